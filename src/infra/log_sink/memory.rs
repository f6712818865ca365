//! In-memory log sink for tests and development.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::core::error::AutopatchError;
use crate::core::job::{JobEvent, JobId, LogSink};

/// Bounded in-memory record of persisted events.
pub struct InMemoryLogSink {
    records: Mutex<VecDeque<(JobId, JobEvent)>>,
    max_records: usize,
}

impl InMemoryLogSink {
    /// Create a sink keeping at most `max_records`, oldest dropped first.
    #[must_use]
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_records.min(1024))),
            max_records,
        }
    }

    /// Snapshot of all stored records.
    #[must_use]
    pub fn records(&self) -> Vec<(JobId, JobEvent)> {
        self.records.lock().iter().cloned().collect()
    }

    /// Stored events of one job, in arrival order.
    #[must_use]
    pub fn events_for(&self, job_id: JobId) -> Vec<JobEvent> {
        self.records
            .lock()
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

impl Default for InMemoryLogSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl LogSink for InMemoryLogSink {
    fn append(&self, job_id: JobId, event: &JobEvent) -> Result<(), AutopatchError> {
        let mut records = self.records.lock();
        if records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back((job_id, event.clone()));
        Ok(())
    }
}
