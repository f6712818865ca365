//! File-backed log sink writing one JSON line per event.

use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::error::AutopatchError;
use crate::core::job::{JobEvent, JobId, LogSink};

/// Appends each job's events to `<dir>/job_<id>.jsonl`.
pub struct JsonLinesLogSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesLogSink {
    /// Create a sink rooted at `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::Persistence`] if the directory cannot be
    /// created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, AutopatchError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir).map_err(|e| AutopatchError::Persistence(e.to_string()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Log file of one job.
    #[must_use]
    pub fn file_path(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("job_{job_id}.jsonl"))
    }

    /// Read back every persisted event of one job.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::Persistence`] on I/O or parse failures.
    pub fn read_job(&self, job_id: JobId) -> Result<Vec<JobEvent>, AutopatchError> {
        let file_path = self.file_path(job_id);
        if !file_path.exists() {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new()
            .read(true)
            .open(&file_path)
            .map_err(|e| AutopatchError::Persistence(e.to_string()))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| AutopatchError::Persistence(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: JobEvent =
                serde_json::from_str(&line).map_err(|e| AutopatchError::Persistence(e.to_string()))?;
            events.push(event);
        }
        Ok(events)
    }
}

impl LogSink for JsonLinesLogSink {
    fn append(&self, job_id: JobId, event: &JobEvent) -> Result<(), AutopatchError> {
        let line =
            serde_json::to_string(event).map_err(|e| AutopatchError::Persistence(e.to_string()))?;
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(job_id))
            .map_err(|e| AutopatchError::Persistence(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| AutopatchError::Persistence(e.to_string()))
    }
}

impl std::fmt::Debug for JsonLinesLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesLogSink")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
