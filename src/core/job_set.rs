//! Ordered job collection owned by the controller side of a rig.
//!
//! [`JobSet`] allocates job ids and pushes the full list into its
//! [`JobQueue`] after every mutation, so the queue always reflects the
//! current set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::core::geometry::Position;
use crate::core::job::{Job, JobId, LogSink};
use crate::core::queue::JobQueue;

/// Mutable list of jobs feeding one queue.
pub struct JobSet {
    queue: Arc<JobQueue>,
    jobs: Mutex<Vec<Arc<Job>>>,
    next_id: AtomicU64,
    sink: Option<Arc<dyn LogSink>>,
}

impl JobSet {
    /// Empty set feeding `queue`.
    #[must_use]
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            jobs: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sink: None,
        }
    }

    /// Attach `sink` to every job created from now on.
    #[must_use]
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Create a job at `position`, append it and republish the list.
    pub fn add_job(&self, position: Position) -> Arc<Job> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(Job::new(id, position));
        if let Some(sink) = &self.sink {
            job.set_log_sink(Some(Arc::clone(sink)));
        }
        let mut jobs = self.jobs.lock();
        jobs.push(Arc::clone(&job));
        self.queue.set_jobs(jobs.clone());
        info!(job_id = id, x = position.x, y = position.y, z = position.z, "job added");
        job
    }

    /// Remove the job with `id`. Returns it if it was present.
    ///
    /// A worker already running the job keeps its handle and finishes it.
    pub fn remove_job(&self, id: JobId) -> Option<Arc<Job>> {
        let mut jobs = self.jobs.lock();
        let idx = jobs.iter().position(|job| job.id() == id)?;
        let job = jobs.remove(idx);
        self.queue.set_jobs(jobs.clone());
        info!(job_id = id, "job removed");
        Some(job)
    }

    /// Reset every job and republish, re-queuing all of them.
    pub fn reset_all(&self) {
        let jobs = self.jobs.lock();
        for job in jobs.iter() {
            job.reset();
        }
        self.queue.set_jobs(jobs.clone());
        info!(count = jobs.len(), "all jobs reset");
    }

    /// Reset the given job and republish.
    pub fn reset_job(&self, id: JobId) -> bool {
        let jobs = self.jobs.lock();
        let Some(job) = jobs.iter().find(|job| job.id() == id) else {
            return false;
        };
        job.reset();
        self.queue.set_jobs(jobs.clone());
        true
    }

    /// Snapshot of the jobs in insertion order.
    #[must_use]
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.lock().clone()
    }

    /// Look up a job by id.
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.lock().iter().find(|job| job.id() == id).cloned()
    }

    /// Number of jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// True when the set holds no jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

impl std::fmt::Debug for JobSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSet")
            .field("jobs", &self.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
