//! Shared job queue with pluggable assignment.
//!
//! All mutable state lives in one [`QueueState`] behind a single
//! `parking_lot::Mutex`. Every read-modify-write (`set_jobs`,
//! `set_protocol`, `set_enabled`, `request_job`) happens under that lock, so
//! two concurrent `request_job` calls can never hand out the same job.
//! Strategies only see a borrowed [`QueueView`] and never re-enter the queue.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::device::WorkerDevice;
use crate::core::error::AutopatchError;
use crate::core::job::Job;
use crate::core::strategy::{QueueView, StrategyRegistry, DEFAULT_STRATEGY};

struct QueueState {
    all_jobs: Vec<Arc<Job>>,
    queued: Vec<Arc<Job>>,
    protocol: Option<String>,
    enabled: bool,
    strategy: String,
    registry: StrategyRegistry,
    workers: Vec<Arc<dyn WorkerDevice>>,
}

impl QueueState {
    fn requeue(&mut self) {
        self.queued = match self.protocol.as_deref() {
            Some(protocol) => self
                .all_jobs
                .iter()
                .filter(|job| job.is_eligible_for(protocol))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
    }
}

/// Holds every known job and hands them out to requesting workers.
pub struct JobQueue {
    state: Mutex<QueueState>,
}

impl JobQueue {
    /// Queue for the given workers with the built-in strategies
    /// (closest-first in exclusive mode).
    #[must_use]
    pub fn new(workers: Vec<Arc<dyn WorkerDevice>>) -> Self {
        Self::with_registry(workers, StrategyRegistry::default())
    }

    /// Queue using a caller-supplied strategy table. The default strategy
    /// is selected if registered, otherwise the first registered name.
    #[must_use]
    pub fn with_registry(workers: Vec<Arc<dyn WorkerDevice>>, registry: StrategyRegistry) -> Self {
        let strategy = if registry.contains(DEFAULT_STRATEGY) {
            DEFAULT_STRATEGY.to_string()
        } else {
            registry.names().into_iter().next().unwrap_or_default()
        };
        Self {
            state: Mutex::new(QueueState {
                all_jobs: Vec::new(),
                queued: Vec::new(),
                protocol: None,
                enabled: false,
                strategy,
                registry,
                workers,
            }),
        }
    }

    /// Replace the job set and recompute the queue for the current task type.
    pub fn set_jobs(&self, jobs: Vec<Arc<Job>>) {
        let mut state = self.state.lock();
        state.all_jobs = jobs;
        state.requeue();
        debug!(
            total = state.all_jobs.len(),
            queued = state.queued.len(),
            "job set replaced"
        );
    }

    /// Select the task type new work is assigned under and recompute the queue.
    pub fn set_protocol(&self, protocol: impl Into<String>) {
        let mut state = self.state.lock();
        let protocol = protocol.into();
        info!(protocol = %protocol, "protocol selected");
        state.protocol = Some(protocol);
        state.requeue();
    }

    /// Current task type, if one was selected.
    #[must_use]
    pub fn protocol(&self) -> Option<String> {
        self.state.lock().protocol.clone()
    }

    /// Gate `request_job`; while disabled it always returns `None`.
    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
        info!(enabled, "job queue gate changed");
    }

    /// Whether the queue currently hands out work.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Switch the active strategy by name.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::UnknownStrategy`] if `name` is not registered.
    pub fn set_strategy(&self, name: &str) -> Result<(), AutopatchError> {
        let mut state = self.state.lock();
        if !state.registry.contains(name) {
            return Err(AutopatchError::UnknownStrategy(name.to_string()));
        }
        state.strategy = name.to_string();
        info!(strategy = name, "assignment strategy selected");
        Ok(())
    }

    /// Name of the active strategy.
    #[must_use]
    pub fn strategy(&self) -> String {
        self.state.lock().strategy.clone()
    }

    /// Names of all registered strategies.
    #[must_use]
    pub fn strategy_names(&self) -> Vec<String> {
        self.state.lock().registry.names()
    }

    /// Register an additional strategy at runtime.
    pub fn add_strategy(
        &self,
        name: impl Into<String>,
        strategy: impl crate::core::strategy::AssignmentStrategy + 'static,
    ) {
        self.state.lock().registry.register(name, strategy);
    }

    /// Add a worker device to the set consulted by reachability checks.
    pub fn register_worker(&self, worker: Arc<dyn WorkerDevice>) {
        self.state.lock().workers.push(worker);
    }

    /// Snapshot of every known job.
    #[must_use]
    pub fn all_jobs(&self) -> Vec<Arc<Job>> {
        self.state.lock().all_jobs.clone()
    }

    /// Snapshot of the jobs still waiting for the current task type.
    #[must_use]
    pub fn queued_jobs(&self) -> Vec<Arc<Job>> {
        self.state.lock().queued.clone()
    }

    /// Hand at most one job to `worker`.
    ///
    /// Returns `Ok(None)` when disabled, when no task type is selected, or
    /// when the active strategy finds nothing suitable. A returned job has
    /// been removed from the queue and assigned to `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::AssignmentViolation`] if the chosen job is
    /// still active under a different worker, or
    /// [`AutopatchError::UnknownStrategy`] if the active strategy vanished.
    pub fn request_job(&self, worker: &dyn WorkerDevice) -> Result<Option<Arc<Job>>, AutopatchError> {
        let mut state = self.state.lock();
        if !state.enabled || state.queued.is_empty() {
            return Ok(None);
        }
        let Some(protocol) = state.protocol.clone() else {
            return Ok(None);
        };

        let strategy = state.registry.get(&state.strategy)?;
        let view = QueueView {
            all_jobs: &state.all_jobs,
            queued: &state.queued,
            workers: &state.workers,
        };
        let Some(idx) = strategy.select(&view, worker) else {
            return Ok(None);
        };

        let Some(job) = state.queued.get(idx).cloned() else {
            warn!(
                worker = worker.name(),
                strategy = %state.strategy,
                index = idx,
                queued = state.queued.len(),
                "strategy selected a job outside the queue"
            );
            return Ok(None);
        };
        job.assign(worker.name(), &protocol)?;
        state.queued.remove(idx);
        info!(
            worker = worker.name(),
            job_id = job.id(),
            protocol = %protocol,
            strategy = %state.strategy,
            remaining = state.queued.len(),
            "job assigned"
        );
        Ok(Some(job))
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JobQueue")
            .field("jobs", &state.all_jobs.len())
            .field("queued", &state.queued.len())
            .field("protocol", &state.protocol)
            .field("enabled", &state.enabled)
            .field("strategy", &state.strategy)
            .finish()
    }
}
