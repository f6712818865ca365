//! Task contract and the cancellation-aware primitives tasks are built from.
//!
//! A task runs on its worker's thread and can only be cancelled
//! cooperatively: every wait it performs goes through [`TaskContext`], which
//! polls in short slices and returns [`TaskError::Stopped`] as soon as the
//! worker's [`StopFlag`] is raised. Tasks propagate that error with `?`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::TimingConfig;
use crate::core::arbiter::{LockRequest, PriorityArbiter};
use crate::core::device::WorkerDevice;
use crate::core::error::{AutopatchError, TaskError, TaskResult};
use crate::core::job::{Job, JobEvent};
use crate::core::operation::PendingOperation;
use crate::protocols::mock::{MockTask, MOCK_PROTOCOL};

struct StopInner {
    raised: Mutex<bool>,
    changed: Condvar,
}

/// Cancellation flag shared between a worker loop and its controller.
#[derive(Clone)]
pub struct StopFlag {
    inner: Arc<StopInner>,
}

impl StopFlag {
    /// New, lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                raised: Mutex::new(false),
                changed: Condvar::new(),
            }),
        }
    }

    /// Raise the flag and wake every sleeper.
    pub fn request(&self) {
        *self.inner.raised.lock() = true;
        self.inner.changed.notify_all();
    }

    /// Lower the flag.
    pub fn clear(&self) {
        *self.inner.raised.lock() = false;
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.inner.raised.lock()
    }

    /// `Err(Stopped)` if a stop was requested.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Stopped`] when the flag is raised.
    pub fn check(&self) -> TaskResult {
        if self.is_set() {
            Err(TaskError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Sleep up to `timeout`, waking early on a stop request. Returns true
    /// if the flag is raised.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let mut raised = self.inner.raised.lock();
        self.inner
            .changed
            .wait_while_for(&mut raised, |raised| !*raised, timeout);
        *raised
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StopFlag").field(&self.is_set()).finish()
    }
}

/// Named arbiters for hardware shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct SharedResources {
    arbiters: BTreeMap<String, PriorityArbiter>,
}

impl SharedResources {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an arbiter under its own name; returns the table for chaining.
    #[must_use]
    pub fn with(mut self, arbiter: PriorityArbiter) -> Self {
        self.insert(arbiter);
        self
    }

    /// Register an arbiter under its own name.
    pub fn insert(&mut self, arbiter: PriorityArbiter) {
        self.arbiters.insert(arbiter.name().to_string(), arbiter);
    }

    /// Look up a resource.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::UnknownResource`] for unregistered names.
    pub fn get(&self, name: &str) -> Result<&PriorityArbiter, AutopatchError> {
        self.arbiters
            .get(name)
            .ok_or_else(|| AutopatchError::UnknownResource(name.to_string()))
    }

    /// Registered resource names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.arbiters.keys().cloned().collect()
    }
}

/// Everything a running task may touch: its job, its device, the stop flag,
/// the shared resources and the timing bounds.
pub struct TaskContext {
    job: Arc<Job>,
    device: Arc<dyn WorkerDevice>,
    stop: StopFlag,
    resources: SharedResources,
    timing: TimingConfig,
    priority: i32,
}

impl TaskContext {
    /// Bind a context to one (worker, job) pair.
    #[must_use]
    pub fn new(
        job: Arc<Job>,
        device: Arc<dyn WorkerDevice>,
        stop: StopFlag,
        resources: SharedResources,
        timing: TimingConfig,
        priority: i32,
    ) -> Self {
        Self {
            job,
            device,
            stop,
            resources,
            timing,
            priority,
        }
    }

    /// Job being worked on.
    #[must_use]
    pub const fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// Device running the job.
    #[must_use]
    pub fn device(&self) -> &dyn WorkerDevice {
        self.device.as_ref()
    }

    /// Timing bounds in effect.
    #[must_use]
    pub const fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Shared resources available to the task.
    #[must_use]
    pub const fn resources(&self) -> &SharedResources {
        &self.resources
    }

    /// Poll point: `Err(Stopped)` if the worker was asked to stop.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Stopped`] when a stop was requested.
    pub fn check_stop(&self) -> TaskResult {
        self.stop.check()
    }

    /// Record an intermediate status on the job.
    pub fn set_status(&self, msg: impl Into<String>) {
        self.job.set_progress(msg);
    }

    /// Append a task-level note to the job's event log.
    pub fn note(&self, kind: &str, payload: &[(&str, serde_json::Value)]) {
        let mut event = JobEvent::new(self.device.name(), kind);
        for (key, value) in payload {
            event = event.with(*key, value.clone());
        }
        self.job.record_event(event);
    }

    /// Sleep for `duration`, honoring stop requests.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Stopped`] if a stop arrives before or during
    /// the sleep.
    pub fn sleep(&self, duration: Duration) -> TaskResult {
        self.check_stop()?;
        if self.stop.sleep(duration) {
            return Err(TaskError::Stopped);
        }
        Ok(())
    }

    /// Acquire `arbiter` at `priority`, polling in slices so a stop request
    /// interrupts the wait. Stop is checked once more after the grant.
    ///
    /// `timeout` defaults to the configured lock timeout. On any error the
    /// request is dropped, which withdraws or releases it.
    ///
    /// # Errors
    ///
    /// [`TaskError::Stopped`] on cancellation, [`TaskError::LockTimeout`]
    /// when the bound elapses.
    pub fn lock_with_cancellation(
        &self,
        arbiter: &PriorityArbiter,
        priority: i32,
        timeout: Option<Duration>,
    ) -> TaskResult<LockRequest> {
        let timeout = timeout.unwrap_or_else(|| self.timing.lock_timeout());
        let slice = self.timing.poll_slice();
        let started = Instant::now();
        let request = arbiter.acquire(priority);
        loop {
            self.check_stop()?;
            let waited = started.elapsed();
            let Some(remaining) = timeout.checked_sub(waited).filter(|r| !r.is_zero()) else {
                return Err(TaskError::LockTimeout { waited });
            };
            if request.wait(remaining.min(slice)) {
                break;
            }
        }
        self.check_stop()?;
        debug!(
            resource = arbiter.name(),
            job_id = self.job.id(),
            worker = self.device.name(),
            "resource locked"
        );
        Ok(request)
    }

    /// Lock a named shared resource at the worker's priority.
    ///
    /// # Errors
    ///
    /// As [`lock_with_cancellation`](Self::lock_with_cancellation), plus
    /// [`AutopatchError::UnknownResource`] for unregistered names.
    pub fn lock_resource(&self, name: &str, timeout: Option<Duration>) -> TaskResult<LockRequest> {
        let arbiter = self.resources.get(name)?;
        self.lock_with_cancellation(arbiter, self.priority, timeout)
    }

    /// Wait for every operation in `ops`, removing each one as it completes.
    ///
    /// The head of the list is waited on for one poll slice per round and
    /// the rest are checked without blocking, so stop requests are seen
    /// within one slice. On timeout `ops` holds exactly the unfinished
    /// operations.
    ///
    /// # Errors
    ///
    /// [`TaskError::Stopped`] on cancellation, [`TaskError::WaitTimeout`]
    /// listing what is still pending, or the first operation failure.
    pub fn wait_all<P: PendingOperation>(
        &self,
        ops: &mut Vec<P>,
        timeout: Option<Duration>,
    ) -> TaskResult {
        let timeout = timeout.unwrap_or_else(|| self.timing.wait_timeout());
        let slice = self.timing.poll_slice();
        let deadline = Instant::now() + timeout;
        while !ops.is_empty() {
            self.check_stop()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TaskError::WaitTimeout {
                    pending: ops.iter().map(PendingOperation::describe).collect(),
                });
            }
            let mut idx = 0;
            while idx < ops.len() {
                let budget = if idx == 0 { remaining.min(slice) } else { Duration::ZERO };
                if ops[idx].wait_for(budget)? {
                    ops.remove(idx);
                } else {
                    idx += 1;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("job_id", &self.job.id())
            .field("worker", &self.device.name())
            .field("stop", &self.stop)
            .finish_non_exhaustive()
    }
}

/// A multi-step procedure run for one job by one worker.
pub trait Task: Send {
    /// Execute the step sequence. Return `Err(Stopped)` (usually via `?` on
    /// a context primitive) to acknowledge cancellation.
    ///
    /// # Errors
    ///
    /// Any step failure; the worker records it on the job.
    fn run(&mut self, ctx: &TaskContext) -> TaskResult;

    /// Cleanup after a cancelled run.
    fn abort(&mut self, ctx: &TaskContext) {
        let _ = ctx;
    }
}

/// Constructor for one task type.
pub type TaskFactory = Arc<dyn Fn(&TaskContext) -> TaskResult<Box<dyn Task>> + Send + Sync>;

/// Startup-time table mapping task-type names to constructors.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl ProtocolRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in task types.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(MOCK_PROTOCOL, |_ctx: &TaskContext| {
            Ok(Box::new(MockTask::default()) as Box<dyn Task>)
        });
        registry
    }

    /// Add or replace a task type.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&TaskContext) -> TaskResult<Box<dyn Task>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Instantiate the task registered under `name`.
    ///
    /// # Errors
    ///
    /// [`AutopatchError::UnknownProtocol`] for unregistered names, or
    /// whatever the factory returns.
    pub fn create(&self, name: &str, ctx: &TaskContext) -> TaskResult<Box<dyn Task>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| AutopatchError::UnknownProtocol(name.to_string()))?;
        factory(ctx)
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.names())
            .finish()
    }
}
