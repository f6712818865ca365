//! Per-device worker loop.
//!
//! Each [`WorkerLoop`] owns one OS thread that polls the [`JobQueue`], runs
//! the assigned task through the [`ProtocolRegistry`] and turns the outcome
//! into job state. The loop is the only place task errors and panics are
//! converted into job status; nothing a task does can kill it. A stop
//! request ends the loop and it stays down until `start` is called again.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::core::device::{EventListener, WorkerDevice};
use crate::core::error::AutopatchError;
use crate::core::job::{CapturedError, Job, JobStatus};
use crate::core::queue::JobQueue;
use crate::core::task::{ProtocolRegistry, SharedResources, StopFlag, Task, TaskContext};

/// How a single job run ended, from the loop's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Finished,
    Stopped,
}

struct WorkerShared {
    device: Arc<dyn WorkerDevice>,
    queue: Arc<JobQueue>,
    protocols: Arc<ProtocolRegistry>,
    resources: SharedResources,
    timing: TimingConfig,
    priority: i32,
    stop: StopFlag,
    current: Mutex<Option<Arc<Job>>>,
}

struct RunningThread {
    handle: JoinHandle<Result<(), AutopatchError>>,
    exited: Receiver<()>,
}

/// Control loop for one worker device.
pub struct WorkerLoop {
    shared: Arc<WorkerShared>,
    thread: Mutex<Option<RunningThread>>,
}

impl WorkerLoop {
    /// Loop for `device`, taking work from `queue` and building tasks from
    /// `protocols`. Not started.
    #[must_use]
    pub fn new(
        device: Arc<dyn WorkerDevice>,
        queue: Arc<JobQueue>,
        protocols: Arc<ProtocolRegistry>,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                device,
                queue,
                protocols,
                resources: SharedResources::new(),
                timing: TimingConfig::default(),
                priority: 0,
                stop: StopFlag::new(),
                current: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Builder-style setters; only valid before the first `start`.
    #[must_use]
    pub fn with_resources(mut self, resources: SharedResources) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.resources = resources;
        }
        self
    }

    /// Poll intervals and bounds for the loop and its tasks.
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.timing = timing;
        }
        self
    }

    /// Arbiter priority used by this worker's tasks.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.priority = priority;
        }
        self
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.device.name()
    }

    /// The device this loop drives.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn WorkerDevice> {
        &self.shared.device
    }

    /// Job currently being run, if any.
    #[must_use]
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.shared.current.lock().clone()
    }

    /// Whether the loop thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Whether a stop was requested and not yet cleared by `start`.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop.is_set()
    }

    /// Clear the stop flag and spawn the loop thread.
    ///
    /// # Errors
    ///
    /// [`AutopatchError::WorkerAlreadyRunning`] if the previous thread is
    /// still alive, [`AutopatchError::Spawn`] if the OS refuses the thread.
    pub fn start(&self) -> Result<(), AutopatchError> {
        let mut slot = self.thread.lock();
        if slot.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(AutopatchError::WorkerAlreadyRunning(self.name().to_string()));
        }
        if let Some(previous) = slot.take() {
            // already finished; reap it
            let _ = previous.handle.join();
        }

        self.shared.stop.clear();
        let shared = Arc::clone(&self.shared);
        let (exit_tx, exited) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("autopatch-{}", self.name()))
            .spawn(move || run_loop(&shared, &exit_tx))
            .map_err(|e| AutopatchError::Spawn(e.to_string()))?;
        *slot = Some(RunningThread { handle, exited });
        info!(worker = self.name(), "worker loop started");
        Ok(())
    }

    /// Ask the loop to stop. A running task sees the request at its next
    /// poll point.
    pub fn stop(&self) {
        self.shared.stop.request();
        info!(worker = self.name(), "worker stop requested");
    }

    /// Wait up to `timeout` for the loop thread to exit.
    ///
    /// Returns `None` if the thread is still running (or was never started)
    /// and otherwise the loop's exit result.
    pub fn join(&self, timeout: Duration) -> Option<Result<(), AutopatchError>> {
        let mut slot = self.thread.lock();
        let running = slot.take()?;
        match running.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                *slot = Some(running);
                None
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let name = self.name().to_string();
                Some(running.handle.join().unwrap_or_else(|_| {
                    error!(worker = %name, "worker thread panicked");
                    Err(AutopatchError::WorkerPanicked(name))
                }))
            }
        }
    }

    /// Stop, wait for the loop to exit, then start it again. Whatever job
    /// was running ends as aborted.
    ///
    /// # Errors
    ///
    /// [`AutopatchError::WorkerAlreadyRunning`] if the loop did not exit
    /// within `timeout`, or a spawn failure.
    pub fn abort_and_restart(&self, timeout: Duration) -> Result<(), AutopatchError> {
        self.stop();
        if let Some(Err(e)) = self.join(timeout) {
            warn!(worker = self.name(), error = %e, "worker loop had exited with an error");
        }
        self.start()
    }
}

impl std::fmt::Debug for WorkerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLoop")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .field("stop", &self.shared.stop)
            .finish_non_exhaustive()
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        // Signal stop but do not join; an explicit join is required for
        // orderly shutdown.
        self.shared.stop.request();
    }
}

fn run_loop(shared: &WorkerShared, _exit: &Sender<()>) -> Result<(), AutopatchError> {
    let worker = shared.device.name();
    debug!(worker, "worker thread running");
    let result = poll_jobs(shared);
    match &result {
        Ok(()) => info!(worker, "worker loop exited"),
        Err(e) => error!(worker, error = %e, "worker loop terminated"),
    }
    result
}

fn poll_jobs(shared: &WorkerShared) -> Result<(), AutopatchError> {
    while !shared.stop.is_set() {
        if !shared.device.is_available() {
            shared.stop.sleep(shared.timing.unavailable_poll());
            continue;
        }
        let Some(job) = shared.queue.request_job(shared.device.as_ref())? else {
            shared.stop.sleep(shared.timing.empty_queue_backoff());
            continue;
        };
        if run_job(shared, &job) == RunOutcome::Stopped {
            break;
        }
    }
    Ok(())
}

fn run_job(shared: &WorkerShared, job: &Arc<Job>) -> RunOutcome {
    let worker = shared.device.name();
    let protocol = job.protocol().unwrap_or_default();
    *shared.current.lock() = Some(Arc::clone(job));
    job.start_logging();
    let listener: Arc<dyn EventListener> = Arc::clone(job) as _;
    shared.device.attach_listener(listener);
    job.set_status(JobStatus::Started(protocol.clone()));

    let ctx = TaskContext::new(
        Arc::clone(job),
        Arc::clone(&shared.device),
        shared.stop.clone(),
        shared.resources.clone(),
        shared.timing.clone(),
        shared.priority,
    );

    let mut task: Option<Box<dyn Task>> = None;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let task = task.insert(shared.protocols.create(&protocol, &ctx)?);
        task.run(&ctx)
    }));

    let result = match outcome {
        Ok(Ok(())) => {
            if let Some(err) = job.error() {
                job.set_status(JobStatus::Failed(err.message));
            } else {
                job.set_status(JobStatus::Success);
                info!(worker, job_id = job.id(), protocol = %protocol, "job succeeded");
            }
            RunOutcome::Finished
        }
        Ok(Err(err)) if err.is_stopped() => {
            if let Some(task) = task.as_mut() {
                let aborted = panic::catch_unwind(AssertUnwindSafe(|| task.abort(&ctx)));
                if aborted.is_err() {
                    warn!(worker, job_id = job.id(), "task abort hook panicked");
                }
            }
            job.set_status(JobStatus::Aborted);
            info!(worker, job_id = job.id(), protocol = %protocol, "job aborted");
            RunOutcome::Stopped
        }
        Ok(Err(err)) => {
            warn!(worker, job_id = job.id(), protocol = %protocol, error = %err, "job failed");
            job.fail(CapturedError::from_task_error(&err));
            RunOutcome::Finished
        }
        Err(payload) => {
            let captured = CapturedError::from_panic(payload.as_ref());
            error!(worker, job_id = job.id(), panic = %captured.message, "task panicked");
            job.fail(captured);
            RunOutcome::Finished
        }
    };

    drop(task);
    shared.device.detach_listener();
    job.stop_logging();
    shared.current.lock().take();
    result
}
