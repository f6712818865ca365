//! Scripted task used for dry runs and tests.
//!
//! A [`MockTask`] walks a list of [`MockStep`]s through the same context
//! primitives a real protocol uses, so the worker loop, arbiter and
//! cancellation paths can be exercised without hardware.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::core::arbiter::LockRequest;
use crate::core::error::{TaskError, TaskResult};
use crate::core::operation::{completion, Completer, Completion};
use crate::core::task::{Task, TaskContext};

/// Registry name of the scripted task.
pub const MOCK_PROTOCOL: &str = "mock";

/// One scripted step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "step")]
pub enum MockStep {
    /// Record an intermediate status.
    Status {
        /// Status text.
        message: String,
    },
    /// Start a timed move and wait for it.
    Move {
        /// Operation label.
        label: String,
        /// Move duration in milliseconds.
        duration_ms: u64,
    },
    /// Start a move that never finishes and wait for it.
    Stall {
        /// Operation label.
        label: String,
    },
    /// Acquire a named shared resource and hold it until `release`.
    Lock {
        /// Resource name.
        resource: String,
    },
    /// Release every held resource.
    Release,
    /// Cancellable pause.
    Sleep {
        /// Pause in milliseconds.
        duration_ms: u64,
    },
    /// Fail the run.
    Fail {
        /// Failure message.
        message: String,
    },
    /// Panic inside the run.
    Panic {
        /// Panic message.
        message: String,
    },
}

impl MockStep {
    /// Status step.
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    /// Timed move step.
    pub fn move_for(label: impl Into<String>, duration: Duration) -> Self {
        Self::Move {
            label: label.into(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Lock step.
    pub fn lock(resource: impl Into<String>) -> Self {
        Self::Lock {
            resource: resource.into(),
        }
    }

    /// Failure step.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
        }
    }
}

/// Task running a fixed script.
#[derive(Debug)]
pub struct MockTask {
    steps: Vec<MockStep>,
    held: Vec<LockRequest>,
    stalled: Vec<Completer>,
}

impl Default for MockTask {
    fn default() -> Self {
        Self::new(vec![
            MockStep::status("moving to target"),
            MockStep::move_for("approach target", Duration::from_millis(10)),
            MockStep::status("at target"),
        ])
    }
}

impl MockTask {
    /// Task running `steps` in order.
    #[must_use]
    pub const fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps,
            held: Vec::new(),
            stalled: Vec::new(),
        }
    }

    /// Factory suitable for
    /// [`ProtocolRegistry::register`](crate::core::ProtocolRegistry::register).
    pub fn factory(
        steps: Vec<MockStep>,
    ) -> impl Fn(&TaskContext) -> TaskResult<Box<dyn Task>> + Send + Sync + 'static {
        move |_ctx: &TaskContext| Ok(Box::new(Self::new(steps.clone())) as Box<dyn Task>)
    }

    fn release_all(&mut self) {
        for request in self.held.drain(..) {
            request.release();
        }
    }

    fn step(&mut self, ctx: &TaskContext, step: &MockStep) -> TaskResult {
        match step {
            MockStep::Status { message } => ctx.set_status(message.clone()),
            MockStep::Move { label, duration_ms } => {
                let mut ops = vec![Completion::after(
                    label.clone(),
                    Duration::from_millis(*duration_ms),
                )];
                ctx.wait_all(&mut ops, None)?;
            }
            MockStep::Stall { label } => {
                let (completer, op) = completion(label.clone());
                self.stalled.push(completer);
                ctx.wait_all(&mut vec![op], None)?;
            }
            MockStep::Lock { resource } => {
                let request = ctx.lock_resource(resource, None)?;
                ctx.note("resource_locked", &[("resource", json!(resource))]);
                self.held.push(request);
            }
            MockStep::Release => self.release_all(),
            MockStep::Sleep { duration_ms } => ctx.sleep(Duration::from_millis(*duration_ms))?,
            MockStep::Fail { message } => return Err(TaskError::failed(message)),
            MockStep::Panic { message } => panic!("{message}"),
        }
        Ok(())
    }
}

impl Task for MockTask {
    fn run(&mut self, ctx: &TaskContext) -> TaskResult {
        let steps = self.steps.clone();
        for step in &steps {
            ctx.check_stop()?;
            debug!(job_id = ctx.job().id(), ?step, "mock step");
            if let Err(err) = self.step(ctx, step) {
                if !err.is_stopped() {
                    self.release_all();
                }
                return Err(err);
            }
        }
        self.release_all();
        Ok(())
    }

    fn abort(&mut self, ctx: &TaskContext) {
        ctx.note("task_aborted", &[("held_resources", json!(self.held.len()))]);
        self.release_all();
        self.stalled.clear();
    }
}
