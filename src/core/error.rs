//! Error types for job assignment and task execution.

use std::time::Duration;

use thiserror::Error;

use crate::core::job::JobId;

/// Errors produced by queue, registry and worker components.
#[derive(Debug, Error)]
pub enum AutopatchError {
    /// A job already owned by one worker was handed to another while active.
    #[error("job {job_id} is assigned to `{assigned}`, cannot assign to `{requested}`")]
    AssignmentViolation {
        /// Job being assigned.
        job_id: JobId,
        /// Worker currently holding the job.
        assigned: String,
        /// Worker that attempted to take it.
        requested: String,
    },
    /// No strategy is registered under the given name.
    #[error("unknown assignment strategy: {0}")]
    UnknownStrategy(String),
    /// No task type is registered under the given name.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// `start` was called on a worker loop whose thread is still alive.
    #[error("worker `{0}` is already running")]
    WorkerAlreadyRunning(String),
    /// A worker thread died from a panic outside the task boundary.
    #[error("worker `{0}` panicked")]
    WorkerPanicked(String),
    /// No shared resource is registered under the given name.
    #[error("unknown shared resource: {0}")]
    UnknownResource(String),
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
    /// Writing an event log record failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Outcome of a task step that did not complete normally.
///
/// `Stopped` is the cooperative cancellation signal and is not a failure;
/// every other variant ends the run with a `failed: ...` status.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A stop was requested for the worker running this task.
    #[error("stopped")]
    Stopped,
    /// The shared resource could not be acquired in time.
    #[error("timed out after {waited:?} waiting for lock")]
    LockTimeout {
        /// How long the task waited before giving up.
        waited: Duration,
    },
    /// Pending operations did not finish in time.
    #[error("timed out waiting for {pending:?}")]
    WaitTimeout {
        /// Descriptions of the operations still unfinished.
        pending: Vec<String>,
    },
    /// Library invariant violated while running the task.
    #[error(transparent)]
    Autopatch(#[from] AutopatchError),
    /// Any other failure raised by a task step.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    /// True for the cooperative cancellation signal.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Short classification recorded on the job as the error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::WaitTimeout { .. } => "wait_timeout",
            Self::Autopatch(_) => "autopatch",
            Self::Failed(_) => "task_failure",
        }
    }

    /// Convenience constructor for ad-hoc task failures.
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{msg}"))
    }
}

/// Result alias for task steps.
pub type TaskResult<T = ()> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_kinds() {
        assert!(TaskError::Stopped.is_stopped());
        assert_eq!(TaskError::Stopped.kind(), "stopped");
        let err = TaskError::WaitTimeout {
            pending: vec!["move x".into()],
        };
        assert!(!err.is_stopped());
        assert_eq!(err.kind(), "wait_timeout");
        assert_eq!(err.to_string(), "timed out waiting for [\"move x\"]");
    }

    #[test]
    fn test_failed_is_transparent() {
        let err = TaskError::failed("pipette broke");
        assert_eq!(err.to_string(), "pipette broke");
        assert_eq!(err.kind(), "task_failure");
    }

    #[test]
    fn test_assignment_violation_display() {
        let err = AutopatchError::AssignmentViolation {
            job_id: 3,
            assigned: "pip1".into(),
            requested: "pip2".into(),
        };
        assert_eq!(
            err.to_string(),
            "job 3 is assigned to `pip1`, cannot assign to `pip2`"
        );
    }
}
