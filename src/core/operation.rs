//! Awaitable handles for asynchronous device operations.
//!
//! Motion collaborators return something implementing [`PendingOperation`];
//! tasks hand a batch of them to
//! [`TaskContext::wait_all`](crate::core::TaskContext::wait_all), which polls
//! each one in short slices so cancellation stays responsive.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::core::error::{TaskError, TaskResult};

/// An operation that finishes at some later time.
pub trait PendingOperation: Send {
    /// Short label used in timeout reports.
    fn describe(&self) -> String;

    /// Block for at most `timeout`. `Ok(true)` once complete, `Ok(false)` if
    /// still running.
    ///
    /// # Errors
    ///
    /// Returns the operation's own failure.
    fn wait_for(&mut self, timeout: Duration) -> TaskResult<bool>;
}

impl<T: PendingOperation + ?Sized> PendingOperation for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn wait_for(&mut self, timeout: Duration) -> TaskResult<bool> {
        (**self).wait_for(timeout)
    }
}

/// Channel-backed completion handle.
#[derive(Debug)]
pub struct Completion {
    label: String,
    rx: Receiver<Result<(), String>>,
    done: bool,
}

/// Producer side of a [`Completion`]. Dropping it without completing marks
/// the operation as abandoned.
#[derive(Debug)]
pub struct Completer {
    tx: Sender<Result<(), String>>,
}

/// Create a linked completer/completion pair.
pub fn completion(label: impl Into<String>) -> (Completer, Completion) {
    let (tx, rx) = bounded(1);
    (
        Completer { tx },
        Completion {
            label: label.into(),
            rx,
            done: false,
        },
    )
}

impl Completer {
    /// Report success.
    pub fn complete(self) {
        let _ = self.tx.try_send(Ok(()));
    }

    /// Report failure with a reason.
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.try_send(Err(reason.into()));
    }
}

impl Completion {
    /// Handle that is already complete.
    pub fn ready(label: impl Into<String>) -> Self {
        let (completer, completion) = completion(label);
        completer.complete();
        completion
    }

    /// Handle completed by a background timer after `duration`, standing in
    /// for a hardware move of known length.
    pub fn after(label: impl Into<String>, duration: Duration) -> Self {
        let (completer, completion) = completion(label);
        thread::spawn(move || {
            thread::sleep(duration);
            completer.complete();
        });
        completion
    }

    /// Whether completion was observed.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }
}

impl PendingOperation for Completion {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn wait_for(&mut self, timeout: Duration) -> TaskResult<bool> {
        if self.done {
            return Ok(true);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(())) => {
                self.done = true;
                Ok(true)
            }
            Ok(Err(reason)) => Err(TaskError::failed(format!("{} failed: {reason}", self.label))),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TaskError::failed(format!("{} was abandoned", self.label)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_lifecycle() {
        let (completer, mut op) = completion("move stage");
        assert!(!op.wait_for(Duration::from_millis(5)).unwrap());
        completer.complete();
        assert!(op.wait_for(Duration::from_millis(5)).unwrap());
        assert!(op.is_done());
        // stays complete once observed
        assert!(op.wait_for(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_completion_failure_and_abandon() {
        let (completer, mut op) = completion("move pipette");
        completer.fail("limit switch");
        let err = op.wait_for(Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.to_string(), "move pipette failed: limit switch");

        let (completer, mut op) = completion("focus");
        drop(completer);
        assert!(op.wait_for(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn test_timer_completion() {
        let mut op = Completion::after("settle", Duration::from_millis(10));
        assert!(op.wait_for(Duration::from_secs(2)).unwrap());
    }
}
