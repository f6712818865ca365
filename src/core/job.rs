//! Jobs: spatial work items with a lifecycle status and an event log.
//!
//! A [`Job`] is shared as `Arc<Job>` between the queue, the worker running
//! it and any observers. All mutable state sits behind one
//! `parking_lot::Mutex`; notifications are delivered after the lock is
//! released so observers may call back into the job.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::error::{AutopatchError, TaskError};
use crate::core::geometry::Position;
use crate::util::clock::now_secs;

/// Unique, monotonically increasing job identifier.
pub type JobId = u64;

/// Lifecycle status of a job.
///
/// `None` on a job means "never run"; terminal statuses are
/// [`Success`](Self::Success), [`Failed`](Self::Failed) and
/// [`Aborted`](Self::Aborted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum JobStatus {
    /// Selected by a strategy and owned by a worker.
    Assigned,
    /// The worker began running the named task type.
    Started(String),
    /// Task-specific intermediate step.
    Progress(String),
    /// Task finished without error.
    Success,
    /// Task raised an error; carries its message.
    Failed(String),
    /// Task was cancelled by a stop request.
    Aborted,
}

impl JobStatus {
    /// Whether no further transitions happen until a reset.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed(_) | Self::Aborted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assigned => write!(f, "assigned"),
            Self::Started(protocol) => write!(f, "start task: {protocol}"),
            Self::Progress(msg) => write!(f, "{msg}"),
            Self::Success => write!(f, "success"),
            Self::Failed(msg) => write!(f, "failed: {msg}"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// One record of a job's event log.
///
/// Serializes as a flat object: `{"source", "timestamp", "kind", ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Device (or component) that produced the event.
    pub source: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Event type, e.g. `status_changed`, `error`, `state_change`.
    pub kind: String,
    /// Additional key/value fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl JobEvent {
    /// New event stamped with the current time.
    pub fn new(source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timestamp: now_secs(),
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Attach a payload field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Append-only ordered record of job events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<JobEvent>,
}

impl EventLog {
    /// Append an event.
    pub fn push(&mut self, event: JobEvent) {
        self.events.push(event);
    }

    /// Events in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &JobEvent> {
        self.events.iter()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn clear(&mut self) {
        self.events.clear();
    }
}

/// Failure captured from the most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedError {
    /// Error classification (see [`TaskError::kind`]).
    pub kind: String,
    /// Top-level message.
    pub message: String,
    /// Cause chain, outermost first.
    pub trace: Vec<String>,
}

impl CapturedError {
    /// Capture a task error with its full cause chain.
    #[must_use]
    pub fn from_task_error(err: &TaskError) -> Self {
        let trace = match err {
            TaskError::Failed(inner) => inner.chain().map(ToString::to_string).collect(),
            other => {
                let mut chain = vec![other.to_string()];
                let mut source = std::error::Error::source(other);
                while let Some(cause) = source {
                    chain.push(cause.to_string());
                    source = cause.source();
                }
                chain
            }
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            trace,
        }
    }

    /// Capture a panic payload caught at the worker boundary.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked".to_string());
        Self {
            kind: "panic".into(),
            trace: vec![message.clone()],
            message,
        }
    }
}

/// Change notifications delivered to job observers.
#[derive(Debug, Clone, PartialEq)]
pub enum JobNotification {
    /// Status changed; `None` after a reset.
    StatusChanged {
        /// Job that changed.
        job_id: JobId,
        /// New status.
        status: Option<JobStatus>,
    },
    /// A device or error event was appended to the log.
    NewEvent {
        /// Job that logged the event.
        job_id: JobId,
        /// The event.
        event: JobEvent,
    },
}

/// Durable storage for job event logs.
///
/// Called whenever a job's log grows. Implementations report failures but
/// the job only logs them; persistence never fails a task.
pub trait LogSink: Send + Sync {
    /// Persist one event record.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::Persistence`] when the record cannot be stored.
    fn append(&self, job_id: JobId, event: &JobEvent) -> Result<(), AutopatchError>;
}

struct JobState {
    status: Option<JobStatus>,
    assigned_worker: Option<String>,
    protocol: Option<String>,
    completed_protocols: BTreeSet<String>,
    error: Option<CapturedError>,
    log: EventLog,
    calibration_offset: Option<Position>,
    sink: Option<Arc<dyn LogSink>>,
    logging: bool,
}

impl JobState {
    const fn is_active(&self) -> bool {
        match &self.status {
            Some(status) => !status.is_terminal(),
            None => false,
        }
    }

    fn source(&self) -> String {
        self.assigned_worker
            .clone()
            .unwrap_or_else(|| "None".to_string())
    }

    // Returns the sink to write to once the job lock is released.
    fn append(&mut self, event: JobEvent) -> Option<Arc<dyn LogSink>> {
        self.log.push(event);
        self.sink.clone()
    }
}

fn persist(sink: Option<Arc<dyn LogSink>>, job_id: JobId, event: &JobEvent) {
    if let Some(sink) = sink {
        if let Err(e) = sink.append(job_id, event) {
            warn!(job_id, error = %e, "failed to persist job event");
        }
    }
}

/// A unit of spatial work (a patch attempt at one target).
pub struct Job {
    id: JobId,
    position: Position,
    state: Mutex<JobState>,
    subscribers: Mutex<Vec<Sender<JobNotification>>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("status", &state.status)
            .field("assigned_worker", &state.assigned_worker)
            .field("protocol", &state.protocol)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Create an unassigned, never-run job at `position`.
    #[must_use]
    pub fn new(id: JobId, position: Position) -> Self {
        Self {
            id,
            position,
            state: Mutex::new(JobState {
                status: None,
                assigned_worker: None,
                protocol: None,
                completed_protocols: BTreeSet::new(),
                error: None,
                log: EventLog::default(),
                calibration_offset: None,
                sink: None,
                logging: false,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Job identifier.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Immutable target location.
    #[must_use]
    pub const fn position(&self) -> Position {
        self.position
    }

    /// Latest status, `None` if the job never ran (or was reset).
    #[must_use]
    pub fn status(&self) -> Option<JobStatus> {
        self.state.lock().status.clone()
    }

    /// Worker that owns (or last owned) this job.
    #[must_use]
    pub fn assigned_worker(&self) -> Option<String> {
        self.state.lock().assigned_worker.clone()
    }

    /// Task type the job is (or was last) assigned under.
    #[must_use]
    pub fn protocol(&self) -> Option<String> {
        self.state.lock().protocol.clone()
    }

    /// Task types this job already ran to a terminal status.
    #[must_use]
    pub fn completed_protocols(&self) -> BTreeSet<String> {
        self.state.lock().completed_protocols.clone()
    }

    /// Failure captured from the most recent run.
    #[must_use]
    pub fn error(&self) -> Option<CapturedError> {
        self.state.lock().error.clone()
    }

    /// Snapshot of the event log.
    #[must_use]
    pub fn events(&self) -> Vec<JobEvent> {
        self.state.lock().log.iter().cloned().collect()
    }

    /// Number of logged events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// True once any status has been recorded since creation or reset.
    #[must_use]
    pub fn has_started(&self) -> bool {
        self.state.lock().status.is_some()
    }

    /// True when the latest status is terminal.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state
            .lock()
            .status
            .as_ref()
            .is_some_and(JobStatus::is_terminal)
    }

    /// Started but not finished.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().is_active()
    }

    /// Whether the job should sit in the queue for task type `protocol`.
    ///
    /// False when the task type already ran to completion, or while the job
    /// is claimed by a worker under any task type.
    #[must_use]
    pub fn is_eligible_for(&self, protocol: &str) -> bool {
        let state = self.state.lock();
        !state.is_active() && !state.completed_protocols.contains(protocol)
    }

    /// Mark the job as owned by `worker` for task type `protocol`.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::AssignmentViolation`] if the job is active
    /// under a different worker.
    pub fn assign(&self, worker: &str, protocol: &str) -> Result<(), AutopatchError> {
        {
            let mut state = self.state.lock();
            if state.is_active() {
                if let Some(current) = state.assigned_worker.as_deref() {
                    if current != worker {
                        return Err(AutopatchError::AssignmentViolation {
                            job_id: self.id,
                            assigned: current.to_string(),
                            requested: worker.to_string(),
                        });
                    }
                }
            }
            state.assigned_worker = Some(worker.to_string());
            state.protocol = Some(protocol.to_string());
            state.error = None;
        }
        debug!(job_id = self.id, worker, protocol, "job assigned");
        self.set_status(JobStatus::Assigned);
        Ok(())
    }

    /// Record a new status and notify observers.
    ///
    /// A terminal status marks the current task type as completed.
    pub fn set_status(&self, status: JobStatus) {
        let (sink, event) = {
            let mut state = self.state.lock();
            let event = JobEvent::new(state.source(), "status_changed")
                .with("status", status.to_string());
            let sink = state.append(event.clone());
            if status.is_terminal() {
                if let Some(protocol) = state.protocol.clone() {
                    state.completed_protocols.insert(protocol);
                }
            }
            state.status = Some(status.clone());
            (sink, event)
        };
        persist(sink, self.id, &event);
        self.notify(&JobNotification::StatusChanged {
            job_id: self.id,
            status: Some(status),
        });
    }

    /// Shorthand for a task-specific intermediate status.
    pub fn set_progress(&self, msg: impl Into<String>) {
        self.set_status(JobStatus::Progress(msg.into()));
    }

    /// Append a device event if logging is on. Returns whether it was kept.
    pub fn record_device_event(&self, event: JobEvent) -> bool {
        let sink = {
            let mut state = self.state.lock();
            if !state.logging {
                return false;
            }
            state.append(event.clone())
        };
        persist(sink, self.id, &event);
        self.notify(&JobNotification::NewEvent {
            job_id: self.id,
            event,
        });
        true
    }

    /// Append an externally produced event such as a task note.
    pub fn record_event(&self, event: JobEvent) {
        let sink = self.state.lock().append(event.clone());
        persist(sink, self.id, &event);
        self.notify(&JobNotification::NewEvent {
            job_id: self.id,
            event,
        });
    }

    /// Capture a failure, log it, and set `failed: <message>`.
    pub fn fail(&self, error: CapturedError) {
        let (sink, event) = {
            let mut state = self.state.lock();
            let event = JobEvent::new(state.source(), "error")
                .with("error_kind", error.kind.clone())
                .with("error", error.trace.clone());
            let sink = state.append(event.clone());
            state.error = Some(error.clone());
            (sink, event)
        };
        persist(sink, self.id, &event);
        self.notify(&JobNotification::NewEvent {
            job_id: self.id,
            event,
        });
        self.set_status(JobStatus::Failed(error.message));
    }

    /// Return to the never-run state. Safe to call at any time, repeatedly.
    ///
    /// Device event logging stops as well, so a worker still finishing the
    /// old run cannot refill the cleared log with device events.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.logging = false;
            state.status = None;
            state.assigned_worker = None;
            state.protocol = None;
            state.completed_protocols.clear();
            state.error = None;
            state.log.clear();
            state.calibration_offset = None;
        }
        self.notify(&JobNotification::StatusChanged {
            job_id: self.id,
            status: None,
        });
    }

    /// Accept device events into the log. Called by the worker when a run
    /// starts.
    pub fn start_logging(&self) {
        self.state.lock().logging = true;
    }

    /// Ignore further device events.
    pub fn stop_logging(&self) {
        self.state.lock().logging = false;
    }

    /// Whether device events are currently recorded.
    #[must_use]
    pub fn is_logging(&self) -> bool {
        self.state.lock().logging
    }

    /// Attach (or detach) durable storage. Existing events are replayed
    /// into the new sink first.
    pub fn set_log_sink(&self, sink: Option<Arc<dyn LogSink>>) {
        let mut state = self.state.lock();
        if let Some(sink) = &sink {
            for event in state.log.iter() {
                if let Err(e) = sink.append(self.id, event) {
                    warn!(job_id = self.id, error = %e, "failed to replay job event");
                }
            }
        }
        state.sink = sink;
    }

    /// Measured correction between where the actuator thinks it is and
    /// where the target actually is.
    #[must_use]
    pub fn calibration_offset(&self) -> Option<Position> {
        self.state.lock().calibration_offset
    }

    /// Store a calibration correction; non-finite components mark a failed
    /// calibration.
    pub fn set_calibration_offset(&self, offset: Option<Position>) {
        self.state.lock().calibration_offset = offset;
    }

    /// Target in actuator coordinates, corrected by the calibration offset.
    #[must_use]
    pub fn target_position(&self) -> Position {
        match self.calibration_offset() {
            Some(offset) => self.position - offset,
            None => self.position,
        }
    }

    /// Target in the shared global coordinate space.
    #[must_use]
    pub const fn global_target_position(&self) -> Position {
        self.position
    }

    /// Receive status and event notifications for this job.
    pub fn subscribe(&self) -> Receiver<JobNotification> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Human-readable dump of the job and its log, for debugging.
    #[must_use]
    pub fn format_log(&self) -> String {
        const RULE: &str = "========================================";
        let state = self.state.lock();
        let status = state
            .status
            .as_ref()
            .map_or_else(|| "None".to_string(), ToString::to_string);
        let mut out = vec![
            RULE.to_string(),
            format!("       Job {}", self.id),
            format!("       Current status: {status}"),
            RULE.to_string(),
            "Event log:".to_string(),
        ];
        for event in state.log.iter() {
            let mut fields = vec![
                format!("source={}", event.source),
                format!("timestamp={}", event.timestamp),
                format!("kind={}", event.kind),
            ];
            fields.extend(event.payload.iter().map(|(k, v)| format!("{k}={v}")));
            out.push(format!("  {}", fields.join("  ")));
        }
        if let Some(error) = &state.error {
            out.push(RULE.to_string());
            out.push("Error:".to_string());
            out.extend(error.trace.iter().cloned());
        }
        out.join("\n")
    }

    fn notify(&self, notification: &JobNotification) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(7, Position::new(1.0, 2.0, 3.0))
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::Assigned.to_string(), "assigned");
        assert_eq!(
            JobStatus::Started("mock".into()).to_string(),
            "start task: mock"
        );
        assert_eq!(JobStatus::Failed("boom".into()).to_string(), "failed: boom");
        assert_eq!(JobStatus::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_assign_then_terminal_marks_completed() {
        let job = job();
        assert!(job.is_eligible_for("mock"));
        job.assign("pip1", "mock").unwrap();
        assert_eq!(job.status(), Some(JobStatus::Assigned));
        assert!(job.is_active());
        assert!(!job.is_eligible_for("mock"));
        // a running job stays out of every queue
        assert!(!job.is_eligible_for("other"));

        job.set_status(JobStatus::Success);
        assert!(job.is_done());
        assert!(job.completed_protocols().contains("mock"));
        assert!(!job.is_eligible_for("mock"));
        assert!(job.is_eligible_for("other"));
    }

    /// Sink that reads the job back while persisting.
    struct ReadBackSink {
        job: Mutex<Option<Arc<Job>>>,
        seen: Mutex<Vec<Option<JobStatus>>>,
    }

    impl LogSink for ReadBackSink {
        fn append(&self, _job_id: JobId, _event: &JobEvent) -> Result<(), AutopatchError> {
            let job = self.job.lock().clone();
            if let Some(job) = job {
                self.seen.lock().push(job.status());
            }
            Ok(())
        }
    }

    #[test]
    fn test_sink_runs_outside_job_lock() {
        let job = Arc::new(job());
        let sink = Arc::new(ReadBackSink {
            job: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        });
        job.set_log_sink(Some(sink.clone()));
        *sink.job.lock() = Some(Arc::clone(&job));

        job.assign("pip1", "mock").unwrap();
        job.record_event(JobEvent::new("pip1", "state_change"));
        job.fail(CapturedError::from_task_error(&TaskError::failed("clogged")));

        let seen = sink.seen.lock().clone();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], Some(JobStatus::Assigned));
        assert_eq!(seen[3], Some(JobStatus::Failed("clogged".into())));
        sink.job.lock().take();
    }

    #[test]
    fn test_device_events_need_logging() {
        let job = job();
        assert!(!job.record_device_event(JobEvent::new("pip1", "state_change")));
        job.start_logging();
        assert!(job.record_device_event(JobEvent::new("pip1", "state_change")));
        job.stop_logging();
        assert!(!job.record_device_event(JobEvent::new("pip1", "state_change")));
        assert_eq!(job.event_count(), 1);
    }

    #[test]
    fn test_reassign_to_other_worker_while_active_is_violation() {
        let job = job();
        job.assign("pip1", "mock").unwrap();
        job.assign("pip1", "mock").unwrap();
        let err = job.assign("pip2", "mock").unwrap_err();
        assert!(matches!(err, AutopatchError::AssignmentViolation { .. }));

        job.set_status(JobStatus::Aborted);
        job.assign("pip2", "other").unwrap();
        assert_eq!(job.assigned_worker().as_deref(), Some("pip2"));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let job = job();
        job.assign("pip1", "mock").unwrap();
        job.fail(CapturedError::from_task_error(&TaskError::failed("clogged")));
        assert_eq!(job.status(), Some(JobStatus::Failed("clogged".into())));
        assert!(job.error().is_some());

        for _ in 0..3 {
            job.reset();
            assert_eq!(job.status(), None);
            assert_eq!(job.event_count(), 0);
            assert!(job.assigned_worker().is_none());
            assert!(job.error().is_none());
            assert!(job.completed_protocols().is_empty());
        }
    }

    #[test]
    fn test_notifications() {
        let job = job();
        let rx = job.subscribe();
        job.set_progress("moving to target");
        job.record_event(JobEvent::new("pip1", "state_change").with("state", "bath"));
        job.reset();

        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 3);
        assert!(matches!(
            &got[0],
            JobNotification::StatusChanged { status: Some(JobStatus::Progress(m)), .. } if m == "moving to target"
        ));
        assert!(matches!(&got[1], JobNotification::NewEvent { event, .. } if event.kind == "state_change"));
        assert_eq!(
            got[2],
            JobNotification::StatusChanged {
                job_id: 7,
                status: None
            }
        );
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = JobEvent::new("pip1", "pressure_changed").with("pressure", 1.5);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["source"], "pip1");
        assert_eq!(json["kind"], "pressure_changed");
        assert_eq!(json["pressure"], 1.5);
        assert!(json["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_target_position_applies_offset() {
        let job = job();
        assert_eq!(job.target_position(), Position::new(1.0, 2.0, 3.0));
        job.set_calibration_offset(Some(Position::new(0.5, 0.5, 0.0)));
        assert_eq!(job.target_position(), Position::new(0.5, 1.5, 3.0));
        assert_eq!(job.global_target_position(), Position::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_format_log_includes_error() {
        let job = job();
        job.assign("pip1", "mock").unwrap();
        job.fail(CapturedError::from_task_error(&TaskError::failed("seal lost")));
        let text = job.format_log();
        assert!(text.contains("Job 7"));
        assert!(text.contains("Current status: failed: seal lost"));
        assert!(text.contains("kind=status_changed"));
        assert!(text.contains("Error:"));
    }

    #[test]
    fn test_panic_capture() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("index out of bounds");
        let captured = CapturedError::from_panic(payload.as_ref());
        assert_eq!(captured.kind, "panic");
        assert_eq!(captured.message, "index out of bounds");
    }
}
