//! Scheduling core: jobs, the shared queue, assignment strategies, the
//! priority arbiter, the task contract and the worker loop.

pub mod arbiter;
pub mod device;
pub mod error;
pub mod geometry;
pub mod job;
pub mod job_set;
pub mod operation;
pub mod queue;
pub mod strategy;
pub mod task;
pub mod worker;

pub use arbiter::{LockRequest, OperatorLock, PriorityArbiter, RequestId, RequestState};
pub use device::{EventListener, WorkerDevice};
pub use error::{AutopatchError, TaskError, TaskResult};
pub use geometry::{Point2, Position, Region};
pub use job::{CapturedError, EventLog, Job, JobEvent, JobId, JobNotification, JobStatus, LogSink};
pub use job_set::JobSet;
pub use operation::{completion, Completer, Completion, PendingOperation};
pub use queue::JobQueue;
pub use strategy::{
    AssignmentStrategy, ClosestFirst, FairByRegion, QueueView, StrategyRegistry, CLOSEST_FIRST,
    DEFAULT_STRATEGY, FAIR_BY_REGION,
};
pub use task::{ProtocolRegistry, SharedResources, StopFlag, Task, TaskContext, TaskFactory};
pub use worker::WorkerLoop;
