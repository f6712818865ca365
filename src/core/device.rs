//! Worker device collaborator.
//!
//! The core never drives hardware itself; it asks the device whether it can
//! take work, where it can reach, and forwards the device's event stream
//! into the log of the job being run.

use std::sync::Arc;

use crate::core::geometry::{Point2, Region};
use crate::core::job::{Job, JobEvent};

/// Receiver of device events while a job is running.
pub trait EventListener: Send + Sync {
    /// Called for every event the device emits.
    fn on_device_event(&self, event: JobEvent);
}

impl EventListener for Job {
    fn on_device_event(&self, event: JobEvent) {
        self.record_device_event(event);
    }
}

/// A physical actuator that consumes jobs through its own worker loop.
pub trait WorkerDevice: Send + Sync {
    /// Unique device name.
    fn name(&self) -> &str;

    /// False while the device awaits a hardware swap or is administratively
    /// inactive.
    fn is_available(&self) -> bool;

    /// Areas this device can reach, in preference order.
    fn regions(&self) -> &[Region];

    /// Center of the device's current view, used by distance-based
    /// strategies.
    fn view_center(&self) -> Point2;

    /// Route subsequent device events to `listener`, replacing any previous
    /// listener.
    fn attach_listener(&self, listener: Arc<dyn EventListener>);

    /// Stop routing device events.
    fn detach_listener(&self);

    /// Whether any of this device's regions contains `point`.
    fn can_reach(&self, point: Point2) -> bool {
        self.regions().iter().any(|r| r.contains(point))
    }
}
