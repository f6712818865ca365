//! In-process worker device used by tests, benches and dry runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::WorkerConfig;
use crate::core::device::{EventListener, WorkerDevice};
use crate::core::geometry::{Point2, Region};
use crate::core::job::JobEvent;

/// Device with fixed regions whose availability and event stream are driven
/// by the caller.
pub struct SimulatedDevice {
    name: String,
    regions: Vec<Region>,
    view_center: Point2,
    available: AtomicBool,
    listener: Mutex<Option<Arc<dyn EventListener>>>,
}

impl SimulatedDevice {
    /// Available device covering `regions`.
    pub fn new(name: impl Into<String>, regions: Vec<Region>, view_center: Point2) -> Self {
        Self {
            name: name.into(),
            regions,
            view_center,
            available: AtomicBool::new(true),
            listener: Mutex::new(None),
        }
    }

    /// Device owning a single circular chamber, viewing its center.
    pub fn circle(name: impl Into<String>, x: f64, y: f64, radius: f64) -> Self {
        let center = Point2::new(x, y);
        Self::new(name, vec![Region::circle(center, radius)], center)
    }

    /// Device described by a configuration entry.
    #[must_use]
    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self::new(cfg.name.clone(), cfg.regions.clone(), cfg.view_center)
    }

    /// Toggle availability (pending swap, administratively inactive).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Forward an event to the attached listener. Returns false when no
    /// job is listening.
    pub fn emit(&self, event: JobEvent) -> bool {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => {
                listener.on_device_event(event);
                true
            }
            None => false,
        }
    }

    /// Whether a job is currently listening.
    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }
}

impl WorkerDevice for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn regions(&self) -> &[Region] {
        &self.regions
    }

    fn view_center(&self) -> Point2 {
        self.view_center
    }

    fn attach_listener(&self, listener: Arc<dyn EventListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn detach_listener(&self) {
        self.listener.lock().take();
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("name", &self.name)
            .field("regions", &self.regions)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::Position;
    use crate::core::job::Job;

    #[test]
    fn test_events_reach_attached_job() {
        let device = SimulatedDevice::circle("pip1", 0.0, 0.0, 5.0);
        assert!(!device.emit(JobEvent::new("pip1", "state_change")));

        let job = Arc::new(Job::new(1, Position::default()));
        job.start_logging();
        device.attach_listener(job.clone());
        assert!(device.emit(JobEvent::new("pip1", "state_change").with("state", "bath")));
        assert_eq!(job.event_count(), 1);

        device.detach_listener();
        assert!(!device.has_listener());
        assert!(!device.emit(JobEvent::new("pip1", "state_change")));
        assert_eq!(job.event_count(), 1);
    }

    #[test]
    fn test_reset_stops_device_logging() {
        let device = SimulatedDevice::circle("pip1", 0.0, 0.0, 5.0);
        let job = Arc::new(Job::new(1, Position::default()));
        job.start_logging();
        device.attach_listener(job.clone());
        assert!(device.emit(JobEvent::new("pip1", "state_change")));
        assert_eq!(job.event_count(), 1);

        // the worker is still attached, but the cleared log stays empty
        job.reset();
        assert!(!job.is_logging());
        assert!(device.emit(JobEvent::new("pip1", "state_change")));
        assert_eq!(job.event_count(), 0);
    }

    #[test]
    fn test_reach_and_availability() {
        let device = SimulatedDevice::circle("pip1", 0.0, 0.0, 5.0);
        assert!(device.can_reach(Point2::new(5.0, 0.0)));
        assert!(!device.can_reach(Point2::new(5.1, 0.0)));
        device.set_available(false);
        assert!(!device.is_available());
    }
}
