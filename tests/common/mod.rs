//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use autopatch::core::{Job, JobQueue, Position, WorkerDevice};
use autopatch::infra::SimulatedDevice;

/// Poll `cond` every few milliseconds until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn device(name: &str, x: f64, y: f64, radius: f64) -> Arc<SimulatedDevice> {
    Arc::new(SimulatedDevice::circle(name, x, y, radius))
}

pub fn as_workers(devices: &[Arc<SimulatedDevice>]) -> Vec<Arc<dyn WorkerDevice>> {
    devices
        .iter()
        .map(|d| Arc::clone(d) as Arc<dyn WorkerDevice>)
        .collect()
}

pub fn jobs_at(points: &[(f64, f64)]) -> Vec<Arc<Job>> {
    points
        .iter()
        .zip(1..)
        .map(|(&(x, y), id)| Arc::new(Job::new(id, Position::new(x, y, 0.0))))
        .collect()
}

/// Enabled queue under `protocol` holding `jobs`.
pub fn ready_queue(
    workers: Vec<Arc<dyn WorkerDevice>>,
    jobs: &[Arc<Job>],
    protocol: &str,
) -> Arc<JobQueue> {
    let queue = Arc::new(JobQueue::new(workers));
    queue.set_jobs(jobs.to_vec());
    queue.set_protocol(protocol);
    queue.set_enabled(true);
    queue
}
