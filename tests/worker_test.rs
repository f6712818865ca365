//! Integration tests for worker loops running real task scripts.
//!
//! These tests validate:
//! - Success, failure and panic outcomes recorded on the job
//! - The loop surviving task failures
//! - Stop requests interrupting waits and ending the loop
//! - Explicit restart after an abort
//! - Shared stage arbitration between workers and the operator
//! - Device events flowing into the running job's log

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use autopatch::config::TimingConfig;
use autopatch::core::{
    AutopatchError, JobEvent, JobQueue, JobStatus, OperatorLock, PriorityArbiter,
    ProtocolRegistry, SharedResources, Task, TaskContext, TaskResult, WorkerLoop,
};
use autopatch::infra::SimulatedDevice;
use autopatch::protocols::{MockStep, MockTask};
use common::{as_workers, device, jobs_at, ready_queue, wait_until};

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// HELPERS
// ============================================================================

fn worker(
    dev: &Arc<SimulatedDevice>,
    queue: &Arc<JobQueue>,
    registry: ProtocolRegistry,
) -> WorkerLoop {
    WorkerLoop::new(dev.clone(), Arc::clone(queue), Arc::new(registry))
        .with_timing(TimingConfig::fast())
}

/// Registry with one task type whose script depends on the job id.
fn scripted(name: &str, script: fn(u64) -> Vec<MockStep>) -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::with_builtin();
    registry.register(name, move |ctx: &TaskContext| {
        Ok(Box::new(MockTask::new(script(ctx.job().id()))) as Box<dyn Task>)
    });
    registry
}

fn shutdown(worker: &WorkerLoop) {
    worker.stop();
    assert!(matches!(worker.join(WAIT), Some(Ok(()))));
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[test]
fn test_failed_task_recorded_and_loop_continues() {
    let pip = device("pip1", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0), (1.0, 0.0)]);
    let queue = ready_queue(as_workers(&[pip.clone()]), &jobs, "flaky");
    let registry = scripted("flaky", |id| {
        if id == 1 {
            vec![MockStep::status("approaching"), MockStep::fail("pipette clogged")]
        } else {
            vec![MockStep::status("approaching")]
        }
    });
    let w = worker(&pip, &queue, registry);
    w.start().unwrap();

    assert!(wait_until(WAIT, || jobs.iter().all(|j| j.is_done())));
    assert_eq!(
        jobs[0].status(),
        Some(JobStatus::Failed("pipette clogged".into()))
    );
    let error = jobs[0].error().unwrap();
    assert_eq!(error.kind, "task_failure");
    assert_eq!(error.message, "pipette clogged");
    assert!(jobs[0].events().iter().any(|e| e.kind == "error"));
    assert!(jobs[0].completed_protocols().contains("flaky"));

    assert_eq!(jobs[1].status(), Some(JobStatus::Success));
    assert!(w.is_running());
    shutdown(&w);
}

#[test]
fn test_status_sequence_of_successful_run() {
    let pip = device("pip1", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0)]);
    let queue = ready_queue(as_workers(&[pip.clone()]), &jobs, "mock");
    let w = worker(&pip, &queue, ProtocolRegistry::with_builtin());
    let notifications = jobs[0].subscribe();
    w.start().unwrap();

    assert!(wait_until(WAIT, || jobs[0].is_done()));
    shutdown(&w);

    let statuses: Vec<String> = jobs[0]
        .events()
        .iter()
        .filter(|e| e.kind == "status_changed")
        .map(|e| e.payload["status"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        statuses,
        vec![
            "assigned",
            "start task: mock",
            "moving to target",
            "at target",
            "success"
        ]
    );
    assert_eq!(notifications.try_iter().count(), statuses.len());
}

#[test]
fn test_panicking_task_is_contained() {
    let pip = device("pip1", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0), (1.0, 0.0)]);
    let queue = ready_queue(as_workers(&[pip.clone()]), &jobs, "fragile");
    let registry = scripted("fragile", |id| {
        if id == 1 {
            vec![MockStep::Panic {
                message: "kaboom".into(),
            }]
        } else {
            Vec::new()
        }
    });
    let w = worker(&pip, &queue, registry);
    w.start().unwrap();

    assert!(wait_until(WAIT, || jobs.iter().all(|j| j.is_done())));
    assert_eq!(jobs[0].status(), Some(JobStatus::Failed("kaboom".into())));
    assert_eq!(jobs[0].error().unwrap().kind, "panic");
    assert_eq!(jobs[1].status(), Some(JobStatus::Success));
    assert!(!pip.has_listener());
    shutdown(&w);
}

#[test]
fn test_unknown_protocol_fails_job() {
    let pip = device("pip1", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0)]);
    let queue = ready_queue(as_workers(&[pip.clone()]), &jobs, "cell attached");
    let w = worker(&pip, &queue, ProtocolRegistry::with_builtin());
    w.start().unwrap();

    assert!(wait_until(WAIT, || jobs[0].is_done()));
    assert_eq!(
        jobs[0].status(),
        Some(JobStatus::Failed("unknown protocol: cell attached".into()))
    );
    shutdown(&w);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_stop_during_wait_aborts_job_and_ends_loop() {
    let pip = device("pip1", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0), (1.0, 0.0)]);
    let queue = ready_queue(as_workers(&[pip.clone()]), &jobs, "stall");
    let registry = scripted("stall", |_| {
        vec![
            MockStep::status("waiting on move"),
            MockStep::Stall {
                label: "move pipette".into(),
            },
        ]
    });
    let w = worker(&pip, &queue, registry);
    w.start().unwrap();

    assert!(wait_until(WAIT, || {
        jobs[0].status() == Some(JobStatus::Progress("waiting on move".into()))
    }));
    assert_eq!(w.current_job().map(|j| j.id()), Some(1));

    let stopped_at = Instant::now();
    w.stop();
    assert!(matches!(w.join(WAIT), Some(Ok(()))));
    // a handful of poll slices at most
    assert!(stopped_at.elapsed() < Duration::from_secs(1));

    assert_eq!(jobs[0].status(), Some(JobStatus::Aborted));
    assert!(jobs[0].events().iter().any(|e| e.kind == "task_aborted"));
    assert!(jobs[0].error().is_none());
    assert!(!pip.has_listener());
    assert!(!w.is_running());
    // the loop does not come back on its own
    assert_eq!(jobs[1].status(), None);
}

#[test]
fn test_abort_and_restart_moves_on() {
    let pip = device("pip1", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0), (1.0, 0.0)]);
    let queue = ready_queue(as_workers(&[pip.clone()]), &jobs, "stall-first");
    let registry = scripted("stall-first", |id| {
        if id == 1 {
            vec![MockStep::Stall {
                label: "move stage".into(),
            }]
        } else {
            vec![MockStep::status("sealing")]
        }
    });
    let w = worker(&pip, &queue, registry);
    w.start().unwrap();

    assert!(wait_until(WAIT, || w.current_job().is_some_and(|j| j.id() == 1)));
    w.abort_and_restart(WAIT).unwrap();

    assert!(wait_until(WAIT, || jobs[1].is_done()));
    assert_eq!(jobs[0].status(), Some(JobStatus::Aborted));
    assert_eq!(jobs[1].status(), Some(JobStatus::Success));
    shutdown(&w);
}

#[test]
fn test_unavailable_device_takes_no_work() {
    let pip = device("pip1", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0)]);
    let queue = ready_queue(as_workers(&[pip.clone()]), &jobs, "mock");
    pip.set_available(false);
    let w = worker(&pip, &queue, ProtocolRegistry::with_builtin());
    w.start().unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(jobs[0].status(), None);

    pip.set_available(true);
    assert!(wait_until(WAIT, || jobs[0].is_done()));
    shutdown(&w);
}

#[test]
fn test_protocol_switch_mid_run_keeps_workers_alive() {
    let a = device("pip_a", 0.0, 0.0, 10.0);
    let b = device("pip_b", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0)]);
    let queue = ready_queue(as_workers(&[a.clone(), b.clone()]), &jobs, "slow");
    let slow: fn(u64) -> Vec<MockStep> = |_| vec![MockStep::Sleep { duration_ms: 300 }];

    let wa = worker(&a, &queue, scripted("slow", slow));
    wa.start().unwrap();
    assert!(wait_until(WAIT, || jobs[0].is_active()));

    let wb = worker(&b, &queue, scripted("slow", slow));
    wb.start().unwrap();
    queue.set_protocol("mock");
    std::thread::sleep(Duration::from_millis(50));

    assert!(wb.is_running());
    assert_eq!(jobs[0].assigned_worker().as_deref(), Some("pip_a"));
    assert!(wait_until(WAIT, || jobs[0].is_done()));
    assert_eq!(jobs[0].status(), Some(JobStatus::Success));
    assert!(wb.is_running());

    shutdown(&wa);
    shutdown(&wb);
}

#[test]
fn test_assignment_violation_ends_worker() {
    let a = device("pip_a", 0.0, 0.0, 10.0);
    let b = device("pip_b", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0)]);
    let queue = ready_queue(as_workers(&[a.clone(), b.clone()]), &jobs, "mock");
    // claimed by pip_a under another task type and still running
    jobs[0].assign("pip_a", "cleaning").unwrap();

    let w = worker(&b, &queue, ProtocolRegistry::with_builtin());
    w.start().unwrap();
    let result = w.join(WAIT).unwrap();
    assert!(matches!(
        result,
        Err(AutopatchError::AssignmentViolation { .. })
    ));
    assert_eq!(jobs[0].assigned_worker().as_deref(), Some("pip_a"));
}

// ============================================================================
// SHARED STAGE
// ============================================================================

fn stage_rig() -> (
    Vec<Arc<SimulatedDevice>>,
    Vec<Arc<autopatch::core::Job>>,
    PriorityArbiter,
    Vec<WorkerLoop>,
) {
    let devices = vec![device("pip_a", 0.0, 0.0, 5.0), device("pip_b", 100.0, 0.0, 5.0)];
    let jobs = jobs_at(&[(0.0, 0.0), (100.0, 0.0)]);
    let queue = ready_queue(as_workers(&devices), &jobs, "stage");
    let stage = PriorityArbiter::new("stage");
    let resources = SharedResources::new().with(stage.clone());
    let registry = scripted("stage", |_| {
        vec![
            MockStep::lock("stage"),
            MockStep::move_for("move stage", Duration::from_millis(20)),
            MockStep::Release,
        ]
    });
    let workers = devices
        .iter()
        .map(|dev| worker(dev, &queue, registry.clone()).with_resources(resources.clone()))
        .collect();
    (devices, jobs, stage, workers)
}

#[test]
fn test_workers_take_stage_in_turn() {
    let (_devices, jobs, stage, workers) = stage_rig();
    for w in &workers {
        w.start().unwrap();
    }
    assert!(wait_until(WAIT, || jobs.iter().all(|j| j.is_done())));
    for job in &jobs {
        assert_eq!(job.status(), Some(JobStatus::Success));
        assert!(job.events().iter().any(|e| e.kind == "resource_locked"));
    }
    assert_eq!(stage.grant_count(), 2);
    assert!(!stage.is_locked());
    workers.iter().for_each(shutdown);
}

#[test]
fn test_operator_hold_blocks_workers_until_released() {
    let (_devices, jobs, stage, workers) = stage_rig();
    let operator = OperatorLock::new(stage.clone(), 10);
    let granted = operator.engage();
    assert!(granted.recv_timeout(WAIT).is_ok());

    for w in &workers {
        w.start().unwrap();
    }
    assert!(wait_until(WAIT, || stage.pending_count() == 2));
    assert!(jobs.iter().all(|j| !j.is_done()));

    operator.disengage();
    assert!(wait_until(WAIT, || jobs.iter().all(|j| j.is_done())));
    assert!(jobs.iter().all(|j| j.status() == Some(JobStatus::Success)));
    workers.iter().for_each(shutdown);
}

#[test]
fn test_lock_timeout_fails_job() {
    let pip = device("pip1", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0)]);
    let queue = ready_queue(as_workers(&[pip.clone()]), &jobs, "stage");
    let stage = PriorityArbiter::new("stage");
    let _held = stage.acquire(100);
    let registry = scripted("stage", |_| vec![MockStep::lock("stage")]);
    let w = WorkerLoop::new(pip.clone(), Arc::clone(&queue), Arc::new(registry))
        .with_resources(SharedResources::new().with(stage.clone()))
        .with_timing(TimingConfig {
            lock_timeout_ms: 30,
            ..TimingConfig::fast()
        });
    w.start().unwrap();

    assert!(wait_until(WAIT, || jobs[0].is_done()));
    let error = jobs[0].error().unwrap();
    assert_eq!(error.kind, "lock_timeout");
    assert!(jobs[0].status().unwrap().to_string().starts_with("failed: timed out"));
    assert_eq!(stage.pending_count(), 0);
    shutdown(&w);
}

// ============================================================================
// DEVICE EVENTS
// ============================================================================

struct PressureTask {
    device: Arc<SimulatedDevice>,
}

impl Task for PressureTask {
    fn run(&mut self, ctx: &TaskContext) -> TaskResult {
        ctx.check_stop()?;
        self.device
            .emit(JobEvent::new("pip1", "pressure_changed").with("pressure", -2.5));
        Ok(())
    }
}

#[test]
fn test_device_events_logged_on_running_job() {
    let pip = device("pip1", 0.0, 0.0, 10.0);
    let jobs = jobs_at(&[(0.0, 0.0)]);
    let queue = ready_queue(as_workers(&[pip.clone()]), &jobs, "pressure");
    let mut registry = ProtocolRegistry::new();
    let dev = pip.clone();
    registry.register("pressure", move |_ctx: &TaskContext| {
        Ok(Box::new(PressureTask {
            device: Arc::clone(&dev),
        }) as Box<dyn Task>)
    });
    let w = worker(&pip, &queue, registry);
    w.start().unwrap();

    assert!(wait_until(WAIT, || jobs[0].is_done()));
    shutdown(&w);
    let events = jobs[0].events();
    let pressure = events
        .iter()
        .find(|e| e.kind == "pressure_changed")
        .expect("device event logged");
    assert_eq!(pressure.payload["pressure"], -2.5);
    // emitted after the run ended: nobody listening
    assert!(!pip.emit(JobEvent::new("pip1", "pressure_changed")));
}
