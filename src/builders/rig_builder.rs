//! Assemble a complete rig (devices, queue, workers, shared stage) from an
//! [`AutopatchConfig`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{AutopatchConfig, WorkerConfig};
use crate::core::{
    AutopatchError, JobQueue, JobSet, OperatorLock, PriorityArbiter, ProtocolRegistry,
    SharedResources, StrategyRegistry, WorkerDevice, WorkerLoop,
};
use crate::infra::SimulatedDevice;

/// Name of the shared stage resource every rig carries.
pub const STAGE_RESOURCE: &str = "stage";

/// A running set of workers around one queue.
pub struct Rig {
    /// Shared job queue.
    pub queue: Arc<JobQueue>,
    /// Controller-side job list feeding the queue.
    pub jobs: JobSet,
    /// One loop per configured worker, in configuration order.
    pub workers: Vec<WorkerLoop>,
    /// Arbiter for the shared stage.
    pub stage: PriorityArbiter,
    /// Operator override on the stage.
    pub operator: OperatorLock,
}

impl Rig {
    /// Start every worker loop.
    ///
    /// # Errors
    ///
    /// The first start failure; loops started before it keep running.
    pub fn start_all(&self) -> Result<(), AutopatchError> {
        for worker in &self.workers {
            worker.start()?;
        }
        Ok(())
    }

    /// Request a stop on every loop, then wait up to `timeout` for each.
    /// Returns the names of loops that did not exit in time.
    pub fn stop_all(&self, timeout: Duration) -> Vec<String> {
        for worker in &self.workers {
            worker.stop();
        }
        let mut stuck = Vec::new();
        for worker in &self.workers {
            match worker.join(timeout) {
                Some(Ok(())) => {}
                Some(Err(e)) => warn!(worker = worker.name(), error = %e, "worker exited with error"),
                None if worker.is_running() => stuck.push(worker.name().to_string()),
                None => {}
            }
        }
        stuck
    }

    /// Abort whatever each worker is doing and restart every loop.
    ///
    /// # Errors
    ///
    /// The first restart failure.
    pub fn abort_all(&self, timeout: Duration) -> Result<(), AutopatchError> {
        for worker in &self.workers {
            worker.abort_and_restart(timeout)?;
        }
        Ok(())
    }

    /// Worker loop by device name.
    #[must_use]
    pub fn worker(&self, name: &str) -> Option<&WorkerLoop> {
        self.workers.iter().find(|w| w.name() == name)
    }
}

impl std::fmt::Debug for Rig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rig")
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// Build a rig of [`SimulatedDevice`]s from `cfg`.
///
/// # Errors
///
/// [`AutopatchError::InvalidConfig`] if validation fails, or
/// [`AutopatchError::UnknownProtocol`] if the default task type is not
/// registered.
pub fn build_rig(cfg: &AutopatchConfig, protocols: ProtocolRegistry) -> Result<Rig, AutopatchError> {
    build_rig_with(
        cfg,
        |worker| Ok(Arc::new(SimulatedDevice::from_config(worker)) as Arc<dyn WorkerDevice>),
        protocols,
    )
}

/// Build a rig using `device_factory` to create one device per worker entry.
///
/// # Errors
///
/// As [`build_rig`], plus any device factory failure.
pub fn build_rig_with<FD>(
    cfg: &AutopatchConfig,
    mut device_factory: FD,
    protocols: ProtocolRegistry,
) -> Result<Rig, AutopatchError>
where
    FD: FnMut(&WorkerConfig) -> Result<Arc<dyn WorkerDevice>, AutopatchError>,
{
    cfg.validate().map_err(AutopatchError::InvalidConfig)?;

    let devices = cfg
        .workers
        .iter()
        .map(&mut device_factory)
        .collect::<Result<Vec<_>, _>>()?;

    let queue = Arc::new(JobQueue::with_registry(
        devices.clone(),
        StrategyRegistry::with_defaults(cfg.closest_first_exclusive),
    ));
    queue.set_strategy(&cfg.strategy)?;
    if let Some(protocol) = &cfg.default_protocol {
        if !protocols.contains(protocol) {
            return Err(AutopatchError::UnknownProtocol(protocol.clone()));
        }
        queue.set_protocol(protocol.clone());
    }

    let stage = PriorityArbiter::new(STAGE_RESOURCE);
    let resources = SharedResources::new().with(stage.clone());
    let protocols = Arc::new(protocols);
    let workers = devices
        .into_iter()
        .map(|device| {
            WorkerLoop::new(device, Arc::clone(&queue), Arc::clone(&protocols))
                .with_resources(resources.clone())
                .with_timing(cfg.timing.clone())
                .with_priority(cfg.worker_priority)
        })
        .collect::<Vec<_>>();

    info!(
        workers = workers.len(),
        strategy = %cfg.strategy,
        "rig assembled"
    );

    Ok(Rig {
        jobs: JobSet::new(Arc::clone(&queue)),
        queue,
        workers,
        operator: OperatorLock::new(stage.clone(), cfg.operator_priority),
        stage,
    })
}
