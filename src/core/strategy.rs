//! Pluggable job assignment strategies.
//!
//! A strategy looks at a read-only [`QueueView`] and names at most one
//! queued job for the requesting worker. Strategies never mutate the queue
//! and never block; the [`JobQueue`](crate::core::JobQueue) applies the
//! choice under its own lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::device::WorkerDevice;
use crate::core::error::AutopatchError;
use crate::core::job::Job;

/// Registry key of the closest-first strategy.
pub const CLOSEST_FIRST: &str = "closest-first";
/// Registry key of the fair-by-region strategy.
pub const FAIR_BY_REGION: &str = "fair-by-region";
/// Strategy selected when nothing else is configured.
pub const DEFAULT_STRATEGY: &str = FAIR_BY_REGION;

/// Read-only snapshot of queue state handed to strategies.
pub struct QueueView<'a> {
    /// Every known job, in caller order.
    pub all_jobs: &'a [Arc<Job>],
    /// Jobs still waiting for the current task type, in queue order.
    pub queued: &'a [Arc<Job>],
    /// All registered worker devices.
    pub workers: &'a [Arc<dyn WorkerDevice>],
}

/// Selection policy: returns the index into [`QueueView::queued`] of the
/// job to hand to `worker`, or `None`.
pub trait AssignmentStrategy: Send + Sync {
    /// Pick a queued job for `worker`.
    fn select(&self, view: &QueueView<'_>, worker: &dyn WorkerDevice) -> Option<usize>;
}

impl<F> AssignmentStrategy for F
where
    F: Fn(&QueueView<'_>, &dyn WorkerDevice) -> Option<usize> + Send + Sync,
{
    fn select(&self, view: &QueueView<'_>, worker: &dyn WorkerDevice) -> Option<usize> {
        self(view, worker)
    }
}

/// Nearest reachable job to the worker's view center.
///
/// In exclusive mode nothing is handed out while any job in the system is
/// active, which serializes work across all workers.
#[derive(Debug, Clone, Copy)]
pub struct ClosestFirst {
    exclusive: bool,
}

impl ClosestFirst {
    /// Construct with or without global exclusivity.
    #[must_use]
    pub const fn exclusive(exclusive: bool) -> Self {
        Self { exclusive }
    }
}

impl AssignmentStrategy for ClosestFirst {
    fn select(&self, view: &QueueView<'_>, worker: &dyn WorkerDevice) -> Option<usize> {
        if self.exclusive && view.all_jobs.iter().any(|j| j.is_active()) {
            return None;
        }

        let center = worker.view_center();
        let mut best: Option<(usize, f64)> = None;
        for (idx, job) in view.queued.iter().enumerate() {
            let point = job.position().xy();
            if !view.workers.iter().any(|w| w.can_reach(point)) {
                continue;
            }
            let dist = point.distance(center);
            // strict comparison keeps the earliest index on ties
            if best.is_none_or(|(_, best_dist)| dist < best_dist) {
                best = Some((idx, dist));
            }
        }

        let (idx, _) = best?;
        // nearest job belongs to someone else; re-checked on the next poll
        worker
            .can_reach(view.queued[idx].position().xy())
            .then_some(idx)
    }
}

/// First queued job inside the worker's own regions, regions checked in
/// the device's order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FairByRegion;

impl AssignmentStrategy for FairByRegion {
    fn select(&self, view: &QueueView<'_>, worker: &dyn WorkerDevice) -> Option<usize> {
        worker.regions().iter().find_map(|region| {
            view.queued
                .iter()
                .position(|job| region.contains(job.position().xy()))
        })
    }
}

/// Name-to-strategy lookup table.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Arc<dyn AssignmentStrategy>>,
}

impl StrategyRegistry {
    /// Empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    /// Registry holding the built-in strategies.
    #[must_use]
    pub fn with_defaults(closest_first_exclusive: bool) -> Self {
        let mut registry = Self::empty();
        registry.register(CLOSEST_FIRST, ClosestFirst::exclusive(closest_first_exclusive));
        registry.register(FAIR_BY_REGION, FairByRegion);
        registry
    }

    /// Add or replace a strategy.
    pub fn register(&mut self, name: impl Into<String>, strategy: impl AssignmentStrategy + 'static) {
        self.strategies.insert(name.into(), Arc::new(strategy));
    }

    /// Look up a strategy by name.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::UnknownStrategy`] for unregistered names.
    pub fn get(&self, name: &str) -> Result<Arc<dyn AssignmentStrategy>, AutopatchError> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| AutopatchError::UnknownStrategy(name.to_string()))
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults(true)
    }
}
