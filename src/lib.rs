//! # Autopatch
//!
//! Coordination core for rigs where several independent actuators
//! ("workers") compete for a shared pool of spatial jobs and for hardware
//! that only one of them may use at a time.
//!
//! ## Core Problem Solved
//!
//! - **Assignment**: a [`JobQueue`](core::JobQueue) hands each requesting
//!   worker at most one job under a pluggable strategy
//!   (fair-by-region or closest-first), never the same job twice.
//! - **Execution**: every worker runs its own [`WorkerLoop`](core::WorkerLoop)
//!   on a dedicated OS thread, driving a multi-step [`Task`](core::Task) with
//!   cooperative cancellation.
//! - **Arbitration**: shared hardware is gated by a
//!   [`PriorityArbiter`](core::PriorityArbiter); waiters are served by
//!   priority, then arrival, and an operator override can jump the queue
//!   without preempting the current holder.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use autopatch::builders::build_rig;
//! use autopatch::config::AutopatchConfig;
//! use autopatch::core::{Position, ProtocolRegistry};
//!
//! let cfg = AutopatchConfig::from_env()?;
//! let rig = build_rig(&cfg, ProtocolRegistry::with_builtin())?;
//! rig.jobs.add_job(Position::new(0.0, 0.0, 0.0));
//! rig.queue.set_protocol("mock");
//! rig.queue.set_enabled(true);
//! rig.start_all()?;
//! ```
//!
//! Logging goes through `tracing`; call [`util::init_tracing`] once to get
//! an env-filtered subscriber.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Jobs, queue, strategies, arbiter, tasks and worker loops.
pub mod core;
/// Configuration models for workers, strategies and timeouts.
pub mod config;
/// Builders that assemble a rig from configuration.
pub mod builders;
/// Infrastructure adapters for devices and event log persistence.
pub mod infra;
/// Built-in task types.
pub mod protocols;
/// Shared utilities.
pub mod util;
