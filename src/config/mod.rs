//! Configuration models for workers, assignment policy and timeouts.

pub mod rig;

pub use rig::{AutopatchConfig, TimingConfig, WorkerConfig, CONFIG_ENV};
