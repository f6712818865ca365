//! Builders to construct rigs from configuration.

pub mod rig_builder;

pub use rig_builder::{build_rig, build_rig_with, Rig, STAGE_RESOURCE};
