//! Infrastructure adapters: simulated devices and event log persistence.

pub mod device;
pub mod log_sink;

pub use device::SimulatedDevice;
pub use log_sink::{InMemoryLogSink, JsonLinesLogSink};
