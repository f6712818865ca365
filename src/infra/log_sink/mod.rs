//! Persistence collaborators for job event logs.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonLinesLogSink;
pub use memory::InMemoryLogSink;
