//! Built-in task types.

pub mod mock;

pub use mock::{MockStep, MockTask, MOCK_PROTOCOL};
