//! Small shared utilities

pub mod queue;

pub use queue::{BoundedQueue, OverflowPolicy, QueueError};
