//! Single-lane access to the serial transport.
//!
//! Every request, from any task, becomes a submission on one bounded FIFO
//! channel. A single worker task owns the `SerialInterface` and runs one
//! `CommandSession` at a time, so frames from different requests can never
//! interleave on the wire.
pub mod queue;
pub mod types;

pub use queue::{DispatchBuilder, DispatchHandle, ReopenPolicy};
pub use types::{HealthSnapshot, MetricsSnapshot, SessionReport};
