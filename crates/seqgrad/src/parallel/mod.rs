//! Multi-device coordination.

mod coordinator;

pub use coordinator::{AggregateKind, Coordinator, Replicated, ShardOutcome};
