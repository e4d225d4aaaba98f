//! pitch-queue — the durable message channel between coordinator and nodes.
//!
//! Carries job-dispatch messages (coordinator → node), lifecycle callbacks
//! and status reports (node → coordinator), and per-node command requests.
//!
//! # Semantics
//!
//! At-least-once delivery: a consumed message is leased (in flight) until
//! acked; nacking requeues it for redelivery. Ordering across redeliveries
//! is not guaranteed. Connectivity loss is handled by retrying forever
//! with fixed backoff ([`retry_with_backoff`]) — the process never gives
//! up on transient infrastructure failure.
//!
//! The backing store is redb, same as the state crate; queues are named
//! key ranges inside one database.

pub mod backoff;
pub mod error;
pub mod messages;
pub mod queue;

pub use backoff::retry_with_backoff;
pub use error::{QueueError, QueueResult};
pub use messages::*;
pub use queue::{Delivery, DurableQueue};

/// Shared queue of job dispatches, consumed by whichever node can admit.
pub const JOBS_QUEUE: &str = "jobs";

/// Node → coordinator events: registration, callbacks, status reports.
pub const EVENTS_QUEUE: &str = "events";

/// The per-node command queue name.
pub fn command_queue(node_id: &str) -> String {
    format!("cmd.{node_id}")
}
