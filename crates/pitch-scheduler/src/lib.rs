//! pitch-scheduler — the coordinator.
//!
//! Advances tournaments through their timed lifecycle, materializes the
//! round robin into dispatched jobs, and mirrors the runner fleet.
//!
//! # Architecture
//!
//! ```text
//! DispatchScheduler ──(tick)──▶ StateStore ──(JobDispatch)──▶ jobs queue
//! NodeRegistry     ◀─(events)── event pump ◀──────────────── events queue
//!        └──(CommandRequest)──▶ cmd.{node_id} queues
//! ```
//!
//! Scheduler and pump are independent loops sharing the store; both
//! survive individual failures and stop on the shared watch channel.

pub mod error;
pub mod pump;
pub mod registry;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use pump::run_event_pump;
pub use registry::NodeRegistry;
pub use scheduler::{CollectSink, DispatchScheduler, JobSink, QueueSink};
