//! Coordinator error types.

use thiserror::Error;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    State(#[from] pitch_state::StateError),

    #[error(transparent)]
    Queue(#[from] pitch_queue::QueueError),

    /// Coordinator-side guard refused to forward a node command.
    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),
}
