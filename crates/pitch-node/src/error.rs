//! Runner node error types.
//!
//! Job-level failures are terminal for that job only and never affect
//! sibling jobs. Command rejections are returned as data
//! (`CommandResponse`), not through this enum.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors a runner node can produce.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Pool exhausted or admission paused — the dispatch should be
    /// requeued by the channel, not dropped.
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    /// A required asset bundle or config is not provisioned locally.
    /// Jobs fail fast on this; provisioning runs out of band via UPDATE.
    #[error("missing asset: {0}")]
    MissingAsset(String),

    /// OS-level failure to launch the simulation server.
    #[error("failed to spawn server process: {0}")]
    ProcessSpawnFailed(String),

    /// The process exited without a valid result artifact.
    #[error("incomplete result artifact: {0}")]
    IncompleteArtifact(String),

    /// One provider out of the ranked list failed; callers fall through
    /// to the next provider.
    #[error("provider fetch failed: {0}")]
    ProviderFetchFailed(String),

    /// Pool reinitialization attempted while triples are still assigned.
    #[error("cannot resize pool: {0} triples still assigned")]
    PoolBusy(usize),

    /// The simulation server binary is absent at startup. Fatal — the
    /// node refuses to start.
    #[error("simulation server binary not found at {0}")]
    ServerMissing(PathBuf),

    #[error("archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Queue(#[from] pitch_queue::QueueError),
}
