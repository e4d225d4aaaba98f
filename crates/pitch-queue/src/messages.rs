//! Wire messages carried by the channel.
//!
//! Both ends share these types; optional fields are real options, never
//! sentinel values.

use pitch_state::{MatchId, NodeCommand, NodeId, NodeStatus};
use serde::{Deserialize, Serialize};

/// Job dispatch (coordinator → node): everything a node needs to run one
/// match as a child process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDispatch {
    pub job_id: MatchId,
    pub left_team_name: String,
    pub right_team_name: String,
    /// Asset bundle names the teams run as (must be pre-provisioned).
    pub left_bundle: String,
    pub right_bundle: String,
    /// Optional per-team configuration payloads (JSON strings).
    pub left_config: Option<String>,
    pub right_config: Option<String>,
    /// Free-form flags appended to the simulation server command line.
    pub server_flags: String,
}

/// Lifecycle callback: a node has admitted (or failed to admit) a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStarted {
    pub job_id: MatchId,
    pub node_id: NodeId,
    pub success: bool,
    pub assigned_port: Option<u16>,
    pub error: Option<String>,
}

/// Lifecycle callback: a job reached its terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFinished {
    pub job_id: MatchId,
    pub node_id: NodeId,
    pub success: bool,
    pub left_score: Option<i32>,
    pub right_score: Option<i32>,
    pub left_penalty: Option<i32>,
    pub right_penalty: Option<i32>,
}

/// Push-style status report (node → coordinator).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub node_id: NodeId,
    pub status: NodeStatus,
    /// Unix timestamp (seconds) at the node when the report was produced.
    pub timestamp: u64,
}

/// Everything a node pushes to the coordinator over the events queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    /// Sent once on boot. The node's id is authoritative: all of its
    /// later reports and its command queue are keyed by it, and
    /// re-registering an address supersedes any earlier record there.
    Register {
        node_id: NodeId,
        address: String,
        capacity: u32,
    },
    Started(JobStarted),
    Finished(JobFinished),
    Status(StatusReport),
}

/// Command request (coordinator → node).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    pub command: NodeCommand,
    /// Restrict an UPDATE to these asset names (all declared when absent).
    pub asset_overrides: Option<Vec<String>>,
    /// Skip URL providers and fetch from the object store only.
    pub use_alt_source: bool,
    /// Static shared key; the node rejects mismatches.
    pub api_key: String,
}

/// Structured command outcome. Rejections are data, not errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponse {
    pub success: bool,
    pub error: Option<String>,
    pub value: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            value: None,
        }
    }

    pub fn ok_with(value: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            value: Some(value.into()),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            value: None,
        }
    }
}
