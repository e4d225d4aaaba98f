//! Domain types for the pitchgrid state store.
//!
//! These types represent the coordinator's persisted view of tournaments,
//! teams, matches, and runner nodes. All types are serializable to/from
//! JSON for storage in redb tables.
//!
//! Node `status` is authoritative only at the node itself; the record here
//! is a best-effort mirror refreshed by status reports.

use serde::{Deserialize, Serialize};

/// Unique identifier for a tournament.
pub type TournamentId = u64;

/// Unique identifier for a team within a tournament.
pub type TeamId = u64;

/// Unique identifier for a match (job).
pub type MatchId = u64;

/// Unique identifier for a runner node.
pub type NodeId = String;

// ── Tournament ─────────────────────────────────────────────────────

/// Lifecycle of a tournament. Transitions are time-driven, strictly
/// forward, and never revert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TournamentStatus {
    WaitForRegistration,
    Registration,
    WaitForStart,
    InProgress,
    Finished,
}

/// A tournament and the three timestamps gating its transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tournament {
    pub id: TournamentId,
    pub name: String,
    /// Unix timestamp (seconds) when registration opens.
    pub start_registration_at: u64,
    /// Unix timestamp (seconds) when registration closes.
    pub end_registration_at: u64,
    /// Unix timestamp (seconds) when matches kick off.
    pub start_at: u64,
    pub status: TournamentStatus,
    /// Unix timestamp (seconds) when this record was created.
    pub created_at: u64,
}

impl Tournament {
    /// Table key: zero-padded id for ordered iteration.
    pub fn table_key(&self) -> String {
        tournament_key(self.id)
    }
}

/// Zero-padded tournament key.
pub fn tournament_key(id: TournamentId) -> String {
    format!("{id:010}")
}

// ── Team ───────────────────────────────────────────────────────────

/// A registered team: a display name plus the asset bundle it runs as,
/// with an optional configuration payload passed to the bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: TeamId,
    pub tournament_id: TournamentId,
    pub name: String,
    /// Name of the executable asset bundle this team competes with.
    pub bundle: String,
    /// Optional per-team configuration (JSON payload).
    pub config: Option<String>,
}

impl Team {
    /// Composite key `{tournament_id}:{team_id}`.
    pub fn table_key(&self) -> String {
        format!("{:010}:{:010}", self.tournament_id, self.id)
    }
}

// ── Match ──────────────────────────────────────────────────────────

/// Lifecycle of a match as seen by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Materialized, not yet dispatched.
    Pending,
    /// Dispatch message published to the job queue.
    InQueue,
    /// A node reported the match started.
    InProgress,
    Finished,
    Failed,
}

impl MatchStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStatus::Finished | MatchStatus::Failed)
    }
}

/// One match between two teams of a tournament.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Match {
    pub id: MatchId,
    pub tournament_id: TournamentId,
    pub left_team_id: TeamId,
    pub right_team_id: TeamId,
    pub status: MatchStatus,
    /// Node that ran (or is running) this match, once known.
    pub node_id: Option<NodeId>,
    pub left_score: Option<i32>,
    pub right_score: Option<i32>,
    pub left_penalty: Option<i32>,
    pub right_penalty: Option<i32>,
}

impl Match {
    /// Composite key `{tournament_id}:{match_id}`.
    pub fn table_key(&self) -> String {
        format!("{:010}:{:010}", self.tournament_id, self.id)
    }
}

// ── Runner node ────────────────────────────────────────────────────

/// Status a runner node reports for itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Paused,
    Updating,
    Crashed,
    Stopped,
}

impl NodeStatus {
    /// Crashed and stopped nodes accept no further commands.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Crashed | NodeStatus::Stopped)
    }
}

/// Operator commands a node accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeCommand {
    Pause,
    Resume,
    Update,
    Stop,
    /// Liveness no-op.
    Hello,
}

/// The coordinator's mirror of one runner node.
///
/// `requested_command` is the desired state (at most one outstanding);
/// `status` is the last observed state, which may lag the node's truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: String,
    /// Maximum number of concurrent matches (port pool capacity).
    pub capacity: u32,
    pub status: NodeStatus,
    pub requested_command: Option<NodeCommand>,
    /// Unix timestamp (seconds) of the last message from this node.
    pub last_seen: u64,
}
