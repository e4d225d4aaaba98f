//! redb table definitions for the pitchgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Child records use composite keys `{tournament_id}:{child_id}`
//! so one prefix scan collects everything belonging to a tournament.

use redb::TableDefinition;

/// Tournaments keyed by zero-padded `{tournament_id}`.
pub const TOURNAMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tournaments");

/// Teams keyed by `{tournament_id}:{team_id}`.
pub const TEAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("teams");

/// Matches keyed by `{tournament_id}:{match_id}`.
pub const MATCHES: TableDefinition<&str, &[u8]> = TableDefinition::new("matches");

/// Runner node records keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Monotonic id counters keyed by counter name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
