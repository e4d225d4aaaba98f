//! StateStore — redb-backed state persistence for pitchgrid.
//!
//! Provides typed CRUD operations over tournaments, teams, matches, and
//! runner nodes, plus the predicate queries the dispatch scheduler runs
//! each tick. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TOURNAMENTS).map_err(map_err!(Table))?;
        txn.open_table(TEAMS).map_err(map_err!(Table))?;
        txn.open_table(MATCHES).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Allocate the next value of a named monotonic counter (ids start at 1).
    pub fn next_id(&self, counter: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let current = table
                .get(counter)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            next = current + 1;
            table.insert(counter, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    // ── Tournaments ────────────────────────────────────────────────

    /// Insert or update a tournament.
    pub fn put_tournament(&self, tournament: &Tournament) -> StateResult<()> {
        let key = tournament.table_key();
        let value = serde_json::to_vec(tournament).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TOURNAMENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "tournament stored");
        Ok(())
    }

    /// Get a tournament by id.
    pub fn get_tournament(&self, id: TournamentId) -> StateResult<Option<Tournament>> {
        let key = tournament_key(id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TOURNAMENTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let tournament: Tournament =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(tournament))
            }
            None => Ok(None),
        }
    }

    /// List all tournaments.
    pub fn list_tournaments(&self) -> StateResult<Vec<Tournament>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TOURNAMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let tournament: Tournament =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(tournament);
        }
        Ok(results)
    }

    /// List tournaments currently at the given status.
    ///
    /// Each scheduler phase queries exactly one status, so tournaments
    /// already at or past the target state are never revisited.
    pub fn list_tournaments_with_status(
        &self,
        status: TournamentStatus,
    ) -> StateResult<Vec<Tournament>> {
        Ok(self
            .list_tournaments()?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    // ── Teams ──────────────────────────────────────────────────────

    /// Insert or update a team.
    pub fn put_team(&self, team: &Team) -> StateResult<()> {
        let key = team.table_key();
        let value = serde_json::to_vec(team).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TEAMS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a team by tournament and team id.
    pub fn get_team(&self, tournament_id: TournamentId, team_id: TeamId) -> StateResult<Option<Team>> {
        let key = format!("{tournament_id:010}:{team_id:010}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TEAMS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let team: Team =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(team))
            }
            None => Ok(None),
        }
    }

    /// List all teams registered to a tournament.
    pub fn teams_for_tournament(&self, tournament_id: TournamentId) -> StateResult<Vec<Team>> {
        let prefix = format!("{tournament_id:010}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TEAMS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let team: Team =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(team);
            }
        }
        Ok(results)
    }

    // ── Matches ────────────────────────────────────────────────────

    /// Insert or update a match.
    pub fn put_match(&self, m: &Match) -> StateResult<()> {
        let key = m.table_key();
        let value = serde_json::to_vec(m).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MATCHES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Find a match by its id alone (scans; match ids are globally unique).
    pub fn find_match(&self, match_id: MatchId) -> StateResult<Option<Match>> {
        let suffix = format!(":{match_id:010}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MATCHES).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().ends_with(&suffix) {
                let m: Match =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                return Ok(Some(m));
            }
        }
        Ok(None)
    }

    /// List all matches belonging to a tournament.
    pub fn matches_for_tournament(&self, tournament_id: TournamentId) -> StateResult<Vec<Match>> {
        let prefix = format!("{tournament_id:010}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MATCHES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let m: Match =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(m);
            }
        }
        Ok(results)
    }

    /// Whether any match exists for a tournament.
    ///
    /// Guards match-set materialization against re-running a partially
    /// committed registration-close phase.
    pub fn tournament_has_matches(&self, tournament_id: TournamentId) -> StateResult<bool> {
        let prefix = format!("{tournament_id:010}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MATCHES).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a node record by id.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: NodeRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all node records.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: NodeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Find a node by its advertised address.
    ///
    /// Registration refreshes an existing address instead of duplicating it.
    pub fn find_node_by_address(&self, address: &str) -> StateResult<Option<NodeRecord>> {
        Ok(self
            .list_nodes()?
            .into_iter()
            .find(|n| n.address == address))
    }

    /// Delete a node record. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, existed, "node deleted");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tournament(id: TournamentId, status: TournamentStatus) -> Tournament {
        Tournament {
            id,
            name: format!("tournament-{id}"),
            start_registration_at: 1000,
            end_registration_at: 2000,
            start_at: 3000,
            status,
            created_at: 500,
        }
    }

    fn test_match(id: MatchId, tournament_id: TournamentId) -> Match {
        Match {
            id,
            tournament_id,
            left_team_id: 1,
            right_team_id: 2,
            status: MatchStatus::Pending,
            node_id: None,
            left_score: None,
            right_score: None,
            left_penalty: None,
            right_penalty: None,
        }
    }

    #[test]
    fn tournament_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let t = test_tournament(1, TournamentStatus::WaitForRegistration);
        store.put_tournament(&t).unwrap();
        assert_eq!(store.get_tournament(1).unwrap(), Some(t));
        assert_eq!(store.get_tournament(2).unwrap(), None);
    }

    #[test]
    fn list_tournaments_with_status_filters() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_tournament(&test_tournament(1, TournamentStatus::Registration))
            .unwrap();
        store
            .put_tournament(&test_tournament(2, TournamentStatus::Finished))
            .unwrap();
        store
            .put_tournament(&test_tournament(3, TournamentStatus::Registration))
            .unwrap();

        let open = store
            .list_tournaments_with_status(TournamentStatus::Registration)
            .unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|t| t.status == TournamentStatus::Registration));
    }

    #[test]
    fn teams_scoped_to_tournament() {
        let store = StateStore::open_in_memory().unwrap();
        for (tid, team_id) in [(1, 1), (1, 2), (2, 3)] {
            store
                .put_team(&Team {
                    id: team_id,
                    tournament_id: tid,
                    name: format!("team-{team_id}"),
                    bundle: "cyrus".to_string(),
                    config: None,
                })
                .unwrap();
        }
        assert_eq!(store.teams_for_tournament(1).unwrap().len(), 2);
        assert_eq!(store.teams_for_tournament(2).unwrap().len(), 1);
        assert_eq!(store.teams_for_tournament(3).unwrap().len(), 0);
    }

    #[test]
    fn match_queries() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store.tournament_has_matches(1).unwrap());

        store.put_match(&test_match(10, 1)).unwrap();
        store.put_match(&test_match(11, 1)).unwrap();
        store.put_match(&test_match(12, 2)).unwrap();

        assert!(store.tournament_has_matches(1).unwrap());
        assert_eq!(store.matches_for_tournament(1).unwrap().len(), 2);
        assert_eq!(store.find_match(12).unwrap().unwrap().tournament_id, 2);
        assert_eq!(store.find_match(99).unwrap(), None);
    }

    #[test]
    fn node_address_lookup() {
        let store = StateStore::open_in_memory().unwrap();
        let node = NodeRecord {
            id: "node-1".to_string(),
            address: "10.0.0.5:8082".to_string(),
            capacity: 2,
            status: NodeStatus::Running,
            requested_command: None,
            last_seen: 1000,
        };
        store.put_node(&node).unwrap();

        assert_eq!(
            store.find_node_by_address("10.0.0.5:8082").unwrap(),
            Some(node)
        );
        assert_eq!(store.find_node_by_address("10.0.0.6:8082").unwrap(), None);
        assert!(store.delete_node("node-1").unwrap());
        assert!(!store.delete_node("node-1").unwrap());
    }

    #[test]
    fn counters_are_monotonic() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.next_id("match").unwrap(), 1);
        assert_eq!(store.next_id("match").unwrap(), 2);
        assert_eq!(store.next_id("tournament").unwrap(), 1);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store
                .put_tournament(&test_tournament(7, TournamentStatus::InProgress))
                .unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(
            store.get_tournament(7).unwrap().unwrap().status,
            TournamentStatus::InProgress
        );
    }
}
