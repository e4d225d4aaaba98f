//! Tournament lifecycle scheduler.
//!
//! A fixed-interval tick advances every tournament through its timed
//! statuses. Each phase is an independent query-then-commit and safe to
//! re-run: the phase predicate excludes already-promoted tournaments,
//! so a tick that died halfway resumes cleanly on the next interval.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use pitch_queue::{DurableQueue, JobDispatch, JOBS_QUEUE};
use pitch_state::{Match, MatchStatus, StateStore, Team, TournamentStatus};

use crate::error::SchedulerResult;

/// Where materialized jobs go. Queue-backed in production; a collecting
/// impl keeps phase tests deterministic.
pub trait JobSink {
    fn dispatch(&self, job: &JobDispatch) -> SchedulerResult<()>;
}

/// Publishes each job on the durable `jobs` queue.
pub struct QueueSink {
    queue: DurableQueue,
}

impl QueueSink {
    pub fn new(queue: DurableQueue) -> Self {
        Self { queue }
    }
}

impl JobSink for QueueSink {
    fn dispatch(&self, job: &JobDispatch) -> SchedulerResult<()> {
        self.queue.publish(JOBS_QUEUE, job)?;
        Ok(())
    }
}

/// Collects dispatched jobs in memory.
#[derive(Default)]
pub struct CollectSink {
    jobs: parking_lot::Mutex<Vec<JobDispatch>>,
}

impl CollectSink {
    pub fn drain(&self) -> Vec<JobDispatch> {
        std::mem::take(&mut self.jobs.lock())
    }
}

impl JobSink for CollectSink {
    fn dispatch(&self, job: &JobDispatch) -> SchedulerResult<()> {
        self.jobs.lock().push(job.clone());
        Ok(())
    }
}

/// Advances tournaments and materializes their matches into jobs.
pub struct DispatchScheduler<S: JobSink> {
    state: StateStore,
    sink: S,
    /// Extra flags appended to every dispatched job's server command line.
    server_flags: String,
}

impl<S: JobSink> DispatchScheduler<S> {
    pub fn new(state: StateStore, sink: S, server_flags: String) -> Self {
        Self {
            state,
            sink,
            server_flags,
        }
    }

    /// One scheduling pass at the given unix time.
    pub fn tick(&self, now: u64) -> SchedulerResult<()> {
        self.open_registration(now)?;
        self.close_registration(now)?;
        self.kick_off(now)?;
        self.sweep_finished()?;
        Ok(())
    }

    /// Phase 1: `WaitForRegistration` tournaments past their opening
    /// instant start accepting teams.
    fn open_registration(&self, now: u64) -> SchedulerResult<()> {
        for mut t in self
            .state
            .list_tournaments_with_status(TournamentStatus::WaitForRegistration)?
        {
            if t.start_registration_at <= now {
                t.status = TournamentStatus::Registration;
                self.state.put_tournament(&t)?;
                info!(tournament = t.id, name = %t.name, "registration opened");
            }
        }
        Ok(())
    }

    /// Phase 2: close registration and materialize the round robin.
    ///
    /// Matches are written before the status flips, and an explicit
    /// has-matches check skips the pairing if an earlier run already
    /// committed it, so a crash between the two writes cannot double the
    /// fixture list.
    fn close_registration(&self, now: u64) -> SchedulerResult<()> {
        for mut t in self
            .state
            .list_tournaments_with_status(TournamentStatus::Registration)?
        {
            if t.end_registration_at > now {
                continue;
            }
            if !self.state.tournament_has_matches(t.id)? {
                let teams = self.state.teams_for_tournament(t.id)?;
                let pairs = round_robin(&teams);
                for (left, right) in &pairs {
                    let m = Match {
                        id: self.state.next_id("match")?,
                        tournament_id: t.id,
                        left_team_id: left.id,
                        right_team_id: right.id,
                        status: MatchStatus::Pending,
                        node_id: None,
                        left_score: None,
                        right_score: None,
                        left_penalty: None,
                        right_penalty: None,
                    };
                    self.state.put_match(&m)?;
                }
                info!(
                    tournament = t.id,
                    teams = teams.len(),
                    matches = pairs.len(),
                    "round robin materialized"
                );
            }
            t.status = TournamentStatus::WaitForStart;
            self.state.put_tournament(&t)?;
        }
        Ok(())
    }

    /// Phase 3: dispatch every pending match of tournaments past their
    /// start instant.
    ///
    /// Matches are dispatched and marked `InQueue` one by one before the
    /// tournament itself is promoted, so a partial dispatch resumes with
    /// the remaining `Pending` matches on the next tick.
    fn kick_off(&self, now: u64) -> SchedulerResult<()> {
        for mut t in self
            .state
            .list_tournaments_with_status(TournamentStatus::WaitForStart)?
        {
            if t.start_at > now {
                continue;
            }
            let teams = self.state.teams_for_tournament(t.id)?;
            for mut m in self.state.matches_for_tournament(t.id)? {
                if m.status != MatchStatus::Pending {
                    continue;
                }
                let (Some(left), Some(right)) = (
                    teams.iter().find(|team| team.id == m.left_team_id),
                    teams.iter().find(|team| team.id == m.right_team_id),
                ) else {
                    error!(tournament = t.id, job_id = m.id, "match references unknown team");
                    continue;
                };
                self.sink.dispatch(&job_for(&m, left, right, &self.server_flags))?;
                m.status = MatchStatus::InQueue;
                self.state.put_match(&m)?;
                debug!(job_id = m.id, "match dispatched");
            }
            t.status = TournamentStatus::InProgress;
            self.state.put_tournament(&t)?;
            info!(tournament = t.id, name = %t.name, "tournament started");
        }
        Ok(())
    }

    /// Final sweep: a tournament with every match terminal is finished.
    fn sweep_finished(&self) -> SchedulerResult<()> {
        for mut t in self
            .state
            .list_tournaments_with_status(TournamentStatus::InProgress)?
        {
            let matches = self.state.matches_for_tournament(t.id)?;
            if !matches.is_empty() && matches.iter().all(|m| m.status.is_terminal()) {
                t.status = TournamentStatus::Finished;
                self.state.put_tournament(&t)?;
                info!(tournament = t.id, name = %t.name, "tournament finished");
            }
        }
        Ok(())
    }

    /// Tick on a fixed interval until shutdown. A failed tick is logged
    /// and retried on the next interval, never fatal.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "scheduler loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick(unix_now()) {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler loop stopping");
                    return;
                }
            }
        }
    }
}

/// Every unordered pair of teams, each exactly once.
fn round_robin(teams: &[Team]) -> Vec<(&Team, &Team)> {
    let mut pairs = Vec::new();
    for (i, left) in teams.iter().enumerate() {
        for right in &teams[i + 1..] {
            pairs.push((left, right));
        }
    }
    pairs
}

fn job_for(m: &Match, left: &Team, right: &Team, server_flags: &str) -> JobDispatch {
    JobDispatch {
        job_id: m.id,
        left_team_name: left.name.clone(),
        right_team_name: right.name.clone(),
        left_bundle: left.bundle.clone(),
        right_bundle: right.bundle.clone(),
        left_config: left.config.clone(),
        right_config: right.config.clone(),
        server_flags: server_flags.to_string(),
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitch_state::Tournament;

    fn fixture(state: &StateStore, team_count: usize) -> u64 {
        let id = state.next_id("tournament").unwrap();
        state
            .put_tournament(&Tournament {
                id,
                name: "spring cup".to_string(),
                start_registration_at: 100,
                end_registration_at: 200,
                start_at: 300,
                status: TournamentStatus::WaitForRegistration,
                created_at: 50,
            })
            .unwrap();
        for i in 0..team_count {
            let team_id = state.next_id("team").unwrap();
            state
                .put_team(&Team {
                    id: team_id,
                    tournament_id: id,
                    name: format!("team-{i}"),
                    bundle: format!("bundle-{i}"),
                    config: None,
                })
                .unwrap();
        }
        id
    }

    fn scheduler(state: &StateStore) -> DispatchScheduler<CollectSink> {
        DispatchScheduler::new(state.clone(), CollectSink::default(), String::new())
    }

    #[test]
    fn full_lifecycle_three_teams() {
        let state = StateStore::open_in_memory().unwrap();
        let id = fixture(&state, 3);
        let s = scheduler(&state);

        // Before the registration window nothing moves.
        s.tick(99).unwrap();
        assert_eq!(
            state.get_tournament(id).unwrap().unwrap().status,
            TournamentStatus::WaitForRegistration
        );

        s.tick(100).unwrap();
        assert_eq!(
            state.get_tournament(id).unwrap().unwrap().status,
            TournamentStatus::Registration
        );

        // Closing registration pairs 3 teams into C(3,2) = 3 matches.
        s.tick(200).unwrap();
        assert_eq!(
            state.get_tournament(id).unwrap().unwrap().status,
            TournamentStatus::WaitForStart
        );
        let matches = state.matches_for_tournament(id).unwrap();
        assert_eq!(matches.len(), 3);
        assert!(matches.iter().all(|m| m.status == MatchStatus::Pending));

        // Kickoff dispatches all three and marks them queued.
        s.tick(300).unwrap();
        assert_eq!(
            state.get_tournament(id).unwrap().unwrap().status,
            TournamentStatus::InProgress
        );
        let jobs = s.sink.drain();
        assert_eq!(jobs.len(), 3);
        assert!(state
            .matches_for_tournament(id)
            .unwrap()
            .iter()
            .all(|m| m.status == MatchStatus::InQueue));
    }

    #[test]
    fn pairing_runs_exactly_once() {
        let state = StateStore::open_in_memory().unwrap();
        let id = fixture(&state, 4);
        let s = scheduler(&state);

        s.tick(250).unwrap();
        assert_eq!(state.matches_for_tournament(id).unwrap().len(), 6);

        // A second pass over the same instant must not duplicate fixtures.
        s.tick(250).unwrap();
        assert_eq!(state.matches_for_tournament(id).unwrap().len(), 6);
    }

    #[test]
    fn kickoff_skips_already_queued_matches() {
        let state = StateStore::open_in_memory().unwrap();
        let id = fixture(&state, 3);
        let s = scheduler(&state);
        s.tick(250).unwrap();

        // Simulate a partially committed kickoff.
        let mut matches = state.matches_for_tournament(id).unwrap();
        matches[0].status = MatchStatus::InQueue;
        state.put_match(&matches[0]).unwrap();

        s.tick(300).unwrap();
        assert_eq!(s.sink.drain().len(), 2);
    }

    #[test]
    fn sweep_finishes_completed_tournaments() {
        let state = StateStore::open_in_memory().unwrap();
        let id = fixture(&state, 2);
        let s = scheduler(&state);
        s.tick(300).unwrap();
        assert_eq!(
            state.get_tournament(id).unwrap().unwrap().status,
            TournamentStatus::InProgress
        );

        let mut matches = state.matches_for_tournament(id).unwrap();
        assert_eq!(matches.len(), 1);
        matches[0].status = MatchStatus::Finished;
        state.put_match(&matches[0]).unwrap();

        s.tick(301).unwrap();
        assert_eq!(
            state.get_tournament(id).unwrap().unwrap().status,
            TournamentStatus::Finished
        );
    }

    #[test]
    fn empty_tournament_never_finishes_by_sweep() {
        let state = StateStore::open_in_memory().unwrap();
        let id = fixture(&state, 0);
        let s = scheduler(&state);
        s.tick(300).unwrap();
        // Zero teams means zero matches; the sweep must not declare it done.
        assert_eq!(
            state.get_tournament(id).unwrap().unwrap().status,
            TournamentStatus::InProgress
        );
        s.tick(400).unwrap();
        assert_eq!(
            state.get_tournament(id).unwrap().unwrap().status,
            TournamentStatus::InProgress
        );
    }

    #[test]
    fn dispatched_job_carries_team_details() {
        let state = StateStore::open_in_memory().unwrap();
        let id = fixture(&state, 2);
        let s = DispatchScheduler::new(
            state.clone(),
            CollectSink::default(),
            "--server::verbose=true".to_string(),
        );
        s.tick(300).unwrap();

        let jobs = s.sink.drain();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.left_team_name, "team-0");
        assert_eq!(job.right_bundle, "bundle-1");
        assert_eq!(job.server_flags, "--server::verbose=true");
        let m = state.find_match(job.job_id).unwrap().unwrap();
        assert_eq!(m.tournament_id, id);
    }
}
