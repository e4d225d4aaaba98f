//! Node registry: the coordinator's mirror of the runner fleet.
//!
//! The mirror is best-effort and eventually consistent; the node itself
//! is authoritative for its status. Guards here exist to fail commands
//! fast against the last known status, the node re-checks on receipt.

use tracing::{info, warn};

use pitch_queue::{
    command_queue, CommandRequest, DurableQueue, JobFinished, JobStarted, NodeEvent,
    StatusReport,
};
use pitch_state::{
    MatchStatus, NodeCommand, NodeId, NodeRecord, NodeStatus, StateStore,
};

use crate::error::{SchedulerError, SchedulerResult};

/// Registers nodes, mirrors their reports, and forwards commands.
pub struct NodeRegistry {
    state: StateStore,
    queue: DurableQueue,
    api_key: String,
}

impl NodeRegistry {
    pub fn new(state: StateStore, queue: DurableQueue, api_key: String) -> Self {
        Self {
            state,
            queue,
            api_key,
        }
    }

    /// Register a node under its own id. The id is authoritative: status
    /// reports and the command queue are keyed by it. Re-registering a
    /// known address refreshes to `Running` instead of duplicating; an
    /// address reclaimed under a different id supersedes the old record.
    pub fn register(
        &self,
        node_id: &str,
        address: &str,
        capacity: u32,
        now: u64,
    ) -> SchedulerResult<NodeId> {
        if let Some(existing) = self.state.find_node_by_address(address)? {
            if existing.id != node_id {
                self.state.delete_node(&existing.id)?;
                warn!(
                    old = %existing.id,
                    new = %node_id,
                    %address,
                    "address re-registered under a new node id"
                );
            }
        }
        self.state.put_node(&NodeRecord {
            id: node_id.to_string(),
            address: address.to_string(),
            capacity,
            status: NodeStatus::Running,
            requested_command: None,
            last_seen: now,
        })?;
        info!(node_id = %node_id, %address, capacity, "node registered");
        Ok(node_id.to_string())
    }

    /// Apply one event from the events queue to the mirror.
    pub fn handle_event(&self, event: &NodeEvent, now: u64) -> SchedulerResult<()> {
        match event {
            NodeEvent::Register {
                node_id,
                address,
                capacity,
            } => {
                self.register(node_id, address, *capacity, now)?;
            }
            NodeEvent::Started(started) => self.apply_started(started)?,
            NodeEvent::Finished(finished) => self.apply_finished(finished)?,
            NodeEvent::Status(report) => self.apply_status(report)?,
        }
        Ok(())
    }

    fn apply_started(&self, started: &JobStarted) -> SchedulerResult<()> {
        let Some(mut m) = self.state.find_match(started.job_id)? else {
            warn!(job_id = started.job_id, "started event for unknown match");
            return Ok(());
        };
        if started.success {
            m.status = MatchStatus::InProgress;
            m.node_id = Some(started.node_id.clone());
            info!(job_id = m.id, node_id = %started.node_id, "match running");
        } else {
            m.status = MatchStatus::Failed;
            warn!(
                job_id = m.id,
                node_id = %started.node_id,
                error = started.error.as_deref().unwrap_or("unknown"),
                "match failed to start"
            );
        }
        self.state.put_match(&m)?;
        Ok(())
    }

    fn apply_finished(&self, finished: &JobFinished) -> SchedulerResult<()> {
        let Some(mut m) = self.state.find_match(finished.job_id)? else {
            warn!(job_id = finished.job_id, "finished event for unknown match");
            return Ok(());
        };
        if m.status.is_terminal() {
            // Duplicate delivery; first terminal verdict wins.
            return Ok(());
        }
        if finished.success {
            m.status = MatchStatus::Finished;
            m.left_score = finished.left_score;
            m.right_score = finished.right_score;
            m.left_penalty = finished.left_penalty;
            m.right_penalty = finished.right_penalty;
            info!(
                job_id = m.id,
                left = ?finished.left_score,
                right = ?finished.right_score,
                "match finished"
            );
        } else {
            m.status = MatchStatus::Failed;
            warn!(job_id = m.id, "match failed");
        }
        self.state.put_match(&m)?;
        Ok(())
    }

    fn apply_status(&self, report: &StatusReport) -> SchedulerResult<()> {
        let Some(mut node) = self.state.get_node(&report.node_id)? else {
            warn!(node_id = %report.node_id, "status report from unknown node");
            return Ok(());
        };
        // An applied command is what the report confirms.
        if node.requested_command.is_some() {
            node.requested_command = None;
        }
        node.status = report.status;
        node.last_seen = report.timestamp;
        self.state.put_node(&node)?;
        Ok(())
    }

    /// Guard and forward one command to a node's command queue.
    pub fn send_command(
        &self,
        node_id: &str,
        command: NodeCommand,
        asset_overrides: Option<Vec<String>>,
        use_alt_source: bool,
    ) -> SchedulerResult<()> {
        let mut node = self
            .state
            .get_node(node_id)?
            .ok_or_else(|| SchedulerError::UnknownNode(node_id.to_string()))?;

        if command != NodeCommand::Hello {
            self.guard(&node, command)?;
        }

        self.queue.publish(
            &command_queue(node_id),
            &CommandRequest {
                command,
                asset_overrides,
                use_alt_source,
                api_key: self.api_key.clone(),
            },
        )?;
        if command != NodeCommand::Hello {
            node.requested_command = Some(command);
            self.state.put_node(&node)?;
        }
        info!(node_id = %node.id, ?command, "command forwarded");
        Ok(())
    }

    /// Fail fast against the last known status. A pending PAUSE counts
    /// as paused for UPDATE so the two can be issued back to back.
    fn guard(&self, node: &NodeRecord, command: NodeCommand) -> SchedulerResult<()> {
        let reject = |reason: &str| Err(SchedulerError::CommandRejected(reason.to_string()));
        if node.status.is_terminal() {
            return reject(&format!("node is {:?}", node.status));
        }
        match command {
            NodeCommand::Update => {
                let paused = node.status == NodeStatus::Paused
                    || node.requested_command == Some(NodeCommand::Pause);
                if !paused {
                    return reject("must be paused");
                }
            }
            NodeCommand::Resume => {
                if node.status == NodeStatus::Updating {
                    return reject("update in progress");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Mirror nodes silent past the timeout as crashed.
    pub fn mark_stale_nodes(&self, timeout_secs: u64, now: u64) -> SchedulerResult<Vec<NodeId>> {
        let mut crashed = Vec::new();
        for mut node in self.state.list_nodes()? {
            if node.status.is_terminal() {
                continue;
            }
            if node.last_seen + timeout_secs < now {
                warn!(node_id = %node.id, last_seen = node.last_seen, "node went silent");
                node.status = NodeStatus::Crashed;
                self.state.put_node(&node)?;
                crashed.push(node.id);
            }
        }
        Ok(crashed)
    }
}
