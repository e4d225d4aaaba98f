//! The runner node: admission control, per-job supervision tasks, and
//! the command protocol handler.
//!
//! # Architecture
//!
//! One `RunnerNode` owns the port pool, the active-job table, and the
//! node status. Admission happens under short lock holds; each admitted
//! job runs in its own spawned task that awaits the server process and
//! funnels into `complete_job`, the single exit where the job is
//! removed, the ports are released, and the terminal event is
//! published. Removal from the job table gates the release, so a job
//! can never free its ports twice.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use pitch_queue::{
    CommandRequest, CommandResponse, DurableQueue, JobDispatch, JobFinished, JobStarted,
    NodeEvent, StatusReport, EVENTS_QUEUE,
};
use pitch_state::{MatchId, NodeCommand, NodeStatus};

use crate::command::{self, Verdict};
use crate::error::{NodeError, NodeResult};
use crate::game::{self, GameSpec, MatchScores};
use crate::ports::{PortPool, PortTriple};
use crate::provision::{AssetSpec, BundleStore, Provisioner};

/// Static configuration of one runner node.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub node_id: String,
    pub address: String,
    pub capacity: u32,
    pub data_dir: PathBuf,
    /// Shared key command requests must carry.
    pub api_key: String,
    /// Bundles this node knows how to provision.
    pub assets: Vec<AssetSpec>,
}

struct ActiveJob {
    ports: PortTriple,
    stop: Option<oneshot::Sender<()>>,
}

/// A worker node: admits dispatched jobs, supervises their server
/// processes, and answers coordinator commands.
pub struct RunnerNode {
    config: RunnerConfig,
    pool: PortPool,
    status: Mutex<NodeStatus>,
    jobs: Mutex<HashMap<MatchId, ActiveJob>>,
    events: DurableQueue,
    provisioner: Provisioner,
}

impl RunnerNode {
    /// Build a node. A missing simulation server binary is fatal here,
    /// never at admission time.
    pub fn new(
        config: RunnerConfig,
        events: DurableQueue,
        store: Option<Arc<dyn BundleStore>>,
    ) -> NodeResult<Arc<Self>> {
        let server = config.data_dir.join(game::SERVER_DIR).join(game::SERVER_BINARY);
        if !server.exists() {
            return Err(NodeError::ServerMissing(server));
        }
        let provisioner = Provisioner::new(&config.data_dir, store);
        Ok(Arc::new(Self {
            pool: PortPool::new(config.capacity),
            status: Mutex::new(NodeStatus::Running),
            jobs: Mutex::new(HashMap::new()),
            events,
            provisioner,
            config,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub async fn status(&self) -> NodeStatus {
        *self.status.lock().await
    }

    /// Ids of jobs currently running.
    pub async fn active_jobs(&self) -> Vec<MatchId> {
        self.jobs.lock().await.keys().copied().collect()
    }

    /// Announce this node over the events queue: registration plus an
    /// initial status report.
    pub async fn announce(&self) -> NodeResult<()> {
        self.events.publish(
            EVENTS_QUEUE,
            &NodeEvent::Register {
                node_id: self.config.node_id.clone(),
                address: self.config.address.clone(),
                capacity: self.config.capacity,
            },
        )?;
        self.publish_status().await?;
        Ok(())
    }

    /// Try to take on a dispatched job.
    ///
    /// `AdmissionRejected` means "not now" and the caller should requeue
    /// the dispatch; any other error is a verdict on the job itself and
    /// has already been reported over the events queue.
    pub async fn admit(self: &Arc<Self>, dispatch: JobDispatch) -> NodeResult<()> {
        let job_id = dispatch.job_id;
        {
            let status = self.status.lock().await;
            if *status != NodeStatus::Running {
                return Err(NodeError::AdmissionRejected(format!(
                    "node is {:?}",
                    *status
                )));
            }
        }

        let ports = match self.pool.acquire() {
            Some(ports) => ports,
            None => {
                return Err(NodeError::AdmissionRejected("no free ports".into()));
            }
        };

        let spec = GameSpec::new(&self.config.data_dir, dispatch, ports);
        if let Err(e) = spec.check_assets() {
            self.pool.release(ports);
            self.events.publish(
                EVENTS_QUEUE,
                &NodeEvent::Started(JobStarted {
                    job_id,
                    node_id: self.config.node_id.clone(),
                    success: false,
                    assigned_port: None,
                    error: Some(e.to_string()),
                }),
            )?;
            return Err(e);
        }

        // Publish before the table insert: once an entry exists its ports
        // are only ever freed by the supervisor's completion path, so
        // nothing fallible may sit between insert and spawn.
        if let Err(e) = self.events.publish(
            EVENTS_QUEUE,
            &NodeEvent::Started(JobStarted {
                job_id,
                node_id: self.config.node_id.clone(),
                success: true,
                assigned_port: Some(ports.primary),
                error: None,
            }),
        ) {
            self.pool.release(ports);
            return Err(e.into());
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        self.jobs.lock().await.insert(
            job_id,
            ActiveJob {
                ports,
                stop: Some(stop_tx),
            },
        );
        info!(job_id, port = ports.primary, "job admitted");

        let node = Arc::clone(self);
        tokio::spawn(async move {
            let result = game::supervise(&spec, stop_rx).await;
            game::log_outcome(job_id, &result);
            if let Err(e) = node.complete_job(job_id, result).await {
                warn!(job_id, error = %e, "job completion reporting failed");
            }
        });
        Ok(())
    }

    /// The single completion path: removal from the job table gates the
    /// port release and the terminal event, making both exactly-once.
    async fn complete_job(
        &self,
        job_id: MatchId,
        result: NodeResult<MatchScores>,
    ) -> NodeResult<()> {
        let Some(job) = self.jobs.lock().await.remove(&job_id) else {
            return Ok(());
        };
        self.pool.release(job.ports);

        let finished = match &result {
            Ok(scores) => JobFinished {
                job_id,
                node_id: self.config.node_id.clone(),
                success: true,
                left_score: Some(scores.left_score),
                right_score: Some(scores.right_score),
                left_penalty: scores.left_penalty,
                right_penalty: scores.right_penalty,
            },
            Err(_) => JobFinished {
                job_id,
                node_id: self.config.node_id.clone(),
                success: false,
                left_score: None,
                right_score: None,
                left_penalty: None,
                right_penalty: None,
            },
        };
        self.events.publish(EVENTS_QUEUE, &NodeEvent::Finished(finished))?;
        Ok(())
    }

    /// Ask one running job to stop; its process is killed and the job
    /// finalizes through the normal failure path. Returns false when no
    /// such job is active.
    pub async fn stop_job(&self, job_id: MatchId) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job_id).and_then(|job| job.stop.take()) {
            Some(stop) => {
                let _ = stop.send(());
                true
            }
            None => false,
        }
    }

    /// Evaluate and apply one coordinator command.
    ///
    /// Rejections come back as unsuccessful responses, never as errors;
    /// only channel faults escape as `Err`.
    pub async fn handle_command(&self, request: CommandRequest) -> NodeResult<CommandResponse> {
        if request.api_key != self.config.api_key {
            warn!(command = ?request.command, "command with invalid api key rejected");
            return Ok(CommandResponse::rejected("invalid api key"));
        }

        let current = *self.status.lock().await;
        let next = match command::evaluate(current, request.command) {
            Verdict::Accept(next) => next,
            Verdict::Reject(reason) => {
                info!(command = ?request.command, status = ?current, %reason, "command rejected");
                return Ok(CommandResponse::rejected(reason));
            }
        };

        if request.command == NodeCommand::Hello {
            let value =
                serde_json::to_string(&current).unwrap_or_else(|_| format!("{current:?}"));
            return Ok(CommandResponse::ok_with(value));
        }

        if request.command == NodeCommand::Update {
            return self.run_update(&request).await;
        }

        // STOP only halts admission and participation; running jobs are
        // left to finish on their own.
        *self.status.lock().await = next;
        info!(command = ?request.command, from = ?current, to = ?next, "command applied");
        self.publish_status().await?;
        Ok(CommandResponse::ok())
    }

    /// Run the provisioner while the node is marked `Updating`; the node
    /// lands in `Paused` afterwards and waits for an explicit RESUME.
    async fn run_update(&self, request: &CommandRequest) -> NodeResult<CommandResponse> {
        *self.status.lock().await = NodeStatus::Updating;
        self.publish_status().await?;

        let summary = self
            .provisioner
            .provision(
                &self.config.assets,
                request.asset_overrides.as_deref(),
                request.use_alt_source,
            )
            .await;

        *self.status.lock().await = NodeStatus::Paused;
        self.publish_status().await?;
        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "update finished"
        );

        let value = serde_json::to_string(&summary)
            .map_err(|e| NodeError::Archive(e.to_string()))?;
        Ok(CommandResponse {
            success: summary.is_ok(),
            error: (!summary.is_ok()).then(|| {
                format!("{} bundle(s) failed to provision", summary.failed.len())
            }),
            value: Some(value),
        })
    }

    /// Push a fresh status report; the coordinator treats prolonged
    /// silence as a crash.
    pub async fn heartbeat(&self) -> NodeResult<()> {
        self.publish_status().await
    }

    async fn publish_status(&self) -> NodeResult<()> {
        let report = StatusReport {
            node_id: self.config.node_id.clone(),
            status: *self.status.lock().await,
            timestamp: unix_now(),
        };
        self.events.publish(EVENTS_QUEUE, &NodeEvent::Status(report))?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
