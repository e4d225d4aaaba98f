//! Node assembly: announce, then poll the jobs queue and this node's
//! command queue until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use pitch_node::{NodeError, RunnerNode};
use pitch_queue::{
    command_queue, retry_with_backoff, CommandRequest, DurableQueue, JobDispatch, JOBS_QUEUE,
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Run the node until shutdown.
pub async fn run(node: Arc<RunnerNode>, queue: DurableQueue, mut shutdown: watch::Receiver<bool>) {
    retry_with_backoff(RETRY_INTERVAL, "announce", || node.announce()).await;
    info!(node_id = node.node_id(), "node announced");

    let commands = command_queue(node.node_id());
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("node stopping");
                return;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = node.heartbeat().await {
                    warn!(error = %e, "heartbeat failed");
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                poll_commands(&node, &queue, &commands).await;
                poll_jobs(&node, &queue).await;
            }
        }
    }
}

/// Answer every queued command request.
async fn poll_commands(node: &Arc<RunnerNode>, queue: &DurableQueue, commands: &str) {
    loop {
        let delivery = match queue.consume::<CommandRequest>(commands) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "command consume failed");
                return;
            }
        };
        let request = delivery.message.clone();
        match node.handle_command(request).await {
            Ok(response) => {
                info!(
                    success = response.success,
                    error = response.error.as_deref().unwrap_or(""),
                    "command handled"
                );
                if let Err(e) = delivery.ack() {
                    error!(error = %e, "command ack failed");
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "command handling failed, requeued");
                if let Err(e) = delivery.nack() {
                    error!(error = %e, "command requeue failed");
                }
                return;
            }
        }
    }
}

/// Admit dispatched jobs while there is room; a rejected dispatch goes
/// back on the queue for another node (or a later attempt).
async fn poll_jobs(node: &Arc<RunnerNode>, queue: &DurableQueue) {
    loop {
        let delivery = match queue.consume::<JobDispatch>(JOBS_QUEUE) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "job consume failed");
                return;
            }
        };
        let dispatch = delivery.message.clone();
        let job_id = dispatch.job_id;
        match node.admit(dispatch).await {
            Ok(()) => {
                if let Err(e) = delivery.ack() {
                    error!(job_id, error = %e, "job ack failed");
                    return;
                }
            }
            Err(NodeError::AdmissionRejected(reason)) => {
                info!(job_id, %reason, "dispatch requeued");
                if let Err(e) = delivery.nack() {
                    error!(job_id, error = %e, "job requeue failed");
                }
                // Full or paused; no point draining further right now.
                return;
            }
            Err(e) => {
                // The job itself failed; its verdict is already on the
                // events queue, so the dispatch is consumed.
                warn!(job_id, error = %e, "job failed at admission");
                if let Err(e) = delivery.ack() {
                    error!(job_id, error = %e, "job ack failed");
                    return;
                }
            }
        }
    }
}
