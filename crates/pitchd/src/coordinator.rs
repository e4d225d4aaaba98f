//! Coordinator assembly: scheduler loop, event pump, stale-node sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pitch_queue::DurableQueue;
use pitch_scheduler::{run_event_pump, DispatchScheduler, NodeRegistry, QueueSink};
use pitch_state::StateStore;

pub struct CoordinatorOpts {
    pub tick_interval: Duration,
    pub stale_timeout: Duration,
    pub api_key: String,
    pub server_flags: String,
}

/// Spawn the coordinator's background loops; they all stop on the
/// shutdown channel.
pub fn spawn(
    state: StateStore,
    queue: DurableQueue,
    opts: CoordinatorOpts,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let scheduler = DispatchScheduler::new(
        state.clone(),
        QueueSink::new(queue.clone()),
        opts.server_flags,
    );
    let registry = Arc::new(NodeRegistry::new(state, queue.clone(), opts.api_key));
    info!("coordinator initialized");

    let scheduler_shutdown = shutdown.clone();
    let tick_interval = opts.tick_interval;
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(tick_interval, scheduler_shutdown).await;
    });

    let pump_registry = Arc::clone(&registry);
    let pump_shutdown = shutdown.clone();
    let pump_handle = tokio::spawn(async move {
        run_event_pump(queue, &pump_registry, pump_shutdown).await;
    });

    let sweep_handle = tokio::spawn(stale_sweep(registry, opts.stale_timeout, shutdown));

    vec![scheduler_handle, pump_handle, sweep_handle]
}

/// Mirror nodes that stopped reporting as crashed.
async fn stale_sweep(
    registry: Arc<NodeRegistry>,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = timeout / 2;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(interval) => {
                match registry.mark_stale_nodes(timeout.as_secs(), unix_now()) {
                    Ok(crashed) if !crashed.is_empty() => {
                        warn!(nodes = ?crashed, "silent nodes marked crashed");
                    }
                    Err(e) => error!(error = %e, "stale-node sweep failed"),
                    Ok(_) => {}
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
