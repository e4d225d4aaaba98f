//! pitchd — the pitchgrid daemon.
//!
//! Single binary that runs the coordinator (tournament scheduler, node
//! registry, event pump), a runner node, or both in one process:
//!
//! ```text
//! pitchd coordinator --data-dir /var/lib/pitchgrid
//! pitchd node --data-dir /var/lib/pitchgrid --node-id node-1 --capacity 4
//! pitchd standalone --data-dir /var/lib/pitchgrid
//! ```
//!
//! Coordinator and node share one channel database; point `--queue-path`
//! of both at the same file (or run standalone).

mod coordinator;
mod node_mode;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use coordinator::CoordinatorOpts;
use pitch_node::{AssetSpec, RunnerConfig, RunnerNode};
use pitch_queue::DurableQueue;
use pitch_state::StateStore;

#[derive(Parser)]
#[command(name = "pitchd", about = "pitchgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/pitchgrid")]
    data_dir: PathBuf,

    /// Channel database path (defaults to `<data-dir>/channel.redb`).
    #[arg(long)]
    queue_path: Option<PathBuf>,

    /// Shared key authenticating node commands.
    #[arg(long, default_value = "pitchgrid")]
    api_key: String,
}

#[derive(clap::Args)]
struct CoordinatorArgs {
    /// Scheduler tick interval in seconds.
    #[arg(long, default_value = "5")]
    tick_interval: u64,

    /// Seconds of silence before a node is mirrored as crashed.
    #[arg(long, default_value = "60")]
    stale_timeout: u64,

    /// Extra flags appended to every match's server command line.
    #[arg(long, default_value = "")]
    server_flags: String,
}

#[derive(clap::Args)]
struct NodeArgs {
    /// Identifier of this node (matches its command queue name).
    #[arg(long, default_value = "node-1")]
    node_id: String,

    /// Address this node registers under.
    #[arg(long, default_value = "127.0.0.1:7000")]
    address: String,

    /// Concurrent matches this node admits.
    #[arg(long, default_value = "4")]
    capacity: u32,

    /// JSON file declaring the asset bundles this node can provision.
    #[arg(long)]
    assets: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator: scheduler, event pump, and node registry.
    Coordinator {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        coordinator: CoordinatorArgs,
    },
    /// Run one runner node.
    Node {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Run coordinator and one node in a single process.
    Standalone {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        coordinator: CoordinatorArgs,
        #[command(flatten)]
        node: NodeArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pitchd=debug,pitch=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator {
            common,
            coordinator,
        } => run_coordinator(common, coordinator).await,
        Command::Node { common, node } => run_node(common, node).await,
        Command::Standalone {
            common,
            coordinator,
            node,
        } => run_standalone(common, coordinator, node).await,
    }
}

fn open_queue(common: &CommonArgs) -> anyhow::Result<DurableQueue> {
    std::fs::create_dir_all(&common.data_dir)?;
    let path = common
        .queue_path
        .clone()
        .unwrap_or_else(|| common.data_dir.join("channel.redb"));
    let queue = DurableQueue::open(&path)?;
    info!(path = ?path, "channel opened");
    Ok(queue)
}

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        let _ = tx.send(true);
    });
    rx
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

fn coordinator_opts(common: &CommonArgs, args: CoordinatorArgs) -> CoordinatorOpts {
    CoordinatorOpts {
        tick_interval: Duration::from_secs(args.tick_interval),
        stale_timeout: Duration::from_secs(args.stale_timeout),
        api_key: common.api_key.clone(),
        server_flags: args.server_flags,
    }
}

fn build_node(
    common: &CommonArgs,
    args: &NodeArgs,
    queue: DurableQueue,
) -> anyhow::Result<Arc<RunnerNode>> {
    let assets: Vec<AssetSpec> = match &args.assets {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };
    let node = RunnerNode::new(
        RunnerConfig {
            node_id: args.node_id.clone(),
            address: args.address.clone(),
            capacity: args.capacity,
            data_dir: common.data_dir.clone(),
            api_key: common.api_key.clone(),
            assets,
        },
        queue,
        None,
    )?;
    info!(node_id = %args.node_id, capacity = args.capacity, "node initialized");
    Ok(node)
}

async fn run_coordinator(common: CommonArgs, args: CoordinatorArgs) -> anyhow::Result<()> {
    info!("pitchgrid coordinator starting");
    let queue = open_queue(&common)?;
    let state = StateStore::open(&common.data_dir.join("state.redb"))?;
    info!("state store opened");

    let shutdown = shutdown_on_ctrl_c();
    let opts = coordinator_opts(&common, args);
    let handles = coordinator::spawn(state, queue, opts, shutdown);
    join_all(handles).await;
    info!("pitchgrid coordinator stopped");
    Ok(())
}

async fn run_node(common: CommonArgs, args: NodeArgs) -> anyhow::Result<()> {
    info!("pitchgrid node starting");
    let queue = open_queue(&common)?;
    let node = build_node(&common, &args, queue.clone())?;

    let shutdown = shutdown_on_ctrl_c();
    node_mode::run(node, queue, shutdown).await;
    info!("pitchgrid node stopped");
    Ok(())
}

async fn run_standalone(
    common: CommonArgs,
    coordinator_args: CoordinatorArgs,
    node_args: NodeArgs,
) -> anyhow::Result<()> {
    info!("pitchgrid daemon starting in standalone mode");
    let queue = open_queue(&common)?;
    let state = StateStore::open(&common.data_dir.join("state.redb"))?;
    let node = build_node(&common, &node_args, queue.clone())?;

    let shutdown = shutdown_on_ctrl_c();
    let opts = coordinator_opts(&common, coordinator_args);
    let mut handles = coordinator::spawn(state, queue.clone(), opts, shutdown.clone());
    handles.push(tokio::spawn(node_mode::run(node, queue, shutdown)));
    join_all(handles).await;
    info!("pitchgrid daemon stopped");
    Ok(())
}
