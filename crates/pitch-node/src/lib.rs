//! pitch-node — the runner node.
//!
//! A node admits match jobs up to its port-pool capacity, supervises each
//! match as one simulation-server child process, and reports lifecycle
//! events back to the coordinator over the message channel.
//!
//! # Architecture
//!
//! ```text
//! RunnerNode
//!   ├── PortPool (fixed-capacity admission control)
//!   ├── active-job table (one supervised task per running match)
//!   ├── command protocol (PAUSE / RESUME / UPDATE / STOP / HELLO)
//!   └── Provisioner (ranked-provider bundle fetch, UPDATE only)
//! ```
//!
//! The control plane (pool mutation, command handling) never blocks on a
//! running match: each process-exit wait lives in its own supervised task
//! that posts exactly one completion event.

pub mod command;
pub mod error;
pub mod game;
pub mod ports;
pub mod provision;
pub mod runner;

pub use command::Verdict;
pub use error::{NodeError, NodeResult};
pub use game::{GameSpec, MatchScores};
pub use ports::{PortPool, PortTriple};
pub use provision::{AssetSpec, BundleStore, Provider, Provisioner, ProvisionSummary};
pub use runner::{RunnerConfig, RunnerNode};
