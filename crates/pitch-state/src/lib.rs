//! pitch-state — embedded state store for pitchgrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the coordinator's view of
//! tournaments, teams, matches, and runner nodes.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{tournament_id}:{child_id}`) enable prefix scans for
//! the per-tournament queries the dispatch scheduler runs each tick.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
