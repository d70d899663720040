//! bulkmove - Parallel tree walker and bulk data-movement engine
//!
//! Moves large file trees between storage locations using fixed pools of
//! workers. Each worker owns its own backend session and talks to a
//! coordinator thread over a framed byte stream, so no backend state is ever
//! shared between threads.
//!
//! # Features
//!
//! - **Bounded Queues**: Blocking FIFO with a finish handshake connects
//!   producers and consumers and provides backpressure.
//!
//! - **Worker Pools**: N workers, N coordinators, a pluggable handler, and
//!   bounded-time termination.
//!
//! - **Tree Walker**: Parallel directory enumeration that resolves source
//!   and destination metadata for every entry.
//!
//! - **Task Dispatcher**: Replicate, migrate, copy, move and remove-replica
//!   tasks with per-task completion callbacks.
//!
//! - **Tree Copy**: Mirrors directories and symlinks and overwrites stale
//!   or mismatched destinations.
//!
//! - **Replication**: Brings every file to a desired replica count, migrates
//!   replicas between host domains and trims surplus replicas.
//!
//! # Architecture
//!
//! ```text
//!   ┌───────────────┐  entries  ┌──────────────┐  commands  ┌───────────────┐
//!   │ DirTreeWalker │ ────────▶ │    caller    │ ─────────▶ │ TaskDispatcher│
//!   │ (pool "walk") │           │ (filters and │ ◀───────── │ (pool         │
//!   └───────┬───────┘           │  decides)    │ on_complete│  "dispatch")  │
//!           │                   └──────────────┘            └───────┬───────┘
//!           ▼                                                       ▼
//!   ┌─────────────────────────────────────────────────────────────────────┐
//!   │        Backend sessions (metadata client + storage operations)      │
//!   └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # List a tree
//! bulkmove list /data -r
//!
//! # Copy a tree, skipping files that are already up to date
//! bulkmove copy /data /backup/data -j 16 --skip-existing
//!
//! # Keep two replicas of every file, removing any extra ones
//! bulkmove replicate /data -N 2 -x
//! ```

pub mod backend;
pub mod config;
pub mod copy;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod hosts;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod replicate;
pub mod walker;

pub use config::{CliArgs, DispatchConfig, Location, WalkConfig};
pub use dispatch::{DispatchOptions, TaskDispatcher, TaskStatus};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use queue::BoundedQueue;
pub use replicate::{ReplicateOptions, Replicator};
pub use walker::{DirTreeEntry, DirTreeWalker};
