//! # Cascade Core
//!
//! The execution core of a distributed dataflow engine: computations are
//! a directed acyclic graph of vertices connected by edges, each vertex
//! instantiated into parallel processing units that transform zero or
//! more input streams into zero or more output streams.
//!
//! This crate implements the execution contract between a unit and the
//! engine:
//!
//! - **Processor contract**: the polymorphic unit abstraction with its
//!   lifecycle (`init` → `process`/`try_process` → `complete`)
//! - **Queue primitives**: bounded inbox/outbox backpressure — the sole
//!   flow-control mechanism in the system
//! - **Cooperative scheduler**: many units multiplexed on few worker
//!   threads, with dedicated threads for units that must block
//! - **Snapshot protocol**: save/restore of unit state into consistent,
//!   replayable checkpoints
//!
//! ## Design Principles
//!
//! 1. **Exclusive unit ownership** - one tasklet owns one unit; lifecycle
//!    calls are strictly sequential, no unit-side synchronization
//! 2. **Backpressure by bounded queues** - a full lane rejects offers;
//!    units retain and retry, never drop
//! 3. **Bounded call slices** - cooperative calls target 1ms; blocking
//!    work belongs on dedicated threads
//! 4. **Replayable state** - every snapshot entry written is replayed
//!    exactly once on restore
//!
//! ## Example
//!
//! ```rust,ignore
//! use cascade_core::{DagBuilder, ExecutionConfig, ExecutionEngine};
//!
//! let dag = DagBuilder::new()
//!     .vertex("numbers", source_factory)
//!     .vertex_with_parallelism("double", map_factory, 4)
//!     .vertex("collect", sink_factory)
//!     .edge("numbers", "double")
//!     .edge("double", "collect")
//!     .build()?;
//!
//! let engine = ExecutionEngine::new(&dag, ExecutionConfig::default())?;
//! engine.run()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod budget;
pub mod dag;
pub mod datamodel;
pub mod execution;
pub mod item;
pub mod processor;
pub mod queue;
pub mod snapshot;

pub use dag::{Dag, DagBuilder, DagError, Distribution, Ordinal, RoutingPolicy};
pub use execution::{ExecutionConfig, ExecutionEngine, ExecutionError, MetricsSnapshot};
pub use item::Item;
pub use processor::{
    CancellationSource, CancellationToken, Context, JobId, Processor, ProcessorError,
    ProcessorFactory, StateType,
};
pub use queue::{Inbox, Outbox};
pub use snapshot::{
    InMemorySnapshotStore, SnapshotConfig, SnapshotCoordinator, SnapshotError, SnapshotManifest,
    SnapshotSink,
};

/// Result type for cascade-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cascade-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DAG construction or validation errors.
    #[error("DAG error: {0}")]
    Dag(#[from] dag::DagError),

    /// Job execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] execution::ExecutionError),

    /// Snapshot protocol errors.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] snapshot::SnapshotError),

    /// Processor lifecycle errors.
    #[error("Processor error: {0}")]
    Processor(#[from] processor::ProcessorError),

    /// Payload codec errors.
    #[error("Codec error: {0}")]
    Codec(#[from] datamodel::CodecError),
}
