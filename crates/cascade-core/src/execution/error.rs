//! Error types for job execution.

use crate::processor::ProcessorError;

/// Errors that can occur while building or running a job execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The DAG handed to the engine was never finalized.
    #[error("DAG has not been finalized")]
    DagNotFinalized,

    /// Instances of one vertex reported different snapshot state types.
    #[error("vertex {0} instances disagree on snapshot state type")]
    MixedStateType(String),

    /// A unit's lifecycle call failed; the job attempt aborts.
    #[error("unit {vertex}[{instance}] failed: {source}")]
    UnitFailed {
        /// Name of the vertex the unit implements.
        vertex: String,
        /// The unit's instance index.
        instance: usize,
        /// The underlying lifecycle failure.
        #[source]
        source: ProcessorError,
    },

    /// The job was cancelled before completing.
    #[error("job cancelled")]
    Cancelled,

    /// A worker thread panicked.
    #[error("worker thread panicked")]
    WorkerPanicked,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}
