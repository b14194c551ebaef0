//! Error types for DAG construction and validation.

/// Errors that can occur while building or validating a DAG.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// The DAG contains a cycle involving the named vertex.
    #[error("cycle detected involving vertex: {0}")]
    CycleDetected(String),

    /// A vertex with the same name already exists.
    #[error("duplicate vertex name: {0}")]
    DuplicateVertex(String),

    /// An edge references a vertex that does not exist.
    #[error("vertex not found: {0}")]
    VertexNotFound(String),

    /// Two edges target the same (vertex, ordinal) pair.
    #[error("duplicate inbound ordinal {ordinal} on vertex {vertex}")]
    DuplicateOrdinal {
        /// Destination vertex name.
        vertex: String,
        /// The ordinal claimed twice.
        ordinal: u16,
    },

    /// Inbound ordinals on a vertex are not contiguous from zero.
    #[error("vertex {vertex} has an ordinal gap: missing ordinal {missing}")]
    OrdinalGap {
        /// Destination vertex name.
        vertex: String,
        /// The lowest missing ordinal.
        missing: u16,
    },

    /// A vertex was declared with zero parallelism.
    #[error("vertex {0} declares zero parallelism")]
    ZeroParallelism(String),

    /// The DAG has no vertices.
    #[error("empty DAG: no vertices")]
    EmptyDag,

    /// Execution was attempted on a DAG that was never finalized.
    #[error("DAG has not been finalized")]
    NotFinalized,
}
