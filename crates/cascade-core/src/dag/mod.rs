//! # DAG model
//!
//! Static description of a computation: which vertices exist, how many
//! parallel unit instances each has, and how items are routed and
//! partitioned between producer and consumer instances.
//!
//! - [`Dag`] — the validated topology with topological ordering
//! - [`DagBuilder`] — fluent builder consumed once at job submission
//! - [`Vertex`] / [`Edge`] — adjacency-list representation
//! - [`RoutingPolicy`] — broadcast, round-robin, or key-partitioned
//!
//! Build-time validation rejects cycles, duplicate names, duplicate
//! destination ordinals, ordinal gaps, and zero parallelism. Once
//! finalized the topology is immutable and can be handed to
//! [`ExecutionEngine`](crate::execution::ExecutionEngine).

pub mod builder;
pub mod error;
pub mod routing;
pub mod topology;

#[cfg(test)]
mod tests;

pub use builder::{DagBuilder, EdgeConfig};
pub use error::DagError;
pub use routing::{key_partition, partition_index, Distribution, KeyFn, RoutingPolicy};
pub use topology::{Dag, Edge, EdgeId, Ordinal, Vertex, VertexId};
