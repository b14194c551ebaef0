//! DAG builder API for programmatic topology construction.
//!
//! Provides [`DagBuilder`] for fluent DAG construction at job-submission
//! time and [`EdgeConfig`] for per-edge routing configuration.

use fxhash::FxHashMap;

use crate::processor::ProcessorFactory;

use super::error::DagError;
use super::routing::{Distribution, KeyFn, RoutingPolicy};
use super::topology::Dag;

/// Fluent builder for constructing [`Dag`] topologies.
///
/// Consumed once at job submission; the built DAG is immutable.
///
/// # Example
///
/// ```rust,ignore
/// use cascade_core::dag::DagBuilder;
///
/// let dag = DagBuilder::new()
///     .vertex("lines", line_source)
///     .vertex_with_parallelism("tokenize", tokenizer, 4)
///     .vertex_with_parallelism("count", counter, 4)
///     .vertex("sink", list_sink) // parallelism 1: global order matters
///     .edge("lines", "tokenize")
///     .edge_via("tokenize", "count", |e| e.partitioned(word_key))
///     .edge("count", "sink")
///     .build()?;
/// ```
pub struct DagBuilder {
    /// Vertices being constructed: (name, factory, parallelism).
    vertices: Vec<(String, ProcessorFactory, usize)>,
    /// Edges being constructed.
    edges: Vec<EdgeConfig>,
    /// Name -> index mapping for duplicate detection at build.
    name_index: FxHashMap<String, usize>,
}

impl DagBuilder {
    /// Creates a new DAG builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
            name_index: FxHashMap::default(),
        }
    }

    /// Adds a vertex with parallelism 1.
    #[must_use]
    pub fn vertex(self, name: &str, factory: ProcessorFactory) -> Self {
        self.vertex_with_parallelism(name, factory, 1)
    }

    /// Adds a vertex with an explicit parallelism.
    #[must_use]
    pub fn vertex_with_parallelism(
        mut self,
        name: &str,
        factory: ProcessorFactory,
        parallelism: usize,
    ) -> Self {
        let idx = self.vertices.len();
        self.vertices.push((name.to_string(), factory, parallelism));
        self.name_index.insert(name.to_string(), idx);
        self
    }

    /// Connects two vertices with a default edge: next free destination
    /// ordinal, round-robin routing, local distribution.
    #[must_use]
    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.edges.push(EdgeConfig::new(from, to));
        self
    }

    /// Connects two vertices, configuring the edge through a closure.
    ///
    /// ```rust,ignore
    /// builder.edge_via("a", "b", |e| e.ordinal(1).broadcast().distributed())
    /// ```
    #[must_use]
    pub fn edge_via<F>(mut self, from: &str, to: &str, configure: F) -> Self
    where
        F: FnOnce(EdgeConfig) -> EdgeConfig,
    {
        self.edges.push(configure(EdgeConfig::new(from, to)));
        self
    }

    /// Builds and finalizes the immutable DAG.
    ///
    /// # Errors
    ///
    /// Returns [`DagError::DuplicateVertex`], [`DagError::VertexNotFound`],
    /// [`DagError::DuplicateOrdinal`], [`DagError::OrdinalGap`],
    /// [`DagError::CycleDetected`], [`DagError::ZeroParallelism`], or
    /// [`DagError::EmptyDag`] when the described topology is invalid.
    pub fn build(self) -> Result<Dag, DagError> {
        let mut dag = Dag::new();

        for (name, factory, parallelism) in self.vertices {
            dag.add_vertex(name, factory, parallelism)?;
        }

        for edge in self.edges {
            let from_id = dag
                .vertex_id_by_name(&edge.from)
                .ok_or_else(|| DagError::VertexNotFound(edge.from.clone()))?;
            let to_id = dag
                .vertex_id_by_name(&edge.to)
                .ok_or_else(|| DagError::VertexNotFound(edge.to.clone()))?;
            dag.add_edge(from_id, to_id, edge.ordinal, edge.routing, edge.distribution)?;
        }

        dag.finalize()?;

        Ok(dag)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-edge configuration collected by [`DagBuilder::edge_via`].
pub struct EdgeConfig {
    from: String,
    to: String,
    ordinal: Option<u16>,
    routing: RoutingPolicy,
    distribution: Distribution,
}

impl EdgeConfig {
    fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            ordinal: None,
            routing: RoutingPolicy::default(),
            distribution: Distribution::default(),
        }
    }

    /// Pins the destination ordinal instead of auto-assigning the next
    /// free one.
    #[must_use]
    pub fn ordinal(mut self, ordinal: u16) -> Self {
        self.ordinal = Some(ordinal);
        self
    }

    /// Routes every item to every destination instance.
    #[must_use]
    pub fn broadcast(mut self) -> Self {
        self.routing = RoutingPolicy::Broadcast;
        self
    }

    /// Routes items by rotation across destination instances (the default).
    #[must_use]
    pub fn round_robin(mut self) -> Self {
        self.routing = RoutingPolicy::RoundRobin;
        self
    }

    /// Routes items by partitioning key, stable per key.
    #[must_use]
    pub fn partitioned(mut self, key_fn: KeyFn) -> Self {
        self.routing = RoutingPolicy::Partitioned(key_fn);
        self
    }

    /// Marks the edge as crossing process boundaries.
    #[must_use]
    pub fn distributed(mut self) -> Self {
        self.distribution = Distribution::Distributed;
        self
    }

    /// Marks the edge as confined to one process (the default).
    #[must_use]
    pub fn local(mut self) -> Self {
        self.distribution = Distribution::Local;
        self
    }
}
