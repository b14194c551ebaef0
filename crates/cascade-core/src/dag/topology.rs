//! DAG topology data structures.
//!
//! Defines [`Vertex`], [`Edge`], and [`Dag`] with build-time validation:
//! cycle detection (Kahn's algorithm with deterministic ordering), unique
//! destination ordinals, and contiguous inbound ordinal ranges.

use std::collections::VecDeque;
use std::fmt;

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::processor::ProcessorFactory;

use super::error::DagError;
use super::routing::{Distribution, RoutingPolicy};

/// Unique identifier for a vertex in the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexId(pub u32);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VertexId({})", self.0)
    }
}

/// Unique identifier for an edge in the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EdgeId({})", self.0)
    }
}

/// Index identifying which logical stream an edge carries.
///
/// On the destination side the ordinal selects which `process` input the
/// edge feeds; on the source side the lane index selects which outbox lane
/// the edge drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ordinal(pub u16);

impl Ordinal {
    /// Returns the ordinal as a lane/stream index.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named computation step with a declared parallelism.
///
/// Created at DAG-build time and immutable thereafter. The factory is
/// invoked once per parallel unit instance when a job starts.
pub struct Vertex {
    /// Unique vertex identifier.
    pub id: VertexId,
    /// Human-readable name (e.g. "tokenize", "aggregate").
    pub name: String,
    /// Factory producing one processor per parallel instance.
    pub factory: ProcessorFactory,
    /// Number of parallel unit instances. May be pinned to 1 when global
    /// ordering across instances matters (strictly-ordered sinks).
    pub parallelism: usize,
    /// Inbound edges. `SmallVec` avoids heap alloc for <= 4 inputs.
    pub inputs: SmallVec<[EdgeId; 4]>,
    /// Outbound edges. `SmallVec` avoids heap alloc for <= 4 outputs.
    pub outputs: SmallVec<[EdgeId; 4]>,
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parallelism", &self.parallelism)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// A directed, routed connection between two vertices carrying one stream.
#[derive(Debug)]
pub struct Edge {
    /// Unique edge identifier.
    pub id: EdgeId,
    /// Source vertex.
    pub source: VertexId,
    /// Destination vertex.
    pub target: VertexId,
    /// Ordinal at the destination: which logical input this edge feeds.
    pub ordinal: Ordinal,
    /// Lane index at the source: which outbox lane this edge drains.
    pub source_lane: Ordinal,
    /// How items spread across destination instances.
    pub routing: RoutingPolicy,
    /// Same-process vs cross-process placement.
    pub distribution: Distribution,
}

/// The complete DAG: vertices plus edges, validated at build time.
///
/// Constructed via [`DagBuilder`](super::builder::DagBuilder) (or directly)
/// and frozen by [`finalize`](Dag::finalize) before execution.
pub struct Dag {
    /// All vertices, keyed by `VertexId`.
    vertices: FxHashMap<VertexId, Vertex>,
    /// All edges, keyed by `EdgeId`.
    edges: FxHashMap<EdgeId, Edge>,
    /// Name -> `VertexId` index for lookups.
    name_index: FxHashMap<String, VertexId>,
    /// Topologically sorted order (dependencies first), from Kahn's algorithm.
    execution_order: Vec<VertexId>,
    /// Vertices with no inbound edges.
    source_vertices: Vec<VertexId>,
    /// Vertices with no outbound edges.
    sink_vertices: Vec<VertexId>,
    /// Next vertex ID counter.
    next_vertex_id: u32,
    /// Next edge ID counter.
    next_edge_id: u32,
    /// Whether the DAG has been finalized.
    finalized: bool,
}

impl fmt::Debug for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("vertex_count", &self.vertices.len())
            .field("edge_count", &self.edges.len())
            .field("execution_order", &self.execution_order)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl Dag {
    /// Creates a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vertices: FxHashMap::default(),
            edges: FxHashMap::default(),
            name_index: FxHashMap::default(),
            execution_order: Vec::new(),
            source_vertices: Vec::new(),
            sink_vertices: Vec::new(),
            next_vertex_id: 0,
            next_edge_id: 0,
            finalized: false,
        }
    }

    /// Adds a vertex to the DAG.
    ///
    /// # Errors
    ///
    /// Returns [`DagError::DuplicateVertex`] if the name is taken and
    /// [`DagError::ZeroParallelism`] if `parallelism` is zero.
    pub fn add_vertex(
        &mut self,
        name: impl Into<String>,
        factory: ProcessorFactory,
        parallelism: usize,
    ) -> Result<VertexId, DagError> {
        let name = name.into();
        if self.name_index.contains_key(&name) {
            return Err(DagError::DuplicateVertex(name));
        }
        if parallelism == 0 {
            return Err(DagError::ZeroParallelism(name));
        }

        let id = VertexId(self.next_vertex_id);
        self.next_vertex_id += 1;

        let vertex = Vertex {
            id,
            name: name.clone(),
            factory,
            parallelism,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
        };

        self.vertices.insert(id, vertex);
        self.name_index.insert(name, id);
        self.finalized = false;

        Ok(id)
    }

    /// Adds an edge between two vertices.
    ///
    /// When `ordinal` is `None`, the next free ordinal at the destination
    /// is assigned. The source lane index is always auto-assigned in edge
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`DagError::VertexNotFound`] if either endpoint is missing,
    /// [`DagError::CycleDetected`] for a self-loop, and
    /// [`DagError::DuplicateOrdinal`] if the (vertex, ordinal) pair is
    /// already claimed.
    pub fn add_edge(
        &mut self,
        source: VertexId,
        target: VertexId,
        ordinal: Option<u16>,
        routing: RoutingPolicy,
        distribution: Distribution,
    ) -> Result<EdgeId, DagError> {
        if source == target {
            let name = self.vertex_name(source).unwrap_or_default();
            return Err(DagError::CycleDetected(name));
        }
        if !self.vertices.contains_key(&source) {
            return Err(DagError::VertexNotFound(format!("{source}")));
        }
        if !self.vertices.contains_key(&target) {
            return Err(DagError::VertexNotFound(format!("{target}")));
        }

        // Ordinal and lane counts are bounded by practical fan-in/out,
        // far below u16::MAX.
        #[allow(clippy::cast_possible_truncation)]
        let ordinal = Ordinal(ordinal.unwrap_or_else(|| {
            self.vertices.get(&target).map_or(0, |v| v.inputs.len() as u16)
        }));

        let taken = self
            .vertices
            .get(&target)
            .map(|v| &v.inputs)
            .into_iter()
            .flatten()
            .filter_map(|edge_id| self.edges.get(edge_id))
            .any(|e| e.ordinal == ordinal);
        if taken {
            return Err(DagError::DuplicateOrdinal {
                vertex: self.vertex_name(target).unwrap_or_default(),
                ordinal: ordinal.0,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let source_lane = Ordinal(
            self.vertices.get(&source).map_or(0, |v| v.outputs.len() as u16),
        );

        let id = EdgeId(self.next_edge_id);
        self.next_edge_id += 1;

        self.edges.insert(
            id,
            Edge {
                id,
                source,
                target,
                ordinal,
                source_lane,
                routing,
                distribution,
            },
        );

        if let Some(vertex) = self.vertices.get_mut(&source) {
            vertex.outputs.push(id);
        }
        if let Some(vertex) = self.vertices.get_mut(&target) {
            vertex.inputs.push(id);
        }

        self.finalized = false;

        Ok(id)
    }

    /// Finalizes the DAG: validates the topology, computes the execution
    /// order, and classifies source and sink vertices.
    ///
    /// # Errors
    ///
    /// Returns [`DagError::EmptyDag`] if the DAG has no vertices,
    /// [`DagError::CycleDetected`] if the graph contains a cycle, and
    /// [`DagError::OrdinalGap`] if any vertex's inbound ordinals are not
    /// contiguous from zero.
    pub fn finalize(&mut self) -> Result<(), DagError> {
        if self.vertices.is_empty() {
            return Err(DagError::EmptyDag);
        }

        self.check_ordinal_contiguity()?;
        self.compute_execution_order()?;
        self.classify_source_sink_vertices();
        self.finalized = true;

        Ok(())
    }

    /// Validates the topology without modifying internal state.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`finalize`](Dag::finalize).
    pub fn validate(&self) -> Result<(), DagError> {
        if self.vertices.is_empty() {
            return Err(DagError::EmptyDag);
        }
        self.check_ordinal_contiguity()?;
        self.check_acyclic()?;
        Ok(())
    }

    // ---- Accessors ----

    /// Returns the number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Returns the number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Returns a reference to a vertex by ID.
    #[must_use]
    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(&id)
    }

    /// Returns a reference to an edge by ID.
    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    /// Returns all vertices.
    #[must_use]
    pub fn vertices(&self) -> &FxHashMap<VertexId, Vertex> {
        &self.vertices
    }

    /// Returns all edges.
    #[must_use]
    pub fn edges(&self) -> &FxHashMap<EdgeId, Edge> {
        &self.edges
    }

    /// Returns the `VertexId` for a given vertex name.
    #[must_use]
    pub fn vertex_id_by_name(&self, name: &str) -> Option<VertexId> {
        self.name_index.get(name).copied()
    }

    /// Returns the vertex name for a given `VertexId`.
    #[must_use]
    pub fn vertex_name(&self, id: VertexId) -> Option<String> {
        self.vertices.get(&id).map(|v| v.name.clone())
    }

    /// Returns vertices in topological execution order (dependencies first).
    #[must_use]
    pub fn execution_order(&self) -> &[VertexId] {
        &self.execution_order
    }

    /// Returns all source vertices (no inbound edges).
    #[must_use]
    pub fn sources(&self) -> &[VertexId] {
        &self.source_vertices
    }

    /// Returns all sink vertices (no outbound edges).
    #[must_use]
    pub fn sinks(&self) -> &[VertexId] {
        &self.sink_vertices
    }

    /// Returns a vertex's inbound edges sorted by destination ordinal.
    #[must_use]
    pub fn inbound_edges(&self, id: VertexId) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self
            .vertices
            .get(&id)
            .map(|v| &v.inputs)
            .into_iter()
            .flatten()
            .filter_map(|edge_id| self.edges.get(edge_id))
            .collect();
        edges.sort_by_key(|e| e.ordinal);
        edges
    }

    /// Returns a vertex's outbound edges sorted by source lane.
    #[must_use]
    pub fn outbound_edges(&self, id: VertexId) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self
            .vertices
            .get(&id)
            .map(|v| &v.outputs)
            .into_iter()
            .flatten()
            .filter_map(|edge_id| self.edges.get(edge_id))
            .collect();
        edges.sort_by_key(|e| e.source_lane);
        edges
    }

    /// Returns whether the DAG has been finalized.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    // ---- Internal validation ----

    /// Checks that each vertex's inbound ordinals are exactly `0..n`.
    fn check_ordinal_contiguity(&self) -> Result<(), DagError> {
        for vertex in self.vertices.values() {
            let mut ordinals: Vec<u16> = vertex
                .inputs
                .iter()
                .filter_map(|edge_id| self.edges.get(edge_id))
                .map(|e| e.ordinal.0)
                .collect();
            ordinals.sort_unstable();
            for (expected, &found) in ordinals.iter().enumerate() {
                // Fan-in is bounded far below u16::MAX.
                #[allow(clippy::cast_possible_truncation)]
                let expected = expected as u16;
                if found != expected {
                    return Err(DagError::OrdinalGap {
                        vertex: vertex.name.clone(),
                        missing: expected,
                    });
                }
            }
        }
        Ok(())
    }

    /// Checks acyclicity using Kahn's algorithm.
    fn check_acyclic(&self) -> Result<(), DagError> {
        let (order, processed) = self.kahn_topo_sort();
        if processed < self.vertices.len() {
            let ordered: FxHashSet<VertexId> = order.into_iter().collect();
            for vertex in self.vertices.values() {
                if !ordered.contains(&vertex.id) {
                    return Err(DagError::CycleDetected(vertex.name.clone()));
                }
            }
            return Err(DagError::CycleDetected("unknown".to_string()));
        }
        Ok(())
    }

    /// Computes the topological execution order, detecting cycles.
    fn compute_execution_order(&mut self) -> Result<(), DagError> {
        let (order, processed) = self.kahn_topo_sort();
        if processed < self.vertices.len() {
            let ordered: FxHashSet<VertexId> = order.iter().copied().collect();
            for vertex in self.vertices.values() {
                if !ordered.contains(&vertex.id) {
                    return Err(DagError::CycleDetected(vertex.name.clone()));
                }
            }
            return Err(DagError::CycleDetected("unknown".to_string()));
        }
        self.execution_order = order;
        Ok(())
    }

    /// Kahn's algorithm for topological sort.
    ///
    /// Returns `(ordered_vertex_ids, count_of_processed_vertices)`.
    /// Ready vertices are visited in ascending ID order so the result is
    /// deterministic across runs.
    fn kahn_topo_sort(&self) -> (Vec<VertexId>, usize) {
        let mut in_degree: FxHashMap<VertexId, usize> = FxHashMap::default();
        for vertex in self.vertices.values() {
            in_degree.entry(vertex.id).or_insert(0);
        }
        for edge in self.edges.values() {
            *in_degree.entry(edge.target).or_insert(0) += 1;
        }

        let mut initial: Vec<VertexId> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        initial.sort_by_key(|v| v.0);

        let mut queue: VecDeque<VertexId> = initial.into_iter().collect();
        let mut order = Vec::with_capacity(self.vertices.len());
        let mut processed = 0;

        while let Some(vertex_id) = queue.pop_front() {
            order.push(vertex_id);
            processed += 1;

            if let Some(vertex) = self.vertices.get(&vertex_id) {
                let mut successors: Vec<VertexId> = Vec::new();
                for &edge_id in &vertex.outputs {
                    if let Some(edge) = self.edges.get(&edge_id) {
                        if let Some(deg) = in_degree.get_mut(&edge.target) {
                            *deg = deg.saturating_sub(1);
                            if *deg == 0 {
                                successors.push(edge.target);
                            }
                        }
                    }
                }
                successors.sort_by_key(|v| v.0);
                queue.extend(successors);
            }
        }

        (order, processed)
    }

    /// Classifies source and sink vertices by connectivity.
    fn classify_source_sink_vertices(&mut self) {
        self.source_vertices.clear();
        self.sink_vertices.clear();

        for vertex in self.vertices.values() {
            if vertex.inputs.is_empty() {
                self.source_vertices.push(vertex.id);
            }
            if vertex.outputs.is_empty() {
                self.sink_vertices.push(vertex.id);
            }
        }

        self.source_vertices.sort_by_key(|v| v.0);
        self.sink_vertices.sort_by_key(|v| v.0);
    }
}

impl Default for Dag {
    fn default() -> Self {
        Self::new()
    }
}
