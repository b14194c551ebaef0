//! Unit tests for DAG topology, builder, routing configuration, and
//! build-time validation.

use std::sync::Arc;

use crate::processor::{Processor, ProcessorFactory};

use super::builder::DagBuilder;
use super::error::DagError;
use super::routing::{Distribution, RoutingPolicy};
use super::topology::{Dag, Ordinal, VertexId};

struct Noop;
impl Processor for Noop {}

/// Helper producing trivial processors.
fn noop() -> ProcessorFactory {
    Arc::new(|| Box::new(Noop))
}

// ---- Dag direct tests ----

#[test]
fn test_empty_dag() {
    let dag = Dag::new();
    assert_eq!(dag.vertex_count(), 0);
    assert_eq!(dag.edge_count(), 0);
    assert!(dag.sources().is_empty());
    assert!(dag.sinks().is_empty());
    assert!(dag.execution_order().is_empty());
    assert!(!dag.is_finalized());
}

#[test]
fn test_empty_dag_finalize_error() {
    let mut dag = Dag::new();
    assert!(matches!(dag.finalize(), Err(DagError::EmptyDag)));
}

#[test]
fn test_add_single_vertex() {
    let mut dag = Dag::new();
    let id = dag.add_vertex("source", noop(), 2).unwrap();
    assert_eq!(id, VertexId(0));
    assert_eq!(dag.vertex_count(), 1);
    assert_eq!(dag.vertex_id_by_name("source"), Some(VertexId(0)));
    assert_eq!(dag.vertex_name(VertexId(0)), Some("source".to_string()));
    assert_eq!(dag.vertex(id).unwrap().parallelism, 2);
}

#[test]
fn test_duplicate_vertex_error() {
    let mut dag = Dag::new();
    dag.add_vertex("src", noop(), 1).unwrap();
    let result = dag.add_vertex("src", noop(), 1);
    assert!(matches!(result, Err(DagError::DuplicateVertex(_))));
}

#[test]
fn test_zero_parallelism_error() {
    let mut dag = Dag::new();
    let result = dag.add_vertex("src", noop(), 0);
    assert!(matches!(result, Err(DagError::ZeroParallelism(_))));
}

#[test]
fn test_add_edge_vertex_not_found() {
    let mut dag = Dag::new();
    let id = dag.add_vertex("a", noop(), 1).unwrap();
    let result = dag.add_edge(
        id,
        VertexId(99),
        None,
        RoutingPolicy::default(),
        Distribution::default(),
    );
    assert!(matches!(result, Err(DagError::VertexNotFound(_))));
}

#[test]
fn test_self_loop_detection() {
    let mut dag = Dag::new();
    let id = dag.add_vertex("a", noop(), 1).unwrap();
    let result = dag.add_edge(
        id,
        id,
        None,
        RoutingPolicy::default(),
        Distribution::default(),
    );
    assert!(matches!(result, Err(DagError::CycleDetected(_))));
}

#[test]
fn test_cycle_detection() {
    let mut dag = Dag::new();
    let a = dag.add_vertex("a", noop(), 1).unwrap();
    let b = dag.add_vertex("b", noop(), 1).unwrap();
    let c = dag.add_vertex("c", noop(), 1).unwrap();
    for (from, to) in [(a, b), (b, c), (c, a)] {
        dag.add_edge(
            from,
            to,
            None,
            RoutingPolicy::default(),
            Distribution::default(),
        )
        .unwrap();
    }
    assert!(matches!(dag.finalize(), Err(DagError::CycleDetected(_))));
}

#[test]
fn test_duplicate_ordinal_rejected() {
    let mut dag = Dag::new();
    let a = dag.add_vertex("a", noop(), 1).unwrap();
    let b = dag.add_vertex("b", noop(), 1).unwrap();
    let c = dag.add_vertex("c", noop(), 1).unwrap();
    dag.add_edge(a, c, Some(0), RoutingPolicy::default(), Distribution::default())
        .unwrap();
    let result = dag.add_edge(b, c, Some(0), RoutingPolicy::default(), Distribution::default());
    assert!(matches!(
        result,
        Err(DagError::DuplicateOrdinal { ordinal: 0, .. })
    ));
}

#[test]
fn test_ordinal_gap_rejected() {
    let mut dag = Dag::new();
    let a = dag.add_vertex("a", noop(), 1).unwrap();
    let b = dag.add_vertex("b", noop(), 1).unwrap();
    dag.add_edge(a, b, Some(1), RoutingPolicy::default(), Distribution::default())
        .unwrap();
    assert!(matches!(
        dag.finalize(),
        Err(DagError::OrdinalGap { missing: 0, .. })
    ));
}

#[test]
fn test_fan_in_auto_ordinals() {
    let mut dag = Dag::new();
    let a = dag.add_vertex("a", noop(), 1).unwrap();
    let b = dag.add_vertex("b", noop(), 1).unwrap();
    let c = dag.add_vertex("c", noop(), 1).unwrap();
    dag.add_edge(a, c, None, RoutingPolicy::default(), Distribution::default())
        .unwrap();
    dag.add_edge(b, c, None, RoutingPolicy::default(), Distribution::default())
        .unwrap();
    dag.finalize().unwrap();

    let inbound = dag.inbound_edges(c);
    assert_eq!(inbound.len(), 2);
    assert_eq!(inbound[0].ordinal, Ordinal(0));
    assert_eq!(inbound[1].ordinal, Ordinal(1));
}

#[test]
fn test_source_lane_assignment() {
    let mut dag = Dag::new();
    let a = dag.add_vertex("a", noop(), 1).unwrap();
    let b = dag.add_vertex("b", noop(), 1).unwrap();
    let c = dag.add_vertex("c", noop(), 1).unwrap();
    dag.add_edge(a, b, None, RoutingPolicy::default(), Distribution::default())
        .unwrap();
    dag.add_edge(a, c, None, RoutingPolicy::default(), Distribution::default())
        .unwrap();
    dag.finalize().unwrap();

    let outbound = dag.outbound_edges(a);
    assert_eq!(outbound.len(), 2);
    assert_eq!(outbound[0].source_lane, Ordinal(0));
    assert_eq!(outbound[1].source_lane, Ordinal(1));
    assert_eq!(outbound[0].target, b);
    assert_eq!(outbound[1].target, c);
}

#[test]
fn test_execution_order_dependencies_first() {
    let mut dag = Dag::new();
    let a = dag.add_vertex("a", noop(), 1).unwrap();
    let b = dag.add_vertex("b", noop(), 1).unwrap();
    let c = dag.add_vertex("c", noop(), 1).unwrap();
    let d = dag.add_vertex("d", noop(), 1).unwrap();
    for (from, to) in [(a, b), (a, c), (b, d), (c, d)] {
        dag.add_edge(from, to, None, RoutingPolicy::default(), Distribution::default())
            .unwrap();
    }
    dag.finalize().unwrap();

    let order = dag.execution_order();
    let pos = |v: VertexId| order.iter().position(|&x| x == v).unwrap();
    assert!(pos(a) < pos(b));
    assert!(pos(a) < pos(c));
    assert!(pos(b) < pos(d));
    assert!(pos(c) < pos(d));

    assert_eq!(dag.sources(), &[a][..]);
    assert_eq!(dag.sinks(), &[d][..]);
}

#[test]
fn test_validate_does_not_finalize() {
    let mut dag = Dag::new();
    let a = dag.add_vertex("a", noop(), 1).unwrap();
    let b = dag.add_vertex("b", noop(), 1).unwrap();
    dag.add_edge(a, b, None, RoutingPolicy::default(), Distribution::default())
        .unwrap();
    dag.validate().unwrap();
    assert!(!dag.is_finalized());
    dag.finalize().unwrap();
    assert!(dag.is_finalized());
}

// ---- DagBuilder tests ----

#[test]
fn test_builder_linear_dag() {
    let dag = DagBuilder::new()
        .vertex("src", noop())
        .vertex_with_parallelism("mid", noop(), 4)
        .vertex("snk", noop())
        .edge("src", "mid")
        .edge("mid", "snk")
        .build()
        .unwrap();

    assert_eq!(dag.vertex_count(), 3);
    assert_eq!(dag.edge_count(), 2);
    assert!(dag.is_finalized());
    let mid = dag.vertex_id_by_name("mid").unwrap();
    assert_eq!(dag.vertex(mid).unwrap().parallelism, 4);
}

#[test]
fn test_builder_unknown_vertex_in_edge() {
    let result = DagBuilder::new()
        .vertex("a", noop())
        .edge("a", "ghost")
        .build();
    assert!(matches!(result, Err(DagError::VertexNotFound(_))));
}

#[test]
fn test_builder_edge_via_configuration() {
    let dag = DagBuilder::new()
        .vertex("a", noop())
        .vertex_with_parallelism("b", noop(), 3)
        .vertex("c", noop())
        .edge_via("a", "b", |e| e.broadcast().distributed())
        .edge_via("b", "c", |e| {
            e.partitioned(Arc::new(|_| 0)).ordinal(0).local()
        })
        .build()
        .unwrap();

    let b = dag.vertex_id_by_name("b").unwrap();
    let into_b = dag.inbound_edges(b);
    assert!(matches!(into_b[0].routing, RoutingPolicy::Broadcast));
    assert_eq!(into_b[0].distribution, Distribution::Distributed);

    let c = dag.vertex_id_by_name("c").unwrap();
    let into_c = dag.inbound_edges(c);
    assert!(matches!(into_c[0].routing, RoutingPolicy::Partitioned(_)));
    assert_eq!(into_c[0].distribution, Distribution::Local);
}

#[test]
fn test_builder_fan_in_ordinals_explicit() {
    let dag = DagBuilder::new()
        .vertex("left", noop())
        .vertex("right", noop())
        .vertex("join", noop())
        .edge_via("left", "join", |e| e.ordinal(0))
        .edge_via("right", "join", |e| e.ordinal(1))
        .build()
        .unwrap();

    let join = dag.vertex_id_by_name("join").unwrap();
    let inbound = dag.inbound_edges(join);
    assert_eq!(inbound[0].ordinal, Ordinal(0));
    assert_eq!(inbound[1].ordinal, Ordinal(1));
    assert_eq!(
        dag.vertex_name(inbound[0].source),
        Some("left".to_string())
    );
    assert_eq!(
        dag.vertex_name(inbound[1].source),
        Some("right".to_string())
    );
}

#[test]
fn test_builder_empty_errors() {
    assert!(matches!(DagBuilder::new().build(), Err(DagError::EmptyDag)));
}
