//! Edge bundling by cycle-equivalence class
//!
//! For every node, incoming edges sharing a cycle-equivalence class are
//! routed through a single dedicated dispatcher predecessor, and outgoing
//! edges symmetrically through dispatcher successors. Afterwards the
//! predecessors (resp. successors) of each node are in bijection with its
//! distinct incoming (resp. outgoing) classes, which is what region entry
//! and exit identification relies on.
//!
//! Every new edge is registered in the [`CycleEquivalence`] result under the
//! class it forwards, so class queries stay total after the rewrite.

use std::collections::BTreeMap;

use petgraph::stable_graph::{EdgeIndex, NodeIndex};
use tracing::debug;

use crate::analysis::CycleEquivalence;
use crate::graph::visit::{post_order, EdgeView};
use crate::graph::{EdgeInfo, NodeKind, RegionGraph};
use petgraph::Direction;

/// Split each node's predecessor and successor edges by class.
pub fn bundle_edges_by_cycle(graph: &mut RegionGraph, classes: &mut CycleEquivalence) {
    let order = post_order(graph, graph.entry(), EdgeView::All);

    for node in order {
        bundle_side(graph, classes, node, Direction::Incoming);
        bundle_side(graph, classes, node, Direction::Outgoing);
    }
}

fn bundle_side(
    graph: &mut RegionGraph,
    classes: &mut CycleEquivalence,
    node: NodeIndex,
    direction: Direction,
) {
    // Snapshot first; the rewrite below invalidates adjacency iteration.
    let edges: Vec<(EdgeIndex, NodeIndex)> = match direction {
        Direction::Incoming => graph
            .edge_indices()
            .into_iter()
            .filter(|&(_, _, dst)| dst == node)
            .map(|(e, src, _)| (e, src))
            .collect(),
        Direction::Outgoing => graph
            .edge_indices()
            .into_iter()
            .filter(|&(_, src, _)| src == node)
            .map(|(e, _, dst)| (e, dst))
            .collect(),
    };

    let mut by_class: BTreeMap<u64, Vec<(EdgeIndex, NodeIndex)>> = BTreeMap::new();
    for (edge, other) in edges {
        let class = classes
            .class_of(edge)
            .expect("edge bundling requires a classified edge");
        by_class.entry(class).or_default().push((edge, other));
    }

    for (class, members) in by_class {
        let suffix = if direction == Direction::Incoming { "pred" } else { "succ" };
        let name = format!("{}_{}_ceci_{}", graph.node(node).name, suffix, class);
        let dispatcher = graph.add_artificial(NodeKind::Dispatcher, name);
        debug!(class, node = %graph.node(node).name, "bundling edges through dispatcher");

        match direction {
            Direction::Incoming => {
                let forward = graph.add_edge(dispatcher, node, EdgeInfo::plain());
                classes.insert(forward, class);
                for (edge, source) in members {
                    let info = graph
                        .remove_edge_index(edge)
                        .expect("bundled edge vanished mid-rewrite");
                    let moved = graph.add_edge(source, dispatcher, info);
                    classes.insert(moved, class);
                }
            }
            Direction::Outgoing => {
                for (edge, target) in members {
                    let info = graph
                        .remove_edge_index(edge)
                        .expect("bundled edge vanished mid-rewrite");
                    let moved = graph.add_edge(node, dispatcher, info);
                    classes.insert(moved, class);
                    let forward = graph.add_edge(dispatcher, target, EdgeInfo::plain());
                    classes.insert(forward, class);
                }
            }
        }
    }
}

/// Splice out dispatchers that merely forward a single edge.
///
/// Bundling is deliberately blind, so classes with one member still get a
/// dispatcher; those carry no information and would otherwise clutter every
/// later pass. The predecessor edge keeps its info, the forwarding edge is
/// dropped.
pub fn purge_pass_through_dispatchers(graph: &mut RegionGraph) {
    let mut changed = true;
    while changed {
        changed = false;
        for ix in graph.node_indices() {
            if graph.node(ix).kind == NodeKind::Dispatcher
                && graph.predecessor_count(ix) == 1
                && graph.successor_count(ix) == 1
            {
                let pred = graph.predecessors(ix)[0];
                let succ = graph.successors(ix)[0];
                graph.move_edge_target(pred, ix, succ);
                graph.remove_node(ix);
                changed = true;
                break;
            }
        }
    }
}
