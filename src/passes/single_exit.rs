//! Single-exit enforcement
//!
//! Gives the region one entry and one sink so post-dominance has a concrete
//! root. Exit blocks are the successorless nodes plus the headers of cycles
//! with no edge leaving the cycle (exit-less infinite loops). When a rewrite
//! is needed, a synthetic sink with an unreachable terminator absorbs every
//! exit, and a gated entry block routes either to the original entry or to
//! the sink.
//!
//! Gate edges are flagged inlined: they exist for analyses that must see a
//! path to the sink, not as control flow the emitted AST may take.

use std::collections::HashSet;

use petgraph::stable_graph::NodeIndex;
use tracing::debug;

use crate::graph::visit::{reverse_post_order, strongly_connected_components, EdgeView};
use crate::graph::{EdgeInfo, NodeKind, RegionGraph};

/// Make the region single-entry/single-sink. Returns whether the graph
/// changed.
pub fn enforce_single_exit(graph: &mut RegionGraph) -> bool {
    let mut plain_exits: Vec<NodeIndex> = graph
        .node_indices()
        .into_iter()
        .filter(|&n| graph.successor_count(n) == 0)
        .collect();
    let loop_exits = exitless_cycle_headers(graph);

    // A single natural exit and no trapped cycle: nothing to enforce.
    if loop_exits.is_empty() && plain_exits.len() <= 1 {
        return false;
    }

    debug!(
        plain = plain_exits.len(),
        loops = loop_exits.len(),
        "enforcing single exit"
    );

    let sink = graph.add_artificial(NodeKind::ArtificialExit, "sink");
    for exit in plain_exits.drain(..) {
        graph.add_plain_edge(exit, sink);
    }
    for header in loop_exits {
        // Gated false: never taken, only there to root post-dominance.
        graph.add_edge(header, sink, EdgeInfo::inlined());
    }

    let old_entry = graph.entry();
    let gate = graph.add_artificial(NodeKind::ArtificialEntry, "entry_gate");
    graph.add_plain_edge(gate, old_entry);
    graph.add_edge(gate, sink, EdgeInfo::inlined());
    graph.set_entry(gate);
    true
}

/// Headers of cycles that have no edge to the outside.
///
/// The header is the member with a predecessor outside the cycle (ties:
/// earliest in reverse post-order); for a cycle unreachable from outside,
/// the earliest member in traversal order.
fn exitless_cycle_headers(graph: &RegionGraph) -> Vec<NodeIndex> {
    let rpo = reverse_post_order(graph, graph.entry(), EdgeView::All);
    let position = |n: NodeIndex| rpo.iter().position(|&x| x == n).unwrap_or(usize::MAX);

    let mut headers = Vec::new();
    for scc in strongly_connected_components(graph, EdgeView::All) {
        let members: HashSet<NodeIndex> = scc.iter().copied().collect();
        let cyclic = scc.len() > 1
            || scc
                .iter()
                .any(|&n| graph.successors(n).contains(&n));
        if !cyclic {
            continue;
        }
        let escapes = scc
            .iter()
            .any(|&n| graph.successors(n).iter().any(|s| !members.contains(s)));
        if escapes {
            continue;
        }
        let mut candidates: Vec<NodeIndex> = scc
            .iter()
            .copied()
            .filter(|&n| {
                graph.predecessors(n).iter().any(|p| !members.contains(p))
            })
            .collect();
        if candidates.is_empty() {
            candidates = scc.clone();
        }
        candidates.sort_by_key(|&n| position(n));
        headers.push(candidates[0]);
    }
    headers.sort_by_key(|&n| position(n));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PayloadId;

    fn code_nodes(g: &mut RegionGraph, count: u64) -> Vec<NodeIndex> {
        (0..count)
            .map(|i| g.add_node(Some(PayloadId(i)), format!("n{i}"), 1))
            .collect()
    }

    #[test]
    fn single_exit_region_is_untouched() {
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 2);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);

        assert!(!enforce_single_exit(&mut g));
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn two_returns_share_one_sink() {
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 3);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[0], n[2]);

        assert!(enforce_single_exit(&mut g));

        let sinks: Vec<_> = g
            .node_indices()
            .into_iter()
            .filter(|&ix| g.node(ix).kind == NodeKind::ArtificialExit)
            .collect();
        assert_eq!(sinks.len(), 1);
        let sink = sinks[0];
        assert_eq!(g.successors(n[1]), vec![sink]);
        assert_eq!(g.successors(n[2]), vec![sink]);

        // Entry was replaced by the gate, which routes to the old entry.
        assert_eq!(g.node(g.entry()).kind, NodeKind::ArtificialEntry);
        assert!(g.successors(g.entry()).contains(&n[0]));
    }

    #[test]
    fn exitless_loop_header_gets_gated_edge() {
        // 0 -> 1 -> 2 -> 1 with no way out.
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 3);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[1], n[2]);
        g.add_plain_edge(n[2], n[1]);

        assert!(enforce_single_exit(&mut g));

        let sink = g
            .node_indices()
            .into_iter()
            .find(|&ix| g.node(ix).kind == NodeKind::ArtificialExit)
            .unwrap();
        // The header (1, the member entered from outside) is gated to sink.
        let edge = g.find_edge(n[1], sink).expect("gate edge from header");
        assert!(g.edge_info(edge).inlined);
        // In the live view the loop is still exit-less.
        assert!(g.live_successors(n[1]).len() == 1);
    }

    #[test]
    fn loop_with_a_break_is_not_an_exit() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3: the cycle escapes; only 3 is an exit.
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 4);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[1], n[2]);
        g.add_plain_edge(n[2], n[1]);
        g.add_plain_edge(n[2], n[3]);

        assert!(!enforce_single_exit(&mut g));
    }
}
