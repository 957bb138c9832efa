//! Inline divergent branches (IDB)
//!
//! An edge (cond, succ) is divergent when taking it leaves the scope the
//! conditional belongs to: the conditional carries a scope-closer target and
//! the successor can no longer reach that target, not even over dashed
//! edges. Each divergent edge is hoisted into a dedicated guard block that
//! re-tests the same condition, so the divergence turns into an outer
//! conditional wrapping a normal scope and the remaining paths keep their
//! shape.

use petgraph::stable_graph::NodeIndex;
use tracing::debug;

use crate::graph::scope_closer::{scope_closer_target, ScopeGraph};
use crate::graph::RegionGraph;

/// Hoist every divergent exit edge into a guard block. Returns the number
/// of guards created.
pub fn inline_divergent_branches(graph: &mut RegionGraph) -> usize {
    // Identify all divergent edges up front; the rewrite below redirects
    // predecessors and would confuse detection if interleaved.
    let mut divergent: Vec<(NodeIndex, NodeIndex)> = Vec::new();
    for cond in graph.node_indices() {
        let Some(closer) = scope_closer_target(graph, cond) else { continue };
        let view = ScopeGraph::new(graph);
        for (succ, info) in graph.labeled_successors(cond) {
            if info.inlined || succ == closer {
                continue;
            }
            if !view.reachable(succ).contains(&closer) {
                divergent.push((cond, succ));
            }
        }
    }

    for &(cond, succ) in &divergent {
        debug!(
            cond = %graph.node(cond).name,
            succ = %graph.node(succ).name,
            "inlining divergent branch"
        );

        // The guard re-tests the original condition payload; it starts with
        // no successors of its own.
        let guard = graph.clone_node(cond);
        graph.node_mut(guard).name = format!("{}_idb", graph.node(cond).name);

        // Pre-save the predecessor list; redirecting edges while iterating
        // adjacency would invalidate it.
        let predecessors = graph.predecessors(cond);
        for pred in predecessors {
            graph.move_edge_target(pred, cond, guard);
        }

        let info = graph
            .remove_edge(cond, succ)
            .expect("divergent edge vanished before rewrite");
        graph.add_edge(guard, succ, info);
        graph.add_plain_edge(guard, cond);

        if graph.entry() == cond {
            graph.set_entry(guard);
        }
    }

    divergent.len()
}
