//! Untangle: weight-driven arm splitting
//!
//! Prefatory transformation before combing. For every binary conditional,
//! compares the cost of combing (duplicating the region between the
//! conditional and its post-dominator) against the cost of duplicating one
//! arm all the way to the function exit. When combing is strictly more
//! expensive, the cheaper arm is cloned until the exit, the conditional's
//! edge is redirected to the clone, and that edge is flagged inlined so the
//! filtered post-dominator tree never sees the split again.

use std::collections::{HashMap, HashSet};

use petgraph::stable_graph::NodeIndex;
use tracing::debug;

use crate::config::RestructureConfig;
use crate::error::RegionError;
use crate::graph::visit::{is_dag, reachable_until, reverse_post_order, EdgeView};
use crate::graph::{DominatorTree, NodeKind, PostDominatorTree, RegionGraph};

/// Run untangle over a DAG region.
pub fn untangle(graph: &mut RegionGraph, config: &RestructureConfig) -> Result<(), RegionError> {
    if !is_dag(graph, EdgeView::All) {
        return Err(RegionError::structure("untangle", "graph is not a DAG"));
    }

    // Virtual sink: every exit connects to it so "cost to the exit" is a
    // single reachability query.
    let sink = graph.add_artificial(NodeKind::ArtificialExit, "virtual_sink");
    for node in graph.node_indices() {
        if node != sink && graph.successor_count(node) == 0 {
            graph.add_plain_edge(node, sink);
        }
    }

    // Conditionals in reverse post-order; popping from the back processes
    // them in post-order.
    let mut conditionals: Vec<NodeIndex> = reverse_post_order(graph, graph.entry(), EdgeView::All)
        .into_iter()
        .filter(|&n| graph.successor_count(n) == 2)
        .collect();

    while let Some(conditional) = conditionals.pop() {
        if !graph.contains_node(conditional) || graph.successor_count(conditional) != 2 {
            // A previous split may have swept this node away.
            continue;
        }

        let dt = DominatorTree::compute(graph);
        let ifpdt = PostDominatorTree::compute(graph, EdgeView::SkipInlined);
        let post_dominator = ifpdt.immediate_post_dominator(conditional);

        let successors = graph.successors(conditional);
        let (then_child, else_child) = (successors[0], successors[1]);

        let mut then_nodes = reachable_until(graph, then_child, post_dominator, EdgeView::All);
        let mut else_nodes = reachable_until(graph, else_child, post_dominator, EdgeView::All);
        if let Some(p) = post_dominator {
            then_nodes.remove(&p);
            else_nodes.remove(&p);
        }

        // Edge-dominance refinement: when the branch edge alone accounts for
        // every way into an arm, the arm's dominated nodes will be absorbed
        // by that branch and must not be charged to the combing cost.
        if edge_dominates(graph, &dt, conditional, else_child) {
            else_nodes.retain(|&n| !dt.dominates(else_child, n));
        }
        if edge_dominates(graph, &dt, conditional, then_child) {
            then_nodes.retain(|&n| !dt.dominates(then_child, n));
        }

        let weigh = |nodes: &HashSet<NodeIndex>| -> u64 {
            nodes.iter().map(|&n| graph.node_weight_total(n)).sum()
        };
        let then_weight = weigh(&then_nodes);
        let else_weight = weigh(&else_nodes);
        let post_dominator_weight = match post_dominator {
            Some(p) => weigh(&reachable_until(graph, p, Some(sink), EdgeView::All)),
            None => 0,
        };

        let combing_cost = then_weight + else_weight;
        let untangle_then_cost = then_weight + post_dominator_weight;
        let untangle_else_cost = else_weight + post_dominator_weight;
        let untangling_cost = untangle_then_cost.min(untangle_else_cost);

        let factor = u64::from(config.untangle_multiplicative_factor);
        if combing_cost > factor * untangling_cost {
            debug!(
                conditional = %graph.node(conditional).name,
                combing_cost,
                untangle_then_cost,
                untangle_else_cost,
                "splitting untangle candidate"
            );

            let split_else = if config.untangle_prefer_else_on_tie {
                untangle_then_cost >= untangle_else_cost
            } else {
                untangle_then_cost > untangle_else_cost
            };
            let to_untangle = if split_else { else_child } else { then_child };

            // Fully inline the chosen arm down to the exit, bypassing the
            // post-dominator.
            let untangled = clone_until_exit(graph, to_untangle, sink);
            graph.move_edge_target(conditional, to_untangle, untangled);
            graph.mark_edge_inlined(conditional, untangled);
            graph.remove_dangling_nodes();
        }
    }

    graph.purge_virtual_sink(sink);
    Ok(())
}

/// Whether the edge (src, dst) dominates `dst`: apart from `src` itself
/// (counted at most once), every predecessor of `dst` is dominated by `dst`.
fn edge_dominates(
    graph: &RegionGraph,
    dt: &DominatorTree,
    src: NodeIndex,
    dst: NodeIndex,
) -> bool {
    if graph.predecessor_count(dst) < 2 {
        return true;
    }
    let mut duplicate_edge = false;
    for pred in graph.predecessors(dst) {
        if pred == src {
            if duplicate_edge {
                return false;
            }
            duplicate_edge = true;
            continue;
        }
        if !dt.dominates(dst, pred) {
            return false;
        }
    }
    true
}

/// Clone the subgraph reachable from `node`, skipping every edge into the
/// sink; the clones' exits simply end. Returns the clone of `node`.
fn clone_until_exit(graph: &mut RegionGraph, node: NodeIndex, sink: NodeIndex) -> NodeIndex {
    let mut clone_map: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let head = graph.clone_node(node);
    clone_map.insert(node, head);

    let mut worklist = vec![node];
    let mut processed: HashSet<NodeIndex> = HashSet::new();
    while let Some(current) = worklist.pop() {
        debug_assert_ne!(current, sink);
        if !processed.insert(current) {
            continue;
        }
        let current_clone = clone_map[&current];
        for (succ, info) in graph.labeled_successors(current) {
            if succ == sink {
                continue;
            }
            let succ_clone = match clone_map.get(&succ) {
                Some(&clone) => clone,
                None => {
                    let clone = graph.clone_node(succ);
                    clone_map.insert(succ, clone);
                    clone
                }
            };
            graph.add_edge(current_clone, succ_clone, info);
            worklist.push(succ);
        }
    }
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PayloadId;

    fn weighted_nodes(g: &mut RegionGraph, weights: &[u32]) -> Vec<NodeIndex> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| g.add_node(Some(PayloadId(i as u64)), format!("n{i}"), w))
            .collect()
    }

    /// A conditional whose then arm funnels into a shared node and also
    /// bypasses it:
    ///
    ///     0 -> 1 -> 3 -> 4 -> 5
    ///     0 -> 2 -> 3
    ///     1 -> 4
    ///
    /// Node 3 has predecessors in both arms, so neither arm absorbs it and
    /// its weight is charged to combing at both conditionals.
    fn build_tangled(weights: &[u32]) -> (RegionGraph, Vec<NodeIndex>) {
        let mut g = RegionGraph::new("f", "root");
        let n = weighted_nodes(&mut g, weights);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[0], n[2]);
        g.add_plain_edge(n[1], n[3]);
        g.add_plain_edge(n[1], n[4]);
        g.add_plain_edge(n[2], n[3]);
        g.add_plain_edge(n[3], n[4]);
        g.add_plain_edge(n[4], n[5]);
        (g, n)
    }

    #[test]
    fn light_shared_node_is_left_for_combing() {
        // At node 1: Comb = 1 (shared node) vs U = 21 (tail). Combing wins
        // everywhere, the graph is untouched.
        let (mut g, _) = build_tangled(&[1, 1, 1, 1, 20, 1]);
        let before = g.node_count();
        untangle(&mut g, &RestructureConfig::default()).unwrap();
        assert_eq!(g.node_count(), before);
    }

    #[test]
    fn heavy_shared_region_splits_the_bypass_arm() {
        // At node 1: Comb = 100 (shared node 3) vs U = 2 (tail 4 -> 5). The
        // bypass arm is cloned to the exit and the edge marked inlined.
        let (mut g, n) = build_tangled(&[1, 1, 1, 100, 1, 1]);
        untangle(&mut g, &RestructureConfig::default()).unwrap();

        let inlined: Vec<_> = g
            .node_indices()
            .into_iter()
            .flat_map(|ix| {
                g.labeled_successors(ix)
                    .into_iter()
                    .filter(|(_, info)| info.inlined)
                    .map(move |(succ, _)| (ix, succ))
            })
            .collect();
        assert_eq!(inlined.len(), 1);
        let (src, clone) = inlined[0];
        assert_eq!(src, n[1]);
        assert_eq!(g.node(clone).payload, Some(PayloadId(4)));
        assert!(g.node(clone).name.ends_with("cloned"));

        // The clone chain runs to the exit without rejoining the originals.
        let reach = reachable_until(&g, clone, None, EdgeView::All);
        assert!(!reach.contains(&n[4]));
        assert!(!reach.contains(&n[5]));

        // The original tail is still fed by the shared node.
        assert_eq!(g.predecessors(n[4]), vec![n[3]]);
    }

    #[test]
    fn tie_break_is_configurable() {
        // Symmetric shared arms: 1 -> {3,4}, 2 -> {3,4}, {3,4} -> 5 -> 6.
        // At node 1 both untangle costs are 52; the tie decides the arm.
        let build = || {
            let mut g = RegionGraph::new("f", "root");
            let n = weighted_nodes(&mut g, &[1, 1, 1, 50, 50, 1, 1]);
            g.set_entry(n[0]);
            g.add_plain_edge(n[0], n[1]);
            g.add_plain_edge(n[0], n[2]);
            g.add_plain_edge(n[1], n[3]);
            g.add_plain_edge(n[1], n[4]);
            g.add_plain_edge(n[2], n[3]);
            g.add_plain_edge(n[2], n[4]);
            g.add_plain_edge(n[3], n[5]);
            g.add_plain_edge(n[4], n[5]);
            g.add_plain_edge(n[5], n[6]);
            (g, n)
        };

        let inlined_payload_at = |g: &RegionGraph, node: NodeIndex| {
            g.labeled_successors(node)
                .into_iter()
                .find(|(_, info)| info.inlined)
                .map(|(succ, _)| g.node(succ).payload.unwrap())
        };

        let (mut g, n) = build();
        untangle(&mut g, &RestructureConfig::default()).unwrap();
        // Default: the else arm (node 4) is duplicated.
        assert_eq!(inlined_payload_at(&g, n[1]), Some(PayloadId(4)));

        let (mut g, n) = build();
        let config = RestructureConfig {
            untangle_prefer_else_on_tie: false,
            ..Default::default()
        };
        untangle(&mut g, &config).unwrap();
        // Flipped: the then arm (node 3) is duplicated.
        assert_eq!(inlined_payload_at(&g, n[1]), Some(PayloadId(3)));
    }

    #[test]
    fn multiplicative_factor_raises_the_bar() {
        let (mut g, _) = build_tangled(&[1, 1, 1, 100, 1, 1]);
        let config = RestructureConfig {
            untangle_multiplicative_factor: 100,
            ..Default::default()
        };
        let before = g.node_count();
        untangle(&mut g, &config).unwrap();
        // 100 > 100 * 2 is false: no split.
        assert_eq!(g.node_count(), before);
    }

    #[test]
    fn rejects_cyclic_graphs() {
        let mut g = RegionGraph::new("f", "root");
        let n = weighted_nodes(&mut g, &[1, 1]);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[1], n[0]);
        let err = untangle(&mut g, &RestructureConfig::default()).unwrap_err();
        assert!(matches!(err, RegionError::Structure { .. }));
    }
}
