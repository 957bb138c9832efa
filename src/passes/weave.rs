//! Weave: sub-switch extraction
//!
//! For every multi-way branch, looks for a node strictly between the switch
//! and its post-dominator that post-dominates more than one case (but not
//! all of them). Those cases share structure, so they are pulled out into a
//! fresh sub-switch carrying the union of their labels; the default case
//! being woven turns the sub-switch into the new default. The result nests
//! directly as `switch` statements.

use petgraph::stable_graph::NodeIndex;
use tracing::debug;

use crate::error::RegionError;
use crate::graph::visit::{is_dag, post_order, reachable_until, EdgeView};
use crate::graph::{CaseLabels, EdgeInfo, NodeKind, PostDominatorTree, RegionGraph};

/// Run weaving over a DAG region.
pub fn weave(graph: &mut RegionGraph) -> Result<(), RegionError> {
    if !is_dag(graph, EdgeView::All) {
        return Err(RegionError::structure("weave", "graph is not a DAG"));
    }

    let mut ifpdt = PostDominatorTree::compute(graph, EdgeView::SkipInlined);

    for switch in post_order(graph, graph.entry(), EdgeView::All) {
        if graph.live_successor_count(switch) <= 2 {
            continue;
        }

        // Case targets in successor order, deduplicated.
        let mut cases: Vec<NodeIndex> = Vec::new();
        for succ in graph.live_successors(switch) {
            if !cases.contains(&succ) {
                cases.push(succ);
            }
        }

        let post_dom = ifpdt.immediate_post_dominator(switch);

        // Nodes strictly between the switch and its post-dominator, in
        // reverse post-order over the filtered graph.
        let mut between = reachable_until(graph, switch, post_dom, EdgeView::SkipInlined);
        between.remove(&switch);
        if let Some(p) = post_dom {
            between.remove(&p);
        }
        let body: Vec<NodeIndex> =
            crate::graph::visit::reverse_post_order(graph, switch, EdgeView::SkipInlined)
                .into_iter()
                .filter(|n| between.contains(n))
                .collect();

        for candidate in body {
            let woven: Vec<NodeIndex> = cases
                .iter()
                .copied()
                .filter(|&c| ifpdt.post_dominates(candidate, c))
                .collect();

            // Weave only when some cases converge early but not all of
            // them; a node post-dominating every case would have been the
            // switch's own post-dominator.
            if woven.len() <= 1 || woven.len() == cases.len() {
                continue;
            }

            debug!(
                switch = %graph.node(switch).name,
                at = %graph.node(candidate).name,
                cases = woven.len(),
                "extracting sub-switch"
            );

            let sub_switch = match graph.node(switch).kind {
                NodeKind::Dispatcher => {
                    let name = format!("{} weaved", graph.node(switch).name);
                    graph.add_artificial(NodeKind::Dispatcher, name)
                }
                _ => {
                    let original = graph.node(switch).clone();
                    let ix = graph.add_node(
                        original.payload,
                        format!("{} weaved", original.name),
                        original.weight,
                    );
                    graph.node_mut(ix).kind = original.kind;
                    ix
                }
            };
            graph.node_mut(sub_switch).weaved = true;

            let mut labels = CaseLabels::new();
            let mut weaving_default = false;
            for &case in &woven {
                let info = graph
                    .remove_edge(switch, case)
                    .expect("woven case edge disappeared");
                // An unlabeled edge is the default; the sub-switch then
                // becomes the default of the outer switch.
                if info.labels.is_empty() {
                    weaving_default = true;
                }
                if !weaving_default {
                    labels.extend(info.labels.iter().copied());
                }
                graph.add_edge(sub_switch, case, info);
                cases.retain(|&c| c != case);
            }
            if weaving_default {
                labels.clear();
            }

            cases.push(sub_switch);
            graph.add_edge(switch, sub_switch, EdgeInfo { labels, inlined: false });

            // Post-dominance shifted around the new node; recompute rather
            // than patch the tree.
            ifpdt = PostDominatorTree::compute(graph, EdgeView::SkipInlined);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PayloadId;

    /// Three-way switch where cases 2 and 3 converge on 5 before the common
    /// post-dominator 7:
    ///
    ///     1 -> {2,3,4};  2 -> 5, 3 -> 5, 4 -> 6;  5 -> 7, 6 -> 7
    fn build_weavable() -> (RegionGraph, Vec<NodeIndex>) {
        let mut g = RegionGraph::new("f", "root");
        let n: Vec<_> = (0..7)
            .map(|i| g.add_node(Some(PayloadId(i)), format!("n{i}"), 1))
            .collect();
        g.set_entry(n[0]);
        for (i, &case) in [n[1], n[2], n[3]].iter().enumerate() {
            let mut labels = CaseLabels::new();
            labels.insert(i as i64);
            g.add_edge(n[0], case, EdgeInfo::with_labels(labels));
        }
        g.add_plain_edge(n[1], n[4]);
        g.add_plain_edge(n[2], n[4]);
        g.add_plain_edge(n[3], n[5]);
        g.add_plain_edge(n[4], n[6]);
        g.add_plain_edge(n[5], n[6]);
        (g, n)
    }

    #[test]
    fn converging_cases_move_into_a_sub_switch() {
        let (mut g, n) = build_weavable();
        weave(&mut g).unwrap();

        // The switch now has two live successors: the lone case and the
        // woven sub-switch.
        let succs = g.live_successors(n[0]);
        assert_eq!(succs.len(), 2);
        let sub = *succs
            .iter()
            .find(|&&s| g.node(s).weaved)
            .expect("a weaved sub-switch");

        // The sub-switch re-tests the same payload and owns cases 1 and 2.
        assert_eq!(g.node(sub).payload, g.node(n[0]).payload);
        let sub_cases = g.successors(sub);
        assert!(sub_cases.contains(&n[1]));
        assert!(sub_cases.contains(&n[2]));

        // Its entering edge carries the union of the moved labels.
        let info = g.edge_info(g.find_edge(n[0], sub).unwrap()).clone();
        let expected: CaseLabels = [0i64, 1].into_iter().collect();
        assert_eq!(info.labels, expected);
    }

    #[test]
    fn weaving_the_default_produces_a_default_sub_switch() {
        let mut g = RegionGraph::new("f", "root");
        let n: Vec<_> = (0..7)
            .map(|i| g.add_node(Some(PayloadId(i)), format!("n{i}"), 1))
            .collect();
        g.set_entry(n[0]);
        // Case 1 labeled, case 2 is the default, case 3 labeled.
        let mut l0 = CaseLabels::new();
        l0.insert(0);
        g.add_edge(n[0], n[1], EdgeInfo::with_labels(l0));
        g.add_plain_edge(n[0], n[2]);
        let mut l2 = CaseLabels::new();
        l2.insert(2);
        g.add_edge(n[0], n[3], EdgeInfo::with_labels(l2));
        g.add_plain_edge(n[1], n[4]);
        g.add_plain_edge(n[2], n[4]);
        g.add_plain_edge(n[3], n[5]);
        g.add_plain_edge(n[4], n[6]);
        g.add_plain_edge(n[5], n[6]);

        weave(&mut g).unwrap();

        let sub = *g
            .live_successors(n[0])
            .iter()
            .find(|&&s| g.node(s).weaved)
            .expect("a weaved sub-switch");
        // The default was woven: the sub-switch is the new default.
        let info = g.edge_info(g.find_edge(n[0], sub).unwrap());
        assert!(info.labels.is_empty());
    }

    #[test]
    fn binary_branches_are_not_woven() {
        let mut g = RegionGraph::new("f", "root");
        let n: Vec<_> = (0..4)
            .map(|i| g.add_node(Some(PayloadId(i)), format!("n{i}"), 1))
            .collect();
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[0], n[2]);
        g.add_plain_edge(n[1], n[3]);
        g.add_plain_edge(n[2], n[3]);

        let before = g.node_count();
        weave(&mut g).unwrap();
        assert_eq!(g.node_count(), before);
    }

    #[test]
    fn fully_converging_cases_stay_in_place() {
        // All three cases meet only at the post-dominator: nothing to weave.
        let mut g = RegionGraph::new("f", "root");
        let n: Vec<_> = (0..5)
            .map(|i| g.add_node(Some(PayloadId(i)), format!("n{i}"), 1))
            .collect();
        g.set_entry(n[0]);
        for case in [n[1], n[2], n[3]] {
            g.add_plain_edge(n[0], case);
            g.add_plain_edge(case, n[4]);
        }

        let before = g.node_count();
        weave(&mut g).unwrap();
        assert_eq!(g.node_count(), before);
    }
}
