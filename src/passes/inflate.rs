//! Inflate: the comb rewrite
//!
//! Duplicates nodes between every conditional and its comb-end (the
//! immediate filtered post-dominator for binary conditionals, the switch's
//! post-dominator for switch cases) until each branch owns its region
//! outright: along every path from the conditional, the comb-end is the
//! only node with more than one in-region predecessor. Where several
//! already-visited predecessors meet the comb-end, a dummy join is inserted
//! and becomes the new comb-end, so later walks converge there instead.
//!
//! The reverse post-order worklist is mutated during iteration; insertions
//! keep the list a valid RPO of the current graph, which is what makes the
//! single linear sweep per conditional sound.

use std::collections::{HashMap, HashSet};

use petgraph::stable_graph::NodeIndex;
use tracing::{debug, trace};

use crate::config::RestructureConfig;
use crate::error::RegionError;
use crate::graph::visit::{is_dag, reverse_post_order, reverse_reachable, EdgeView};
use crate::graph::{DominatorTree, PostDominatorTree, RegionGraph};

/// Run the comb over a DAG region.
pub fn inflate(graph: &mut RegionGraph, config: &RestructureConfig) -> Result<(), RegionError> {
    if !is_dag(graph, EdgeView::All) {
        return Err(RegionError::structure("inflate", "graph is not a DAG"));
    }

    // For every node, the set of inlined-only exits it can reach over the
    // filtered graph. Used to blacklist conditionals that dominate one
    // whole side's exits: that side can be absorbed instead of combed.
    let mut reachable_exits: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();
    for exit in graph.node_indices() {
        if graph.live_successor_count(exit) != 0 {
            continue;
        }
        for node in reverse_reachable(graph, exit, EdgeView::SkipInlined) {
            reachable_exits.entry(node).or_default().insert(exit);
        }
    }

    let dt = DominatorTree::compute(graph);
    let ifpdt = PostDominatorTree::compute(graph, EdgeView::SkipInlined);

    // Conditionals that initiate combing, each with the node where combing
    // stops. Switch cases share the switch's post-dominator, not their own.
    let mut comb_end_of: HashMap<NodeIndex, Option<NodeIndex>> = HashMap::new();
    let mut conditional_set: HashSet<NodeIndex> = HashSet::new();
    let mut switches: Vec<NodeIndex> = Vec::new();

    for node in graph.node_indices() {
        match graph.successor_count(node) {
            0 | 1 => {}
            2 => {
                let succs = graph.successors(node);
                let (then_child, else_child) = (succs[0], succs[1]);
                conditional_set.insert(node);
                comb_end_of.insert(node, ifpdt.immediate_post_dominator(node));

                let dominates_all = |exits: Option<&HashSet<NodeIndex>>| {
                    exits
                        .map(|set| set.iter().all(|&e| dt.dominates(node, e)))
                        .unwrap_or(true)
                };
                let then_dominated = dominates_all(reachable_exits.get(&then_child));
                let else_dominated = dominates_all(reachable_exits.get(&else_child));

                // A side whose exits are all dominated can be inlined whole;
                // it will never force duplication.
                if then_dominated && else_dominated {
                    graph.mark_edge_inlined(node, then_child);
                    graph.mark_edge_inlined(node, else_child);
                } else if then_dominated {
                    graph.mark_edge_inlined(node, then_child);
                } else if else_dominated {
                    graph.mark_edge_inlined(node, else_child);
                }
                if then_dominated || else_dominated {
                    trace!(node = %graph.node(node).name, "blacklisted conditional");
                }
            }
            _ => switches.push(node),
        }
    }

    // Wrap each switch case in a dummy so cases share a uniform shape; the
    // dummies, not the switch, drive the combing.
    for switch in switches {
        let mut cases: Vec<NodeIndex> = Vec::new();
        for succ in graph.successors(switch) {
            if !cases.contains(&succ) {
                cases.push(succ);
            }
        }
        let post_dom = ifpdt.immediate_post_dominator(switch);
        for case in cases {
            let dummy = graph.add_dummy();
            graph.move_edge_target(switch, case, dummy);
            graph.add_plain_edge(dummy, case);
            conditional_set.insert(dummy);
            comb_end_of.insert(dummy, post_dom);
        }
    }

    // Reverse post-order list of live nodes, the clone equivalence classes,
    // and the conditionals in RPO (popping from the back is post-order).
    let mut rpo_list: Vec<NodeIndex> = reverse_post_order(graph, graph.entry(), EdgeView::All);
    let mut clone_to_original: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut clones_of: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();
    for &node in &rpo_list {
        clone_to_original.insert(node, node);
        clones_of.entry(node).or_default().insert(node);
    }
    let mut conditionals: Vec<NodeIndex> =
        rpo_list.iter().copied().filter(|n| conditional_set.contains(n)).collect();

    let mut duplications = 0usize;

    while let Some(conditional) = conditionals.pop() {
        if !graph.contains_node(conditional) {
            // Swallowed by an earlier purge; nothing left to comb.
            continue;
        }
        let mut comb_end = *comb_end_of
            .get(&conditional)
            .expect("conditional registered without a comb end");

        debug!(conditional = %graph.node(conditional).name, "combing conditional");

        let mut worklist: HashSet<NodeIndex> =
            graph.live_successors(conditional).into_iter().collect();
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        visited.insert(conditional);

        let Some(start) = rpo_list.iter().position(|&x| x == conditional) else {
            continue;
        };
        let mut i = start + 1;

        while i < rpo_list.len() && !worklist.is_empty() {
            let candidate = rpo_list[i];
            if !worklist.remove(&candidate) {
                i += 1;
                continue;
            }

            trace!(candidate = %graph.node(candidate).name, "analyzing candidate");

            let all_preds_visited =
                graph.predecessors(candidate).iter().all(|p| visited.contains(p));
            visited.insert(candidate);

            let is_comb_end = match comb_end {
                Some(end) => clones_of
                    .get(&end)
                    .map(|set| set.contains(&candidate))
                    .unwrap_or(false),
                None => false,
            };

            if !is_comb_end {
                for (succ, _) in graph.labeled_successors(candidate) {
                    worklist.insert(succ);
                }
            }

            if all_preds_visited {
                i += 1;
                continue;
            }

            if is_comb_end {
                assert!(
                    graph.predecessor_count(candidate) > 1,
                    "comb end reached with a single predecessor"
                );
                let visited_preds: Vec<NodeIndex> = graph
                    .predecessors(candidate)
                    .into_iter()
                    .filter(|p| visited.contains(p))
                    .collect();
                // A dummy with one predecessor and one successor would be
                // trivial; skip it.
                if visited_preds.len() < 2 {
                    i += 1;
                    continue;
                }

                let dummy = graph.add_dummy();
                trace!(at = %graph.node(candidate).name, "inserting dummy join");
                for pred in visited_preds {
                    graph.move_edge_target(pred, candidate, dummy);
                }
                graph.add_plain_edge(dummy, candidate);

                // The candidate was not really analyzed, only displaced;
                // downstream visits must treat it as fresh.
                visited.remove(&candidate);
                clone_to_original.insert(dummy, dummy);
                clones_of.entry(dummy).or_default().insert(dummy);

                // The dummy now ends the combing for this conditional, and
                // it post-dominates the region, so it must come before the
                // candidate in the RPO list.
                comb_end = Some(dummy);
                comb_end_of.insert(conditional, Some(dummy));
                worklist.insert(dummy);
                rpo_list.insert(i, dummy);
                // Re-enter at the dummy's position.
                continue;
            }

            // Duplicate the candidate onto its unvisited predecessors.
            if let Some(limit) = config.inflate_max_duplications {
                if duplications >= limit {
                    return Err(RegionError::BudgetExceeded {
                        duplications: duplications + 1,
                        limit,
                    });
                }
            }
            duplications += 1;

            let duplicated = graph.clone_node(candidate);
            trace!(node = %graph.node(candidate).name, "duplicating node");
            for (succ, info) in graph.labeled_successors(candidate) {
                graph.add_edge(duplicated, succ, info);
            }
            let unvisited_preds: Vec<NodeIndex> = graph
                .predecessors(candidate)
                .into_iter()
                .filter(|p| !visited.contains(p))
                .collect();
            for pred in unvisited_preds {
                graph.move_edge_target(pred, candidate, duplicated);
            }

            let original = *clone_to_original
                .get(&candidate)
                .expect("candidate outside the clone equivalence classes");

            if graph.node(candidate).is_empty() {
                // Splitting a dummy's predecessors may leave either copy
                // trivial; purge them on the spot so the RPO list only
                // carries meaningful dummies.
                let mut candidate_pos = i;
                if !graph.purge_if_trivial_dummy(duplicated) {
                    clone_to_original.insert(duplicated, original);
                    clones_of.entry(original).or_default().insert(duplicated);
                    rpo_list.insert(i, duplicated);
                    candidate_pos = i + 1;
                }
                if graph.purge_if_trivial_dummy(candidate) {
                    clone_to_original.remove(&candidate);
                    if let Some(set) = clones_of.get_mut(&original) {
                        set.remove(&candidate);
                    }
                    visited.remove(&candidate);
                    rpo_list.remove(candidate_pos);
                    i = candidate_pos;
                } else {
                    i = candidate_pos + 1;
                }
            } else {
                clone_to_original.insert(duplicated, original);
                clones_of.entry(original).or_default().insert(duplicated);

                // A duplicated conditional combs the same region as its
                // original; queue it behind the current one.
                if let Some(&end) = comb_end_of.get(&candidate) {
                    comb_end_of.insert(duplicated, end);
                    conditionals.push(duplicated);
                }

                // The clone has no ordering constraint against the
                // candidate; placing it right before keeps the list a
                // valid RPO.
                rpo_list.insert(i, duplicated);
                i += 2;
            }
        }
    }

    graph.purge_trivial_dummies();
    debug!(duplications, "inflate finished");
    Ok(())
}
