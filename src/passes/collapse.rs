//! Cycle collapsing
//!
//! Replaces every cycle with a single `Collapsed` node owning a nested
//! graph, leaving the parent (and, recursively, every nested body) acyclic.
//! This is the step that pushes loop handling out of the way of untangle
//! and inflate, which both require a DAG.
//!
//! A cycle with several entry targets is first normalized to a single
//! entry. A non-head entry whose in-cycle edges all lead to the head is
//! simply duplicated outside the cycle, which absorbs the irreducibility at
//! the cost of one clone. Anything messier gets an entry dispatcher: every
//! edge into the cycle runs through a `SetVariable` node feeding a fresh
//! `Dispatcher` that becomes the new head.
//!
//! Inside the nested body, retreating edges to the head become `Continue`
//! nodes and edges leaving the cycle become `Break` nodes, one per exit
//! edge, sharing an exit index per distinct target. When a cycle has more
//! than one exit target the parent gets an exit dispatcher after the
//! collapsed node, so a collapsed cycle always has at most one successor.

use std::collections::{HashMap, HashSet};

use petgraph::stable_graph::NodeIndex;
use tracing::{debug, trace};

use crate::graph::visit::{reverse_post_order, strongly_connected_components, EdgeView};
use crate::graph::{CaseLabels, EdgeInfo, NodeKind, RegionGraph};

/// Collapse every cycle, recursively. The graph is a DAG afterwards.
pub fn collapse_cycles(graph: &mut RegionGraph) {
    loop {
        let Some(members) = find_cycle(graph) else { break };

        let entry_targets = cycle_entry_targets(graph, &members);
        if entry_targets.len() > 1 {
            normalize_entries(graph, &members, &entry_targets);
            // Membership changed; rediscover the cycle.
            continue;
        }

        let head = match entry_targets.first() {
            Some(&head) => head,
            // A cycle no edge enters: the earliest member in index order.
            None => *members
                .iter()
                .min()
                .expect("cycle with no members"),
        };
        collapse_one(graph, &members, head);
    }
}

/// First non-trivial SCC over the live (non-inlined) edges, if any.
fn find_cycle(graph: &RegionGraph) -> Option<HashSet<NodeIndex>> {
    for scc in strongly_connected_components(graph, EdgeView::SkipInlined) {
        let cyclic = scc.len() > 1
            || scc
                .iter()
                .any(|&n| graph.live_successors(n).contains(&n));
        if cyclic {
            return Some(scc.into_iter().collect());
        }
    }
    None
}

/// Cycle members entered from outside, ordered by reverse post-order.
fn cycle_entry_targets(graph: &RegionGraph, members: &HashSet<NodeIndex>) -> Vec<NodeIndex> {
    let rpo = reverse_post_order(graph, graph.entry(), EdgeView::All);
    let mut targets: Vec<NodeIndex> = members
        .iter()
        .copied()
        .filter(|&n| {
            graph.entry() == n
                || graph
                    .live_predecessors(n)
                    .iter()
                    .any(|p| !members.contains(p))
        })
        .collect();
    targets.sort_by_key(|&n| rpo.iter().position(|&x| x == n).unwrap_or(usize::MAX));
    targets
}

/// Make a multiple-entry cycle single-entry.
fn normalize_entries(
    graph: &mut RegionGraph,
    members: &HashSet<NodeIndex>,
    entry_targets: &[NodeIndex],
) {
    // Head election: the target with the most incoming edges from outside
    // the cycle, ties broken by entry-target order (reverse post-order).
    let external_in_degree = |n: NodeIndex| {
        graph
            .live_predecessors(n)
            .iter()
            .filter(|p| !members.contains(p))
            .count()
    };
    let mut head = entry_targets[0];
    let mut best = external_in_degree(head);
    for &candidate in &entry_targets[1..] {
        let degree = external_in_degree(candidate);
        if degree > best {
            head = candidate;
            best = degree;
        }
    }

    // Cheap path: a late entry whose in-cycle edges all lead to the head
    // can be duplicated outside the cycle instead of paying a dispatcher.
    // The region entry itself cannot be cloned away.
    let duplicable = entry_targets.iter().all(|&e| {
        e == head
            || (e != graph.entry()
                && graph
                    .successors(e)
                    .iter()
                    .all(|s| !members.contains(s) || *s == head))
    });

    if duplicable {
        for &entry in entry_targets {
            if entry == head {
                continue;
            }
            debug!(entry = %graph.node(entry).name, "duplicating late cycle entry");
            let clone = graph.clone_node(entry);
            for (succ, info) in graph.labeled_successors(entry) {
                graph.add_edge(clone, succ, info);
            }
            let external: Vec<NodeIndex> = graph
                .predecessors(entry)
                .into_iter()
                .filter(|p| !members.contains(p))
                .collect();
            for pred in external {
                graph.move_edge_target(pred, entry, clone);
            }
        }
        return;
    }

    // Dispatcher path: every edge into any entry target is rerouted through
    // a state assignment into a fresh dispatcher, which becomes the head.
    debug!(
        entries = entry_targets.len(),
        "normalizing cycle entries through a dispatcher"
    );
    let head_name = graph.node(head).name.clone();
    let dispatcher =
        graph.add_artificial(NodeKind::Dispatcher, format!("{head_name}_entry_dispatch"));
    for (i, &target) in entry_targets.iter().enumerate() {
        let mut labels = CaseLabels::new();
        labels.insert(i as i64);
        graph.add_edge(dispatcher, target, EdgeInfo::with_labels(labels));
    }
    for (i, &target) in entry_targets.iter().enumerate() {
        let predecessors: Vec<NodeIndex> = graph
            .predecessors(target)
            .into_iter()
            .filter(|&p| p != dispatcher)
            .collect();
        for pred in predecessors {
            let setter = graph.add_artificial(
                NodeKind::SetVariable { value: i as u64 },
                format!("{head_name}_set_{i}"),
            );
            graph.move_edge_target(pred, target, setter);
            graph.add_plain_edge(setter, dispatcher);
        }
    }
    if members.contains(&graph.entry()) {
        graph.set_entry(dispatcher);
    }
}

/// Move a single-entry cycle into a nested graph behind a `Collapsed` node.
fn collapse_one(graph: &mut RegionGraph, members: &HashSet<NodeIndex>, head: NodeIndex) {
    let head_name = graph.node(head).name.clone();
    let head_id = graph.node(head).id;
    debug!(head = %head_name, size = members.len(), "collapsing cycle");

    let mut body = RegionGraph::new(
        graph.function_name().to_string(),
        format!("{}-loop-{}", graph.region_name(), head_id.0),
    );

    // Members keep their identity inside the body; deterministic order.
    let mut ordered: Vec<NodeIndex> = members.iter().copied().collect();
    ordered.sort();
    let mut inner: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    for &m in &ordered {
        let node = graph.node(m).clone();
        let child_ix = body.insert_node(node);
        if let Some(nested) = graph.take_nested(m) {
            body.set_nested(child_ix, nested);
        }
        inner.insert(m, child_ix);
    }
    body.set_entry(inner[&head]);

    // Internal edges move verbatim; exit edges become breaks, one per edge,
    // sharing an exit index per distinct target. Inlined edges out of the
    // cycle are sink gates and simply end here.
    let mut exit_index_of: HashMap<NodeIndex, usize> = HashMap::new();
    let mut exit_order: Vec<NodeIndex> = Vec::new();
    for (edge, src, dst) in graph.edge_indices() {
        if !members.contains(&src) {
            continue;
        }
        let info = graph.edge_info(edge).clone();
        if members.contains(&dst) {
            body.add_edge(inner[&src], inner[&dst], info);
        } else if !info.inlined {
            let index = *exit_index_of.entry(dst).or_insert_with(|| {
                exit_order.push(dst);
                body.push_exit_target(graph.node(dst).id)
            });
            let brk = body.add_artificial(
                NodeKind::Break { exit_index: index },
                format!("break_{index}"),
            );
            body.add_edge(inner[&src], brk, info);
        }
    }

    // Retreating edges to the head become continues.
    let body_head = body.entry();
    let retreating = body.predecessors(body_head);
    for pred in retreating {
        let cont = body.add_artificial(NodeKind::Continue, "continue");
        trace!(from = %body.node(pred).name, "retargeting retreating edge");
        body.move_edge_target(pred, body_head, cont);
    }

    // Nested cycles collapse the same way.
    collapse_cycles(&mut body);

    // The parent sees one collapsed node; entries redirect into it.
    let collapsed =
        graph.add_artificial(NodeKind::Collapsed, format!("collapsed_{head_name}"));
    let external: Vec<NodeIndex> = graph
        .predecessors(head)
        .into_iter()
        .filter(|p| !members.contains(p))
        .collect();
    for pred in external {
        graph.move_edge_target(pred, head, collapsed);
    }

    match exit_order.len() {
        0 => {}
        1 => {
            graph.add_plain_edge(collapsed, exit_order[0]);
        }
        _ => {
            // Which break fired is dispatched after the loop, so the
            // collapsed node keeps a single successor.
            let exit_dispatch = graph
                .add_artificial(NodeKind::Dispatcher, format!("{head_name}_exit_dispatch"));
            graph.add_plain_edge(collapsed, exit_dispatch);
            for (index, &target) in exit_order.iter().enumerate() {
                let mut labels = CaseLabels::new();
                labels.insert(index as i64);
                graph.add_edge(exit_dispatch, target, EdgeInfo::with_labels(labels));
            }
        }
    }

    graph.set_nested(collapsed, body);
    let was_entry = members.contains(&graph.entry());
    for &m in &ordered {
        graph.remove_node(m);
    }
    if was_entry {
        graph.set_entry(collapsed);
    }
}
