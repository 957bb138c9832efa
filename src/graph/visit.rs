//! Deterministic traversals over a region graph
//!
//! Every pass visits nodes in reverse post-order unless stated otherwise,
//! with sibling ties broken by edge insertion order. petgraph's own
//! adjacency iteration is newest-first, so these helpers are the one place
//! that re-establishes insertion order; passes never walk raw adjacency.
//!
//! `filtered` variants skip edges flagged `inlined`, matching the view the
//! filtered post-dominator tree has of the graph.

use std::collections::{HashMap, HashSet};

use petgraph::stable_graph::NodeIndex;

use crate::graph::RegionGraph;

/// Which edges a traversal follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeView {
    /// Every edge, inlined or not
    All,
    /// Non-inlined edges only
    SkipInlined,
}

fn successors(graph: &RegionGraph, node: NodeIndex, view: EdgeView) -> Vec<NodeIndex> {
    match view {
        EdgeView::All => graph.successors(node),
        EdgeView::SkipInlined => graph.live_successors(node),
    }
}

fn predecessors(graph: &RegionGraph, node: NodeIndex, view: EdgeView) -> Vec<NodeIndex> {
    match view {
        EdgeView::All => graph.predecessors(node),
        EdgeView::SkipInlined => graph.live_predecessors(node),
    }
}

/// Post-order of the nodes reachable from `start`.
///
/// Iterative DFS; children are entered in insertion order.
pub fn post_order(graph: &RegionGraph, start: NodeIndex, view: EdgeView) -> Vec<NodeIndex> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    // (node, expanded): a node is emitted when popped the second time
    let mut stack = vec![(start, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node) {
            continue;
        }
        stack.push((node, true));
        let succs = successors(graph, node, view);
        for &succ in succs.iter().rev() {
            if !visited.contains(&succ) {
                stack.push((succ, false));
            }
        }
    }
    order
}

/// Reverse post-order of the nodes reachable from `start`.
pub fn reverse_post_order(graph: &RegionGraph, start: NodeIndex, view: EdgeView) -> Vec<NodeIndex> {
    let mut order = post_order(graph, start, view);
    order.reverse();
    order
}

/// Nodes reachable from `start`, traversal not continuing past `stop`.
///
/// `stop` itself is included when reached, mirroring the region queries of
/// the untangle cost model (the caller erases it when unwanted).
pub fn reachable_until(
    graph: &RegionGraph,
    start: NodeIndex,
    stop: Option<NodeIndex>,
    view: EdgeView,
) -> HashSet<NodeIndex> {
    let mut seen = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        if Some(node) == stop {
            continue;
        }
        for succ in successors(graph, node, view) {
            if !seen.contains(&succ) {
                stack.push(succ);
            }
        }
    }
    seen
}

/// Nodes from which `target` is reachable (inverse depth-first).
pub fn reverse_reachable(
    graph: &RegionGraph,
    target: NodeIndex,
    view: EdgeView,
) -> HashSet<NodeIndex> {
    let mut seen = HashSet::new();
    let mut stack = vec![target];
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        for pred in predecessors(graph, node, view) {
            if !seen.contains(&pred) {
                stack.push(pred);
            }
        }
    }
    seen
}

/// Strongly connected components over the chosen edge view.
///
/// Iterative Tarjan; components come out in reverse topological order.
/// Unreachable nodes are included (every node belongs to exactly one
/// component).
pub fn strongly_connected_components(graph: &RegionGraph, view: EdgeView) -> Vec<Vec<NodeIndex>> {
    let mut index: HashMap<NodeIndex, usize> = HashMap::new();
    let mut lowlink: HashMap<NodeIndex, usize> = HashMap::new();
    let mut on_stack: HashSet<NodeIndex> = HashSet::new();
    let mut stack: Vec<NodeIndex> = Vec::new();
    let mut sccs: Vec<Vec<NodeIndex>> = Vec::new();
    let mut next_index = 0usize;

    for start in graph.node_indices() {
        if index.contains_key(&start) {
            continue;
        }
        let mut call: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
            vec![(start, successors(graph, start, view), 0)];
        index.insert(start, next_index);
        lowlink.insert(start, next_index);
        next_index += 1;
        stack.push(start);
        on_stack.insert(start);

        while !call.is_empty() {
            let (node, next) = {
                let frame = call.last_mut().expect("tarjan call stack underflow");
                let node = frame.0;
                if frame.2 < frame.1.len() {
                    let next = frame.1[frame.2];
                    frame.2 += 1;
                    (node, Some(next))
                } else {
                    (node, None)
                }
            };
            match next {
                Some(next) => {
                    if !index.contains_key(&next) {
                        index.insert(next, next_index);
                        lowlink.insert(next, next_index);
                        next_index += 1;
                        stack.push(next);
                        on_stack.insert(next);
                        let next_succs = successors(graph, next, view);
                        call.push((next, next_succs, 0));
                    } else if on_stack.contains(&next) {
                        let candidate = index[&next];
                        if candidate < lowlink[&node] {
                            lowlink.insert(node, candidate);
                        }
                    }
                }
                None => {
                    if lowlink[&node] == index[&node] {
                        let mut component = Vec::new();
                        loop {
                            let member = stack.pop().expect("tarjan stack underflow");
                            on_stack.remove(&member);
                            component.push(member);
                            if member == node {
                                break;
                            }
                        }
                        sccs.push(component);
                    }
                    let low = lowlink[&node];
                    call.pop();
                    if let Some((parent, _, _)) = call.last() {
                        if low < lowlink[parent] {
                            lowlink.insert(*parent, low);
                        }
                    }
                }
            }
        }
    }
    sccs
}

/// A graph is a DAG when every SCC is a singleton without a self-loop.
pub fn is_dag(graph: &RegionGraph, view: EdgeView) -> bool {
    for scc in strongly_connected_components(graph, view) {
        if scc.len() != 1 {
            return false;
        }
        let node = scc[0];
        if successors(graph, node, view).contains(&node) {
            return false;
        }
    }
    true
}
