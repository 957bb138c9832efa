//! Scope-closer overlay: auxiliary "dashed" edges over the base CFG
//!
//! A node may carry at most one scope-closer target, recorded as a marker
//! annotation on the graph rather than as a real edge. The [`ScopeGraph`]
//! view yields the union of a node's standard successors and its dashed
//! target in one lazy sequence, so depth-first traversals see the dashed
//! edge as an ordinary successor while dominance annotation can still tell
//! the two apart.
//!
//! Marker tables are owned by the graph and keyed by [`MarkerKind`], so
//! different analyses can read each other's annotations without any
//! process-wide state.

use petgraph::stable_graph::NodeIndex;

use crate::graph::RegionGraph;

/// Registry key for per-node marker annotations.
///
/// Injective by construction: each analysis owns one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    /// Dashed edge closing a lexical scope
    ScopeCloser,
}

/// Read the scope-closer target of a node, if any.
pub fn scope_closer_target(graph: &RegionGraph, node: NodeIndex) -> Option<NodeIndex> {
    graph
        .marker_table(MarkerKind::ScopeCloser)?
        .get(&node)
        .copied()
}

/// Attach (or replace) the scope-closer target of a node.
///
/// At most one target per node; setting a new one overwrites the old.
pub fn set_scope_closer_target(graph: &mut RegionGraph, node: NodeIndex, target: NodeIndex) {
    debug_assert!(graph.contains_node(node) && graph.contains_node(target));
    graph
        .marker_table_mut(MarkerKind::ScopeCloser)
        .insert(node, target);
}

/// Drop the scope-closer target of a node.
pub fn clear_scope_closer_target(graph: &mut RegionGraph, node: NodeIndex) {
    graph.marker_table_mut(MarkerKind::ScopeCloser).remove(&node);
}

/// Whether any node in the graph carries a scope-closer marker.
pub fn has_scope_closers(graph: &RegionGraph) -> bool {
    graph
        .marker_table(MarkerKind::ScopeCloser)
        .map(|t| !t.is_empty())
        .unwrap_or(false)
}

/// View of a [`RegionGraph`] augmented with the dashed scope-closer edges.
#[derive(Clone, Copy)]
pub struct ScopeGraph<'g> {
    graph: &'g RegionGraph,
}

impl<'g> ScopeGraph<'g> {
    pub fn new(graph: &'g RegionGraph) -> Self {
        Self { graph }
    }

    /// Standard successors in declared order, then the dashed target exactly
    /// once if present. The sequence is finite and regenerated per call.
    pub fn child_iter(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + 'g {
        let dashed = scope_closer_target(self.graph, node);
        self.graph.successors(node).into_iter().chain(dashed)
    }

    /// Depth-first reachability over the overlay, dashed edges included.
    pub fn reachable(&self, from: NodeIndex) -> std::collections::HashSet<NodeIndex> {
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            for child in self.child_iter(n) {
                if !seen.contains(&child) {
                    stack.push(child);
                }
            }
        }
        seen
    }
}
