//! Dominator tree construction and queries
//!
//! A node d dominates node n if every path from the entry node to n must go
//! through d. The tree is computed over the full edge set: inlined edges
//! are still real control flow for forward dominance; only the filtered
//! post-dominator tree ignores them.
//!
//! Recomputed on demand at the points the pass pipeline defines; results
//! are stale after any structural mutation and must not be queried until
//! the next recomputation.

use std::collections::HashMap;

use petgraph::algo::dominators::simple_fast;
use petgraph::stable_graph::NodeIndex;

use crate::graph::RegionGraph;

/// Dominator tree for a region graph, rooted at the entry node.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    root: NodeIndex,
    /// None for the root; absent for nodes unreachable from the entry
    immediate_dominator: HashMap<NodeIndex, Option<NodeIndex>>,
}

impl DominatorTree {
    /// Compute the tree with the Cooper–Harvey–Kennedy algorithm.
    pub fn compute(graph: &RegionGraph) -> Self {
        let root = graph.entry();
        let dominators = simple_fast(graph.inner(), root);

        let mut immediate_dominator = HashMap::new();
        for node in graph.node_indices() {
            if node == root {
                immediate_dominator.insert(node, None);
            } else if let Some(idom) = dominators.immediate_dominator(node) {
                immediate_dominator.insert(node, Some(idom));
            }
        }
        Self { root, immediate_dominator }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Immediate dominator; None for the root or unreachable nodes.
    pub fn immediate_dominator(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.immediate_dominator.get(&node).copied().flatten()
    }

    /// Whether `a` dominates `b`. Every node dominates itself.
    pub fn dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        while let Some(idom) = self.immediate_dominator(current) {
            if idom == a {
                return true;
            }
            current = idom;
        }
        false
    }

    pub fn strictly_dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
        a != b && self.dominates(a, b)
    }
}
