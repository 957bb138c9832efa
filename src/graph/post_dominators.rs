//! Post-dominator tree with a virtual root, optionally edge-filtered
//!
//! A node d post-dominates n if every path from n to an exit passes through
//! d. The tree is rooted at a virtual exit connected to every exit node, so
//! regions with several exits still get a well-defined tree; the immediate
//! post-dominator of a node whose paths diverge to different exits is the
//! virtual root, reported as `None`.
//!
//! Computed over [`EdgeView::SkipInlined`] this is the filtered tree
//! (IFPDT): edges flagged `Inlined` are invisible, which keeps comb-ends
//! stable under the edge-marking discipline of untangle and inflate.

use std::collections::HashMap;

use petgraph::stable_graph::NodeIndex;

use crate::graph::visit::EdgeView;
use crate::graph::RegionGraph;

/// Post-dominator tree for a region graph.
#[derive(Debug, Clone)]
pub struct PostDominatorTree {
    /// Immediate post-dominator per node; `None` value means the virtual
    /// root. Nodes that cannot reach any exit are absent.
    ipdom: HashMap<NodeIndex, Option<NodeIndex>>,
}

impl PostDominatorTree {
    /// Compute the tree over the chosen edge view.
    ///
    /// Exits are the nodes without successors in that view. Uses the
    /// Cooper–Harvey–Kennedy iteration on the reversed graph, with the
    /// virtual root as the common ancestor of all exits.
    pub fn compute(graph: &RegionGraph, view: EdgeView) -> Self {
        let exits: Vec<NodeIndex> = graph
            .node_indices()
            .into_iter()
            .filter(|&n| match view {
                EdgeView::All => graph.successor_count(n) == 0,
                EdgeView::SkipInlined => graph.live_successor_count(n) == 0,
            })
            .collect();

        // Post-order DFS of the reversed graph from the virtual root.
        let mut porder: Vec<NodeIndex> = Vec::new();
        let mut visited: std::collections::HashSet<NodeIndex> = std::collections::HashSet::new();
        for &exit in &exits {
            if visited.contains(&exit) {
                continue;
            }
            let mut stack = vec![(exit, false)];
            while let Some((node, expanded)) = stack.pop() {
                if expanded {
                    porder.push(node);
                    continue;
                }
                if !visited.insert(node) {
                    continue;
                }
                stack.push((node, true));
                let preds = match view {
                    EdgeView::All => graph.predecessors(node),
                    EdgeView::SkipInlined => graph.live_predecessors(node),
                };
                for &pred in preds.iter().rev() {
                    if !visited.contains(&pred) {
                        stack.push((pred, false));
                    }
                }
            }
        }

        // Reverse-graph RPO numbering: virtual root is 0.
        let order: Vec<NodeIndex> = porder.into_iter().rev().collect();
        let mut number: HashMap<NodeIndex, usize> = HashMap::new();
        for (i, &n) in order.iter().enumerate() {
            number.insert(n, i + 1);
        }

        const UNDEFINED: usize = usize::MAX;
        let mut idom = vec![UNDEFINED; order.len() + 1];
        idom[0] = 0;

        let intersect = |idom: &[usize], mut a: usize, mut b: usize| -> usize {
            while a != b {
                while a > b {
                    a = idom[a];
                }
                while b > a {
                    b = idom[b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for (i, &node) in order.iter().enumerate() {
                let num = i + 1;
                // Predecessors in the reversed graph are successors here,
                // plus the virtual root for exit nodes.
                let mut new_idom = UNDEFINED;
                if exits.contains(&node) {
                    new_idom = 0;
                }
                let succs = match view {
                    EdgeView::All => graph.successors(node),
                    EdgeView::SkipInlined => graph.live_successors(node),
                };
                for succ in succs {
                    let Some(&succ_num) = number.get(&succ) else { continue };
                    if idom[succ_num] == UNDEFINED {
                        continue;
                    }
                    new_idom = if new_idom == UNDEFINED {
                        succ_num
                    } else {
                        intersect(&idom, new_idom, succ_num)
                    };
                }
                if new_idom != UNDEFINED && idom[num] != new_idom {
                    idom[num] = new_idom;
                    changed = true;
                }
            }
        }

        let mut ipdom = HashMap::new();
        for (i, &node) in order.iter().enumerate() {
            let num = i + 1;
            if idom[num] == UNDEFINED {
                continue;
            }
            let parent = if idom[num] == 0 { None } else { Some(order[idom[num] - 1]) };
            ipdom.insert(node, parent);
        }
        Self { ipdom }
    }

    /// Immediate post-dominator; `None` when it is the virtual root or the
    /// node cannot reach an exit under the computed view.
    pub fn immediate_post_dominator(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.ipdom.get(&node).copied().flatten()
    }

    /// Nearest common post-dominator of a set of nodes, each counting as a
    /// post-dominator of itself. `None` when their paths only meet at the
    /// virtual root.
    pub fn common_post_dominator<I>(&self, nodes: I) -> Option<NodeIndex>
    where
        I: IntoIterator<Item = NodeIndex>,
    {
        let mut iter = nodes.into_iter();
        let first = iter.next()?;
        let mut chain: Vec<NodeIndex> = {
            let mut chain = vec![first];
            let mut current = first;
            while let Some(ipdom) = self.immediate_post_dominator(current) {
                chain.push(ipdom);
                current = ipdom;
            }
            chain
        };
        for node in iter {
            let mut other: std::collections::HashSet<NodeIndex> =
                std::collections::HashSet::new();
            let mut current = node;
            other.insert(current);
            while let Some(ipdom) = self.immediate_post_dominator(current) {
                other.insert(ipdom);
                current = ipdom;
            }
            if let Some(pos) = chain.iter().position(|n| other.contains(n)) {
                chain.drain(..pos);
            } else {
                return None;
            }
        }
        chain.first().copied()
    }

    /// Whether `a` post-dominates `b`. Every node post-dominates itself.
    pub fn post_dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        while let Some(ipdom) = self.immediate_post_dominator(current) {
            if ipdom == a {
                return true;
            }
            current = ipdom;
        }
        false
    }
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
    fn diamond_join_post_dominates_branch() {
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 4);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[0], n[2]);
        g.add_plain_edge(n[1], n[3]);
        g.add_plain_edge(n[2], n[3]);

        let pdt = PostDominatorTree::compute(&g, EdgeView::All);
        assert_eq!(pdt.immediate_post_dominator(n[0]), Some(n[3]));
        assert_eq!(pdt.immediate_post_dominator(n[1]), Some(n[3]));
        assert_eq!(pdt.immediate_post_dominator(n[2]), Some(n[3]));
        assert_eq!(pdt.immediate_post_dominator(n[3]), None);
        assert!(pdt.post_dominates(n[3], n[0]));
        assert!(!pdt.post_dominates(n[1], n[0]));
    }

    #[test]
    fn multiple_exits_meet_at_virtual_root() {
        // 0 branches to two distinct exits: its ipdom is the virtual root.
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 3);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[0], n[2]);

        let pdt = PostDominatorTree::compute(&g, EdgeView::All);
        assert_eq!(pdt.immediate_post_dominator(n[0]), None);
        assert_eq!(pdt.immediate_post_dominator(n[1]), None);
        assert_eq!(pdt.immediate_post_dominator(n[2]), None);
    }

    #[test]
    fn filtered_view_ignores_inlined_edges() {
        // 0 -> 1 -> 3, 0 => 2 (inlined), 2 -> 3.
        // Filtered: 0's only successor is 1, so ipdom(0) = 1.
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 4);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[0], n[2]);
        g.mark_edge_inlined(n[0], n[2]);
        g.add_plain_edge(n[1], n[3]);
        g.add_plain_edge(n[2], n[3]);

        let full = PostDominatorTree::compute(&g, EdgeView::All);
        assert_eq!(full.immediate_post_dominator(n[0]), Some(n[3]));

        let filtered = PostDominatorTree::compute(&g, EdgeView::SkipInlined);
        assert_eq!(filtered.immediate_post_dominator(n[0]), Some(n[1]));
    }

    #[test]
    fn linear_chain_post_dominators() {
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 3);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[1], n[2]);

        let pdt = PostDominatorTree::compute(&g, EdgeView::All);
        assert_eq!(pdt.immediate_post_dominator(n[0]), Some(n[1]));
        assert_eq!(pdt.immediate_post_dominator(n[1]), Some(n[2]));
        assert_eq!(pdt.immediate_post_dominator(n[2]), None);
        assert!(pdt.post_dominates(n[2], n[0]));
    }
}
