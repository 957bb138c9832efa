//! Structured AST of scopes and its builder
//!
//! Consumes a fully restructured region: a DAG in which every conditional
//! owns its region up to a unique join, cycles live behind `Collapsed`
//! nodes, and inlined edges mark arms that never rejoin. The produced tree
//! uses only sequence/if/loop/switch/scope constructs with `break` and
//! `continue`; no goto is ever needed.
//!
//! Every surviving graph node with a payload appears in exactly one `Leaf`;
//! cloned nodes appear once per clone under their fresh id.

use serde::{Deserialize, Serialize};

use petgraph::stable_graph::NodeIndex;

use crate::graph::visit::EdgeView;
use crate::graph::{NodeId, NodeKind, PostDominatorTree, RegionGraph};

/// Loop flavor, classified from the body's shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopKind {
    While,
    DoWhile,
    Infinite,
}

/// One switch case: label set and body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub labels: Vec<i64>,
    pub body: AstNode,
}

/// Structured control tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AstNode {
    Sequence(Vec<AstNode>),
    If {
        condition: NodeId,
        then_body: Option<Box<AstNode>>,
        else_body: Option<Box<AstNode>>,
    },
    Loop {
        label: usize,
        kind: LoopKind,
        body: Box<AstNode>,
        exit_targets: Vec<NodeId>,
    },
    Switch {
        scrutinee: NodeId,
        cases: Vec<SwitchCase>,
        default: Option<Box<AstNode>>,
    },
    Scope {
        label: usize,
        body: Box<AstNode>,
    },
    Break {
        label: usize,
        exit_index: usize,
    },
    Continue {
        label: usize,
    },
    Leaf(NodeId),
}

impl AstNode {
    /// All leaf ids in the tree, in emission order.
    pub fn leaf_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<NodeId>) {
        match self {
            AstNode::Sequence(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
            AstNode::If { then_body, else_body, .. } => {
                if let Some(body) = then_body {
                    body.collect_leaves(out);
                }
                if let Some(body) = else_body {
                    body.collect_leaves(out);
                }
            }
            AstNode::Loop { body, .. } | AstNode::Scope { body, .. } => {
                body.collect_leaves(out)
            }
            AstNode::Switch { cases, default, .. } => {
                for case in cases {
                    case.body.collect_leaves(out);
                }
                if let Some(body) = default {
                    body.collect_leaves(out);
                }
            }
            AstNode::Leaf(id) => out.push(*id),
            AstNode::Break { .. } | AstNode::Continue { .. } => {}
        }
    }
}

/// Build the structured AST of a restructured region.
pub fn build_ast(graph: &RegionGraph) -> AstNode {
    let mut builder = AstBuilder { next_label: 0 };
    builder.build_graph(graph, None)
}

struct AstBuilder {
    next_label: usize,
}

impl AstBuilder {
    fn fresh_label(&mut self) -> usize {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    fn build_graph(&mut self, graph: &RegionGraph, loop_label: Option<usize>) -> AstNode {
        // The filtered tree names where each branch's live flows converge;
        // inlined arms that never rejoin simply have no join there.
        let pdt = PostDominatorTree::compute(graph, EdgeView::SkipInlined);
        let items = self.build_sequence(graph, &pdt, graph.entry(), None, loop_label);
        seq_or_single(items)
    }

    /// Emit the chain from `start` up to (excluding) `stop`.
    fn build_sequence(
        &mut self,
        graph: &RegionGraph,
        pdt: &PostDominatorTree,
        start: NodeIndex,
        stop: Option<NodeIndex>,
        loop_label: Option<usize>,
    ) -> Vec<AstNode> {
        let mut out = Vec::new();
        let mut cursor = Some(start);
        while let Some(node) = cursor {
            if Some(node) == stop {
                break;
            }
            cursor = self.emit_node(graph, pdt, node, stop, loop_label, &mut out);
        }
        out
    }

    /// Emit one node, returning where the sequence continues.
    fn emit_node(
        &mut self,
        graph: &RegionGraph,
        pdt: &PostDominatorTree,
        node: NodeIndex,
        stop: Option<NodeIndex>,
        loop_label: Option<usize>,
        out: &mut Vec<AstNode>,
    ) -> Option<NodeIndex> {
        let data = graph.node(node);

        // Empty artificials are wiring, not statements.
        if data.is_empty() {
            return graph.live_successors(node).first().copied();
        }

        match data.kind {
            NodeKind::Collapsed => {
                let body_graph = graph
                    .nested(node)
                    .expect("collapsed node without a nested body");
                let label = self.fresh_label();
                let body = self.build_graph(body_graph, Some(label));
                let kind = classify_loop(&body);
                out.push(AstNode::Loop {
                    label,
                    kind,
                    body: Box::new(body),
                    exit_targets: body_graph.exit_targets().to_vec(),
                });
                graph.live_successors(node).first().copied()
            }
            NodeKind::Break { exit_index } => {
                out.push(AstNode::Break {
                    label: loop_label.expect("break outside of any loop"),
                    exit_index,
                });
                None
            }
            NodeKind::Continue => {
                out.push(AstNode::Continue {
                    label: loop_label.expect("continue outside of any loop"),
                });
                None
            }
            _ => self.emit_branching(graph, pdt, node, stop, loop_label, out),
        }
    }

    fn emit_branching(
        &mut self,
        graph: &RegionGraph,
        pdt: &PostDominatorTree,
        node: NodeIndex,
        stop: Option<NodeIndex>,
        loop_label: Option<usize>,
        out: &mut Vec<AstNode>,
    ) -> Option<NodeIndex> {
        let data = graph.node(node);
        let successors = graph.labeled_successors(node);

        if data.kind != NodeKind::Dispatcher {
            out.push(AstNode::Leaf(data.id));
        }

        // Labeled out-edges mean a multi-way branch even when weaving left
        // only two of them.
        let labeled = successors.iter().any(|(_, info)| !info.labels.is_empty());
        let plain_branch = data.kind != NodeKind::Dispatcher && !labeled;

        match successors.len() {
            0 => None,
            1 if data.kind != NodeKind::Dispatcher => Some(successors[0].0),
            2 if plain_branch => {
                // The arms converge where their live flows meet; arms whose
                // flow never rejoins run to their own end, bounded by the
                // enclosing region.
                let merge = pdt.common_post_dominator(successors.iter().map(|(t, _)| *t));
                let arm_stop = merge.or(stop);
                let then_body =
                    self.build_arm(graph, pdt, &successors[0], merge, arm_stop, loop_label);
                let else_body =
                    self.build_arm(graph, pdt, &successors[1], merge, arm_stop, loop_label);
                out.push(AstNode::If {
                    condition: data.id,
                    then_body: then_body.map(Box::new),
                    else_body: else_body.map(Box::new),
                });
                merge
            }
            _ => {
                // Multi-way: group parallel edges per target, default is the
                // unlabeled case.
                let merge = pdt.common_post_dominator(successors.iter().map(|(t, _)| *t));
                let arm_stop = merge.or(stop);
                let mut cases: Vec<SwitchCase> = Vec::new();
                let mut default: Option<Box<AstNode>> = None;
                let mut seen: Vec<NodeIndex> = Vec::new();
                for entry in &successors {
                    let (target, info) = entry;
                    if seen.contains(target) {
                        continue;
                    }
                    seen.push(*target);
                    let body = self
                        .build_arm(graph, pdt, entry, merge, arm_stop, loop_label)
                        .unwrap_or(AstNode::Sequence(Vec::new()));
                    if info.labels.is_empty() {
                        default = Some(Box::new(body));
                    } else {
                        cases.push(SwitchCase {
                            labels: info.labels.iter().copied().collect(),
                            body,
                        });
                    }
                }
                out.push(AstNode::Switch { scrutinee: data.id, cases, default });
                merge
            }
        }
    }

    /// Build one branch arm up to the merge point. Arms that start at the
    /// merge are absent; inlined arms carrying real code that never rejoins
    /// get their own scope.
    fn build_arm(
        &mut self,
        graph: &RegionGraph,
        pdt: &PostDominatorTree,
        (target, info): &(NodeIndex, crate::graph::EdgeInfo),
        merge: Option<NodeIndex>,
        arm_stop: Option<NodeIndex>,
        loop_label: Option<usize>,
    ) -> Option<AstNode> {
        if Some(*target) == merge || Some(*target) == arm_stop {
            return None;
        }
        let items = self.build_sequence(graph, pdt, *target, arm_stop, loop_label);
        if items.is_empty() {
            return None;
        }
        let body = seq_or_single(items);
        if info.inlined && merge.is_none() && contains_leaf(&body) {
            let label = self.fresh_label();
            Some(AstNode::Scope { label, body: Box::new(body) })
        } else {
            Some(body)
        }
    }
}

fn contains_leaf(node: &AstNode) -> bool {
    !node.leaf_ids().is_empty()
}

fn seq_or_single(mut items: Vec<AstNode>) -> AstNode {
    if items.len() == 1 {
        items.pop().expect("single item")
    } else {
        AstNode::Sequence(items)
    }
}

/// Classify a loop body: a head conditional breaking out is a while, a tail
/// conditional continuing is a do-while, anything else runs forever.
fn classify_loop(body: &AstNode) -> LoopKind {
    let items: &[AstNode] = match body {
        AstNode::Sequence(items) => items,
        other => std::slice::from_ref(other),
    };

    if items.len() >= 2 {
        if let (AstNode::Leaf(head), AstNode::If { condition, then_body, else_body }) =
            (&items[0], &items[1])
        {
            if head == condition
                && (arm_is_only(then_body, |n| matches!(n, AstNode::Break { .. }))
                    || arm_is_only(else_body, |n| matches!(n, AstNode::Break { .. })))
            {
                return LoopKind::While;
            }
        }
    }

    if let Some(AstNode::If { then_body, else_body, .. }) = items.last() {
        if arm_is_only(then_body, |n| matches!(n, AstNode::Continue { .. }))
            || arm_is_only(else_body, |n| matches!(n, AstNode::Continue { .. }))
        {
            return LoopKind::DoWhile;
        }
    }

    LoopKind::Infinite
}

fn arm_is_only(arm: &Option<Box<AstNode>>, predicate: impl Fn(&AstNode) -> bool + Copy) -> bool {
    fn check(node: &AstNode, predicate: impl Fn(&AstNode) -> bool + Copy) -> bool {
        if predicate(node) {
            return true;
        }
        match node {
            AstNode::Sequence(items) if items.len() == 1 => check(&items[0], predicate),
            AstNode::Scope { body, .. } => check(body, predicate),
            _ => false,
        }
    }
    arm.as_ref().map(|body| check(body, predicate)).unwrap_or(false)
}
