//! Mutable region graph: the substrate every restructuring pass operates on
//!
//! A [`RegionGraph`] owns the nodes of one CFG region. Nodes carry an opaque
//! payload reference and a kind tag; edges carry case labels and an `inlined`
//! flag. Predecessor/successor symmetry is maintained by construction since
//! both directions live in the same underlying `StableDiGraph`.

pub mod dominators;
pub mod export;
pub mod post_dominators;
pub mod scope_closer;
pub mod visit;

pub use dominators::DominatorTree;
pub use post_dominators::PostDominatorTree;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::graph::scope_closer::MarkerKind;

/// Stable identifier of a node, unique within one restructuring run.
///
/// Ids are allocated from a per-graph monotone counter and never reused,
/// so a removed node's id stays dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Opaque reference to the caller's original instruction block.
///
/// The core never inspects payloads; clones share the payload id of their
/// origin node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadId(pub u64);

/// Node classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Carries a payload from the original CFG
    Code,
    /// Multi-way branch on a synthetic state variable
    Dispatcher,
    /// Synthetic unique entry inserted by single-exit enforcement
    ArtificialEntry,
    /// Synthetic sink with an unreachable terminator
    ArtificialExit,
    /// Exits the enclosing collapsed cycle towards `exit_index`
    Break { exit_index: usize },
    /// Jumps back to the head of the enclosing collapsed cycle
    Continue,
    /// Assigns `value` to the state variable read by a dispatcher
    SetVariable { value: u64 },
    /// Owns a nested graph holding a collapsed cycle
    Collapsed,
    /// Empty join inserted by combing in front of a post-dominator
    DummyJoin,
}

/// Set of switch case labels carried by an edge; empty = default/unlabeled
pub type CaseLabels = BTreeSet<i64>;

/// Labels and flags attached to every CFG edge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeInfo {
    /// Case labels for switch-like branches; empty set is the default edge
    pub labels: CaseLabels,
    /// Inlined edges are invisible to the filtered post-dominator tree
    pub inlined: bool,
}

impl EdgeInfo {
    /// Plain unlabeled, non-inlined edge
    pub fn plain() -> Self {
        Self::default()
    }

    /// Unlabeled edge marked inlined
    pub fn inlined() -> Self {
        Self { labels: CaseLabels::new(), inlined: true }
    }

    /// Labeled, non-inlined edge
    pub fn with_labels(labels: CaseLabels) -> Self {
        Self { labels, inlined: false }
    }
}

/// A single CFG node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the run
    pub id: NodeId,
    /// Node classification
    pub kind: NodeKind,
    /// Opaque reference to the original instruction block, if any
    pub payload: Option<PayloadId>,
    /// Display name used in logs and dot dumps
    pub name: String,
    /// Size estimate used by the untangle cost model
    pub weight: u32,
    /// Set on sub-switches extracted by weaving
    pub weaved: bool,
}

impl Node {
    /// Empty nodes carry no payload and no control semantics of their own.
    ///
    /// Only these are candidates for trivial-dummy purging and virtual-sink
    /// cleanup; dispatchers, breaks, continues and state assignments are
    /// semantic and must survive.
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
            && matches!(
                self.kind,
                NodeKind::DummyJoin | NodeKind::ArtificialEntry | NodeKind::ArtificialExit
            )
    }
}

/// Mutable directed multigraph for one CFG region
///
/// Owns its nodes exclusively. The graph may transiently violate the
/// single-exit invariant between passes; it is restored before AST
/// construction.
#[derive(Debug, Clone, Default)]
pub struct RegionGraph {
    graph: StableDiGraph<Node, EdgeInfo>,
    entry: Option<NodeIndex>,
    function_name: String,
    region_name: String,
    next_id: u64,
    /// Per-analysis node annotations; see [`scope_closer`]
    markers: HashMap<MarkerKind, HashMap<NodeIndex, NodeIndex>>,
    /// Bodies of `Collapsed` nodes
    nested: HashMap<NodeIndex, RegionGraph>,
    /// For a collapsed cycle body: parent-graph targets of `Break` nodes,
    /// indexed by `Break::exit_index`
    exit_targets: Vec<NodeId>,
}

impl RegionGraph {
    pub fn new(function_name: impl Into<String>, region_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            region_name: region_name.into(),
            ..Self::default()
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn region_name(&self) -> &str {
        &self.region_name
    }

    pub fn set_region_name(&mut self, name: impl Into<String>) {
        self.region_name = name.into();
    }

    /// The designated entry node.
    ///
    /// Panics if no entry has been set; a graph without an entry is a
    /// construction bug, not a recoverable state.
    pub fn entry(&self) -> NodeIndex {
        self.entry.expect("region graph has no entry node")
    }

    pub fn try_entry(&self) -> Option<NodeIndex> {
        self.entry
    }

    pub fn set_entry(&mut self, entry: NodeIndex) {
        debug_assert!(self.graph.contains_node(entry));
        self.entry = Some(entry);
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All node indices in ascending index order (deterministic).
    pub fn node_indices(&self) -> Vec<NodeIndex> {
        self.graph.node_indices().collect()
    }

    /// Borrow a node. Operating on an index not owned by this graph is a
    /// programming error and panics.
    pub fn node(&self, ix: NodeIndex) -> &Node {
        self.graph.node_weight(ix).expect("node not owned by this graph")
    }

    pub fn node_mut(&mut self, ix: NodeIndex) -> &mut Node {
        self.graph.node_weight_mut(ix).expect("node not owned by this graph")
    }

    pub fn contains_node(&self, ix: NodeIndex) -> bool {
        self.graph.contains_node(ix)
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Seed the id counter so synthetic nodes never collide with input ids.
    pub fn reserve_ids_through(&mut self, max_seen: u64) {
        self.next_id = self.next_id.max(max_seen + 1);
    }

    /// Add a `Code` node carrying a payload reference.
    pub fn add_node(
        &mut self,
        payload: Option<PayloadId>,
        name: impl Into<String>,
        weight: u32,
    ) -> NodeIndex {
        let node = Node {
            id: self.fresh_id(),
            kind: NodeKind::Code,
            payload,
            name: name.into(),
            weight,
            weaved: false,
        };
        trace!(name = %node.name, "building node");
        self.graph.add_node(node)
    }

    /// Add a payload-free node of the given kind.
    pub fn add_artificial(&mut self, kind: NodeKind, name: impl Into<String>) -> NodeIndex {
        let node = Node {
            id: self.fresh_id(),
            kind,
            payload: None,
            name: name.into(),
            weight: 0,
            weaved: false,
        };
        self.graph.add_node(node)
    }

    /// Add an anonymous dummy join.
    pub fn add_dummy(&mut self) -> NodeIndex {
        let name = format!("dummy_{}", self.next_id);
        self.add_artificial(NodeKind::DummyJoin, name)
    }

    /// Insert a fully built node, keeping its id. Used when moving nodes
    /// between a parent graph and a collapsed cycle body; the id counter is
    /// bumped past the inserted id so later synthetic nodes never collide.
    pub fn insert_node(&mut self, node: Node) -> NodeIndex {
        self.next_id = self.next_id.max(node.id.0 + 1);
        self.graph.add_node(node)
    }

    /// Clone a node: same kind, payload, weight and weaved flag, fresh id,
    /// no edges.
    pub fn clone_node(&mut self, original: NodeIndex) -> NodeIndex {
        let src = self.node(original).clone();
        let node = Node {
            id: self.fresh_id(),
            kind: src.kind,
            payload: src.payload,
            name: format!("{} cloned", src.name),
            weight: src.weight,
            weaved: src.weaved,
        };
        let clone = self.graph.add_node(node);
        // A clone of a collapsed node shares nothing structural yet; the
        // nested body is duplicated so both copies stay independently owned.
        if let Some(body) = self.nested.get(&original).cloned() {
            self.nested.insert(clone, body);
        }
        clone
    }

    /// Remove a node, detaching all incident edges first. Scope-closer
    /// markers pointing at the node are dropped so no marker ever dangles.
    pub fn remove_node(&mut self, ix: NodeIndex) {
        trace!(name = %self.node(ix).name, "removing node");
        for table in self.markers.values_mut() {
            table.remove(&ix);
            table.retain(|_, target| *target != ix);
        }
        self.nested.remove(&ix);
        if self.entry == Some(ix) {
            self.entry = None;
        }
        self.graph.remove_node(ix);
    }

    pub fn add_edge(&mut self, src: NodeIndex, dst: NodeIndex, info: EdgeInfo) -> EdgeIndex {
        debug_assert!(self.graph.contains_node(src) && self.graph.contains_node(dst));
        self.graph.add_edge(src, dst, info)
    }

    pub fn add_plain_edge(&mut self, src: NodeIndex, dst: NodeIndex) -> EdgeIndex {
        self.add_edge(src, dst, EdgeInfo::plain())
    }

    /// The earliest-inserted edge `src -> dst`, if any.
    ///
    /// Parallel edges are permitted; operations addressing an edge by its
    /// endpoints resolve to the earliest surviving one.
    pub fn find_edge(&self, src: NodeIndex, dst: NodeIndex) -> Option<EdgeIndex> {
        self.graph.edges_connecting(src, dst).map(|e| e.id()).last()
    }

    pub fn edge_info(&self, edge: EdgeIndex) -> &EdgeInfo {
        self.graph.edge_weight(edge).expect("edge not owned by this graph")
    }

    pub fn edge_endpoints(&self, edge: EdgeIndex) -> (NodeIndex, NodeIndex) {
        self.graph.edge_endpoints(edge).expect("edge not owned by this graph")
    }

    /// All edge indices with endpoints, ascending index order.
    pub fn edge_indices(&self) -> Vec<(EdgeIndex, NodeIndex, NodeIndex)> {
        self.graph
            .edge_indices()
            .map(|e| {
                let (s, d) = self.edge_endpoints(e);
                (e, s, d)
            })
            .collect()
    }

    /// Remove the earliest edge `src -> dst`, returning its info.
    pub fn remove_edge(&mut self, src: NodeIndex, dst: NodeIndex) -> Option<EdgeInfo> {
        let edge = self.find_edge(src, dst)?;
        self.graph.remove_edge(edge)
    }

    /// Remove a specific edge instance, returning its info.
    pub fn remove_edge_index(&mut self, edge: EdgeIndex) -> Option<EdgeInfo> {
        self.graph.remove_edge(edge)
    }

    /// Retarget the earliest edge `src -> old_dst` to `new_dst`, preserving
    /// its `EdgeInfo`. Both adjacency directions update atomically. A no-op
    /// when `old_dst == new_dst`.
    pub fn move_edge_target(&mut self, src: NodeIndex, old_dst: NodeIndex, new_dst: NodeIndex) {
        if old_dst == new_dst {
            return;
        }
        let info = self
            .remove_edge(src, old_dst)
            .expect("move_edge_target on a non-existent edge");
        self.add_edge(src, new_dst, info);
    }

    /// Flag the earliest edge `src -> dst` as inlined, hiding it from the
    /// filtered post-dominator tree.
    pub fn mark_edge_inlined(&mut self, src: NodeIndex, dst: NodeIndex) {
        let edge = self
            .find_edge(src, dst)
            .expect("mark_edge_inlined on a non-existent edge");
        self.graph
            .edge_weight_mut(edge)
            .expect("edge not owned by this graph")
            .inlined = true;
    }

    /// Successor targets in edge insertion order; parallel edges repeat the
    /// target once per edge.
    pub fn successors(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self
            .graph
            .edges_directed(ix, Direction::Outgoing)
            .map(|e| e.target())
            .collect();
        out.reverse();
        out
    }

    /// Predecessor sources in edge insertion order, one entry per edge.
    pub fn predecessors(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self
            .graph
            .edges_directed(ix, Direction::Incoming)
            .map(|e| e.source())
            .collect();
        out.reverse();
        out
    }

    /// Successors together with a copy of their edge info, insertion order.
    pub fn labeled_successors(&self, ix: NodeIndex) -> Vec<(NodeIndex, EdgeInfo)> {
        let mut out: Vec<(NodeIndex, EdgeInfo)> = self
            .graph
            .edges_directed(ix, Direction::Outgoing)
            .map(|e| (e.target(), e.weight().clone()))
            .collect();
        out.reverse();
        out
    }

    /// Successor targets reachable over non-inlined edges, insertion order.
    pub fn live_successors(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self
            .graph
            .edges_directed(ix, Direction::Outgoing)
            .filter(|e| !e.weight().inlined)
            .map(|e| e.target())
            .collect();
        out.reverse();
        out
    }

    /// Predecessor sources over non-inlined edges, insertion order.
    pub fn live_predecessors(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self
            .graph
            .edges_directed(ix, Direction::Incoming)
            .filter(|e| !e.weight().inlined)
            .map(|e| e.source())
            .collect();
        out.reverse();
        out
    }

    pub fn successor_count(&self, ix: NodeIndex) -> usize {
        self.graph.edges_directed(ix, Direction::Outgoing).count()
    }

    pub fn predecessor_count(&self, ix: NodeIndex) -> usize {
        self.graph.edges_directed(ix, Direction::Incoming).count()
    }

    pub fn live_successor_count(&self, ix: NodeIndex) -> usize {
        self.graph
            .edges_directed(ix, Direction::Outgoing)
            .filter(|e| !e.weight().inlined)
            .count()
    }

    /// Total weight of a node: collapsed nodes weigh the sum of their body.
    pub fn node_weight_total(&self, ix: NodeIndex) -> u64 {
        match self.node(ix).kind {
            NodeKind::Collapsed => self
                .nested
                .get(&ix)
                .map(|body| {
                    body.node_indices()
                        .iter()
                        .map(|&n| body.node_weight_total(n))
                        .sum()
                })
                .unwrap_or(0),
            _ => u64::from(self.node(ix).weight),
        }
    }

    // Nested graphs (collapsed cycle bodies)

    pub fn set_nested(&mut self, ix: NodeIndex, body: RegionGraph) {
        debug_assert!(matches!(self.node(ix).kind, NodeKind::Collapsed));
        self.nested.insert(ix, body);
    }

    pub fn nested(&self, ix: NodeIndex) -> Option<&RegionGraph> {
        self.nested.get(&ix)
    }

    pub fn take_nested(&mut self, ix: NodeIndex) -> Option<RegionGraph> {
        self.nested.remove(&ix)
    }

    /// Indices of all collapsed nodes that own a nested body.
    pub fn nested_indices(&self) -> Vec<NodeIndex> {
        let mut v: Vec<NodeIndex> = self.nested.keys().copied().collect();
        v.sort();
        v
    }

    pub fn exit_targets(&self) -> &[NodeId] {
        &self.exit_targets
    }

    pub fn push_exit_target(&mut self, target: NodeId) -> usize {
        self.exit_targets.push(target);
        self.exit_targets.len() - 1
    }

    // Marker tables (see scope_closer)

    pub(crate) fn marker_table(&self, kind: MarkerKind) -> Option<&HashMap<NodeIndex, NodeIndex>> {
        self.markers.get(&kind)
    }

    pub(crate) fn marker_table_mut(&mut self, kind: MarkerKind) -> &mut HashMap<NodeIndex, NodeIndex> {
        self.markers.entry(kind).or_default()
    }

    // Cleanup helpers shared by untangle and inflate

    /// Splice out a trivial dummy: empty payload, exactly one predecessor,
    /// exactly one successor. The predecessor edge keeps its info and is
    /// retargeted to the successor. Returns whether the node was removed.
    pub fn purge_if_trivial_dummy(&mut self, ix: NodeIndex) -> bool {
        if !self.contains_node(ix) {
            return false;
        }
        let node = self.node(ix);
        debug_assert!(!node.is_empty() || self.predecessor_count(ix) != 0 || self.entry == Some(ix));
        if node.is_empty() && self.predecessor_count(ix) == 1 && self.successor_count(ix) == 1 {
            trace!(name = %node.name, "purging trivial dummy");
            let pred = self.predecessors(ix)[0];
            let succ = self.successors(ix)[0];
            self.move_edge_target(pred, ix, succ);
            self.remove_node(ix);
            return true;
        }
        false
    }

    /// Purge trivial dummies to fixpoint. Idempotent.
    pub fn purge_trivial_dummies(&mut self) -> bool {
        let mut removed = false;
        let mut removed_now = true;
        while removed_now {
            removed_now = false;
            for ix in self.node_indices() {
                if self.purge_if_trivial_dummy(ix) {
                    removed = true;
                    removed_now = true;
                    break;
                }
            }
        }
        removed
    }

    /// Remove a virtual sink together with the empty nodes upstream that
    /// existed only to reach it. An empty node goes when every one of its
    /// successors is already going; anything with a live way out stays.
    pub fn purge_virtual_sink(&mut self, sink: NodeIndex) {
        let mut purge: std::collections::HashSet<NodeIndex> = std::collections::HashSet::new();
        purge.insert(sink);
        let mut changed = true;
        while changed {
            changed = false;
            let mut worklist: Vec<NodeIndex> = purge.iter().copied().collect();
            while let Some(current) = worklist.pop() {
                for pred in self.predecessors(current) {
                    if purge.contains(&pred) {
                        continue;
                    }
                    if self.node(pred).is_empty()
                        && self.successors(pred).iter().all(|s| purge.contains(s))
                    {
                        purge.insert(pred);
                        worklist.push(pred);
                        changed = true;
                    }
                }
            }
        }
        for ix in purge {
            self.remove_node(ix);
        }
    }

    /// Iteratively drop predecessorless nodes other than the entry; clones
    /// orphaned by edge moves go away here.
    pub fn remove_dangling_nodes(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            let entry = self.entry;
            for ix in self.node_indices() {
                if Some(ix) != entry && self.predecessor_count(ix) == 0 {
                    self.remove_node(ix);
                    changed = true;
                    break;
                }
            }
        }
    }

    /// Direct access for traversal adapters and dominator computations.
    pub(crate) fn inner(&self) -> &StableDiGraph<Node, EdgeInfo> {
        &self.graph
    }
}
