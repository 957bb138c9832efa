//! Cycle-equivalence classification of CFG edges
//!
//! Two edges are cycle equivalent iff they belong to the same set of cycles
//! in the undirected view of the CFG. The classifier runs the bracket-list
//! algorithm from "The Program Structure Tree" by Johnson, Pearson and
//! Pingali
//! over an undirected spanning traversal rooted at a synthetic node
//! connected to the entry and to every exit:
//!
//! 1. Undirected DFS records a DFS index and parent edge per node and
//!    splits edges into tree and back edges.
//! 2. Nodes are processed in reverse DFS order, each maintaining a bracket
//!    list: the back edges spanning it, built from the concatenation of the
//!    children's lists minus brackets closing here plus back edges starting
//!    here, with a capping bracket when two children reach above.
//! 3. Each tree edge takes the class of the topmost bracket of its list;
//!    each back edge starts with its own class, merged with a tree edge when
//!    it is the single bracket over it.
//!
//! Class ids are assigned in traversal order, so rerunning the analysis on
//! an unchanged graph reproduces the same partition.

use std::collections::HashMap;

use petgraph::stable_graph::EdgeIndex;
use tracing::trace;

use crate::graph::RegionGraph;

/// Result of the analysis: a class id per directed edge.
///
/// The domain can be extended through [`CycleEquivalence::insert`] for edges
/// created after the analysis ran; existing classes are never renamed.
#[derive(Debug, Clone, Default)]
pub struct CycleEquivalence {
    classes: HashMap<EdgeIndex, u64>,
    next_class: u64,
}

impl CycleEquivalence {
    /// Classify every edge of the graph.
    pub fn compute(graph: &RegionGraph) -> Self {
        let mut result = Self::default();
        Classifier::new(graph, &mut result).run();
        result
    }

    /// Class of an edge; `None` for edges created after the analysis that
    /// were never [`insert`](Self::insert)ed.
    pub fn class_of(&self, edge: EdgeIndex) -> Option<u64> {
        self.classes.get(&edge).copied()
    }

    /// Record the class of a newly created edge.
    pub fn insert(&mut self, edge: EdgeIndex, class: u64) {
        self.classes.insert(edge, class);
        self.next_class = self.next_class.max(class + 1);
    }

    fn fresh_class(&mut self) -> u64 {
        let class = self.next_class;
        self.next_class += 1;
        class
    }

    /// Canonical partition for comparisons: sorted edge groups per class.
    pub fn partition(&self) -> Vec<Vec<EdgeIndex>> {
        let mut groups: HashMap<u64, Vec<EdgeIndex>> = HashMap::new();
        for (&edge, &class) in &self.classes {
            groups.entry(class).or_default().push(edge);
        }
        let mut partition: Vec<Vec<EdgeIndex>> = groups.into_values().collect();
        for group in &mut partition {
            group.sort();
        }
        partition.sort();
        partition
    }
}

/// One undirected edge instance of the traversal graph.
struct UndirEdge {
    u: usize,
    v: usize,
    /// The directed graph edge this instance mirrors; synthetic root
    /// connections and capping brackets carry `None`.
    origin: Option<EdgeIndex>,
}

/// A back edge acting as a bracket.
struct Bracket {
    origin: Option<EdgeIndex>,
    recent_class: u64,
    recent_size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked bracket list over the shared arena; the top is the head.
#[derive(Clone, Copy, Default)]
struct BracketList {
    head: Option<usize>,
    tail: Option<usize>,
    size: usize,
}

struct Classifier<'g, 'r> {
    graph: &'g RegionGraph,
    result: &'r mut CycleEquivalence,
    /// vertex -> adjacency as (undirected edge id, other endpoint)
    adjacency: Vec<Vec<(usize, usize)>>,
    edges: Vec<UndirEdge>,
}

const INFINITY: usize = usize::MAX;

impl<'g, 'r> Classifier<'g, 'r> {
    fn new(graph: &'g RegionGraph, result: &'r mut CycleEquivalence) -> Self {
        let nodes = graph.node_indices();
        let vertex_of: HashMap<_, _> =
            nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let root = nodes.len();

        let mut edges = Vec::new();
        let mut adjacency = vec![Vec::new(); nodes.len() + 1];
        let mut connect = |edges: &mut Vec<UndirEdge>,
                           adjacency: &mut Vec<Vec<(usize, usize)>>,
                           u: usize,
                           v: usize,
                           origin: Option<EdgeIndex>| {
            let id = edges.len();
            edges.push(UndirEdge { u, v, origin });
            adjacency[u].push((id, v));
            if u != v {
                adjacency[v].push((id, u));
            }
        };

        for (edge, src, dst) in graph.edge_indices() {
            connect(&mut edges, &mut adjacency, vertex_of[&src], vertex_of[&dst], Some(edge));
        }
        // Synthetic root: entry first, then every exit in node order.
        if let Some(entry) = graph.try_entry() {
            connect(&mut edges, &mut adjacency, root, vertex_of[&entry], None);
        }
        for &node in &nodes {
            if graph.successor_count(node) == 0 {
                connect(&mut edges, &mut adjacency, root, vertex_of[&node], None);
            }
        }

        Self { graph, result, adjacency, edges }
    }

    fn run(&mut self) {
        let vertex_count = self.adjacency.len();
        let root = vertex_count - 1;

        // Self loops sit on exactly their own cycle.
        let self_loops: Vec<usize> =
            (0..self.edges.len()).filter(|&e| self.edges[e].u == self.edges[e].v).collect();
        for e in self_loops {
            if let Some(origin) = self.edges[e].origin {
                let class = self.result.fresh_class();
                self.result.insert(origin, class);
            }
        }

        // Undirected DFS forest rooted at the synthetic node.
        let mut dfsnum: Vec<usize> = vec![INFINITY; vertex_count];
        let mut dfs_order: Vec<usize> = Vec::new();
        let mut parent_edge: Vec<Option<usize>> = vec![None; vertex_count];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); vertex_count];
        let mut is_tree_edge: Vec<bool> = vec![false; self.edges.len()];

        let mut roots: Vec<usize> = vec![root];
        roots.extend(0..root);
        for start in roots {
            if dfsnum[start] != INFINITY {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            dfsnum[start] = dfs_order.len();
            dfs_order.push(start);
            while !stack.is_empty() {
                let (vertex, step) = {
                    let frame = stack.last_mut().expect("dfs stack underflow");
                    let vertex = frame.0;
                    if frame.1 < self.adjacency[vertex].len() {
                        let step = self.adjacency[vertex][frame.1];
                        frame.1 += 1;
                        (vertex, Some(step))
                    } else {
                        (vertex, None)
                    }
                };
                match step {
                    Some((edge, other)) => {
                        if self.edges[edge].u == self.edges[edge].v {
                            continue;
                        }
                        if dfsnum[other] == INFINITY {
                            is_tree_edge[edge] = true;
                            parent_edge[other] = Some(edge);
                            children[vertex].push(other);
                            dfsnum[other] = dfs_order.len();
                            dfs_order.push(other);
                            stack.push((other, 0));
                        }
                    }
                    None => {
                        stack.pop();
                    }
                }
            }
        }

        // Back edges, keyed by their descendant (start) and ancestor (end).
        let mut backedges_from: Vec<Vec<usize>> = vec![Vec::new(); vertex_count];
        let mut ends_at: Vec<Vec<usize>> = vec![Vec::new(); vertex_count];
        for (e, edge) in self.edges.iter().enumerate() {
            if is_tree_edge[e] || edge.u == edge.v {
                continue;
            }
            let (descendant, ancestor) =
                if dfsnum[edge.u] >= dfsnum[edge.v] { (edge.u, edge.v) } else { (edge.v, edge.u) };
            backedges_from[descendant].push(e);
            ends_at[ancestor].push(e);
        }

        // Bottom-up bracket propagation.
        let mut arena: Vec<Bracket> = Vec::new();
        let mut bracket_of_edge: Vec<Option<usize>> = vec![None; self.edges.len()];
        let mut capping_ends_at: Vec<Vec<usize>> = vec![Vec::new(); vertex_count];
        let mut blist: Vec<BracketList> = vec![BracketList::default(); vertex_count];
        let mut hi: Vec<usize> = vec![INFINITY; vertex_count];

        for &vertex in dfs_order.iter().rev() {
            let hi0 = backedges_from[vertex]
                .iter()
                .map(|&e| dfsnum[self.other_endpoint(e, vertex)])
                .min()
                .unwrap_or(INFINITY);
            let mut hi1 = INFINITY;
            let mut hi2 = INFINITY;
            for &child in &children[vertex] {
                if hi[child] < hi1 {
                    hi2 = hi1;
                    hi1 = hi[child];
                } else if hi[child] < hi2 {
                    hi2 = hi[child];
                }
            }
            hi[vertex] = hi0.min(hi1);

            // Concatenate the children's bracket lists.
            let mut list = BracketList::default();
            for &child in &children[vertex] {
                list = concat(&mut arena, list, std::mem::take(&mut blist[child]));
            }

            // Drop brackets closing here.
            for &e in &ends_at[vertex] {
                if let Some(b) = bracket_of_edge[e].take() {
                    delete(&mut arena, &mut list, b);
                }
            }
            for b in std::mem::take(&mut capping_ends_at[vertex]) {
                delete(&mut arena, &mut list, b);
            }

            // Push back edges starting here; each begins as its own class.
            for &e in &backedges_from[vertex] {
                let origin = self.edges[e].origin;
                if let Some(origin_edge) = origin {
                    let class = self.result.fresh_class();
                    self.result.insert(origin_edge, class);
                }
                let b = alloc(&mut arena, Bracket {
                    origin,
                    recent_class: u64::MAX,
                    recent_size: usize::MAX,
                    prev: None,
                    next: None,
                });
                bracket_of_edge[e] = Some(b);
                push(&mut arena, &mut list, b);
            }

            // Capping bracket when two children reach above this node.
            if hi2 < hi0 {
                let b = alloc(&mut arena, Bracket {
                    origin: None,
                    recent_class: u64::MAX,
                    recent_size: usize::MAX,
                    prev: None,
                    next: None,
                });
                push(&mut arena, &mut list, b);
                capping_ends_at[dfs_order[hi2]].push(b);
            }

            // Classify the tree edge entering this node.
            if let Some(tree) = parent_edge[vertex] {
                let class = match list.head {
                    None => self.result.fresh_class(),
                    Some(top) => {
                        if arena[top].recent_size != list.size {
                            arena[top].recent_size = list.size;
                            arena[top].recent_class = self.result.fresh_class();
                        }
                        let class = arena[top].recent_class;
                        if arena[top].recent_size == 1 {
                            // The tree edge and its single bracket bound the
                            // same cycles.
                            if let Some(origin) = arena[top].origin {
                                self.result.insert(origin, class);
                            }
                        }
                        class
                    }
                };
                if let Some(origin) = self.edges[tree].origin {
                    trace!(?origin, class, "tree edge classified");
                    self.result.insert(origin, class);
                }
            }

            blist[vertex] = list;
        }

        debug_assert_eq!(self.result.classes.len(), self.graph.edge_count());
    }

    fn other_endpoint(&self, edge: usize, vertex: usize) -> usize {
        let e = &self.edges[edge];
        if e.u == vertex {
            e.v
        } else {
            e.u
        }
    }
}

fn alloc(arena: &mut Vec<Bracket>, bracket: Bracket) -> usize {
    arena.push(bracket);
    arena.len() - 1
}

fn push(arena: &mut [Bracket], list: &mut BracketList, b: usize) {
    arena[b].prev = None;
    arena[b].next = list.head;
    if let Some(head) = list.head {
        arena[head].prev = Some(b);
    }
    list.head = Some(b);
    if list.tail.is_none() {
        list.tail = Some(b);
    }
    list.size += 1;
}

fn delete(arena: &mut [Bracket], list: &mut BracketList, b: usize) {
    let (prev, next) = (arena[b].prev, arena[b].next);
    match prev {
        Some(p) => arena[p].next = next,
        None => list.head = next,
    }
    match next {
        Some(n) => arena[n].prev = prev,
        None => list.tail = prev,
    }
    arena[b].prev = None;
    arena[b].next = None;
    list.size -= 1;
}

fn concat(arena: &mut [Bracket], a: BracketList, b: BracketList) -> BracketList {
    if a.size == 0 {
        return b;
    }
    if b.size == 0 {
        return a;
    }
    let a_tail = a.tail.expect("non-empty list has a tail");
    let b_head = b.head.expect("non-empty list has a head");
    arena[a_tail].next = Some(b_head);
    arena[b_head].prev = Some(a_tail);
    BracketList { head: a.head, tail: b.tail, size: a.size + b.size }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PayloadId;
    use petgraph::stable_graph::NodeIndex;

    fn code_nodes(g: &mut RegionGraph, count: u64) -> Vec<NodeIndex> {
        (0..count)
            .map(|i| g.add_node(Some(PayloadId(i)), format!("n{i}"), 1))
            .collect()
    }

    fn class(g: &RegionGraph, ceq: &CycleEquivalence, a: NodeIndex, b: NodeIndex) -> u64 {
        ceq.class_of(g.find_edge(a, b).unwrap()).unwrap()
    }

    #[test]
    fn chain_edges_share_one_class() {
        // a -> b -> c lies on a single undirected cycle through the root.
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 3);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[1], n[2]);

        let ceq = CycleEquivalence::compute(&g);
        assert_eq!(class(&g, &ceq, n[0], n[1]), class(&g, &ceq, n[1], n[2]));
    }

    #[test]
    fn diamond_arms_get_distinct_classes() {
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 4);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[0], n[2]);
        g.add_plain_edge(n[1], n[3]);
        g.add_plain_edge(n[2], n[3]);

        let ceq = CycleEquivalence::compute(&g);
        // Each arm is internally equivalent, the two arms are not.
        assert_eq!(class(&g, &ceq, n[0], n[1]), class(&g, &ceq, n[1], n[3]));
        assert_eq!(class(&g, &ceq, n[0], n[2]), class(&g, &ceq, n[2], n[3]));
        assert_ne!(class(&g, &ceq, n[0], n[1]), class(&g, &ceq, n[0], n[2]));
    }

    #[test]
    fn loop_back_edge_is_its_own_class() {
        // a -> b -> c, b -> b? no: a -> b, b -> c, c -> b back edge.
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 3);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[1], n[2]);
        g.add_plain_edge(n[2], n[1]);

        let ceq = CycleEquivalence::compute(&g);
        let entering = class(&g, &ceq, n[0], n[1]);
        let body = class(&g, &ceq, n[1], n[2]);
        let back = class(&g, &ceq, n[2], n[1]);
        // The entering edge is not part of the inner loop cycle.
        assert_ne!(entering, body);
        // b->c and c->b lie on exactly the same cycles: the loop itself.
        assert_eq!(body, back);
    }

    #[test]
    fn every_edge_is_classified() {
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 5);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[0], n[2]);
        g.add_plain_edge(n[1], n[3]);
        g.add_plain_edge(n[2], n[3]);
        g.add_plain_edge(n[3], n[4]);
        g.add_plain_edge(n[4], n[1]);

        let ceq = CycleEquivalence::compute(&g);
        for (edge, _, _) in g.edge_indices() {
            assert!(ceq.class_of(edge).is_some());
        }
    }

    #[test]
    fn rerunning_reproduces_the_partition() {
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 5);
        g.set_entry(n[0]);
        g.add_plain_edge(n[0], n[1]);
        g.add_plain_edge(n[1], n[2]);
        g.add_plain_edge(n[2], n[1]);
        g.add_plain_edge(n[2], n[3]);
        g.add_plain_edge(n[1], n[4]);
        g.add_plain_edge(n[3], n[4]);

        let first = CycleEquivalence::compute(&g).partition();
        let second = CycleEquivalence::compute(&g).partition();
        assert_eq!(first, second);
    }

    #[test]
    fn insert_extends_domain_without_renaming() {
        let mut g = RegionGraph::new("f", "root");
        let n = code_nodes(&mut g, 2);
        g.set_entry(n[0]);
        let e = g.add_plain_edge(n[0], n[1]);

        let mut ceq = CycleEquivalence::compute(&g);
        let class = ceq.class_of(e).unwrap();

        let extra = g.add_node(Some(PayloadId(9)), "x", 1);
        let e2 = g.add_plain_edge(n[0], extra);
        ceq.insert(e2, class);
        assert_eq!(ceq.class_of(e2), Some(class));
        assert_eq!(ceq.class_of(e), Some(class));
    }
}
