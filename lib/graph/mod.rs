//! Implements a directed graph, with the dominator and natural loop queries
//! the guard placement passes rely on.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::cmp;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::Error;

pub trait Vertex: Clone + Sync {
    // The index of this vertex.
    fn index(&self) -> usize;
}

pub trait Edge: Clone + Sync {
    /// The index of the head vertex.
    fn head(&self) -> usize;
    /// The index of the tail vertex.
    fn tail(&self) -> usize;
}

/// An empty edge for creating structures when data is not required
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NullEdge {
    head: usize,
    tail: usize,
}

impl NullEdge {
    pub fn new(head: usize, tail: usize) -> NullEdge {
        NullEdge { head, tail }
    }
}

impl Edge for NullEdge {
    fn head(&self) -> usize {
        self.head
    }
    fn tail(&self) -> usize {
        self.tail
    }
}

/// A natural loop, identified by its header.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Loop {
    header: usize,
    nodes: BTreeSet<usize>,
}

impl Loop {
    pub fn new(header: usize, nodes: BTreeSet<usize>) -> Self {
        Self { header, nodes }
    }

    /// The set of nodes part of this loop
    pub fn nodes(&self) -> &BTreeSet<usize> {
        &self.nodes
    }

    /// The loop header node
    pub fn header(&self) -> usize {
        self.header
    }

    /// Returns `true` if the given node belongs to this loop.
    pub fn contains(&self, node: usize) -> bool {
        self.nodes.contains(&node)
    }

    /// Returns `true` if this loop is nesting another loop.
    pub fn is_nesting(&self, other: &Self) -> bool {
        self.header != other.header && self.nodes.contains(&other.header)
    }
}

impl Vertex for Loop {
    fn index(&self) -> usize {
        self.header
    }
}

impl fmt::Display for Loop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Loop 0x{:X}: {{", self.header)?;
        let mut is_first = true;
        for node in &self.nodes {
            if !is_first {
                write!(f, ", ")?;
            }
            write!(f, "0x{:X}", node)?;
            is_first = false;
        }
        write!(f, "}}")
    }
}

pub type LoopTree = Graph<Loop, NullEdge>;

/// Immediate dominators of every vertex reachable from a root.
#[derive(Clone, Debug, Default)]
pub struct Dominators {
    root: usize,
    idoms: FxHashMap<usize, usize>,
}

impl Dominators {
    /// The root these dominators were computed from.
    pub fn root(&self) -> usize {
        self.root
    }

    /// The immediate dominator of `vertex`, `None` for the root and for
    /// unreachable vertices.
    pub fn immediate_dominator(&self, vertex: usize) -> Option<usize> {
        self.idoms.get(&vertex).cloned()
    }

    /// Returns `true` if `dominator` dominates `vertex`. Every vertex dominates
    /// itself.
    pub fn dominates(&self, dominator: usize, vertex: usize) -> bool {
        let mut runner = vertex;
        loop {
            if runner == dominator {
                return true;
            }
            match self.idoms.get(&runner) {
                Some(idom) => runner = *idom,
                None => return false,
            }
        }
    }
}

/// A directed graph.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Default)]
pub struct Graph<V: Vertex, E: Edge> {
    vertices: BTreeMap<usize, V>,
    edges: BTreeMap<(usize, usize), E>,
    successors: BTreeMap<usize, BTreeSet<usize>>,
    predecessors: BTreeMap<usize, BTreeSet<usize>>,
}

impl<V, E> Graph<V, E>
where
    V: Vertex,
    E: Edge,
{
    pub fn new() -> Graph<V, E> {
        Graph {
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
            successors: BTreeMap::new(),
            predecessors: BTreeMap::new(),
        }
    }

    /// Returns true if the vertex with the given index exists in this graph
    pub fn has_vertex(&self, index: usize) -> bool {
        self.vertices.contains_key(&index)
    }

    /// Removes an edge
    pub fn remove_edge(&mut self, head: usize, tail: usize) -> Result<E, Error> {
        let edge = self
            .edges
            .remove(&(head, tail))
            .ok_or(Error::GraphEdgeNotFound(head, tail))?;

        if let Some(predecessors) = self.predecessors.get_mut(&tail) {
            predecessors.remove(&head);
        }
        if let Some(successors) = self.successors.get_mut(&head) {
            successors.remove(&tail);
        }

        Ok(edge)
    }

    /// Inserts a vertex into the graph.
    /// # Errors
    /// Error if the vertex already exists by index.
    pub fn insert_vertex(&mut self, v: V) -> Result<(), Error> {
        if self.vertices.contains_key(&v.index()) {
            return Err("duplicate vertex index".into());
        }
        self.successors.insert(v.index(), BTreeSet::new());
        self.predecessors.insert(v.index(), BTreeSet::new());
        self.vertices.insert(v.index(), v);
        Ok(())
    }

    /// Inserts an edge into the graph.
    /// # Errors
    /// Error if the edge already exists by indices.
    pub fn insert_edge(&mut self, edge: E) -> Result<(), Error> {
        let (head, tail) = (edge.head(), edge.tail());
        if self.edges.contains_key(&(head, tail)) {
            return Err("duplicate edge".into());
        }
        if !self.vertices.contains_key(&head) {
            return Err(Error::GraphVertexNotFound(head));
        }
        if !self.vertices.contains_key(&tail) {
            return Err(Error::GraphVertexNotFound(tail));
        }

        self.edges.insert((head, tail), edge);
        self.successors.entry(head).or_default().insert(tail);
        self.predecessors.entry(tail).or_default().insert(head);

        Ok(())
    }

    /// Returns the indices of all immediate successors of a vertex from the graph.
    pub fn successor_indices(&self, index: usize) -> Result<Vec<usize>, Error> {
        self.successors
            .get(&index)
            .map(|successors| successors.iter().cloned().collect())
            .ok_or(Error::GraphVertexNotFound(index))
    }

    /// Returns the indices of all immediate predecessors of a vertex from the graph.
    pub fn predecessor_indices(&self, index: usize) -> Result<Vec<usize>, Error> {
        self.predecessors
            .get(&index)
            .map(|predecessors| predecessors.iter().cloned().collect())
            .ok_or(Error::GraphVertexNotFound(index))
    }

    /// Computes the set of vertices reachable from the given index.
    pub fn reachable_vertices(&self, index: usize) -> Result<FxHashSet<usize>, Error> {
        if !self.has_vertex(index) {
            return Err(Error::GraphVertexNotFound(index));
        }

        let mut reachable_vertices: FxHashSet<usize> = FxHashSet::default();
        let mut queue: Vec<usize> = vec![index];

        reachable_vertices.insert(index);

        while let Some(vertex) = queue.pop() {
            for &successor in &self.successors[&vertex] {
                if reachable_vertices.insert(successor) {
                    queue.push(successor)
                }
            }
        }

        Ok(reachable_vertices)
    }

    /// Compute the reverse post order of all vertices reachable from `root`.
    ///
    /// Forward dataflow problems converge fastest when visited in this order.
    pub fn compute_reverse_post_order(&self, root: usize) -> Result<Vec<usize>, Error> {
        if !self.has_vertex(root) {
            return Err(Error::GraphVertexNotFound(root));
        }

        let mut visited: FxHashSet<usize> = FxHashSet::default();
        let mut order: Vec<usize> = Vec::new();
        // (vertex, successors already pushed)
        let mut stack: Vec<(usize, bool)> = vec![(root, false)];

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !visited.insert(node) {
                continue;
            }
            stack.push((node, true));
            for &successor in self.successors[&node].iter().rev() {
                if !visited.contains(&successor) {
                    stack.push((successor, false));
                }
            }
        }

        order.reverse();
        Ok(order)
    }

    /// Depth-first pre order of the vertices reachable from `root`, with the
    /// parent of each vertex in the depth-first spanning tree.
    fn depth_first(&self, root: usize) -> (Vec<usize>, FxHashMap<usize, usize>) {
        let mut order = Vec::new();
        let mut parents = FxHashMap::default();
        let mut visited = FxHashSet::default();
        let mut stack = vec![(root, root)];

        while let Some((parent, vertex)) = stack.pop() {
            if !visited.insert(vertex) {
                continue;
            }
            if vertex != root {
                parents.insert(vertex, parent);
            }
            order.push(vertex);
            for &successor in self.successors[&vertex].iter().rev() {
                if !visited.contains(&successor) {
                    stack.push((vertex, successor));
                }
            }
        }

        (order, parents)
    }

    /// Computes the immediate dominator of every vertex reachable from
    /// `root`, with the Semi-NCA algorithm.
    ///
    /// Georgiadis, Loukas: Linear-Time Algorithms for Dominators and Related
    /// Problems (thesis) <https://www.cs.princeton.edu/research/techreps/TR-737-05>
    pub fn compute_immediate_dominators(
        &self,
        root: usize,
    ) -> Result<FxHashMap<usize, usize>, Error> {
        if !self.has_vertex(root) {
            return Err(Error::GraphVertexNotFound(root));
        }

        let (order, parents) = self.depth_first(root);
        let number: FxHashMap<usize, usize> = order
            .iter()
            .enumerate()
            .map(|(number, vertex)| (*vertex, number))
            .collect();
        // parent numbers, indexed by vertex number
        let parent: Vec<usize> = order
            .iter()
            .map(|vertex| parents.get(vertex).map(|p| number[p]).unwrap_or(0))
            .collect();

        // path-compressed forest over vertex numbers
        let mut ancestor: Vec<Option<usize>> = vec![None; order.len()];
        let mut label: Vec<usize> = (0..order.len()).collect();
        let mut semi: Vec<usize> = (0..order.len()).collect();

        fn compress(ancestor: &mut [Option<usize>], label: &mut [usize], v: usize) {
            if let Some(u) = ancestor[v] {
                if ancestor[u].is_some() {
                    compress(ancestor, label, u);
                    label[v] = cmp::min(label[v], label[u]);
                    ancestor[v] = ancestor[u];
                }
            }
        }

        for w in (1..order.len()).rev() {
            let mut min_semi = usize::MAX;
            for predecessor in &self.predecessors[&order[w]] {
                // unreachable predecessors play no part
                let v = match number.get(predecessor) {
                    Some(v) => *v,
                    None => continue,
                };
                if ancestor[v].is_some() {
                    compress(&mut ancestor, &mut label, v);
                }
                min_semi = cmp::min(min_semi, label[v]);
            }
            semi[w] = min_semi;
            label[w] = min_semi;
            ancestor[w] = Some(parent[w]);
        }

        let mut idom: Vec<usize> = vec![0; order.len()];
        for w in 1..order.len() {
            let mut candidate = parent[w];
            while candidate > semi[w] {
                candidate = idom[candidate];
            }
            idom[w] = candidate;
        }

        Ok((1..order.len())
            .map(|w| (order[w], order[idom[w]]))
            .collect())
    }

    /// Computes the dominator relation rooted at `root`.
    pub fn compute_dominator_info(&self, root: usize) -> Result<Dominators, Error> {
        Ok(Dominators {
            root,
            idoms: self.compute_immediate_dominators(root)?,
        })
    }

    /// The edges whose tails dominate their heads.
    fn compute_back_edges(&self, root: usize) -> Result<Vec<(usize, usize)>, Error> {
        let dominators = self.compute_dominator_info(root)?;
        let reachable = self.reachable_vertices(root)?;
        Ok(self
            .edges
            .keys()
            .filter(|(head, tail)| reachable.contains(head) && dominators.dominates(*tail, *head))
            .cloned()
            .collect())
    }

    /// Computes the set of natural loops in the graph
    pub fn compute_loops(&self, head: usize) -> Result<Vec<Loop>, Error> {
        let mut loops: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        let reachable = self.reachable_vertices(head)?;

        // For each back edge compute the set of nodes part of the loop
        for (tail, header) in self.compute_back_edges(head)? {
            let nodes = loops.entry(header).or_default();
            let mut queue: Vec<usize> = Vec::new();

            nodes.insert(header);

            if nodes.insert(tail) {
                queue.push(tail);
            }

            while let Some(node) = queue.pop() {
                for &predecessor in &self.predecessors[&node] {
                    if reachable.contains(&predecessor) && nodes.insert(predecessor) {
                        queue.push(predecessor);
                    }
                }
            }
        }

        Ok(loops
            .into_iter()
            .map(|(header, nodes)| Loop::new(header, nodes))
            .collect())
    }

    /// Computes the loop tree of all natural loops in the graph
    ///
    /// If loop `l1` is nested in loop `l2`, `l1` is a child node of `l2` in the
    /// loop tree. Only immediate nesting is recorded.
    pub fn compute_loop_tree(&self, head: usize) -> Result<LoopTree, Error> {
        let mut tree = LoopTree::new();

        let loops = self.compute_loops(head)?;
        for l in &loops {
            tree.insert_vertex(l.clone())?;
        }

        for inner in &loops {
            // The immediate parent is the smallest loop nesting this one.
            let parent = loops
                .iter()
                .filter(|outer| outer.is_nesting(inner))
                .min_by_key(|outer| outer.nodes().len());
            if let Some(parent) = parent {
                tree.insert_edge(NullEdge::new(parent.header(), inner.header()))?;
            }
        }

        Ok(tree)
    }

    /// Returns all vertices in the graph.
    pub fn vertices(&self) -> Vec<&V> {
        self.vertices.values().collect()
    }

    /// Fetches an index from the graph by index.
    pub fn vertex(&self, index: usize) -> Result<&V, Error> {
        self.vertices
            .get(&index)
            .ok_or(Error::GraphVertexNotFound(index))
    }

    // Fetches a mutable instance of a vertex.
    pub fn vertex_mut(&mut self, index: usize) -> Result<&mut V, Error> {
        self.vertices
            .get_mut(&index)
            .ok_or(Error::GraphVertexNotFound(index))
    }

    pub fn edge(&self, head: usize, tail: usize) -> Result<&E, Error> {
        self.edges
            .get(&(head, tail))
            .ok_or(Error::GraphEdgeNotFound(head, tail))
    }

    /// Get a reference to every `Edge` in the `Graph`.
    pub fn edges(&self) -> Vec<&E> {
        self.edges.values().collect()
    }

    /// Return all edges out for a vertex
    pub fn edges_out(&self, index: usize) -> Result<Vec<&E>, Error> {
        self.successors
            .get(&index)
            .map(|succs| {
                succs
                    .iter()
                    .map(|succ| &self.edges[&(index, *succ)])
                    .collect()
            })
            .ok_or(Error::GraphVertexNotFound(index))
    }

}
