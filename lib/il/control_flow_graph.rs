//! A `ControlFlowGraph` is a directed `Graph` of `Block` and `Edge`.

use crate::il::*;
use crate::{graph, Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A directed graph of types `Block` and `Edge`.
///
/// # Entry
/// Every `ControlFlowGraph` of a defined function has an entry block. Analyses
/// refuse graphs without one.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ControlFlowGraph {
    // The internal graph used to store our blocks.
    graph: graph::Graph<Block, Edge>,
    // The next index to use when creating a basic block.
    next_index: usize,
    // The index for the next temp variable to create.
    next_temp_index: usize,
    // An optional entry index for the graph.
    entry: Option<usize>,
}

impl ControlFlowGraph {
    pub fn new() -> ControlFlowGraph {
        ControlFlowGraph {
            graph: graph::Graph::new(),
            next_index: 0,
            next_temp_index: 0,
            entry: None,
        }
    }

    /// Returns the underlying graph
    pub fn graph(&self) -> &graph::Graph<Block, Edge> {
        &self.graph
    }

    /// Sets the entry point for this `ControlFlowGraph` to the given `Block` index.
    pub fn set_entry(&mut self, entry: usize) -> Result<(), Error> {
        if self.graph.has_vertex(entry) {
            self.entry = Some(entry);
            return Ok(());
        }
        Err("Index does not exist for set_entry".into())
    }

    /// Get the entry `Block` index for this `ControlFlowGraph`.
    pub fn entry(&self) -> Option<usize> {
        self.entry
    }

    /// Get the entry `Block` index, or an error if none is set.
    pub fn entry_index(&self) -> Result<usize, Error> {
        self.entry.ok_or(Error::ControlFlowGraphEntryNotFound)
    }

    /// Get a `Block` by index.
    pub fn block(&self, index: usize) -> Result<&Block, Error> {
        self.graph.vertex(index)
    }

    /// Get a mutable reference to a `Block` by index.
    pub fn block_mut(&mut self, index: usize) -> Result<&mut Block, Error> {
        self.graph.vertex_mut(index)
    }

    /// Get every `Block` in this `ControlFlowGraph`.
    pub fn blocks(&self) -> Vec<&Block> {
        self.graph.vertices()
    }

    /// Get an `Instruction` by its location.
    pub fn instruction(&self, location: &FunctionLocation) -> Result<&Instruction, Error> {
        self.block(location.block())?
            .instruction(location.instruction())
    }

    /// Get a mutable reference to an `Instruction` by its location.
    pub fn instruction_mut(
        &mut self,
        location: &FunctionLocation,
    ) -> Result<&mut Instruction, Error> {
        self.block_mut(location.block())?
            .instruction_mut(location.instruction())
    }

    /// Get an `Edge` by its head and tail `Block` indices.
    pub fn edge(&self, head: usize, tail: usize) -> Result<&Edge, Error> {
        self.graph.edge(head, tail)
    }

    /// Get every outgoing edge from a block
    pub fn edges_out(&self, index: usize) -> Result<Vec<&Edge>, Error> {
        self.graph.edges_out(index)
    }

    /// Get the indices of every predecessor of a `Block` in this `ControlFlowGraph`.
    pub fn predecessor_indices(&self, index: usize) -> Result<Vec<usize>, Error> {
        self.graph.predecessor_indices(index)
    }

    /// Get the indices of every successor of a `Block` in this `ControlFlowGraph`.
    pub fn successor_indices(&self, index: usize) -> Result<Vec<usize>, Error> {
        self.graph.successor_indices(index)
    }

    /// Generates a temporary variable unique to this control flow graph.
    pub fn temp(&mut self, ty: Type) -> Variable {
        let next_index = self.next_temp_index;
        self.next_temp_index = next_index + 1;
        Variable::new(format!("carat.temp_{}", next_index), ty)
    }

    /// Creates a new basic block, adds it to the graph, and returns it
    pub fn new_block(&mut self) -> Result<&mut Block, Error> {
        let next_index = self.next_index;
        self.next_index += 1;
        let block = Block::new(next_index);
        self.graph.insert_vertex(block)?;
        self.graph.vertex_mut(next_index)
    }

    /// Creates an unconditional edge from one block to another block
    pub fn unconditional_edge(&mut self, head: usize, tail: usize) -> Result<(), Error> {
        let edge = Edge::new(head, tail, None);
        self.graph.insert_edge(edge)
    }

    /// Creates a conditional edge from one block to another block
    pub fn conditional_edge(
        &mut self,
        head: usize,
        tail: usize,
        condition: Condition,
    ) -> Result<(), Error> {
        let edge = Edge::new(head, tail, Some(condition));
        self.graph.insert_edge(edge)
    }

    /// Removes an edge and returns it.
    pub fn remove_edge(&mut self, head: usize, tail: usize) -> Result<Edge, Error> {
        self.graph.remove_edge(head, tail)
    }

    /// Moves the tail of the edge `head -> old_tail` to `new_tail`, keeping its
    /// condition.
    pub fn redirect_edge(
        &mut self,
        head: usize,
        old_tail: usize,
        new_tail: usize,
    ) -> Result<(), Error> {
        let edge = self.graph.remove_edge(head, old_tail)?;
        let mut redirected = Edge::new(head, new_tail, edge.condition().cloned());
        redirected.set_comment(edge.comment().map(|comment| comment.to_string()));
        self.graph.insert_edge(redirected)
    }

    /// Computes the dominator relation rooted at the entry block.
    pub fn dominators(&self) -> Result<graph::Dominators, Error> {
        self.graph.compute_dominator_info(self.entry_index()?)
    }
}

impl Default for ControlFlowGraph {
    fn default() -> ControlFlowGraph {
        ControlFlowGraph::new()
    }
}

impl fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for block in self.blocks() {
            writeln!(f, "{}", block)?;
        }
        for edge in self.graph.edges() {
            writeln!(f, "edge {}", edge)?;
        }
        Ok(())
    }
}
