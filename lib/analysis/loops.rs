//! Natural loops of a function, their nesting, and loop invariance.

use crate::analysis::def_use::DefUse;
use crate::graph::LoopTree;
use crate::il;
use crate::Error;
use std::collections::{BTreeMap, BTreeSet};

/// A natural loop of a `ControlFlowGraph`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NaturalLoop {
    header: usize,
    blocks: BTreeSet<usize>,
    preheader: Option<usize>,
    latches: Vec<usize>,
    exiting: Vec<usize>,
    parent: Option<usize>,
    depth: usize,
}

impl NaturalLoop {
    pub fn header(&self) -> usize {
        self.header
    }

    pub fn blocks(&self) -> &BTreeSet<usize> {
        &self.blocks
    }

    pub fn contains(&self, block: usize) -> bool {
        self.blocks.contains(&block)
    }

    /// The unique block outside the loop which branches to the header, and
    /// only to the header.
    pub fn preheader(&self) -> Option<usize> {
        self.preheader
    }

    /// Blocks inside the loop with an edge back to the header.
    pub fn latches(&self) -> &[usize] {
        &self.latches
    }

    /// Blocks inside the loop with an edge leaving the loop.
    pub fn exiting(&self) -> &[usize] {
        &self.exiting
    }

    /// The header of the immediately enclosing loop.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// The nesting depth, 1 for an outermost loop.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Every natural loop of a function, keyed by header.
#[derive(Clone, Debug, Default)]
pub struct LoopInfo {
    loops: BTreeMap<usize, NaturalLoop>,
}

impl LoopInfo {
    pub fn new(control_flow_graph: &il::ControlFlowGraph) -> Result<LoopInfo, Error> {
        let entry = control_flow_graph.entry_index()?;
        let graph = control_flow_graph.graph();
        let tree: LoopTree = graph.compute_loop_tree(entry)?;

        let mut loops = BTreeMap::new();
        for l in tree.vertices() {
            let header = l.header();
            let blocks = l.nodes().clone();

            let mut outside_predecessors = Vec::new();
            let mut latches = Vec::new();
            for predecessor in control_flow_graph.predecessor_indices(header)? {
                if blocks.contains(&predecessor) {
                    latches.push(predecessor);
                } else {
                    outside_predecessors.push(predecessor);
                }
            }

            let preheader = match outside_predecessors.as_slice() {
                [single] if control_flow_graph.successor_indices(*single)? == vec![header] => {
                    Some(*single)
                }
                _ => None,
            };

            let mut exiting = Vec::new();
            for block in &blocks {
                if control_flow_graph
                    .successor_indices(*block)?
                    .iter()
                    .any(|successor| !blocks.contains(successor))
                {
                    exiting.push(*block);
                }
            }

            let parent = tree.predecessor_indices(header)?.first().cloned();

            loops.insert(
                header,
                NaturalLoop {
                    header,
                    blocks,
                    preheader,
                    latches,
                    exiting,
                    parent,
                    depth: 0,
                },
            );
        }

        // Depth follows parent links, which are acyclic in a loop tree.
        let headers: Vec<usize> = loops.keys().cloned().collect();
        for header in headers {
            let mut depth = 1;
            let mut runner = loops[&header].parent;
            while let Some(parent) = runner {
                depth += 1;
                runner = loops.get(&parent).and_then(|l| l.parent);
            }
            if let Some(l) = loops.get_mut(&header) {
                l.depth = depth;
            }
        }

        Ok(LoopInfo { loops })
    }

    pub fn loops(&self) -> Vec<&NaturalLoop> {
        self.loops.values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// The loop with the given header.
    pub fn loop_with_header(&self, header: usize) -> Option<&NaturalLoop> {
        self.loops.get(&header)
    }

    /// The innermost loop containing `block`.
    pub fn innermost_loop(&self, block: usize) -> Option<&NaturalLoop> {
        self.loops
            .values()
            .filter(|l| l.contains(block))
            .max_by_key(|l| l.depth)
    }

    /// Every loop containing `block`, innermost first.
    pub fn loop_nest(&self, block: usize) -> Vec<&NaturalLoop> {
        let mut nest = Vec::new();
        let mut runner = self.innermost_loop(block);
        while let Some(l) = runner {
            nest.push(l);
            runner = l.parent.and_then(|parent| self.loops.get(&parent));
        }
        nest
    }

    /// Returns `true` if `value` holds the same value on every iteration of
    /// `l`: it is not a variable, or it is defined outside of the loop.
    pub fn is_invariant(&self, l: &NaturalLoop, value: &il::Value, def_use: &DefUse) -> bool {
        match value {
            il::Value::Variable(variable) => match def_use.definition(variable) {
                Some(location) => !l.contains(location.block()),
                None => false,
            },
            il::Value::Argument(_)
            | il::Value::Global(_)
            | il::Value::Function(_)
            | il::Value::Constant(_)
            | il::Value::Null => true,
        }
    }
}
