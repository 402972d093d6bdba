//! A forward fixed-point engine over the instructions of a function.

use crate::il;
use crate::Error;
use rustc_hash::FxHashSet;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;

/// A forward dataflow problem over one function.
pub trait FixedPointAnalysis<State: Clone + Debug + PartialEq> {
    /// Given the state before an instruction, create the state after it.
    fn trans(
        &self,
        location: &il::FunctionLocation,
        instruction: &il::Instruction,
        state: State,
    ) -> Result<State, Error>;

    /// Given two states, join them into one state.
    fn join(&self, state0: State, state1: &State) -> Result<State, Error>;

    /// The state flowing into the entry block, and into any block not
    /// reachable from it.
    fn boundary(&self) -> State;

    /// The optimistic state every other block starts from before its
    /// predecessors are known.
    fn top(&self) -> State;
}

/// The solution of a `FixedPointAnalysis`.
#[derive(Clone, Debug, Default)]
pub struct FixedPointResult<State> {
    ins: BTreeMap<il::FunctionLocation, State>,
    outs: BTreeMap<il::FunctionLocation, State>,
    block_ins: BTreeMap<usize, State>,
    block_outs: BTreeMap<usize, State>,
}

impl<State> FixedPointResult<State> {
    /// The state immediately before the instruction at `location`.
    pub fn state_in(&self, location: &il::FunctionLocation) -> Option<&State> {
        self.ins.get(location)
    }

    /// The state immediately after the instruction at `location`.
    pub fn state_out(&self, location: &il::FunctionLocation) -> Option<&State> {
        self.outs.get(location)
    }

    /// The state on entry to a block.
    pub fn block_in(&self, block: usize) -> Option<&State> {
        self.block_ins.get(&block)
    }

    /// The state on exit from a block.
    pub fn block_out(&self, block: usize) -> Option<&State> {
        self.block_outs.get(&block)
    }
}

fn transfer_block<Analysis, State>(
    analysis: &Analysis,
    block: &il::Block,
    state: State,
) -> Result<State, Error>
where
    Analysis: FixedPointAnalysis<State>,
    State: Clone + Debug + PartialEq,
{
    let mut state = state;
    for instruction in block.instructions() {
        let location = il::FunctionLocation::new(block.index(), instruction.index());
        state = analysis.trans(&location, instruction, state)?;
    }
    Ok(state)
}

/// Solve a forward dataflow problem with a block-level worklist.
///
/// Blocks are visited in reverse post order. Blocks unreachable from the
/// entry start from `boundary` and are solved once, without a meet.
pub fn fixed_point_forward<Analysis, State>(
    analysis: &Analysis,
    control_flow_graph: &il::ControlFlowGraph,
) -> Result<FixedPointResult<State>, Error>
where
    Analysis: FixedPointAnalysis<State>,
    State: Clone + Debug + PartialEq,
{
    let entry = control_flow_graph.entry_index()?;
    let graph = control_flow_graph.graph();
    let order = graph.compute_reverse_post_order(entry)?;
    let reachable: FxHashSet<usize> = order.iter().cloned().collect();

    let mut block_outs: BTreeMap<usize, State> = BTreeMap::new();
    for block in control_flow_graph.blocks() {
        block_outs.insert(block.index(), analysis.top());
    }

    let mut queue: VecDeque<usize> = order.iter().cloned().collect();
    let mut queued: FxHashSet<usize> = reachable.clone();
    let mut iterations = 0;

    while let Some(index) = queue.pop_front() {
        queued.remove(&index);
        iterations += 1;

        let in_state = if index == entry {
            analysis.boundary()
        } else {
            let mut in_state: Option<State> = None;
            for predecessor in control_flow_graph.predecessor_indices(index)? {
                if !reachable.contains(&predecessor) {
                    continue;
                }
                let predecessor_out = &block_outs[&predecessor];
                in_state = Some(match in_state {
                    Some(state) => analysis.join(state, predecessor_out)?,
                    None => predecessor_out.clone(),
                });
            }
            in_state.unwrap_or_else(|| analysis.boundary())
        };

        let out_state = transfer_block(analysis, control_flow_graph.block(index)?, in_state)?;

        if block_outs.get(&index) == Some(&out_state) {
            continue;
        }
        block_outs.insert(index, out_state);

        for successor in control_flow_graph.successor_indices(index)? {
            if reachable.contains(&successor) && queued.insert(successor) {
                queue.push_back(successor);
            }
        }
    }

    trace!("fixed point reached after {} block visits", iterations);

    // Record per-instruction states from the stable block states.
    let mut result = FixedPointResult {
        ins: BTreeMap::new(),
        outs: BTreeMap::new(),
        block_ins: BTreeMap::new(),
        block_outs: BTreeMap::new(),
    };

    for block in control_flow_graph.blocks() {
        let index = block.index();
        let mut state = if index == entry || !reachable.contains(&index) {
            analysis.boundary()
        } else {
            let mut in_state: Option<State> = None;
            for predecessor in control_flow_graph.predecessor_indices(index)? {
                if !reachable.contains(&predecessor) {
                    continue;
                }
                in_state = Some(match in_state {
                    Some(state) => analysis.join(state, &block_outs[&predecessor])?,
                    None => block_outs[&predecessor].clone(),
                });
            }
            in_state.unwrap_or_else(|| analysis.boundary())
        };

        result.block_ins.insert(index, state.clone());
        for instruction in block.instructions() {
            let location = il::FunctionLocation::new(index, instruction.index());
            result.ins.insert(location, state.clone());
            state = analysis.trans(&location, instruction, state)?;
            result.outs.insert(location, state.clone());
        }
        result.block_outs.insert(index, state);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::*;
    use std::collections::BTreeSet;

    // Collects the names of variables written on every path.
    struct MustWrite;

    impl FixedPointAnalysis<BTreeSet<String>> for MustWrite {
        fn trans(
            &self,
            _: &FunctionLocation,
            instruction: &Instruction,
            mut state: BTreeSet<String>,
        ) -> Result<BTreeSet<String>, Error> {
            if let Some(variable) = instruction.variable_written() {
                state.insert(variable.name().to_string());
            }
            Ok(state)
        }

        fn join(
            &self,
            state0: BTreeSet<String>,
            state1: &BTreeSet<String>,
        ) -> Result<BTreeSet<String>, Error> {
            Ok(state0.intersection(state1).cloned().collect())
        }

        fn boundary(&self) -> BTreeSet<String> {
            BTreeSet::new()
        }

        fn top(&self) -> BTreeSet<String> {
            ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect()
        }
    }

    #[test]
    fn diamond_intersects() {
        let mut cfg = ControlFlowGraph::new();
        let head = {
            let block = cfg.new_block().unwrap();
            block.binary(int("a", 64), BinaryOperator::Add, const_(1, 64), const_(1, 64));
            block.index()
        };
        let left = {
            let block = cfg.new_block().unwrap();
            block.binary(int("b", 64), BinaryOperator::Add, const_(1, 64), const_(1, 64));
            block.index()
        };
        let right = {
            let block = cfg.new_block().unwrap();
            block.binary(int("c", 64), BinaryOperator::Add, const_(1, 64), const_(1, 64));
            block.index()
        };
        let join = {
            let block = cfg.new_block().unwrap();
            block.ret(None);
            block.index()
        };
        cfg.set_entry(head).unwrap();
        cfg.conditional_edge(head, left, Condition::True(val_int("a", 64)))
            .unwrap();
        cfg.conditional_edge(head, right, Condition::False(val_int("a", 64)))
            .unwrap();
        cfg.unconditional_edge(left, join).unwrap();
        cfg.unconditional_edge(right, join).unwrap();

        let result = fixed_point_forward(&MustWrite, &cfg).unwrap();

        let expected: BTreeSet<String> = ["a".to_string()].iter().cloned().collect();
        assert_eq!(result.block_in(join), Some(&expected));
        assert_eq!(
            result.state_in(&FunctionLocation::new(join, 0)),
            Some(&expected)
        );
    }

    #[test]
    fn loop_reaches_fixed_point() {
        let mut cfg = ControlFlowGraph::new();
        let head = {
            let block = cfg.new_block().unwrap();
            block.nop();
            block.index()
        };
        let body = {
            let block = cfg.new_block().unwrap();
            block.binary(int("b", 64), BinaryOperator::Add, const_(1, 64), const_(1, 64));
            block.index()
        };
        let exit = {
            let block = cfg.new_block().unwrap();
            block.ret(None);
            block.index()
        };
        cfg.set_entry(head).unwrap();
        cfg.unconditional_edge(head, body).unwrap();
        cfg.conditional_edge(body, body, Condition::True(val_int("b", 64)))
            .unwrap();
        cfg.conditional_edge(body, exit, Condition::False(val_int("b", 64)))
            .unwrap();

        let result = fixed_point_forward(&MustWrite, &cfg).unwrap();

        assert!(result.block_in(body).unwrap().is_empty());
        assert!(result.block_in(exit).unwrap().contains("b"));
    }
}
