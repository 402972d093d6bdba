//! Address checking for data custody.
//!
//! A forward, intraprocedural analysis computing, at every instruction, the
//! set of values already validated on every path reaching it, together with
//! the kind of access they were validated for. A load or store validates its
//! pointer operand, and everything the pointer was derived from through
//! bitcasts and in-bounds indexing. A store validates for writes and reads,
//! a load only for reads. Nothing is ever invalidated within a function.

use crate::analysis::def_use::DefUse;
use crate::analysis::fixed_point::{self, FixedPointAnalysis, FixedPointResult};
use crate::il;
use crate::{AccessKind, Error};
use std::collections::BTreeSet;

/// The values known to be validated, each with the access it was validated
/// for.
pub type CustodySet = BTreeSet<(il::Value, AccessKind)>;

/// The accesses a validation of `access` also covers.
fn covered(access: AccessKind) -> &'static [AccessKind] {
    match access {
        AccessKind::Read => &[AccessKind::Read],
        AccessKind::Write => &[AccessKind::Read, AccessKind::Write],
    }
}

/// The solved custody analysis for one function.
#[derive(Clone, Debug)]
pub struct DataCustody {
    universe: CustodySet,
    result: FixedPointResult<CustodySet>,
}

impl DataCustody {
    /// Run the analysis over `def_use.function()`.
    pub fn new(def_use: &DefUse) -> Result<DataCustody, Error> {
        let function = def_use.function();
        let universe = universe(function)?;
        let analysis = CustodyAnalysis {
            def_use,
            universe: &universe,
        };
        let result = fixed_point::fixed_point_forward(&analysis, function.control_flow_graph()?)?;
        debug!(
            "custody for {}: {} tracked values",
            function.name(),
            universe.len()
        );
        Ok(DataCustody { universe, result })
    }

    /// Every value the analysis tracks.
    pub fn universe(&self) -> &CustodySet {
        &self.universe
    }

    /// Values validated before the instruction at `location` executes.
    pub fn validated_in(&self, location: &il::FunctionLocation) -> Option<&CustodySet> {
        self.result.state_in(location)
    }

    /// Values validated after the instruction at `location` executes.
    pub fn validated_out(&self, location: &il::FunctionLocation) -> Option<&CustodySet> {
        self.result.state_out(location)
    }

    /// Returns `true` if `value` is validated for `access` on every path
    /// reaching `location`.
    pub fn is_validated_before(
        &self,
        location: &il::FunctionLocation,
        value: &il::Value,
        access: AccessKind,
    ) -> bool {
        self.validated_in(location)
            .map(|set| set.contains(&(value.clone(), access)))
            .unwrap_or(false)
    }
}

/// Every instruction result and every operand which is not a function, for
/// both kinds of access.
pub fn universe(function: &il::Function) -> Result<CustodySet, Error> {
    let mut values = BTreeSet::new();
    for block in function.control_flow_graph()?.blocks() {
        for instruction in block.instructions() {
            if let Some(variable) = instruction.variable_written() {
                values.insert(il::Value::Variable(variable.clone()));
            }
            for value in instruction.values_read() {
                if let il::Value::Function(_) = value {
                    continue;
                }
                values.insert(value.clone());
            }
        }
    }
    for argument in function.arguments() {
        values.insert(il::Value::Argument(argument.clone()));
    }
    Ok(values
        .into_iter()
        .flat_map(|value| {
            covered(AccessKind::Write)
                .iter()
                .map(move |access| (value.clone(), *access))
        })
        .collect())
}

/// The pointer and every pointer it was derived from by unwinding bitcasts
/// and in-bounds indexing.
pub fn custody_chain(def_use: &DefUse, pointer: &il::Value) -> Vec<il::Value> {
    let mut chain = Vec::new();
    let mut current = pointer.clone();
    loop {
        if chain.contains(&current) {
            break;
        }
        chain.push(current.clone());
        current = match def_use.defining_operation(&current) {
            Some(il::Operation::Cast {
                kind: il::CastKind::Bitcast,
                src,
                ..
            }) if src.is_pointer() => src.clone(),
            Some(il::Operation::GetElementPtr {
                base,
                inbounds: true,
                ..
            }) => base.clone(),
            _ => break,
        };
    }
    chain
}

struct CustodyAnalysis<'a, 'f> {
    def_use: &'a DefUse<'f>,
    universe: &'a CustodySet,
}

impl<'a, 'f> FixedPointAnalysis<CustodySet> for CustodyAnalysis<'a, 'f> {
    fn trans(
        &self,
        location: &il::FunctionLocation,
        instruction: &il::Instruction,
        mut state: CustodySet,
    ) -> Result<CustodySet, Error> {
        let operation = instruction.operation();
        if let Some(pointer) = operation.pointer_operand() {
            let access = AccessKind::from_is_write(operation.is_store());
            for value in custody_chain(self.def_use, pointer) {
                trace!("{} validates {} for {}", location, value, access);
                for kind in covered(access) {
                    state.insert((value.clone(), *kind));
                }
            }
        }
        Ok(state)
    }

    fn join(&self, state0: CustodySet, state1: &CustodySet) -> Result<CustodySet, Error> {
        Ok(state0.intersection(state1).cloned().collect())
    }

    fn boundary(&self) -> CustodySet {
        CustodySet::new()
    }

    fn top(&self) -> CustodySet {
        self.universe.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::*;

    /// entry: p = gep inbounds a, 1; [p] = 0; q = bitcast p
    /// then: [a] = 1  (only on one side)
    /// join: [q] = 2
    fn function() -> Function {
        let mut cfg = ControlFlowGraph::new();
        let a = Value::Argument(Argument::new(0, "a", Type::Pointer));

        let entry = {
            let block = cfg.new_block().unwrap();
            block.gep(ptr("p"), Type::Integer(32), a.clone(), vec![const_(1, 64)]);
            block.store(val_ptr("p"), const_(0, 32));
            block.cast(ptr("q"), CastKind::Bitcast, val_ptr("p"));
            block.compare(int("c", 1), ComparePredicate::Eq, const_(0, 32), const_(0, 32));
            block.index()
        };
        let then = {
            let block = cfg.new_block().unwrap();
            block.store(val_ptr("r"), const_(1, 32));
            block.index()
        };
        let join = {
            let block = cfg.new_block().unwrap();
            block.store(val_ptr("q"), const_(2, 32));
            block.ret(None);
            block.index()
        };
        cfg.set_entry(entry).unwrap();
        cfg.conditional_edge(entry, then, Condition::True(val_int("c", 1)))
            .unwrap();
        cfg.conditional_edge(entry, join, Condition::False(val_int("c", 1)))
            .unwrap();
        cfg.unconditional_edge(then, join).unwrap();

        Function::new(
            "f",
            vec![Argument::new(0, "a", Type::Pointer)],
            Type::Void,
            cfg,
        )
    }

    #[test]
    fn store_validates_derivation_chain() {
        let function = function();
        let def_use = DefUse::new(&function).unwrap();
        let custody = DataCustody::new(&def_use).unwrap();
        let writable = |block, index, value: &Value| {
            let location = FunctionLocation::new(block, index);
            custody.is_validated_before(&location, value, AccessKind::Write)
        };
        let a = Value::Argument(Argument::new(0, "a", Type::Pointer));

        // Nothing is validated at entry.
        assert!(!writable(0, 1, &val_ptr("p")));
        // After the store, p and the base it was derived from are validated.
        assert!(writable(0, 2, &val_ptr("p")));
        assert!(writable(0, 2, &a));
        // q is a bitcast of p, but was never used as a pointer operand.
        assert!(!writable(2, 0, &val_ptr("q")));
    }

    #[test]
    fn meet_is_intersection() {
        let function = function();
        let def_use = DefUse::new(&function).unwrap();
        let custody = DataCustody::new(&def_use).unwrap();
        let writable = |block, index, value: &Value| {
            let location = FunctionLocation::new(block, index);
            custody.is_validated_before(&location, value, AccessKind::Write)
        };

        // r is only validated on one path into the join block.
        assert!(writable(1, 0, &val_ptr("p")));
        assert!(!writable(2, 0, &val_ptr("r")));
        assert!(writable(2, 0, &val_ptr("p")));
        assert!(custody
            .validated_out(&FunctionLocation::new(1, 0))
            .unwrap()
            .contains(&(val_ptr("r"), AccessKind::Write)));
    }

    #[test]
    fn load_validates_reads_only() {
        let mut cfg = ControlFlowGraph::new();
        let p = Value::Argument(Argument::new(0, "p", Type::Pointer));
        let entry = {
            let block = cfg.new_block().unwrap();
            block.load(int("x", 64), p.clone());
            block.store(p.clone(), const_(0, 64));
            block.load(int("y", 64), p.clone());
            block.ret(None);
            block.index()
        };
        cfg.set_entry(entry).unwrap();
        let function = Function::new(
            "f",
            vec![Argument::new(0, "p", Type::Pointer)],
            Type::Void,
            cfg,
        );
        let def_use = DefUse::new(&function).unwrap();
        let custody = DataCustody::new(&def_use).unwrap();

        let store = FunctionLocation::new(0, 1);
        assert!(custody.is_validated_before(&store, &p, AccessKind::Read));
        assert!(!custody.is_validated_before(&store, &p, AccessKind::Write));

        // a store covers later reads as well as writes
        let second_load = FunctionLocation::new(0, 2);
        assert!(custody.is_validated_before(&second_load, &p, AccessKind::Read));
        assert!(custody.is_validated_before(&second_load, &p, AccessKind::Write));
    }

    #[test]
    fn chain_follows_casts_and_inbounds_indexing() {
        let function = function();
        let def_use = DefUse::new(&function).unwrap();
        let chain = custody_chain(&def_use, &val_ptr("q"));
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0], val_ptr("q"));
        assert_eq!(chain[1], val_ptr("p"));
    }
}
