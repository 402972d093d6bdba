//! Symbolic evolution of integer values across loop iterations.
//!
//! An `Evolution` describes how a value changes from one iteration of a loop
//! to the next. Only evolutions built from constants, loop-invariant leaves,
//! additions, multiplications and affine recurrences are analyzable. Values
//! chosen by `select`, values loaded inside the loop, and cyclic derivations
//! which are not recognized recurrences are not.

use crate::analysis::def_use::DefUse;
use crate::analysis::loops::{LoopInfo, NaturalLoop};
use crate::il;
use crate::Error;
use rustc_hash::FxHashSet;
use std::fmt;

/// The symbolic value of an integer with respect to one loop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Evolution {
    Constant(i64),
    /// A value which does not change while the loop runs.
    Invariant(il::Value),
    Add(Box<Evolution>, Box<Evolution>),
    Mul(Box<Evolution>, Box<Evolution>),
    /// `{start, +, step}` over the loop with the given header.
    AddRecurrence {
        start: Box<Evolution>,
        step: Box<Evolution>,
        header: usize,
    },
    /// A choice between two evolutions.
    MinMax(Box<Evolution>, Box<Evolution>),
    Unknown,
}

impl Evolution {
    fn add(lhs: Evolution, rhs: Evolution) -> Evolution {
        match (lhs.constant(), rhs.constant()) {
            (Some(l), Some(r)) => Evolution::Constant(l.wrapping_add(r)),
            _ => Evolution::Add(Box::new(lhs), Box::new(rhs)),
        }
    }

    fn mul(lhs: Evolution, rhs: Evolution) -> Evolution {
        match (lhs.constant(), rhs.constant()) {
            (Some(l), Some(r)) => Evolution::Constant(l.wrapping_mul(r)),
            _ => Evolution::Mul(Box::new(lhs), Box::new(rhs)),
        }
    }

    /// The value of this evolution if it is a constant.
    pub fn constant(&self) -> Option<i64> {
        match self {
            Evolution::Constant(c) => Some(*c),
            _ => None,
        }
    }

    /// Returns `true` if this evolution is a bounded combination of
    /// additions, multiplications, recurrences and loop-invariant leaves.
    pub fn is_analyzable(&self) -> bool {
        match self {
            Evolution::Constant(_) | Evolution::Invariant(_) => true,
            Evolution::Add(lhs, rhs) | Evolution::Mul(lhs, rhs) => {
                lhs.is_analyzable() && rhs.is_analyzable()
            }
            Evolution::AddRecurrence { start, step, .. } => {
                start.is_analyzable() && step.is_analyzable()
            }
            Evolution::MinMax(..) | Evolution::Unknown => false,
        }
    }

    /// Returns `true` if this evolution changes with the loop of `header`.
    pub fn varies_in(&self, header: usize) -> bool {
        match self {
            Evolution::Constant(_) | Evolution::Invariant(_) => false,
            Evolution::Add(lhs, rhs) | Evolution::Mul(lhs, rhs) | Evolution::MinMax(lhs, rhs) => {
                lhs.varies_in(header) || rhs.varies_in(header)
            }
            Evolution::AddRecurrence {
                header: h,
                start,
                step,
            } => *h == header || start.varies_in(header) || step.varies_in(header),
            Evolution::Unknown => true,
        }
    }
}

impl fmt::Display for Evolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Evolution::Constant(c) => write!(f, "{}", c),
            Evolution::Invariant(value) => write!(f, "{}", value),
            Evolution::Add(lhs, rhs) => write!(f, "({} + {})", lhs, rhs),
            Evolution::Mul(lhs, rhs) => write!(f, "({} * {})", lhs, rhs),
            Evolution::AddRecurrence {
                start,
                step,
                header,
            } => write!(f, "{{{}, +, {}}}<0x{:X}>", start, step, header),
            Evolution::MinMax(lhs, rhs) => write!(f, "minmax({}, {})", lhs, rhs),
            Evolution::Unknown => write!(f, "unknown"),
        }
    }
}

/// A basic induction variable: a header phi advanced by a loop-invariant
/// step on every back edge.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InductionVariable {
    phi: il::Variable,
    header: usize,
    start: il::Value,
    step: il::Value,
    next: il::Variable,
}

impl InductionVariable {
    /// The phi in the loop header.
    pub fn phi(&self) -> &il::Variable {
        &self.phi
    }

    pub fn header(&self) -> usize {
        self.header
    }

    /// The value entering the loop from outside.
    pub fn start(&self) -> &il::Value {
        &self.start
    }

    pub fn step(&self) -> &il::Value {
        &self.step
    }

    /// The step, if it is a constant.
    pub fn constant_step(&self) -> Option<i64> {
        self.step.constant().map(|c| c.value_signed())
    }

    /// The value flowing back to the header.
    pub fn next(&self) -> &il::Variable {
        &self.next
    }
}

/// The condition keeping control inside a loop, normalized so the induction
/// variable is on the left.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoopBound {
    predicate: il::ComparePredicate,
    bound: il::Value,
    /// The number of steps the last iteration runs past the last value
    /// satisfying the predicate.
    overshoot: u64,
    /// The condition is tested in the header, before the body first runs.
    top_tested: bool,
}

impl LoopBound {
    pub fn predicate(&self) -> il::ComparePredicate {
        self.predicate
    }

    pub fn bound(&self) -> &il::Value {
        &self.bound
    }

    pub fn overshoot(&self) -> u64 {
        self.overshoot
    }

    /// Returns `true` if the loop may run no iteration at all. Otherwise the
    /// body runs once before the condition is first tested.
    pub fn is_top_tested(&self) -> bool {
        self.top_tested
    }

    /// The value of the induction variable on the last iteration, for
    /// constant operands. `None` if the loop runs no iteration past the
    /// start, or if the predicate is not understood.
    pub fn last_value(&self, start: i64, step: i64, bound: i64) -> Option<i64> {
        if step <= 0 {
            return None;
        }
        let last = match self.predicate {
            il::ComparePredicate::Slt | il::ComparePredicate::Ult => {
                if bound <= start {
                    return None;
                }
                start + step * ((bound - start - 1) / step)
            }
            il::ComparePredicate::Sle | il::ComparePredicate::Ule => {
                if bound < start {
                    return None;
                }
                start + step * ((bound - start) / step)
            }
            il::ComparePredicate::Ne => bound - step,
            _ => return None,
        };
        Some(last + step * self.overshoot as i64)
    }
}

/// Computes evolutions of values with respect to the loops of one function.
pub struct ScalarEvolution<'a, 'f> {
    def_use: &'a DefUse<'f>,
    loop_info: &'a LoopInfo,
}

impl<'a, 'f> ScalarEvolution<'a, 'f> {
    pub fn new(def_use: &'a DefUse<'f>, loop_info: &'a LoopInfo) -> ScalarEvolution<'a, 'f> {
        ScalarEvolution { def_use, loop_info }
    }

    /// The evolution of `value` with respect to `l`.
    pub fn evolution(&self, value: &il::Value, l: &NaturalLoop) -> Evolution {
        let mut in_progress = FxHashSet::default();
        self.evolution_inner(value, l, &mut in_progress)
    }

    fn evolution_inner(
        &self,
        value: &il::Value,
        l: &NaturalLoop,
        in_progress: &mut FxHashSet<il::Variable>,
    ) -> Evolution {
        let variable = match value {
            il::Value::Constant(constant) => return Evolution::Constant(constant.value_signed()),
            il::Value::Variable(variable) => variable,
            _ => return Evolution::Invariant(value.clone()),
        };

        let location = match self.def_use.definition(variable) {
            Some(location) => location,
            None => return Evolution::Unknown,
        };
        let operation = match self.def_use.defining_operation(value) {
            Some(operation) => operation,
            None => return Evolution::Unknown,
        };

        if !in_progress.insert(variable.clone()) {
            trace!("{} is defined cyclically", variable);
            return Evolution::Unknown;
        }

        let inside = l.contains(location.block());
        let evolution = match operation {
            il::Operation::Binary { op, lhs, rhs, .. } => match op {
                il::BinaryOperator::Add => Evolution::add(
                    self.evolution_inner(lhs, l, in_progress),
                    self.evolution_inner(rhs, l, in_progress),
                ),
                il::BinaryOperator::Sub => Evolution::add(
                    self.evolution_inner(lhs, l, in_progress),
                    Evolution::mul(
                        Evolution::Constant(-1),
                        self.evolution_inner(rhs, l, in_progress),
                    ),
                ),
                il::BinaryOperator::Mul => Evolution::mul(
                    self.evolution_inner(lhs, l, in_progress),
                    self.evolution_inner(rhs, l, in_progress),
                ),
                il::BinaryOperator::Shl => match rhs.constant() {
                    Some(shift) if shift.value() < 63 => Evolution::mul(
                        self.evolution_inner(lhs, l, in_progress),
                        Evolution::Constant(1 << shift.value()),
                    ),
                    _ => Evolution::Unknown,
                },
                _ if !inside => Evolution::Invariant(value.clone()),
                _ => Evolution::Unknown,
            },
            il::Operation::Cast {
                kind: il::CastKind::ZeroExtend,
                src,
                ..
            }
            | il::Operation::Cast {
                kind: il::CastKind::SignExtend,
                src,
                ..
            }
            | il::Operation::Cast {
                kind: il::CastKind::Truncate,
                src,
                ..
            } => self.evolution_inner(src, l, in_progress),
            il::Operation::Select {
                on_true, on_false, ..
            } => Evolution::MinMax(
                Box::new(self.evolution_inner(on_true, l, in_progress)),
                Box::new(self.evolution_inner(on_false, l, in_progress)),
            ),
            il::Operation::Phi { .. } if location.block() == l.header() => {
                match self.induction_variable(variable, l) {
                    Some(iv) => Evolution::AddRecurrence {
                        start: Box::new(self.evolution_inner(iv.start(), l, in_progress)),
                        step: Box::new(self.evolution_inner(iv.step(), l, in_progress)),
                        header: l.header(),
                    },
                    None => Evolution::Unknown,
                }
            }
            _ if !inside => Evolution::Invariant(value.clone()),
            _ => Evolution::Unknown,
        };

        in_progress.remove(variable);
        evolution
    }

    /// Recognize `phi` as a basic induction variable of `l`.
    pub fn induction_variable(
        &self,
        phi: &il::Variable,
        l: &NaturalLoop,
    ) -> Option<InductionVariable> {
        let location = self.def_use.definition(phi)?;
        if location.block() != l.header() {
            return None;
        }
        let incoming = match self.def_use.defining_instruction(phi)?.operation() {
            il::Operation::Phi { incoming, .. } => incoming,
            _ => return None,
        };

        let mut start: Option<&il::Value> = None;
        let mut next: Option<&il::Value> = None;
        for (value, block) in incoming {
            if l.contains(*block) {
                if next.map(|next| next != value).unwrap_or(false) {
                    return None;
                }
                next = Some(value);
            } else {
                if start.is_some() {
                    return None;
                }
                start = Some(value);
            }
        }
        let start = start?;
        let next = next?.variable()?;

        let phi_value = il::Value::Variable(phi.clone());
        let step = match self.def_use.defining_operation(&il::Value::Variable(next.clone()))? {
            il::Operation::Binary {
                op: il::BinaryOperator::Add,
                lhs,
                rhs,
                ..
            } => {
                if *lhs == phi_value {
                    rhs.clone()
                } else if *rhs == phi_value {
                    lhs.clone()
                } else {
                    return None;
                }
            }
            il::Operation::Binary {
                op: il::BinaryOperator::Sub,
                lhs,
                rhs: il::Value::Constant(constant),
                ..
            } if *lhs == phi_value => {
                let negated = constant.value_signed().wrapping_neg() as u64;
                il::Value::Constant(il::Constant::new(negated, constant.bits()))
            }
            _ => return None,
        };

        if !self.loop_info.is_invariant(l, &step, self.def_use) {
            return None;
        }

        Some(InductionVariable {
            phi: phi.clone(),
            header: l.header(),
            start: start.clone(),
            step,
            next: next.clone(),
        })
    }

    /// Find the condition keeping control inside `l` in terms of `iv`.
    ///
    /// The loop must leave through a single block, which is the header or a
    /// latch, and must test the induction variable or its next value against
    /// a loop-invariant bound.
    pub fn loop_bound(
        &self,
        iv: &InductionVariable,
        l: &NaturalLoop,
        control_flow_graph: &il::ControlFlowGraph,
    ) -> Result<Option<LoopBound>, Error> {
        let exiting = match l.exiting() {
            [exiting] => *exiting,
            _ => return Ok(None),
        };
        let at_header = exiting == l.header();
        if !at_header && !l.latches().contains(&exiting) {
            return Ok(None);
        }

        let mut stay = None;
        for edge in control_flow_graph.edges_out(exiting)? {
            if l.contains(edge.tail()) {
                if stay.is_some() {
                    return Ok(None);
                }
                stay = edge.condition();
            }
        }
        let condition = match stay {
            Some(condition) => condition,
            None => return Ok(None),
        };

        let (predicate, lhs, rhs) = match self.def_use.defining_operation(condition.value()) {
            Some(il::Operation::Compare {
                predicate,
                lhs,
                rhs,
                ..
            }) => (*predicate, lhs, rhs),
            _ => return Ok(None),
        };
        let predicate = if condition.when_true() {
            predicate
        } else {
            predicate.inverse()
        };

        let phi = il::Value::Variable(iv.phi().clone());
        let next = il::Value::Variable(iv.next().clone());
        let (predicate, tested, bound) = if *lhs == phi || *lhs == next {
            (predicate, lhs, rhs)
        } else if *rhs == phi || *rhs == next {
            (predicate.swapped(), rhs, lhs)
        } else {
            return Ok(None);
        };

        if !self.loop_info.is_invariant(l, bound, self.def_use) {
            return Ok(None);
        }

        let overshoot = match (at_header, *tested == phi) {
            // tested before the body runs
            (true, true) => 0,
            // the next value is not available in the header
            (true, false) => return Ok(None),
            // tested after the body, against the value of the next iteration
            (false, false) => 0,
            // tested after the body, against this iteration's value
            (false, true) => 1,
        };

        Ok(Some(LoopBound {
            predicate,
            bound: bound.clone(),
            overshoot,
            top_tested: at_header,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::*;

    /// for (i = 0; i < n; i++) { x = a[i]; y = select c, i, n }
    fn counted_loop() -> Function {
        let mut cfg = ControlFlowGraph::new();
        let n = Value::Argument(Argument::new(1, "n", Type::Integer(64)));
        let a = Value::Argument(Argument::new(0, "a", Type::Pointer));

        let entry = {
            let block = cfg.new_block().unwrap();
            block.nop();
            block.index()
        };
        let header = {
            let block = cfg.new_block().unwrap();
            block.phi(
                int("i", 64),
                vec![(const_(0, 64), entry), (val_int("i.next", 64), 2)],
            );
            block.compare(int("c", 1), ComparePredicate::Slt, val_int("i", 64), n.clone());
            block.index()
        };
        let body = {
            let block = cfg.new_block().unwrap();
            block.binary(int("off", 64), BinaryOperator::Shl, val_int("i", 64), const_(2, 64));
            block.gep(ptr("p"), Type::Integer(32), a, vec![val_int("i", 64)]);
            block.load(int("x", 32), val_ptr("p"));
            block.load(int("w", 64), val_ptr("p"));
            block.binary(int("bad", 64), BinaryOperator::Add, val_int("w", 64), val_int("i", 64));
            block.select(int("y", 64), val_int("c", 1), val_int("i", 64), n.clone());
            block.binary(int("i.next", 64), BinaryOperator::Add, val_int("i", 64), const_(1, 64));
            block.index()
        };
        let exit = {
            let block = cfg.new_block().unwrap();
            block.ret(None);
            block.index()
        };
        assert_eq!(body, 2);
        cfg.set_entry(entry).unwrap();
        cfg.unconditional_edge(entry, header).unwrap();
        cfg.conditional_edge(header, body, Condition::True(val_int("c", 1)))
            .unwrap();
        cfg.conditional_edge(header, exit, Condition::False(val_int("c", 1)))
            .unwrap();
        cfg.unconditional_edge(body, header).unwrap();

        Function::new(
            "f",
            vec![
                Argument::new(0, "a", Type::Pointer),
                Argument::new(1, "n", Type::Integer(64)),
            ],
            Type::Void,
            cfg,
        )
    }

    #[test]
    fn recognizes_induction_variable() {
        let function = counted_loop();
        let def_use = DefUse::new(&function).unwrap();
        let loop_info = LoopInfo::new(function.control_flow_graph().unwrap()).unwrap();
        let l = loop_info.loop_with_header(1).unwrap();
        let scev = ScalarEvolution::new(&def_use, &loop_info);

        let iv = scev.induction_variable(&int("i", 64), l).unwrap();
        assert_eq!(iv.constant_step(), Some(1));
        assert_eq!(iv.start(), &const_(0, 64));
        assert_eq!(iv.next(), &int("i.next", 64));

        let evolution = scev.evolution(&val_int("off", 64), l);
        assert!(evolution.is_analyzable());
        assert!(evolution.varies_in(1));
    }

    #[test]
    fn rejects_select_and_loads() {
        let function = counted_loop();
        let def_use = DefUse::new(&function).unwrap();
        let loop_info = LoopInfo::new(function.control_flow_graph().unwrap()).unwrap();
        let l = loop_info.loop_with_header(1).unwrap();
        let scev = ScalarEvolution::new(&def_use, &loop_info);

        assert!(!scev.evolution(&val_int("y", 64), l).is_analyzable());
        assert!(!scev.evolution(&val_int("bad", 64), l).is_analyzable());
        let n = Value::Argument(Argument::new(1, "n", Type::Integer(64)));
        assert_eq!(scev.evolution(&n, l), Evolution::Invariant(n.clone()));
    }

    #[test]
    fn header_bound() {
        let function = counted_loop();
        let def_use = DefUse::new(&function).unwrap();
        let cfg = function.control_flow_graph().unwrap();
        let loop_info = LoopInfo::new(cfg).unwrap();
        let l = loop_info.loop_with_header(1).unwrap();
        let scev = ScalarEvolution::new(&def_use, &loop_info);

        let iv = scev.induction_variable(&int("i", 64), l).unwrap();
        let bound = scev.loop_bound(&iv, l, cfg).unwrap().unwrap();

        assert_eq!(bound.predicate(), ComparePredicate::Slt);
        assert_eq!(bound.overshoot(), 0);
        assert!(bound.is_top_tested());
        assert_eq!(bound.last_value(0, 1, 10), Some(9));
        assert_eq!(bound.last_value(0, 3, 10), Some(9));
        assert_eq!(bound.last_value(0, 4, 10), Some(8));
        assert_eq!(bound.last_value(5, 1, 5), None);
    }

    #[test]
    fn last_value_by_predicate() {
        let bound = |predicate, overshoot| LoopBound {
            predicate,
            bound: const_(10, 64),
            overshoot,
            top_tested: overshoot == 0,
        };
        assert_eq!(bound(ComparePredicate::Ule, 0).last_value(0, 1, 10), Some(10));
        assert_eq!(bound(ComparePredicate::Ne, 0).last_value(0, 2, 10), Some(8));
        assert_eq!(bound(ComparePredicate::Slt, 1).last_value(0, 1, 10), Some(10));
        assert_eq!(bound(ComparePredicate::Sgt, 0).last_value(0, 1, 10), None);
    }
}
