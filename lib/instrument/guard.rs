//! Decides where memory accesses are guarded, and injects the guards.
//!
//! Every load, store, indirect call target and pointer handed to an escaping
//! call is an access. Each access is given to an ordered set of rules, and
//! the first rule which matches decides its guard:
//!
//! 1. The access is redundant when its pointer was already validated on
//! every path reaching it, or the pointer is provably safe: a stack slot, a
//! global, a fresh allocation, a cast or in-bounds index of a safe pointer, a
//! value loaded from a stack slot holding a safe pointer, or an argument whose
//! every caller passes a safe pointer.
//! 2. A pointer which does not change inside its loop nest is guarded once,
//! in the preheader of the outermost loop it is invariant in.
//! 3. A pointer indexed by an induction variable of its innermost loop is
//! guarded at the first and last address the loop touches, in the loop's
//! preheader.
//! 4. Otherwise the guard is placed right before the access.
//!
//! Calls which escape into code we cannot see additionally get a callee stack
//! guard, once at function entry when every stack slot is allocated there, and
//! before each such call otherwise.
//!
//! Placement is decided for the whole program before anything is injected.

use crate::analysis::{
    CallGraph, DataCustody, DefUse, InductionVariable, LoopBound, LoopInfo, ScalarEvolution,
};
use crate::graph::Dominators;
use crate::il;
use crate::instrument::allocation::inject;
use crate::instrument::config::Configuration;
use crate::instrument::{declare_runtime_hooks, GUARDED, INJECTED, RULE};
use crate::{AccessKind, Error};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Why an access needs no guard.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum RedundancyReason {
    /// Validated on every path reaching the access.
    AlreadyValidated,
    StackLocal,
    /// The address of a global or function.
    Global,
    FreshAllocation,
    /// A cast, index, phi or select of safe pointers.
    Derived,
    /// Loaded from a stack slot whose only store holds a safe pointer.
    MustAlias,
    /// Every caller passes a safe pointer.
    Argument,
}

/// The rule which decided an access's guard.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum GuardRule {
    Redundant(RedundancyReason),
    InvariantHoist,
    InductionHoist,
    Fallback,
}

impl GuardRule {
    pub fn is_redundant(&self) -> bool {
        matches!(self, GuardRule::Redundant(_))
    }
}

impl fmt::Display for GuardRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GuardRule::Redundant(reason) => {
                let reason = match reason {
                    RedundancyReason::AlreadyValidated => "validated",
                    RedundancyReason::StackLocal => "stack",
                    RedundancyReason::Global => "global",
                    RedundancyReason::FreshAllocation => "allocation",
                    RedundancyReason::Derived => "derived",
                    RedundancyReason::MustAlias => "must-alias",
                    RedundancyReason::Argument => "argument",
                };
                write!(f, "redundant:{}", reason)
            }
            GuardRule::InvariantHoist => write!(f, "invariant-hoist"),
            GuardRule::InductionHoist => write!(f, "induction-hoist"),
            GuardRule::Fallback => write!(f, "fallback"),
        }
    }
}

/// Where a guard is injected.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum GuardPlacement {
    /// The access is redundant.
    Omitted,
    /// Right before the instruction at this location.
    Before(il::FunctionLocation),
    /// At the end of the preheader of the loop with this header.
    Preheader { header: usize, preheader: usize },
}

/// How a hoisted induction-indexed pointer is rebuilt in the preheader.
///
/// The pointer is `gep source, base, indices`, where the index at `position`
/// is the induction variable, optionally passed through `cast`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RangePlan {
    source: il::Type,
    base: il::Value,
    indices: Vec<il::Value>,
    position: usize,
    cast: Option<(il::CastKind, il::Type)>,
    start: il::Value,
    step: i64,
    predicate: il::ComparePredicate,
    bound: il::Value,
    overshoot: u64,
    top_tested: bool,
}

/// Whether one address is checked, or the first and last address of a loop.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum GuardShape {
    Single,
    Range(RangePlan),
}

/// The decision made for one access.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GuardDecision {
    function: String,
    location: il::FunctionLocation,
    pointer: il::Value,
    access: AccessKind,
    rule: GuardRule,
    placement: GuardPlacement,
    shape: GuardShape,
}

impl GuardDecision {
    pub fn function(&self) -> &str {
        &self.function
    }

    /// The access being guarded.
    pub fn location(&self) -> &il::FunctionLocation {
        &self.location
    }

    pub fn pointer(&self) -> &il::Value {
        &self.pointer
    }

    pub fn access(&self) -> AccessKind {
        self.access
    }

    pub fn rule(&self) -> GuardRule {
        self.rule
    }

    pub fn placement(&self) -> &GuardPlacement {
        &self.placement
    }

    pub fn shape(&self) -> &GuardShape {
        &self.shape
    }

    /// The number of guard calls this decision needs, before deduplication.
    pub fn guard_count(&self) -> usize {
        match (&self.placement, &self.shape) {
            (GuardPlacement::Omitted, _) => 0,
            (_, GuardShape::Single) => 1,
            (_, GuardShape::Range(_)) => 2,
        }
    }
}

/// Where a callee stack guard is injected.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum StackGuardPlacement {
    /// Once, after the stack slots of the entry block.
    FunctionEntry,
    /// Before the escaping call at this location.
    BeforeCall(il::FunctionLocation),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StackGuardDecision {
    function: String,
    placement: StackGuardPlacement,
    frame_size: u64,
}

impl StackGuardDecision {
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn placement(&self) -> &StackGuardPlacement {
        &self.placement
    }

    /// The bytes of stack the function allocates.
    pub fn frame_size(&self) -> u64 {
        self.frame_size
    }
}

/// Every decision made, and the number of guard calls injected.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GuardReport {
    pub decisions: Vec<GuardDecision>,
    pub stack_guards: Vec<StackGuardDecision>,
    pub guards_injected: usize,
}

impl GuardReport {
    /// The number of accesses decided by `rule`.
    pub fn count(&self, rule: GuardRule) -> usize {
        self.decisions.iter().filter(|d| d.rule == rule).count()
    }

    /// The number of redundant accesses.
    pub fn redundant(&self) -> usize {
        self.decisions.iter().filter(|d| d.rule.is_redundant()).count()
    }
}

/// Per-function facts the safety rules query.
struct Facts<'p> {
    function: &'p il::Function,
    def_use: DefUse<'p>,
    dominators: Dominators,
}

impl<'p> Facts<'p> {
    fn new(function: &'p il::Function) -> Result<Facts<'p>, Error> {
        Ok(Facts {
            function,
            def_use: DefUse::new(function)?,
            dominators: function.control_flow_graph()?.dominators()?,
        })
    }

    /// Returns `true` if the instruction at `a` runs before the instruction
    /// at `b` on every path reaching `b`.
    fn dominates(&self, a: il::FunctionLocation, b: il::FunctionLocation) -> bool {
        if a.block() != b.block() {
            return self.dominators.dominates(a.block(), b.block());
        }
        let block = match self.function.block(a.block()) {
            Ok(block) => block,
            Err(_) => return false,
        };
        match (block.position(a.instruction()), block.position(b.instruction())) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

#[derive(Default)]
struct Visiting {
    phis: FxHashSet<(String, il::Variable)>,
    functions: Vec<String>,
}

/// Proves pointers safe without a guard.
struct Safety<'p> {
    program: &'p il::Program,
    call_graph: CallGraph,
    configuration: &'p Configuration,
}

impl<'p> Safety<'p> {
    fn safe(
        &self,
        facts: &Facts<'p>,
        value: &il::Value,
        visiting: &mut Visiting,
    ) -> Option<RedundancyReason> {
        match value {
            il::Value::Global(_) | il::Value::Function(_) => Some(RedundancyReason::Global),
            il::Value::Argument(argument) => self.safe_argument(facts, argument.index(), visiting),
            il::Value::Variable(variable) => self.safe_variable(facts, variable, visiting),
            il::Value::Constant(_) | il::Value::Null => None,
        }
    }

    fn safe_variable(
        &self,
        facts: &Facts<'p>,
        variable: &il::Variable,
        visiting: &mut Visiting,
    ) -> Option<RedundancyReason> {
        let value = il::Value::Variable(variable.clone());
        match facts.def_use.defining_operation(&value)? {
            il::Operation::Alloca { .. } => Some(RedundancyReason::StackLocal),
            il::Operation::Call {
                target: il::CallTarget::Direct(callee),
                ..
            } if self.configuration.allocator(callee).is_some() => {
                Some(RedundancyReason::FreshAllocation)
            }
            il::Operation::Cast {
                kind: il::CastKind::Bitcast,
                src,
                ..
            } => self
                .safe(facts, src, visiting)
                .map(|_| RedundancyReason::Derived),
            il::Operation::GetElementPtr {
                base,
                inbounds: true,
                ..
            } => self
                .safe(facts, base, visiting)
                .map(|_| RedundancyReason::Derived),
            il::Operation::Load { pointer, .. } => self.must_alias(facts, variable, pointer, visiting),
            il::Operation::Select {
                on_true, on_false, ..
            } => {
                self.safe(facts, on_true, visiting)?;
                self.safe(facts, on_false, visiting)?;
                Some(RedundancyReason::Derived)
            }
            il::Operation::Phi { incoming, .. } => {
                let key = (facts.function.name().to_string(), variable.clone());
                // A cycle through phis is safe if everything entering it is.
                if visiting.phis.contains(&key) {
                    return Some(RedundancyReason::Derived);
                }
                visiting.phis.insert(key.clone());
                let safe = incoming
                    .iter()
                    .all(|(value, _)| self.safe(facts, value, visiting).is_some());
                visiting.phis.remove(&key);
                if safe {
                    Some(RedundancyReason::Derived)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// A load from a stack slot which is only loaded from and stored to,
    /// with exactly one store which runs before the load and stores a safe
    /// pointer.
    fn must_alias(
        &self,
        facts: &Facts<'p>,
        loaded: &il::Variable,
        pointer: &il::Value,
        visiting: &mut Visiting,
    ) -> Option<RedundancyReason> {
        let slot = pointer.variable()?;
        match facts.def_use.defining_operation(pointer)? {
            il::Operation::Alloca { .. } => {}
            _ => return None,
        }

        let mut store = None;
        for location in facts.def_use.uses(slot) {
            let instruction = facts.function.control_flow_graph().ok()?.instruction(location).ok()?;
            // runtime notifications only record the slot's address
            if instruction.has_metadata(INJECTED) {
                continue;
            }
            match instruction.operation() {
                il::Operation::Load { pointer: p, .. } if p == pointer => {}
                il::Operation::Store { pointer: p, value } if p == pointer && value != pointer => {
                    if store.is_some() {
                        return None;
                    }
                    store = Some((*location, value));
                }
                _ => return None,
            }
        }

        let (store_location, stored) = store?;
        let load_location = facts.def_use.definition(loaded)?;
        if !facts.dominates(store_location, load_location) {
            return None;
        }
        self.safe(facts, stored, visiting)
            .map(|_| RedundancyReason::MustAlias)
    }

    /// An argument is safe if its function can only be called from the call
    /// sites we see, none of them is recursive, and every one passes a safe
    /// pointer.
    fn safe_argument(
        &self,
        facts: &Facts<'p>,
        index: usize,
        visiting: &mut Visiting,
    ) -> Option<RedundancyReason> {
        let function = facts.function;
        if visiting.functions.iter().any(|f| f == function.name()) {
            return None;
        }
        if !self.call_graph.callers_are_known(function) {
            return None;
        }

        visiting.functions.push(function.name().to_string());
        let mut safe = true;
        for site in self.call_graph.call_sites(function.name()) {
            let caller_is_visiting = visiting.functions.iter().any(|f| f == site.caller());
            let caller = match self.program.function(site.caller()) {
                Some(caller) if !caller_is_visiting => caller,
                _ => {
                    safe = false;
                    break;
                }
            };
            let caller_facts = match Facts::new(caller) {
                Ok(caller_facts) => caller_facts,
                Err(_) => {
                    safe = false;
                    break;
                }
            };
            let passes = site
                .argument(index)
                .map(|argument| self.safe(&caller_facts, argument, visiting).is_some())
                .unwrap_or(false);
            if !passes {
                safe = false;
                break;
            }
        }
        visiting.functions.pop();

        if safe {
            Some(RedundancyReason::Argument)
        } else {
            None
        }
    }
}

/// An access found in a function.
struct Access {
    location: il::FunctionLocation,
    pointer: il::Value,
    access: AccessKind,
}

/// Returns `true` if a call may run code we cannot see.
fn is_escaping_call(
    program: &il::Program,
    configuration: &Configuration,
    operation: &il::Operation,
) -> bool {
    match operation {
        il::Operation::Call {
            target: il::CallTarget::Indirect(_),
            ..
        } => true,
        il::Operation::Call {
            target: il::CallTarget::Direct(callee),
            ..
        } => {
            let has_body = program
                .function(callee)
                .map(|function| !function.is_declaration())
                .unwrap_or(false);
            !has_body && !configuration.is_known_function(callee)
        }
        _ => false,
    }
}

fn find_accesses(
    program: &il::Program,
    configuration: &Configuration,
    function: &il::Function,
) -> Result<Vec<Access>, Error> {
    let mut accesses = Vec::new();
    for block in function.control_flow_graph()?.blocks() {
        for instruction in block.instructions() {
            if instruction.has_metadata(INJECTED) || instruction.has_metadata(GUARDED) {
                continue;
            }
            let location = il::FunctionLocation::new(block.index(), instruction.index());
            let mut push = |pointer: &il::Value, access: AccessKind| {
                accesses.push(Access {
                    location,
                    pointer: pointer.clone(),
                    access,
                })
            };
            match instruction.operation() {
                il::Operation::Load { pointer, .. } => push(pointer, AccessKind::Read),
                il::Operation::Store { pointer, .. } => push(pointer, AccessKind::Write),
                il::Operation::Call {
                    target, arguments, ..
                } if is_escaping_call(program, configuration, instruction.operation()) => {
                    if let il::CallTarget::Indirect(target) = target {
                        push(target, AccessKind::Read);
                    }
                    for argument in arguments.iter().filter(|a| a.is_pointer()) {
                        push(argument, AccessKind::Write);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(accesses)
}

/// Decides guards for the accesses of one function.
struct Placer<'a, 'p> {
    safety: &'a Safety<'p>,
    facts: &'a Facts<'p>,
    custody: &'a DataCustody,
    loop_info: &'a LoopInfo,
    scev: ScalarEvolution<'a, 'p>,
    configuration: &'a Configuration,
}

impl<'a, 'p> Placer<'a, 'p> {
    fn decide(&self, access: Access) -> Result<GuardDecision, Error> {
        let (rule, placement, shape) = self.rule_for(&access)?;
        trace!(
            "{}: {} of {} at {}: {}",
            self.facts.function.name(),
            access.access,
            access.pointer,
            access.location,
            rule
        );
        Ok(GuardDecision {
            function: self.facts.function.name().to_string(),
            location: access.location,
            pointer: access.pointer,
            access: access.access,
            rule,
            placement,
            shape,
        })
    }

    fn rule_for(
        &self,
        access: &Access,
    ) -> Result<(GuardRule, GuardPlacement, GuardShape), Error> {
        let location = access.location;
        let pointer = &access.pointer;

        if self
            .custody
            .is_validated_before(&location, pointer, access.access)
        {
            return Ok(redundant(RedundancyReason::AlreadyValidated));
        }
        let mut visiting = Visiting::default();
        if let Some(reason) = self.safety.safe(self.facts, pointer, &mut visiting) {
            return Ok(redundant(reason));
        }

        if self.configuration.optimize_guards() {
            if let Some(placement) = self.invariant_hoist(location.block(), pointer) {
                return Ok((GuardRule::InvariantHoist, placement, GuardShape::Single));
            }
            if let Some((placement, plan)) = self.induction_hoist(location.block(), pointer)? {
                return Ok((GuardRule::InductionHoist, placement, GuardShape::Range(plan)));
            }
        }

        Ok((
            GuardRule::Fallback,
            GuardPlacement::Before(location),
            GuardShape::Single,
        ))
    }

    /// The preheader of the outermost loop `pointer` is invariant in, walking
    /// out from the innermost loop containing `block`.
    fn invariant_hoist(&self, block: usize, pointer: &il::Value) -> Option<GuardPlacement> {
        let mut placement = None;
        for l in self.loop_info.loop_nest(block) {
            if !self.loop_info.is_invariant(l, pointer, &self.facts.def_use) {
                break;
            }
            if let Some(preheader) = l.preheader() {
                placement = Some(GuardPlacement::Preheader {
                    header: l.header(),
                    preheader,
                });
            }
        }
        placement
    }

    fn induction_hoist(
        &self,
        block: usize,
        pointer: &il::Value,
    ) -> Result<Option<(GuardPlacement, RangePlan)>, Error> {
        let l = match self.loop_info.innermost_loop(block) {
            Some(l) => l,
            None => return Ok(None),
        };
        let preheader = match l.preheader() {
            Some(preheader) => preheader,
            None => return Ok(None),
        };

        let (source, base, indices) = match self.facts.def_use.defining_operation(pointer) {
            Some(il::Operation::GetElementPtr {
                source,
                base,
                indices,
                ..
            }) => (source, base, indices),
            _ => return Ok(None),
        };
        if !self.loop_info.is_invariant(l, base, &self.facts.def_use) {
            return Ok(None);
        }

        let mut induction = None;
        for (position, index) in indices.iter().enumerate() {
            if self.loop_info.is_invariant(l, index, &self.facts.def_use) {
                continue;
            }
            if induction.is_some() {
                return Ok(None);
            }
            induction = Some((position, index));
        }
        let (position, index) = match induction {
            Some(induction) => induction,
            None => return Ok(None),
        };

        let evolution = self.scev.evolution(index, l);
        if !evolution.is_analyzable() || !evolution.varies_in(l.header()) {
            debug!("{} does not evolve predictably: {}", index, evolution);
            return Ok(None);
        }

        let (phi, cast) = match self.facts.def_use.defining_operation(index) {
            Some(il::Operation::Phi { .. }) => match index.variable() {
                Some(phi) => (phi, None),
                None => return Ok(None),
            },
            Some(il::Operation::Cast { kind, src, dst })
                if matches!(kind, il::CastKind::ZeroExtend | il::CastKind::SignExtend) =>
            {
                match src.variable() {
                    Some(phi) => (phi, Some((*kind, dst.ty().clone()))),
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };

        let iv: InductionVariable = match self.scev.induction_variable(phi, l) {
            Some(iv) => iv,
            None => return Ok(None),
        };
        let step = match iv.constant_step() {
            Some(step) if step > 0 => step,
            _ => return Ok(None),
        };
        let bound: LoopBound = match self.scev.loop_bound(&iv, l, self.facts.function.control_flow_graph()?)? {
            Some(bound) => bound,
            None => return Ok(None),
        };
        match bound.predicate() {
            il::ComparePredicate::Slt
            | il::ComparePredicate::Ult
            | il::ComparePredicate::Sle
            | il::ComparePredicate::Ule
            | il::ComparePredicate::Ne => {}
            _ => return Ok(None),
        }
        // an access in the header also runs on the test which leaves the loop
        let (top_tested, overshoot) = if bound.is_top_tested() && block == l.header() {
            (false, bound.overshoot() + 1)
        } else {
            (bound.is_top_tested(), bound.overshoot())
        };

        Ok(Some((
            GuardPlacement::Preheader {
                header: l.header(),
                preheader,
            },
            RangePlan {
                source: source.clone(),
                base: base.clone(),
                indices: indices.clone(),
                position,
                cast,
                start: iv.start().clone(),
                step,
                predicate: bound.predicate(),
                bound: bound.bound().clone(),
                overshoot,
                top_tested,
            },
        )))
    }
}

fn redundant(reason: RedundancyReason) -> (GuardRule, GuardPlacement, GuardShape) {
    (
        GuardRule::Redundant(reason),
        GuardPlacement::Omitted,
        GuardShape::Single,
    )
}

/// The bytes of stack `function` allocates. Slots with a dynamic count are
/// counted once.
fn frame_size(function: &il::Function) -> u64 {
    function
        .blocks()
        .into_iter()
        .flat_map(|block| block.instructions().iter())
        .filter_map(|instruction| match instruction.operation() {
            il::Operation::Alloca {
                allocated, count, ..
            } => {
                let count = count.constant().map(|c| c.value()).unwrap_or(1);
                Some(allocated.size_in_bytes().saturating_mul(count))
            }
            _ => None,
        })
        .fold(0u64, |size, slot| size.saturating_add(slot))
}

fn decide_stack_guards(
    program: &il::Program,
    configuration: &Configuration,
    function: &il::Function,
) -> Result<Vec<StackGuardDecision>, Error> {
    let cfg = function.control_flow_graph()?;
    let entry = cfg.entry_index()?;

    let already = cfg.blocks().into_iter().any(|block| {
        block
            .instructions()
            .iter()
            .any(|instruction| instruction.metadata(INJECTED) == Some("stack-guard"))
    });
    if already {
        return Ok(Vec::new());
    }

    let mut calls = Vec::new();
    let mut grouped = true;
    for block in cfg.blocks() {
        for instruction in block.instructions() {
            let operation = instruction.operation();
            if let il::Operation::Alloca { .. } = operation {
                if block.index() != entry {
                    grouped = false;
                }
            }
            if !instruction.has_metadata(INJECTED)
                && is_escaping_call(program, configuration, operation)
            {
                calls.push(il::FunctionLocation::new(block.index(), instruction.index()));
            }
        }
    }
    if calls.is_empty() {
        return Ok(Vec::new());
    }

    let frame_size = frame_size(function);
    let decision = |placement| StackGuardDecision {
        function: function.name().to_string(),
        placement,
        frame_size,
    };
    if grouped {
        Ok(vec![decision(StackGuardPlacement::FunctionEntry)])
    } else {
        Ok(calls
            .into_iter()
            .map(|call| decision(StackGuardPlacement::BeforeCall(call)))
            .collect())
    }
}

fn decide_function<'p>(
    safety: &Safety<'p>,
    function: &'p il::Function,
    configuration: &Configuration,
) -> Result<Vec<GuardDecision>, Error> {
    let accesses = find_accesses(safety.program, configuration, function)?;
    if accesses.is_empty() {
        return Ok(Vec::new());
    }

    let facts = Facts::new(function)?;
    let custody = DataCustody::new(&facts.def_use)?;
    let loop_info = LoopInfo::new(function.control_flow_graph()?)?;
    let placer = Placer {
        safety,
        facts: &facts,
        custody: &custody,
        loop_info: &loop_info,
        scev: ScalarEvolution::new(&facts.def_use, &loop_info),
        configuration,
    };

    accesses
        .into_iter()
        .map(|access| placer.decide(access))
        .collect()
}

/// Decide guards for every instrumentable function of `program`, without
/// changing it.
pub fn decide_guards(
    program: &il::Program,
    configuration: &Configuration,
) -> Result<GuardReport, Error> {
    let safety = Safety {
        program,
        call_graph: CallGraph::new(program)?,
        configuration,
    };

    let mut report = GuardReport::default();
    for function in program.functions() {
        if function.is_declaration() || !configuration.should_instrument(function.name()) {
            continue;
        }
        if configuration.protection() {
            report
                .decisions
                .extend(decide_function(&safety, function, configuration)?);
        }
        if configuration.restriction() {
            report
                .stack_guards
                .extend(decide_stack_guards(program, configuration, function)?);
        }
    }
    Ok(report)
}

/// `ptrtoint` the pointer, then call the guard.
fn guard_operations(
    cfg: &mut il::ControlFlowGraph,
    configuration: &Configuration,
    pointer: &il::Value,
    access: AccessKind,
) -> Vec<il::Operation> {
    let address = cfg.temp(il::Type::Integer(64));
    vec![
        il::Operation::Cast {
            dst: address.clone(),
            kind: il::CastKind::PtrToInt,
            src: pointer.clone(),
        },
        il::Operation::call(
            None,
            &configuration.hooks().guard_address,
            vec![
                il::Value::Variable(address),
                il::const_(access.is_write() as u64, 32),
            ],
        ),
    ]
}

/// The value of the induction variable on the last iteration, computed in
/// the preheader.
fn last_iteration(
    cfg: &mut il::ControlFlowGraph,
    plan: &RangePlan,
    operations: &mut Vec<il::Operation>,
) -> il::Value {
    let ty = plan.start.ty();
    let bits = ty.bits().unwrap_or(64);
    let mut binary = |op, lhs: il::Value, rhs: il::Value, operations: &mut Vec<il::Operation>| {
        let dst = cfg.temp(ty.clone());
        operations.push(il::Operation::Binary {
            dst: dst.clone(),
            op,
            lhs,
            rhs,
        });
        il::Value::Variable(dst)
    };
    let step = il::const_(plan.step as u64, bits);

    let last = match plan.predicate {
        il::ComparePredicate::Ne => {
            binary(il::BinaryOperator::Sub, plan.bound.clone(), step.clone(), operations)
        }
        predicate => {
            let strict = matches!(
                predicate,
                il::ComparePredicate::Slt | il::ComparePredicate::Ult
            );
            let signed = matches!(
                predicate,
                il::ComparePredicate::Slt | il::ComparePredicate::Sle
            );
            let mut span = binary(
                il::BinaryOperator::Sub,
                plan.bound.clone(),
                plan.start.clone(),
                operations,
            );
            if strict {
                span = binary(il::BinaryOperator::Sub, span, il::const_(1, bits), operations);
            }
            if plan.step != 1 {
                let divide = if signed {
                    il::BinaryOperator::Sdiv
                } else {
                    il::BinaryOperator::Udiv
                };
                let steps = binary(divide, span, step.clone(), operations);
                span = binary(il::BinaryOperator::Mul, steps, step.clone(), operations);
            }
            binary(il::BinaryOperator::Add, plan.start.clone(), span, operations)
        }
    };

    if plan.overshoot == 0 {
        return last;
    }
    let past = il::const_((plan.step as u64).wrapping_mul(plan.overshoot), bits);
    binary(il::BinaryOperator::Add, last, past, operations)
}

/// Rebuild the indexed pointer with `value` for the induction variable.
fn rebuild_pointer(
    cfg: &mut il::ControlFlowGraph,
    plan: &RangePlan,
    value: il::Value,
    operations: &mut Vec<il::Operation>,
) -> il::Value {
    let index = match &plan.cast {
        Some((kind, ty)) => {
            let dst = cfg.temp(ty.clone());
            operations.push(il::Operation::Cast {
                dst: dst.clone(),
                kind: *kind,
                src: value,
            });
            il::Value::Variable(dst)
        }
        None => value,
    };
    let mut indices = plan.indices.clone();
    indices[plan.position] = index;
    let dst = cfg.temp(il::Type::Pointer);
    operations.push(il::Operation::GetElementPtr {
        dst: dst.clone(),
        base: plan.base.clone(),
        source: plan.source.clone(),
        indices,
        inbounds: false,
    });
    il::Value::Variable(dst)
}

/// The loop's test applied to its first value.
fn enters_loop(
    cfg: &mut il::ControlFlowGraph,
    plan: &RangePlan,
    operations: &mut Vec<il::Operation>,
) -> il::Value {
    let dst = cfg.temp(il::Type::Integer(1));
    operations.push(il::Operation::Compare {
        dst: dst.clone(),
        predicate: plan.predicate,
        lhs: plan.start.clone(),
        rhs: plan.bound.clone(),
    });
    il::Value::Variable(dst)
}

/// Guards on the first and last address the loop touches. With `enters`, a
/// loop which fails its first test is taken to touch only its first address.
fn range_operations(
    cfg: &mut il::ControlFlowGraph,
    configuration: &Configuration,
    plan: &RangePlan,
    access: AccessKind,
    enters: Option<il::Value>,
) -> Vec<il::Operation> {
    let mut operations = Vec::new();
    let first = rebuild_pointer(cfg, plan, plan.start.clone(), &mut operations);
    let mut last_value = last_iteration(cfg, plan, &mut operations);
    if let Some(enters) = enters {
        let dst = cfg.temp(plan.start.ty());
        operations.push(il::Operation::Select {
            dst: dst.clone(),
            condition: enters,
            on_true: last_value,
            on_false: plan.start.clone(),
        });
        last_value = il::Value::Variable(dst);
    }
    let last = rebuild_pointer(cfg, plan, last_value, &mut operations);
    operations.extend(guard_operations(cfg, configuration, &first, access));
    operations.extend(guard_operations(cfg, configuration, &last, access));
    operations
}

/// Inject guard operations at `position`, tagged with the rule which placed
/// them.
fn inject_guards(
    block: &mut il::Block,
    position: usize,
    operations: Vec<il::Operation>,
    rule: &str,
) -> Result<(), Error> {
    let count = operations.len();
    inject(block, position, operations, "guard")?;
    for instruction in &mut block.instructions_mut()[position..position + count] {
        instruction.set_metadata(RULE, rule);
    }
    Ok(())
}

/// Inject the range guards of a loop at the end of `entering`, the block
/// entering `header`, and return the block entering `header` afterwards.
///
/// The body of a loop tested in its header may never run, so the guards of
/// such a loop get a block of their own, taken only when the first test
/// passes:
///
/// ```text
/// entering --(enters)--> guards --> join --> header
/// entering --(!enters)------------> join
/// ```
fn inject_range(
    cfg: &mut il::ControlFlowGraph,
    configuration: &Configuration,
    plan: &RangePlan,
    access: AccessKind,
    (entering, header): (usize, usize),
    rule: &str,
) -> Result<usize, Error> {
    let mut test = Vec::new();
    let enters = enters_loop(cfg, plan, &mut test);

    if !plan.top_tested {
        test.extend(range_operations(cfg, configuration, plan, access, Some(enters)));
        let block = cfg.block_mut(entering)?;
        let position = block.terminator_position();
        inject_guards(block, position, test, rule)?;
        return Ok(entering);
    }

    let block = cfg.block_mut(entering)?;
    let position = block.terminator_position();
    inject_guards(block, position, test, rule)?;

    let operations = range_operations(cfg, configuration, plan, access, None);
    let guards = cfg.new_block()?.index();
    inject_guards(cfg.block_mut(guards)?, 0, operations, rule)?;
    let join = cfg.new_block()?.index();

    cfg.remove_edge(entering, header)?;
    cfg.conditional_edge(entering, guards, il::Condition::True(enters.clone()))?;
    cfg.conditional_edge(entering, join, il::Condition::False(enters))?;
    cfg.unconditional_edge(guards, join)?;
    cfg.unconditional_edge(join, header)?;

    for instruction in cfg.block_mut(header)?.instructions_mut() {
        if let il::Operation::Phi { incoming, .. } = instruction.operation_mut() {
            for (_, predecessor) in incoming.iter_mut() {
                if *predecessor == entering {
                    *predecessor = join;
                }
            }
        }
    }
    trace!(
        "range guards for loop 0x{:X} in block 0x{:X}, entered through 0x{:X}",
        header,
        guards,
        join
    );
    Ok(join)
}

fn inject_function(
    function: &mut il::Function,
    configuration: &Configuration,
    decisions: &[&GuardDecision],
    stack_guards: &[&StackGuardDecision],
) -> Result<usize, Error> {
    let cfg = function.control_flow_graph_mut()?;
    let mut injected = 0;
    let mut hoisted: BTreeSet<(usize, il::Value, AccessKind, bool)> = BTreeSet::new();
    // the block currently entering each loop header with range guards
    let mut entering: BTreeMap<usize, usize> = BTreeMap::new();

    for decision in decisions {
        let rule = decision.rule.to_string();
        cfg.instruction_mut(&decision.location)?
            .set_metadata(GUARDED, rule.clone());

        let (block_index, position) = match &decision.placement {
            GuardPlacement::Omitted => continue,
            GuardPlacement::Before(location) => {
                let block = cfg.block(location.block())?;
                let position = block
                    .position(location.instruction())
                    .ok_or(Error::InstructionNotFound(location.block(), location.instruction()))?;
                (location.block(), position)
            }
            GuardPlacement::Preheader { preheader, .. } => {
                let key = (
                    *preheader,
                    decision.pointer.clone(),
                    decision.access,
                    matches!(decision.shape, GuardShape::Range(_)),
                );
                if !hoisted.insert(key) {
                    continue;
                }
                (*preheader, cfg.block(*preheader)?.terminator_position())
            }
        };

        let operations = match (&decision.shape, &decision.placement) {
            (GuardShape::Single, _) => {
                guard_operations(cfg, configuration, &decision.pointer, decision.access)
            }
            (GuardShape::Range(plan), GuardPlacement::Preheader { header, .. }) => {
                let from = entering.get(header).copied().unwrap_or(block_index);
                let to = inject_range(
                    cfg,
                    configuration,
                    plan,
                    decision.access,
                    (from, *header),
                    &rule,
                )?;
                entering.insert(*header, to);
                injected += 2;
                continue;
            }
            (GuardShape::Range(_), placement) => {
                return Err(Error::Instrumentation(format!(
                    "range guard placed at {:?}",
                    placement
                )));
            }
        };
        injected += 1;
        inject_guards(cfg.block_mut(block_index)?, position, operations, &rule)?;
    }

    for stack_guard in stack_guards {
        let (block_index, position) = match &stack_guard.placement {
            StackGuardPlacement::FunctionEntry => {
                let entry = cfg.entry_index()?;
                let block = cfg.block(entry)?;
                let after_slots = block
                    .instructions()
                    .iter()
                    .rposition(|instruction| {
                        matches!(instruction.operation(), il::Operation::Alloca { .. })
                    })
                    .map(|position| position + 1)
                    .unwrap_or_else(|| block.first_non_phi_position());
                (entry, after_slots)
            }
            StackGuardPlacement::BeforeCall(location) => {
                let block = cfg.block(location.block())?;
                let position = block
                    .position(location.instruction())
                    .ok_or(Error::InstructionNotFound(location.block(), location.instruction()))?;
                (location.block(), position)
            }
        };
        let operation = il::Operation::call(
            None,
            &configuration.hooks().guard_callee_stack,
            vec![il::const_(stack_guard.frame_size, 64)],
        );
        inject(cfg.block_mut(block_index)?, position, vec![operation], "stack-guard")?;
        injected += 1;
    }

    Ok(injected)
}

/// Decide and inject guards for every instrumentable function of `program`.
pub fn place_guards(
    program: &mut il::Program,
    configuration: &Configuration,
) -> Result<GuardReport, Error> {
    declare_runtime_hooks(program, configuration);
    let mut report = decide_guards(program, configuration)?;

    for function in program.functions_mut() {
        let decisions: Vec<&GuardDecision> = report
            .decisions
            .iter()
            .filter(|d| d.function == function.name())
            .collect();
        let stack_guards: Vec<&StackGuardDecision> = report
            .stack_guards
            .iter()
            .filter(|d| d.function == function.name())
            .collect();
        if decisions.is_empty() && stack_guards.is_empty() {
            continue;
        }
        let injected = inject_function(function, configuration, &decisions, &stack_guards)?;
        debug!("{}: injected {} guards", function.name(), injected);
        report.guards_injected += injected;
    }

    info!(
        "{} accesses, {} redundant, {} guards injected",
        report.decisions.len(),
        report.redundant(),
        report.guards_injected
    );
    Ok(report)
}
