//! A driver concretely executes IL programs.

use crate::executor::eval;
use crate::executor::memory::{Machine, STACK_BASE};
use crate::executor::successor::Successor;
use crate::executor::State;
use crate::il;
use crate::instrument::{AllocatorKind, Configuration};
use crate::runtime::{HostMemory, Runtime, TrackerConfig};
use crate::Error;
use std::sync::Arc;

/// The number of instructions a driver executes before giving up.
pub const DEFAULT_STEP_LIMIT: u64 = 1 << 24;
/// The deepest a call chain may get.
pub const MAX_CALL_DEPTH: usize = 512;

/// A driver for a concrete executor over IL.
///
/// Calls to the runtime hooks named by the configuration go to the machine's
/// `Runtime`, and calls to the configured allocators go to its heap. Any
/// other call to a function without a body does nothing and returns zero.
pub struct Driver {
    program: Arc<il::Program>,
    configuration: Configuration,
    machine: Machine,
    stack_pointer: u64,
    steps: u64,
    step_limit: u64,
    depth: usize,
}

impl Driver {
    /// Create a new driver over a fresh machine.
    pub fn new(program: Arc<il::Program>, configuration: Configuration) -> Result<Driver, Error> {
        let machine = Machine::new(&program, TrackerConfig::default())?;
        Ok(Driver::with_machine(program, configuration, machine))
    }

    pub fn with_machine(
        program: Arc<il::Program>,
        configuration: Configuration,
        machine: Machine,
    ) -> Driver {
        let stack_pointer = machine.stack_top();
        Driver {
            program,
            configuration,
            machine,
            stack_pointer,
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
            depth: 0,
        }
    }

    pub fn with_step_limit(mut self, step_limit: u64) -> Driver {
        self.step_limit = step_limit;
        self
    }

    /// Retrieve the IL program associated with this driver.
    pub fn program(&self) -> &il::Program {
        &self.program
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        self.machine.runtime()
    }

    /// The number of instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Call `function` with integer arguments, returning its result.
    pub fn run(&mut self, function: &str, arguments: &[u64]) -> Result<Option<u64>, Error> {
        let program = self.program.clone();
        let function = program.function_or_err(function)?;
        let arguments = function
            .arguments()
            .iter()
            .zip(arguments.iter())
            .map(|(argument, value)| {
                let bits = argument.ty().bits().unwrap_or(il::POINTER_BITS);
                il::Constant::new(*value, bits)
            })
            .collect();
        info!("running {}", function.name());
        let result = self.execute_function(function, arguments);
        match &result {
            Ok(_) => info!("{} returned after {} steps", function.name(), self.steps),
            Err(e) => info!("{} halted after {} steps: {}", function.name(), self.steps, e),
        }
        Ok(result?.map(|value| value.value()))
    }

    fn step(&mut self) -> Result<(), Error> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(Error::ExecutorStepLimit(self.step_limit));
        }
        Ok(())
    }

    fn value(&self, state: &State, value: &il::Value) -> Result<il::Constant, Error> {
        if let Some(constant) = state.local(value)? {
            return Ok(constant);
        }
        let image = self.machine.image();
        let address = match value {
            il::Value::Global(name) => image.global_address(name),
            il::Value::Function(name) => image.function_address(name),
            _ => None,
        };
        address
            .map(|address| il::Constant::new(address, il::POINTER_BITS))
            .ok_or_else(|| Error::Executor(format!("{} has no address", value)))
    }

    fn set_stack_pointer(&mut self, stack_pointer: u64) {
        self.stack_pointer = stack_pointer;
        self.machine.runtime().set_stack_pointer(stack_pointer);
    }

    fn execute_function(
        &mut self,
        function: &il::Function,
        arguments: Vec<il::Constant>,
    ) -> Result<Option<il::Constant>, Error> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Error::Executor(format!(
                "call depth exceeded calling {}",
                function.name()
            )));
        }
        self.depth += 1;
        let mut state = State::new(arguments, self.stack_pointer);
        let result = self.execute_body(function, &mut state);
        self.depth -= 1;
        self.set_stack_pointer(state.stack_pointer());
        result
    }

    fn execute_body(
        &mut self,
        function: &il::Function,
        state: &mut State,
    ) -> Result<Option<il::Constant>, Error> {
        let cfg = function.control_flow_graph()?;
        let mut block = cfg.entry_index()?;
        let mut previous = None;
        loop {
            trace!("{} block 0x{:x}", function.name(), block);
            let instructions = cfg.block(block)?.instructions();
            let phis = instructions
                .iter()
                .take_while(|instruction| instruction.operation().is_phi())
                .count();

            // phis read their incoming values together
            let mut incoming_values = Vec::new();
            for instruction in &instructions[..phis] {
                if let il::Operation::Phi { dst, incoming } = instruction.operation() {
                    let from = previous.ok_or_else(|| {
                        Error::Executor(format!("{} reached without a predecessor", dst))
                    })?;
                    let value = incoming
                        .iter()
                        .find(|(_, predecessor)| *predecessor == from)
                        .map(|(value, _)| value)
                        .ok_or_else(|| {
                            Error::Executor(format!("{} has no value from block 0x{:x}", dst, from))
                        })?;
                    incoming_values.push((dst.name(), self.value(state, value)?));
                }
            }
            for (name, value) in incoming_values {
                state.set_scalar(name, value);
            }

            for instruction in &instructions[phis..] {
                self.step()?;
                if let Successor::Return(value) = self.execute(state, instruction.operation())? {
                    return Ok(value);
                }
            }

            previous = Some(block);
            block = self.next_block(state, cfg, block)?;
        }
    }

    fn next_block(
        &self,
        state: &State,
        cfg: &il::ControlFlowGraph,
        block: usize,
    ) -> Result<usize, Error> {
        for edge in cfg.edges_out(block)? {
            match edge.condition() {
                None => return Ok(edge.tail()),
                Some(condition) => {
                    let value = self.value(state, condition.value())?;
                    if condition.is_satisfied_by(value.value()) {
                        return Ok(edge.tail());
                    }
                }
            }
        }
        Err(Error::Executor(format!(
            "no edge out of block 0x{:x} can be taken",
            block
        )))
    }

    /// Execute an `il::Operation`, updating `state`.
    fn execute(
        &mut self,
        state: &mut State,
        operation: &il::Operation,
    ) -> Result<Successor, Error> {
        match operation {
            il::Operation::Alloca {
                dst,
                allocated,
                count,
            } => {
                let count = self.value(state, count)?.value();
                let size = allocated.size_in_bytes().wrapping_mul(count);
                let alignment = allocated.alignment().max(1);
                let stack_pointer = self
                    .stack_pointer
                    .checked_sub(size)
                    .map(|sp| sp & !(alignment - 1))
                    .filter(|sp| *sp >= STACK_BASE)
                    .ok_or_else(|| Error::Executor(format!("stack overflow allocating {}", dst)))?;
                self.set_stack_pointer(stack_pointer);
                state.set_scalar(
                    dst.name(),
                    il::Constant::new(stack_pointer, il::POINTER_BITS),
                );
            }
            il::Operation::Load { dst, pointer } => {
                let address = self.value(state, pointer)?.value();
                let bits = scalar_bits(dst.ty())?;
                let value = self
                    .machine
                    .memory()
                    .read_uint(address, (bits + 7) / 8)?;
                state.set_scalar(dst.name(), il::Constant::new(value, bits));
            }
            il::Operation::Store { pointer, value } => {
                let address = self.value(state, pointer)?.value();
                let value = self.value(state, value)?;
                self.machine
                    .memory()
                    .write_uint(address, value.value(), (value.bits() + 7) / 8)?;
            }
            il::Operation::Cast { dst, kind, src } => {
                let src = self.value(state, src)?;
                state.set_scalar(dst.name(), eval::cast(*kind, &src, dst.ty())?);
            }
            il::Operation::GetElementPtr {
                dst,
                base,
                source,
                indices,
                ..
            } => {
                let base = self.value(state, base)?;
                let indices = indices
                    .iter()
                    .map(|index| self.value(state, index))
                    .collect::<Result<Vec<il::Constant>, Error>>()?;
                let offset = eval::element_offset(source, &indices)?;
                state.set_scalar(
                    dst.name(),
                    il::Constant::new(base.value().wrapping_add(offset), il::POINTER_BITS),
                );
            }
            il::Operation::Binary { dst, op, lhs, rhs } => {
                let lhs = self.value(state, lhs)?;
                let rhs = self.value(state, rhs)?;
                state.set_scalar(dst.name(), eval::binary(*op, &lhs, &rhs)?);
            }
            il::Operation::Compare {
                dst,
                predicate,
                lhs,
                rhs,
            } => {
                let lhs = self.value(state, lhs)?;
                let rhs = self.value(state, rhs)?;
                state.set_scalar(dst.name(), eval::compare(*predicate, &lhs, &rhs));
            }
            il::Operation::Select {
                dst,
                condition,
                on_true,
                on_false,
            } => {
                let value = if self.value(state, condition)?.is_zero() {
                    self.value(state, on_false)?
                } else {
                    self.value(state, on_true)?
                };
                state.set_scalar(dst.name(), value);
            }
            il::Operation::Phi { dst, .. } => {
                return Err(Error::Executor(format!(
                    "{} is not at the start of its block",
                    dst
                )));
            }
            il::Operation::Call {
                dst,
                target,
                arguments,
            } => {
                let arguments = arguments
                    .iter()
                    .map(|argument| self.value(state, argument))
                    .collect::<Result<Vec<il::Constant>, Error>>()?;
                let name = match target {
                    il::CallTarget::Direct(name) => name.clone(),
                    il::CallTarget::Indirect(value) => {
                        let address = self.value(state, value)?.value();
                        self.machine
                            .image()
                            .function_at(address)
                            .map(|name| name.to_string())
                            .ok_or_else(|| {
                                Error::Executor(format!("call to 0x{:x}, not a function", address))
                            })?
                    }
                };
                let result = self.call(&name, arguments)?;
                if let Some(dst) = dst {
                    let bits = scalar_bits(dst.ty())?;
                    let value = result.map(|value| value.value()).unwrap_or(0);
                    state.set_scalar(dst.name(), il::Constant::new(value, bits));
                }
            }
            il::Operation::Return { value } => {
                let value = match value {
                    Some(value) => Some(self.value(state, value)?),
                    None => None,
                };
                return Ok(Successor::Return(value));
            }
            il::Operation::Nop => {}
        }
        Ok(Successor::FallThrough)
    }

    fn call(
        &mut self,
        name: &str,
        arguments: Vec<il::Constant>,
    ) -> Result<Option<il::Constant>, Error> {
        let argument = |index: usize| -> Result<u64, Error> {
            arguments
                .get(index)
                .map(|argument| argument.value())
                .ok_or_else(|| Error::Executor(format!("{} expects argument {}", name, index)))
        };
        let pointer = |value: u64| Some(il::Constant::new(value, il::POINTER_BITS));

        if self.call_hook(name, &arguments)? {
            return Ok(None);
        }
        if let Some(kind) = self.configuration.allocator(name) {
            let ptr = match kind {
                AllocatorKind::Malloc => self.machine.malloc(argument(0)?),
                AllocatorKind::Calloc => self.machine.calloc(argument(0)?, argument(1)?)?,
                AllocatorKind::Realloc => self.machine.realloc(argument(0)?, argument(1)?)?,
            };
            trace!("{} returned 0x{:x}", name, ptr);
            return Ok(pointer(ptr));
        }
        if self.configuration.is_deallocator(name) {
            self.machine.free(argument(0)?);
            return Ok(None);
        }

        let program = self.program.clone();
        let function = program.function_or_err(name)?;
        if function.is_declaration() {
            debug!("call to external function {} ignored", name);
            return Ok(None);
        }
        self.execute_function(function, arguments)
    }

    /// Dispatch a call to a runtime hook, returning `false` if `name` is not
    /// a hook.
    fn call_hook(&self, name: &str, arguments: &[il::Constant]) -> Result<bool, Error> {
        let hooks = self.configuration.hooks();
        if !hooks.contains(name) {
            return Ok(false);
        }
        let argument = |index: usize| -> Result<u64, Error> {
            arguments
                .get(index)
                .map(|argument| argument.value())
                .ok_or_else(|| Error::Executor(format!("{} expects argument {}", name, index)))
        };

        let runtime = self.machine.runtime();
        if name == hooks.notify_malloc {
            runtime.notify_malloc(argument(0)?, argument(1)?)?;
        } else if name == hooks.notify_calloc {
            runtime.notify_calloc(argument(0)?, argument(1)?, argument(2)?)?;
        } else if name == hooks.notify_realloc {
            runtime.notify_realloc(argument(0)?, argument(1)?, argument(2)?)?;
        } else if name == hooks.notify_free {
            runtime.notify_free(argument(0)?)?;
        } else if name == hooks.notify_global {
            runtime.notify_global(argument(0)?, argument(1)?, argument(2)?)?;
        } else if name == hooks.notify_escape {
            runtime.notify_escape(argument(0)?)?;
        } else if name == hooks.guard_address {
            runtime.guard_address(argument(0)?, argument(1)? != 0)?;
        } else if name == hooks.guard_callee_stack {
            runtime.guard_callee_stack(argument(0)?)?;
        } else if name == hooks.pin_pointer {
            runtime.pin_pointer(argument(0)?)?;
        }
        Ok(true)
    }
}

fn scalar_bits(ty: &il::Type) -> Result<usize, Error> {
    ty.bits()
        .ok_or_else(|| Error::Executor(format!("{} is not a scalar type", ty)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::*;

    fn run(program: Program, function: &str, arguments: &[u64]) -> Result<Option<u64>, Error> {
        let mut driver = Driver::new(Arc::new(program), Configuration::new())?;
        driver.run(function, arguments)
    }

    /// sum(n) = 0 + 1 + ... + (n - 1), summed through a stack slot
    fn sum() -> Program {
        let mut cfg = ControlFlowGraph::new();
        let i = int("i", 64);
        let next = int("next", 64);
        let total = int("total", 64);
        let slot = ptr("slot");

        let entry = {
            let block = cfg.new_block().unwrap();
            block.alloca(slot.clone(), Type::Integer(64), const_(1, 64));
            block.store(Value::Variable(slot.clone()), const_(0, 64));
            block.index()
        };
        let header = cfg.new_block().unwrap().index();
        let body = cfg.new_block().unwrap().index();
        let exit = cfg.new_block().unwrap().index();
        {
            let block = cfg.block_mut(header).unwrap();
            block.phi(
                i.clone(),
                vec![(const_(0, 64), entry), (Value::Variable(next.clone()), body)],
            );
            block.compare(
                int("done", 1),
                ComparePredicate::Uge,
                Value::Variable(i.clone()),
                Value::Argument(Argument::new(0, "n", Type::Integer(64))),
            );
        }
        {
            let block = cfg.block_mut(body).unwrap();
            block.load(total.clone(), Value::Variable(slot.clone()));
            block.binary(
                int("added", 64),
                BinaryOperator::Add,
                Value::Variable(total.clone()),
                Value::Variable(i.clone()),
            );
            block.store(Value::Variable(slot.clone()), val_int("added", 64));
            block.binary(
                next.clone(),
                BinaryOperator::Add,
                Value::Variable(i.clone()),
                const_(1, 64),
            );
        }
        {
            let block = cfg.block_mut(exit).unwrap();
            block.load(int("result", 64), Value::Variable(slot));
            block.ret(Some(val_int("result", 64)));
        }
        cfg.unconditional_edge(entry, header).unwrap();
        cfg.conditional_edge(header, exit, Condition::True(val_int("done", 1)))
            .unwrap();
        cfg.conditional_edge(header, body, Condition::False(val_int("done", 1)))
            .unwrap();
        cfg.unconditional_edge(body, header).unwrap();
        cfg.set_entry(entry).unwrap();

        let mut program = Program::new();
        program.add_function(Function::new(
            "sum",
            vec![Argument::new(0, "n", Type::Integer(64))],
            Type::Integer(64),
            cfg,
        ));
        program
    }

    #[test]
    fn loops_and_stack_slots() {
        assert_eq!(run(sum(), "sum", &[10]).unwrap(), Some(45));
        assert_eq!(run(sum(), "sum", &[0]).unwrap(), Some(0));
    }

    #[test]
    fn step_limit_halts_execution() {
        let mut driver = Driver::new(Arc::new(sum()), Configuration::new())
            .unwrap()
            .with_step_limit(100);
        assert!(matches!(
            driver.run("sum", &[1000]),
            Err(Error::ExecutorStepLimit(100))
        ));
    }

    fn single_block<F>(name: &str, ret: Type, build: F) -> Function
    where
        F: FnOnce(&mut Block),
    {
        let mut cfg = ControlFlowGraph::new();
        let index = {
            let block = cfg.new_block().unwrap();
            build(block);
            block.index()
        };
        cfg.set_entry(index).unwrap();
        Function::new(name, vec![], ret, cfg)
    }

    #[test]
    fn heap_calls_and_indirect_calls() {
        let mut program = Program::new();
        program.add_function(Function::declaration(
            "malloc",
            vec![Argument::new(0, "size", Type::Integer(64))],
            Type::Pointer,
        ));
        program.add_function(Function::declaration(
            "free",
            vec![Argument::new(0, "ptr", Type::Pointer)],
            Type::Void,
        ));
        program.add_function(single_block("seven", Type::Integer(32), |block| {
            block.ret(Some(const_(7, 32)));
        }));
        program.add_function(single_block("main", Type::Integer(32), |block| {
            block.call(Some(ptr("p")), "malloc", vec![const_(16, 64)]);
            block.call_indirect(Some(int("x", 32)), Value::Function("seven".to_string()), vec![]);
            block.gep(
                ptr("q"),
                Type::Integer(32),
                val_ptr("p"),
                vec![const_(3, 64)],
            );
            block.store(val_ptr("q"), val_int("x", 32));
            block.load(int("y", 32), val_ptr("q"));
            block.call(None, "free", vec![val_ptr("p")]);
            block.ret(Some(val_int("y", 32)));
        }));

        assert_eq!(run(program, "main", &[]).unwrap(), Some(7));
    }

    #[test]
    fn null_dereference_faults() {
        let mut program = Program::new();
        program.add_function(single_block("main", Type::Integer(32), |block| {
            block.load(int("x", 32), Value::Null);
            block.ret(Some(val_int("x", 32)));
        }));

        assert!(matches!(
            run(program, "main", &[]),
            Err(Error::MemoryFault(0))
        ));
    }

    #[test]
    fn guard_hooks_reach_the_runtime() {
        let configuration = Configuration::new();
        let mut program = Program::new();
        crate::instrument::declare_runtime_hooks(&mut program, &configuration);
        let guard = configuration.hooks().guard_address.clone();
        program.add_function(single_block("main", Type::Void, |block| {
            block.call(None, guard.as_str(), vec![const_(0x1234, 64), const_(0, 32)]);
            block.ret(None);
        }));

        let mut driver = Driver::new(Arc::new(program), configuration).unwrap();
        assert!(matches!(
            driver.run("main", &[]),
            Err(Error::GuardViolation { address: 0x1234, .. })
        ));
        assert_eq!(driver.runtime().stats().violations, 1);
    }
}
