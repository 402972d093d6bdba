//! Structural checks of IL functions, run before and after instrumentation.

use crate::analysis::DefUse;
use crate::il;
use crate::Error;
use rustc_hash::FxHashSet;

fn fail<S: Into<String>>(function: &il::Function, message: S) -> Error {
    Error::Verification(function.name().to_string(), message.into())
}

/// Verify every function with a body in `program`.
pub fn verify_program(program: &il::Program) -> Result<(), Error> {
    for function in program.functions() {
        if !function.is_declaration() {
            verify_function(program, function)?;
        }
    }
    Ok(())
}

/// Verify one function:
///
/// * it has an entry block
/// * every variable is defined exactly once, and every definition dominates
/// its uses
/// * phis come first in their block and name only predecessors
/// * a return is the last instruction of a block without successors
/// * direct calls name functions of the program
pub fn verify_function(program: &il::Program, function: &il::Function) -> Result<(), Error> {
    let cfg = function.control_flow_graph()?;
    let entry = cfg
        .entry()
        .ok_or_else(|| fail(function, "control flow graph has no entry block"))?;
    let def_use = DefUse::new(function).map_err(|e| fail(function, e.to_string()))?;
    let dominators = cfg.dominators()?;
    let reachable: FxHashSet<usize> = cfg.graph().reachable_vertices(entry)?;

    // A definition at `def` is available at position `position` of `block`.
    let available = |def: il::FunctionLocation, block: usize, position: usize| -> bool {
        if !reachable.contains(&block) {
            return true;
        }
        if def.block() != block {
            return dominators.dominates(def.block(), block);
        }
        cfg.block(block)
            .ok()
            .and_then(|b| b.position(def.instruction()))
            .map(|def_position| def_position < position)
            .unwrap_or(false)
    };

    for block in cfg.blocks() {
        let predecessors = cfg.predecessor_indices(block.index())?;
        let successors = cfg.successor_indices(block.index())?;
        let mut seen_non_phi = false;

        for (position, instruction) in block.instructions().iter().enumerate() {
            let at = il::FunctionLocation::new(block.index(), instruction.index());
            match instruction.operation() {
                il::Operation::Phi { incoming, .. } => {
                    if seen_non_phi {
                        return Err(fail(function, format!("phi at {} follows non-phi", at)));
                    }
                    for (value, incoming_block) in incoming {
                        if !predecessors.contains(incoming_block) {
                            return Err(fail(
                                function,
                                format!(
                                    "phi at {} names 0x{:X}, which is not a predecessor",
                                    at, incoming_block
                                ),
                            ));
                        }
                        if let il::Value::Variable(variable) = value {
                            let def = def_use.definition(variable).ok_or_else(|| {
                                fail(function, format!("{} used at {} is undefined", variable, at))
                            })?;
                            let len = cfg.block(*incoming_block)?.instructions().len();
                            if !available(def, *incoming_block, len) {
                                return Err(fail(
                                    function,
                                    format!("{} does not reach the phi at {}", variable, at),
                                ));
                            }
                        }
                    }
                    continue;
                }
                il::Operation::Return { .. } => {
                    if position + 1 != block.instructions().len() || !successors.is_empty() {
                        return Err(fail(
                            function,
                            format!("return at {} does not end the function", at),
                        ));
                    }
                }
                il::Operation::Call {
                    target: il::CallTarget::Direct(callee),
                    ..
                } => {
                    if program.function(callee).is_none() {
                        return Err(fail(
                            function,
                            format!("call at {} to unknown function {}", at, callee),
                        ));
                    }
                }
                _ => {}
            }
            seen_non_phi = true;

            for value in instruction.values_read() {
                match value {
                    il::Value::Variable(variable) => {
                        let def = def_use.definition(variable).ok_or_else(|| {
                            fail(function, format!("{} used at {} is undefined", variable, at))
                        })?;
                        if !available(def, block.index(), position) {
                            return Err(fail(
                                function,
                                format!("{} does not dominate its use at {}", variable, at),
                            ));
                        }
                    }
                    il::Value::Argument(argument) => {
                        if function.argument(argument.index()) != Some(argument) {
                            return Err(fail(
                                function,
                                format!("{} at {} is not an argument", argument, at),
                            ));
                        }
                    }
                    il::Value::Global(name) => {
                        if program.global(name).is_none() {
                            return Err(fail(
                                function,
                                format!("unknown global @{} at {}", name, at),
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}
