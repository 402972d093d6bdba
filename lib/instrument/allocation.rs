//! Keeps the runtime informed of allocations, frees, globals and escapes.
//!
//! * A recognized allocator call is followed by a notification carrying the
//! returned pointer and the requested size, widened to 64 bits. `calloc`
//! forwards its element count and `realloc` its old pointer.
//! * A recognized deallocator call is preceded by a notification carrying the
//! freed pointer, so the runtime untracks memory before it is reclaimed.
//! * Every eligible global is registered once, at the start of the
//! configured initialization function.
//! * A store of a pointer is followed by an escape notification carrying the
//! address the pointer was stored to.
//!
//! Instrumented instructions are tagged, and injected instructions are
//! skipped, so running the pass twice changes nothing.

use crate::il;
use crate::instrument::config::{AllocatorKind, Configuration};
use crate::instrument::{declare_runtime_hooks, INJECTED, TRACKED};
use crate::Error;
use serde::{Deserialize, Serialize};

/// What the pass injected.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AllocationReport {
    pub allocations: usize,
    pub frees: usize,
    pub globals: usize,
    pub escapes: usize,
}

impl AllocationReport {
    fn merge(&mut self, other: &AllocationReport) {
        self.allocations += other.allocations;
        self.frees += other.frees;
        self.globals += other.globals;
        self.escapes += other.escapes;
    }
}

enum Site {
    Allocation {
        kind: AllocatorKind,
        dst: il::Variable,
        arguments: Vec<il::Value>,
    },
    Free {
        pointer: il::Value,
    },
    Escape {
        destination: il::Value,
    },
}

/// Instrument every allocation, free, global and escape in `program`.
pub fn instrument_allocations(
    program: &mut il::Program,
    configuration: &Configuration,
) -> Result<AllocationReport, Error> {
    declare_runtime_hooks(program, configuration);

    let mut report = AllocationReport::default();
    for function in program.functions_mut() {
        if function.is_declaration() || !configuration.should_instrument(function.name()) {
            continue;
        }
        let function_report = instrument_function(function, configuration)?;
        debug!(
            "{}: {} allocations, {} frees, {} escapes",
            function.name(),
            function_report.allocations,
            function_report.frees,
            function_report.escapes
        );
        report.merge(&function_report);
    }

    if configuration.globals() {
        report.globals = register_globals(program, configuration)?;
    }

    Ok(report)
}

fn find_sites(
    function: &il::Function,
    configuration: &Configuration,
) -> Result<Vec<(il::FunctionLocation, Site)>, Error> {
    let mut sites = Vec::new();
    for block in function.control_flow_graph()?.blocks() {
        for instruction in block.instructions() {
            if instruction.has_metadata(INJECTED) || instruction.has_metadata(TRACKED) {
                continue;
            }
            let location = il::FunctionLocation::new(block.index(), instruction.index());
            match instruction.operation() {
                il::Operation::Call {
                    dst,
                    target: il::CallTarget::Direct(callee),
                    arguments,
                } => {
                    if let Some(kind) = configuration.allocator(callee) {
                        if !configuration.mallocs() {
                            continue;
                        }
                        match dst {
                            Some(dst) => sites.push((
                                location,
                                Site::Allocation {
                                    kind,
                                    dst: dst.clone(),
                                    arguments: arguments.clone(),
                                },
                            )),
                            None => trace!("result of {} at {} is unused", callee, location),
                        }
                    } else if configuration.is_deallocator(callee) && configuration.frees() {
                        if let Some(pointer) = arguments.first() {
                            sites.push((
                                location,
                                Site::Free {
                                    pointer: pointer.clone(),
                                },
                            ));
                        }
                    }
                }
                il::Operation::Store { pointer, value }
                    if configuration.escapes() && value.is_pointer() =>
                {
                    sites.push((
                        location,
                        Site::Escape {
                            destination: pointer.clone(),
                        },
                    ));
                }
                _ => {}
            }
        }
    }
    Ok(sites)
}

/// Cast an integer to 64 bits, appending the cast to `operations`.
fn widen(
    cfg: &mut il::ControlFlowGraph,
    value: &il::Value,
    operations: &mut Vec<il::Operation>,
) -> il::Value {
    if let il::Value::Constant(constant) = value {
        return il::const_(constant.value(), 64);
    }
    let kind = match value.ty() {
        il::Type::Integer(bits) if bits < 64 => il::CastKind::ZeroExtend,
        il::Type::Integer(bits) if bits > 64 => il::CastKind::Truncate,
        _ => return value.clone(),
    };
    let dst = cfg.temp(il::Type::Integer(64));
    operations.push(il::Operation::Cast {
        dst: dst.clone(),
        kind,
        src: value.clone(),
    });
    il::Value::Variable(dst)
}

/// The position just after `index`, past any instructions already injected
/// there.
fn position_after(block: &il::Block, index: usize) -> Result<usize, Error> {
    let mut position = block
        .position(index)
        .ok_or(Error::InstructionNotFound(block.index(), index))?
        + 1;
    while position < block.instructions().len()
        && block.instructions()[position].has_metadata(INJECTED)
    {
        position += 1;
    }
    Ok(position)
}

pub(crate) fn inject(
    block: &mut il::Block,
    position: usize,
    operations: Vec<il::Operation>,
    tag: &str,
) -> Result<(), Error> {
    for (offset, operation) in operations.into_iter().enumerate() {
        block
            .insert_operation(position + offset, operation)?
            .set_metadata(INJECTED, tag);
    }
    Ok(())
}

fn instrument_function(
    function: &mut il::Function,
    configuration: &Configuration,
) -> Result<AllocationReport, Error> {
    let sites = find_sites(function, configuration)?;
    let hooks = configuration.hooks();
    let cfg = function.control_flow_graph_mut()?;
    let mut report = AllocationReport::default();

    for (location, site) in sites {
        let mut operations = Vec::new();
        let (tag, before) = match site {
            Site::Allocation {
                kind,
                dst,
                arguments,
            } => {
                let pointer = il::Value::Variable(dst);
                let argument = |index: usize| {
                    arguments.get(index).cloned().ok_or_else(|| {
                        Error::Instrumentation(format!(
                            "allocator call at {} is missing argument {}",
                            location, index
                        ))
                    })
                };
                let call = match kind {
                    AllocatorKind::Malloc => {
                        let size = widen(cfg, &argument(0)?, &mut operations);
                        il::Operation::call(None, &hooks.notify_malloc, vec![pointer, size])
                    }
                    AllocatorKind::Calloc => {
                        let count = widen(cfg, &argument(0)?, &mut operations);
                        let size = widen(cfg, &argument(1)?, &mut operations);
                        il::Operation::call(None, &hooks.notify_calloc, vec![pointer, size, count])
                    }
                    AllocatorKind::Realloc => {
                        let old = argument(0)?;
                        let size = widen(cfg, &argument(1)?, &mut operations);
                        il::Operation::call(None, &hooks.notify_realloc, vec![pointer, size, old])
                    }
                };
                operations.push(call);
                report.allocations += 1;
                ("allocation", false)
            }
            Site::Free { pointer } => {
                operations.push(il::Operation::call(None, &hooks.notify_free, vec![pointer]));
                report.frees += 1;
                ("free", true)
            }
            Site::Escape { destination } => {
                operations.push(il::Operation::call(
                    None,
                    &hooks.notify_escape,
                    vec![destination],
                ));
                report.escapes += 1;
                ("escape", false)
            }
        };

        let block = cfg.block_mut(location.block())?;
        let position = if before {
            block
                .position(location.instruction())
                .ok_or(Error::InstructionNotFound(location.block(), location.instruction()))?
        } else {
            position_after(block, location.instruction())?
        };
        inject(block, position, operations, tag)?;
        block
            .instruction_mut(location.instruction())?
            .set_metadata(TRACKED, tag);
    }

    Ok(report)
}

/// Returns `true` for globals the runtime should track.
fn is_trackable(global: &il::GlobalVariable) -> bool {
    !global.is_declaration()
        && global.linkage() != il::Linkage::Private
        && !global.name().starts_with("llvm.")
        && global.size_in_bytes() > 0
}

fn register_globals(
    program: &mut il::Program,
    configuration: &Configuration,
) -> Result<usize, Error> {
    let globals: Vec<(String, u64)> = program
        .globals()
        .into_iter()
        .filter(|global| is_trackable(global))
        .map(|global| (global.name().to_string(), global.size_in_bytes()))
        .collect();
    if globals.is_empty() {
        return Ok(0);
    }

    let init = configuration.global_init_function();
    let function = program.function_mut(init).ok_or_else(|| {
        Error::Instrumentation(format!("global initialization function {} not found", init))
    })?;
    let cfg = function.control_flow_graph_mut()?;
    let entry = cfg.entry_index()?;
    let block = cfg.block_mut(entry)?;

    let registered = block.instructions().iter().any(|instruction| {
        instruction.metadata(INJECTED) == Some("global")
    });
    if registered {
        debug!("globals already registered in {}", init);
        return Ok(0);
    }

    let operations: Vec<il::Operation> = globals
        .iter()
        .enumerate()
        .map(|(id, (name, size))| {
            il::Operation::call(
                None,
                &configuration.hooks().notify_global,
                vec![
                    il::Value::Global(name.clone()),
                    il::const_(*size, 64),
                    il::const_(id as u64, 64),
                ],
            )
        })
        .collect();
    let position = block.first_non_phi_position();
    inject(block, position, operations, "global")?;

    info!("registered {} globals in {}", globals.len(), init);
    Ok(globals.len())
}
