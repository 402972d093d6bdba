//! Compile-time instrumentation.
//!
//! [`instrument`] runs the whole pipeline over a `Program`:
//!
//! 1. verify the input, when verification is enabled
//! 2. give every loop a dedicated preheader
//! 3. notify the runtime of allocations, frees, globals and escapes
//! 4. decide and inject guards
//! 5. verify the output
//!
//! Every pass takes the same immutable [`Configuration`].

mod allocation;
mod config;
mod guard;

pub use self::allocation::{instrument_allocations, AllocationReport};
pub use self::config::{
    AllocatorKind, AllocatorMode, Configuration, ConfigurationBuilder, RuntimeHooks,
};
pub use self::guard::{
    decide_guards, place_guards, GuardDecision, GuardPlacement, GuardReport, GuardRule,
    GuardShape, RangePlan, RedundancyReason, StackGuardDecision, StackGuardPlacement,
};

use crate::il;
use crate::transformation;
use crate::Error;
use serde::{Deserialize, Serialize};

/// Set on every instruction a pass injected, naming what it is.
pub const INJECTED: &str = "carat.injected";
/// Set on allocator, deallocator and store instructions already reported.
pub const TRACKED: &str = "carat.tracked";
/// Set on accesses already decided, naming the rule.
pub const GUARDED: &str = "carat.guarded";
/// Set on injected guards, naming the rule which placed them.
pub const RULE: &str = "carat.rule";

/// What the pipeline did.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstrumentationReport {
    pub preheaders: usize,
    pub allocation: AllocationReport,
    pub guards: GuardReport,
}

/// Add a declaration for every runtime hook the program does not already
/// have, so injected calls name functions of the program.
pub fn declare_runtime_hooks(program: &mut il::Program, configuration: &Configuration) {
    let pointer = |index: usize, name: &str| il::Argument::new(index, name, il::Type::Pointer);
    let integer =
        |index: usize, name: &str, bits: usize| il::Argument::new(index, name, il::Type::Integer(bits));

    let hooks = configuration.hooks();
    let declarations = vec![
        (
            &hooks.notify_malloc,
            vec![pointer(0, "ptr"), integer(1, "size", 64)],
        ),
        (
            &hooks.notify_calloc,
            vec![pointer(0, "ptr"), integer(1, "size", 64), integer(2, "nmemb", 64)],
        ),
        (
            &hooks.notify_realloc,
            vec![pointer(0, "ptr"), integer(1, "size", 64), pointer(2, "old")],
        ),
        (&hooks.notify_free, vec![pointer(0, "ptr")]),
        (
            &hooks.notify_global,
            vec![pointer(0, "ptr"), integer(1, "size", 64), integer(2, "id", 64)],
        ),
        (&hooks.notify_escape, vec![pointer(0, "dest")]),
        (
            &hooks.guard_address,
            vec![integer(0, "address", 64), integer(1, "is_write", 32)],
        ),
        (&hooks.guard_callee_stack, vec![integer(0, "frame_size", 64)]),
        (&hooks.pin_pointer, vec![pointer(0, "ptr")]),
    ];

    for (name, arguments) in declarations {
        if program.function(name).is_none() {
            program.add_function(il::Function::declaration(
                name.as_str(),
                arguments,
                il::Type::Void,
            ));
        }
    }
}

/// Run every instrumentation pass over `program`.
pub fn instrument(
    program: &mut il::Program,
    configuration: &Configuration,
) -> Result<InstrumentationReport, Error> {
    if configuration.verification() {
        transformation::verify_program(program)?;
    }
    declare_runtime_hooks(program, configuration);

    let mut report = InstrumentationReport::default();
    for function in program.functions_mut() {
        if function.is_declaration() || !configuration.should_instrument(function.name()) {
            continue;
        }
        report.preheaders += transformation::loop_simplify(function)?;
    }

    report.allocation = instrument_allocations(program, configuration)?;
    report.guards = place_guards(program, configuration)?;

    if configuration.verification() {
        transformation::verify_program(program).map_err(|e| {
            error!("instrumented program does not verify: {}", e);
            e
        })?;
    }

    info!(
        "instrumented {} functions: {} preheaders, {} allocations, {} frees, {} globals, {} escapes, {} guards",
        program.defined_function_names().len(),
        report.preheaders,
        report.allocation.allocations,
        report.allocation.frees,
        report.allocation.globals,
        report.allocation.escapes,
        report.guards.guards_injected
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::*;

    #[test]
    fn hooks_are_declared_once() {
        let mut program = Program::new();
        let configuration = Configuration::new();

        declare_runtime_hooks(&mut program, &configuration);
        declare_runtime_hooks(&mut program, &configuration);

        assert_eq!(program.functions().len(), 9);
        let guard = program.function("carat_guard_address").unwrap();
        assert!(guard.is_declaration());
        assert_eq!(guard.arguments()[1].ty(), &Type::Integer(32));
    }

    #[test]
    fn invalid_input_is_rejected() {
        let mut cfg = ControlFlowGraph::new();
        let index = {
            let block = cfg.new_block().unwrap();
            block.call(None, "nowhere", vec![]);
            block.ret(None);
            block.index()
        };
        cfg.set_entry(index).unwrap();
        let mut program = Program::new();
        program.add_function(Function::new("main", vec![], Type::Void, cfg));

        assert!(matches!(
            instrument(&mut program, &Configuration::new()),
            Err(Error::Verification(_, _))
        ));
    }
}
