//! Instrument programs, then run them on the runtime.

use crate::executor::Driver;
use crate::il::*;
use crate::instrument::{instrument, Configuration, ConfigurationBuilder, GuardRule};
use crate::runtime::{AddressSpace, Protection, RegionInfo};
use crate::{AccessKind, Error};
use std::sync::Arc;

fn buf() -> Argument {
    Argument::new(0, "buf", Type::Pointer)
}

fn n() -> Argument {
    Argument::new(1, "n", Type::Integer(64))
}

/// fill(buf, n) writes i to the i-th 64-bit element of buf, for i in 0..n.
fn fill(linkage: Linkage) -> Function {
    let mut cfg = ControlFlowGraph::new();
    let i = int("i", 64);

    let entry = {
        let block = cfg.new_block().unwrap();
        block.nop();
        block.index()
    };
    let header = cfg.new_block().unwrap().index();
    let body = cfg.new_block().unwrap().index();
    let exit = cfg.new_block().unwrap().index();
    {
        let block = cfg.block_mut(header).unwrap();
        block.phi(
            i.clone(),
            vec![(const_(0, 64), entry), (val_int("next", 64), body)],
        );
        block.compare(
            int("done", 1),
            ComparePredicate::Uge,
            Value::Variable(i.clone()),
            Value::Argument(n()),
        );
    }
    {
        let block = cfg.block_mut(body).unwrap();
        block.gep(
            ptr("element"),
            Type::Integer(64),
            Value::Argument(buf()),
            vec![Value::Variable(i.clone())],
        );
        block.store(val_ptr("element"), Value::Variable(i.clone()));
        block.binary(
            int("next", 64),
            BinaryOperator::Add,
            Value::Variable(i),
            const_(1, 64),
        );
    }
    cfg.block_mut(exit).unwrap().ret(None);

    cfg.unconditional_edge(entry, header).unwrap();
    cfg.conditional_edge(header, exit, Condition::True(val_int("done", 1)))
        .unwrap();
    cfg.conditional_edge(header, body, Condition::False(val_int("done", 1)))
        .unwrap();
    cfg.unconditional_edge(body, header).unwrap();
    cfg.set_entry(entry).unwrap();

    Function::new("fill", vec![buf(), n()], Type::Void, cfg).with_linkage(linkage)
}

/// do { buf[i] = i; i++ } while (i < n), which writes buf[0] even when n
/// is zero.
fn fill_at_least_once() -> Function {
    let mut cfg = ControlFlowGraph::new();
    let i = int("i", 64);

    let entry = {
        let block = cfg.new_block().unwrap();
        block.nop();
        block.index()
    };
    let body = cfg.new_block().unwrap().index();
    let latch = cfg.new_block().unwrap().index();
    let exit = cfg.new_block().unwrap().index();
    {
        let block = cfg.block_mut(body).unwrap();
        block.phi(
            i.clone(),
            vec![(const_(0, 64), entry), (val_int("next", 64), latch)],
        );
        block.gep(
            ptr("element"),
            Type::Integer(64),
            Value::Argument(buf()),
            vec![Value::Variable(i.clone())],
        );
        block.store(val_ptr("element"), Value::Variable(i.clone()));
        block.binary(
            int("next", 64),
            BinaryOperator::Add,
            Value::Variable(i),
            const_(1, 64),
        );
    }
    cfg.block_mut(latch).unwrap().compare(
        int("done", 1),
        ComparePredicate::Uge,
        val_int("next", 64),
        Value::Argument(n()),
    );
    cfg.block_mut(exit).unwrap().ret(None);

    cfg.unconditional_edge(entry, body).unwrap();
    cfg.unconditional_edge(body, latch).unwrap();
    cfg.conditional_edge(latch, exit, Condition::True(val_int("done", 1)))
        .unwrap();
    cfg.conditional_edge(latch, body, Condition::False(val_int("done", 1)))
        .unwrap();
    cfg.set_entry(entry).unwrap();

    Function::new("fill", vec![buf(), n()], Type::Void, cfg)
}

fn single_block<F>(name: &str, arguments: Vec<Argument>, build: F) -> Function
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
    Function::new(name, arguments, Type::Void, cfg)
}

fn heap_functions(program: &mut Program) {
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
}

/// main(count) fills a buffer of four 64-bit elements with count elements.
fn fill_program(linkage: Linkage) -> Program {
    let count = Argument::new(0, "count", Type::Integer(64));
    let mut program = Program::new();
    heap_functions(&mut program);
    program.add_function(fill(linkage));
    program.add_function(single_block("main", vec![count.clone()], |block| {
        block.call(Some(ptr("p")), "malloc", vec![const_(32, 64)]);
        block.call(None, "fill", vec![val_ptr("p"), Value::Argument(count)]);
        block.call(None, "free", vec![val_ptr("p")]);
        block.ret(None);
    }));
    program
}

fn instrumented(mut program: Program, configuration: &Configuration) -> Driver {
    instrument(&mut program, configuration).unwrap();
    Driver::new(Arc::new(program), configuration.clone()).unwrap()
}

fn fallback() -> Configuration {
    ConfigurationBuilder::new().fallback_only(true).build()
}

#[test]
fn uninstrumented_overflow_goes_unnoticed() {
    let mut driver = Driver::new(
        Arc::new(fill_program(Linkage::External)),
        Configuration::new(),
    )
    .unwrap();
    assert_eq!(driver.run("main", &[5]).unwrap(), None);
}

#[test]
fn in_bounds_runs_complete() {
    for configuration in [Configuration::new(), fallback()] {
        for count in 0..=4 {
            let mut driver = instrumented(fill_program(Linkage::External), &configuration);
            assert_eq!(driver.run("main", &[count]).unwrap(), None);

            let stats = driver.runtime().stats();
            assert_eq!(stats.violations, 0);
            assert_eq!(stats.allocations, 1);
            assert_eq!(stats.frees, 1);
        }
    }
}

#[test]
fn loops_that_never_run_guard_nothing() {
    let mut program = Program::new();
    program.add_function(fill(Linkage::External));

    for configuration in [Configuration::new(), fallback()] {
        let mut driver = instrumented(program.clone(), &configuration);
        // a null buffer is fine as long as nothing is written to it
        assert_eq!(driver.run("fill", &[0, 0]).unwrap(), None);
        assert_eq!(driver.runtime().stats().guards, 0);

        assert!(matches!(
            driver.run("fill", &[0, 1]),
            Err(Error::GuardViolation {
                address: 0,
                access: AccessKind::Write,
            })
        ));
    }
}

#[test]
fn loops_tested_at_the_latch_run_once() {
    // main(count) fills a buffer of two 64-bit elements
    let program = || {
        let count = Argument::new(0, "count", Type::Integer(64));
        let mut program = Program::new();
        heap_functions(&mut program);
        program.add_function(fill_at_least_once());
        program.add_function(single_block("main", vec![count.clone()], |block| {
            block.call(Some(ptr("p")), "malloc", vec![const_(16, 64)]);
            block.call(None, "fill", vec![val_ptr("p"), Value::Argument(count)]);
            block.call(None, "free", vec![val_ptr("p")]);
            block.ret(None);
        }));
        program
    };

    let mut hoisted = program();
    let report = instrument(&mut hoisted, &Configuration::new()).unwrap();
    assert_eq!(report.guards.count(GuardRule::InductionHoist), 1);

    for configuration in [Configuration::new(), fallback()] {
        for count in 0..=2 {
            let mut driver = instrumented(program(), &configuration);
            assert_eq!(driver.run("main", &[count]).unwrap(), None);
            assert_eq!(driver.runtime().stats().violations, 0);
        }

        let mut driver = instrumented(program(), &configuration);
        assert!(matches!(
            driver.run("main", &[3]),
            Err(Error::GuardViolation {
                access: AccessKind::Write,
                ..
            })
        ));
    }
}

#[test]
fn out_of_bounds_writes_are_stopped() {
    for configuration in [Configuration::new(), fallback()] {
        let mut driver = instrumented(fill_program(Linkage::External), &configuration);
        match driver.run("main", &[5]) {
            Err(Error::GuardViolation { access, .. }) => assert_eq!(access, AccessKind::Write),
            other => panic!("expected a guard violation, got {:?}", other),
        }
        assert_eq!(driver.runtime().stats().violations, 1);
    }
}

#[test]
fn hoisted_guards_run_once() {
    let mut program = fill_program(Linkage::External);
    let report = instrument(&mut program, &Configuration::new()).unwrap();
    assert_eq!(report.guards.count(GuardRule::InductionHoist), 1);
    assert_eq!(report.guards.guards_injected, 2);

    let mut optimized = Driver::new(Arc::new(program), Configuration::new()).unwrap();
    optimized.run("main", &[4]).unwrap();

    let mut unoptimized = instrumented(fill_program(Linkage::External), &fallback());
    unoptimized.run("main", &[4]).unwrap();

    assert_eq!(optimized.runtime().stats().guards, 2);
    assert_eq!(unoptimized.runtime().stats().guards, 4);
}

#[test]
fn internal_callee_of_fresh_allocation_needs_no_guards() {
    let mut program = fill_program(Linkage::Internal);
    let report = instrument(&mut program, &Configuration::new()).unwrap();
    assert_eq!(report.guards.guards_injected, 0);

    let mut driver = Driver::new(Arc::new(program), Configuration::new()).unwrap();
    driver.run("main", &[4]).unwrap();
    assert_eq!(driver.runtime().stats().guards, 0);
}

#[test]
fn constant_offsets_past_the_end_are_stopped() {
    let mut program = Program::new();
    heap_functions(&mut program);
    program.add_function(single_block("main", vec![], |block| {
        block.call(Some(ptr("p")), "malloc", vec![const_(16, 64)]);
        block.append_operation(Operation::GetElementPtr {
            dst: ptr("q"),
            base: val_ptr("p"),
            source: Type::Integer(32),
            indices: vec![const_(8, 64)],
            inbounds: false,
        });
        block.store(val_ptr("q"), const_(1, 32));
        block.call(None, "free", vec![val_ptr("p")]);
        block.ret(None);
    }));

    let mut driver = instrumented(program, &Configuration::new());
    assert!(matches!(
        driver.run("main", &[]),
        Err(Error::GuardViolation {
            access: AccessKind::Write,
            ..
        })
    ));
}

#[test]
fn globals_are_registered_at_startup() {
    let mut program = Program::new();
    program.add_global(GlobalVariable::new(
        "counter",
        Type::Integer(64),
        Linkage::External,
    ));
    program.add_global(GlobalVariable::new(
        "table",
        Type::array(Type::Integer(32), 16),
        Linkage::Internal,
    ));
    program.add_function(single_block("main", vec![], |block| {
        block.store(global("counter"), const_(1, 64));
        block.ret(None);
    }));

    let mut driver = instrumented(program, &Configuration::new());
    driver.run("main", &[]).unwrap();

    let stats = driver.runtime().stats();
    assert_eq!(stats.globals, 2);
    assert_eq!(stats.guards, 0);
    let counter = driver.machine().image().global_address("counter").unwrap();
    assert!(driver.runtime().table().allocation(counter).unwrap().is_some());
}

#[test]
fn escaped_pointers_are_recorded() {
    let mut program = Program::new();
    heap_functions(&mut program);
    program.add_function(single_block("main", vec![], |block| {
        block.alloca(ptr("slot"), Type::Pointer, const_(1, 64));
        block.call(Some(ptr("p")), "malloc", vec![const_(16, 64)]);
        block.store(val_ptr("slot"), val_ptr("p"));
        block.load(ptr("q"), val_ptr("slot"));
        block.store(val_ptr("q"), const_(7, 32));
        block.ret(None);
    }));

    let mut driver = instrumented(program, &Configuration::new());
    driver.run("main", &[]).unwrap();

    let stats = driver.runtime().stats();
    assert_eq!(stats.escapes, 1);
    assert_eq!(stats.guards, 0);
    assert_eq!(driver.runtime().table().escapes().unwrap().len(), 1);
    assert_eq!(driver.runtime().table().allocations().unwrap().len(), 1);
}

#[test]
fn calls_out_of_the_module_check_the_stack() {
    let mut program = Program::new();
    program.add_function(Function::declaration(
        "elsewhere",
        vec![Argument::new(0, "ptr", Type::Pointer)],
        Type::Void,
    ));
    program.add_function(single_block("main", vec![], |block| {
        block.alloca(ptr("slot"), Type::Integer(64), const_(4, 64));
        block.call(None, "elsewhere", vec![val_ptr("slot")]);
        block.ret(None);
    }));

    let mut driver = instrumented(program, &Configuration::new());
    driver.run("main", &[]).unwrap();

    let stats = driver.runtime().stats();
    assert_eq!(stats.stack_guards, 1);
    assert_eq!(stats.violations, 0);
}

#[test]
fn writes_after_reads_of_read_only_memory_are_stopped() {
    let p = Argument::new(0, "p", Type::Pointer);
    let mut program = Program::new();
    program.add_function(single_block("main", vec![p.clone()], |block| {
        block.load(int("x", 64), Value::Argument(p.clone()));
        block.store(Value::Argument(p), const_(1, 64));
        block.ret(None);
    }));

    let mut driver = instrumented(program, &Configuration::new());
    driver
        .runtime()
        .aspace()
        .add_region(&RegionInfo::new(0x6000_0000, 0x100, Protection::READ))
        .unwrap();

    match driver.run("main", &[0x6000_0000]) {
        Err(Error::GuardViolation { address, access }) => {
            assert_eq!(address, 0x6000_0000);
            assert_eq!(access, AccessKind::Write);
        }
        other => panic!("expected a guard violation, got {:?}", other),
    }
    let stats = driver.runtime().stats();
    assert_eq!(stats.guards, 2);
    assert_eq!(stats.violations, 1);
}
