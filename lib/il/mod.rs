//! CARAT Intermediate Language.
//!
//! # An Introduction
//!
//! The IL is a small, typed, SSA three-address language. It carries exactly
//! what the instrumentation passes need to reason about memory: stack
//! allocations, loads and stores, pointer casts, address arithmetic, calls,
//! and the control flow around them.
//!
//! ## Semantics
//!
//! * `Type` gives every value a layout. Pointers are opaque and 64 bits wide.
//! * `Value` is an operand: an SSA `Variable`, a function `Argument`, the
//! address of a global or function, an integer `Constant`, or null.
//! * `Operation` is a closed set of instruction kinds. Each operation writes
//! at most one `Variable`, exactly once, anywhere in its function.
//! * `Block` is a sequence of `Instruction`, an `Edge` connects two blocks and
//! may carry a `Condition`, and the `ControlFlowGraph` of a `Function` holds
//! them together. Branches are edges, not instructions.
//! * A `Program` holds functions and global variables by name.
//!
//! ## Location
//!
//! `FunctionLocation` names an instruction inside a function by block index
//! and instruction index. Instruction indices are stable: inserting new
//! instructions never renumbers existing ones, so locations computed by an
//! analysis stay valid while a pass rewrites the function.
//!
//! ## Metadata
//!
//! Every `Instruction` carries a string map of metadata. Instrumentation uses
//! it to tag what it injected, so that passes are idempotent, and to record
//! why a guard was placed where it was.

mod block;
mod constant;
mod control_flow_graph;
mod edge;
mod function;
mod global;
mod instruction;
mod location;
mod operation;
mod program;
mod ty;
mod value;
mod variable;

pub use self::block::*;
pub use self::constant::*;
pub use self::control_flow_graph::*;
pub use self::edge::*;
pub use self::function::*;
pub use self::global::*;
pub use self::instruction::*;
pub use self::location::*;
pub use self::operation::*;
pub use self::program::*;
pub use self::ty::*;
pub use self::value::*;
pub use self::variable::*;

/// A convenience function to create a new constant value.
pub fn const_(value: u64, bits: usize) -> Value {
    Value::Constant(Constant::new(value, bits))
}

/// A convenience function to create a new variable.
pub fn var<S>(name: S, ty: Type) -> Variable
where
    S: Into<String>,
{
    Variable::new(name, ty)
}

/// A convenience function to create a new pointer-typed variable.
pub fn ptr<S>(name: S) -> Variable
where
    S: Into<String>,
{
    Variable::new(name, Type::Pointer)
}

/// A convenience function to create a new integer-typed variable.
pub fn int<S>(name: S, bits: usize) -> Variable
where
    S: Into<String>,
{
    Variable::new(name, Type::Integer(bits))
}

/// A convenience function to create a new variable value.
pub fn val<S>(name: S, ty: Type) -> Value
where
    S: Into<String>,
{
    Value::Variable(Variable::new(name, ty))
}

/// A convenience function to create a new pointer-typed variable value.
pub fn val_ptr<S>(name: S) -> Value
where
    S: Into<String>,
{
    Value::Variable(Variable::new(name, Type::Pointer))
}

/// A convenience function to create a new integer-typed variable value.
pub fn val_int<S>(name: S, bits: usize) -> Value
where
    S: Into<String>,
{
    Value::Variable(Variable::new(name, Type::Integer(bits)))
}

/// A convenience function for the address of a global variable.
pub fn global<S>(name: S) -> Value
where
    S: Into<String>,
{
    Value::Global(name.into())
}
