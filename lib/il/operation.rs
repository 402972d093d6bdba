//! An `Operation` captures the semantics of an `Instruction`.

use crate::il::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a conversion performed by `Operation::Cast`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum CastKind {
    /// Reinterpret a value as a type of the same width.
    Bitcast,
    PtrToInt,
    IntToPtr,
    ZeroExtend,
    SignExtend,
    Truncate,
}

impl fmt::Display for CastKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CastKind::Bitcast => write!(f, "bitcast"),
            CastKind::PtrToInt => write!(f, "ptrtoint"),
            CastKind::IntToPtr => write!(f, "inttoptr"),
            CastKind::ZeroExtend => write!(f, "zext"),
            CastKind::SignExtend => write!(f, "sext"),
            CastKind::Truncate => write!(f, "trunc"),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Udiv,
    Sdiv,
    Urem,
    Shl,
    Lshr,
    Ashr,
    And,
    Or,
    Xor,
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            BinaryOperator::Add => "add",
            BinaryOperator::Sub => "sub",
            BinaryOperator::Mul => "mul",
            BinaryOperator::Udiv => "udiv",
            BinaryOperator::Sdiv => "sdiv",
            BinaryOperator::Urem => "urem",
            BinaryOperator::Shl => "shl",
            BinaryOperator::Lshr => "lshr",
            BinaryOperator::Ashr => "ashr",
            BinaryOperator::And => "and",
            BinaryOperator::Or => "or",
            BinaryOperator::Xor => "xor",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum ComparePredicate {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl ComparePredicate {
    /// The predicate which holds exactly when this one does not.
    pub fn inverse(&self) -> ComparePredicate {
        match self {
            ComparePredicate::Eq => ComparePredicate::Ne,
            ComparePredicate::Ne => ComparePredicate::Eq,
            ComparePredicate::Ult => ComparePredicate::Uge,
            ComparePredicate::Ule => ComparePredicate::Ugt,
            ComparePredicate::Ugt => ComparePredicate::Ule,
            ComparePredicate::Uge => ComparePredicate::Ult,
            ComparePredicate::Slt => ComparePredicate::Sge,
            ComparePredicate::Sle => ComparePredicate::Sgt,
            ComparePredicate::Sgt => ComparePredicate::Sle,
            ComparePredicate::Sge => ComparePredicate::Slt,
        }
    }

    /// The predicate which holds with its operands swapped.
    pub fn swapped(&self) -> ComparePredicate {
        match self {
            ComparePredicate::Eq => ComparePredicate::Eq,
            ComparePredicate::Ne => ComparePredicate::Ne,
            ComparePredicate::Ult => ComparePredicate::Ugt,
            ComparePredicate::Ule => ComparePredicate::Uge,
            ComparePredicate::Ugt => ComparePredicate::Ult,
            ComparePredicate::Uge => ComparePredicate::Ule,
            ComparePredicate::Slt => ComparePredicate::Sgt,
            ComparePredicate::Sle => ComparePredicate::Sge,
            ComparePredicate::Sgt => ComparePredicate::Slt,
            ComparePredicate::Sge => ComparePredicate::Sle,
        }
    }
}

impl fmt::Display for ComparePredicate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ComparePredicate::Eq => "eq",
            ComparePredicate::Ne => "ne",
            ComparePredicate::Ult => "ult",
            ComparePredicate::Ule => "ule",
            ComparePredicate::Ugt => "ugt",
            ComparePredicate::Uge => "uge",
            ComparePredicate::Slt => "slt",
            ComparePredicate::Sle => "sle",
            ComparePredicate::Sgt => "sgt",
            ComparePredicate::Sge => "sge",
        };
        write!(f, "{}", s)
    }
}

/// The callee of an `Operation::Call`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum CallTarget {
    Direct(String),
    Indirect(Value),
}

impl CallTarget {
    pub fn direct<S>(name: S) -> CallTarget
    where
        S: Into<String>,
    {
        CallTarget::Direct(name.into())
    }

    /// The name of the callee, if it is known statically.
    pub fn function_name(&self) -> Option<&str> {
        match self {
            CallTarget::Direct(name) => Some(name),
            CallTarget::Indirect(_) => None,
        }
    }
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CallTarget::Direct(name) => write!(f, "@{}", name),
            CallTarget::Indirect(value) => write!(f, "*{}", value),
        }
    }
}

/// An IL Operation updates some state.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Operation {
    /// Reserve stack memory for `count` objects of type `allocated`.
    Alloca {
        dst: Variable,
        allocated: Type,
        count: Value,
    },
    /// Load a value of `dst`'s type from the address in `pointer`.
    Load { dst: Variable, pointer: Value },
    /// Store `value` at the address in `pointer`.
    Store { pointer: Value, value: Value },
    Cast {
        dst: Variable,
        kind: CastKind,
        src: Value,
    },
    /// Compute an address. The first index scales `source`, each further
    /// index steps into the aggregate reached so far.
    GetElementPtr {
        dst: Variable,
        base: Value,
        source: Type,
        indices: Vec<Value>,
        inbounds: bool,
    },
    Binary {
        dst: Variable,
        op: BinaryOperator,
        lhs: Value,
        rhs: Value,
    },
    Compare {
        dst: Variable,
        predicate: ComparePredicate,
        lhs: Value,
        rhs: Value,
    },
    Select {
        dst: Variable,
        condition: Value,
        on_true: Value,
        on_false: Value,
    },
    /// Choose a value by the predecessor block control arrived from.
    Phi {
        dst: Variable,
        incoming: Vec<(Value, usize)>,
    },
    Call {
        dst: Option<Variable>,
        target: CallTarget,
        arguments: Vec<Value>,
    },
    Return { value: Option<Value> },
    Nop,
}

impl Operation {
    pub fn call<S>(dst: Option<Variable>, function: S, arguments: Vec<Value>) -> Operation
    where
        S: Into<String>,
    {
        Operation::Call {
            dst,
            target: CallTarget::direct(function),
            arguments,
        }
    }

    pub fn is_load(&self) -> bool {
        matches!(self, Operation::Load { .. })
    }

    pub fn is_store(&self) -> bool {
        matches!(self, Operation::Store { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Operation::Call { .. })
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Operation::Phi { .. })
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Operation::Return { .. })
    }

    /// Returns `true` if this is a direct call to `function`.
    pub fn is_call_to(&self, function: &str) -> bool {
        self.called_function() == Some(function)
    }

    /// The statically known callee of a call.
    pub fn called_function(&self) -> Option<&str> {
        match self {
            Operation::Call { target, .. } => target.function_name(),
            _ => None,
        }
    }

    /// The pointer dereferenced by a load or store.
    pub fn pointer_operand(&self) -> Option<&Value> {
        match self {
            Operation::Load { pointer, .. } | Operation::Store { pointer, .. } => Some(pointer),
            _ => None,
        }
    }

    /// Get the variable which this operation writes.
    pub fn variable_written(&self) -> Option<&Variable> {
        match self {
            Operation::Alloca { dst, .. }
            | Operation::Load { dst, .. }
            | Operation::Cast { dst, .. }
            | Operation::GetElementPtr { dst, .. }
            | Operation::Binary { dst, .. }
            | Operation::Compare { dst, .. }
            | Operation::Select { dst, .. }
            | Operation::Phi { dst, .. } => Some(dst),
            Operation::Call { dst, .. } => dst.as_ref(),
            Operation::Store { .. } | Operation::Return { .. } | Operation::Nop => None,
        }
    }

    /// Get the values this operation reads, in operand order.
    pub fn values_read(&self) -> Vec<&Value> {
        match self {
            Operation::Alloca { count, .. } => vec![count],
            Operation::Load { pointer, .. } => vec![pointer],
            Operation::Store { pointer, value } => vec![pointer, value],
            Operation::Cast { src, .. } => vec![src],
            Operation::GetElementPtr { base, indices, .. } => {
                let mut values = vec![base];
                values.extend(indices.iter());
                values
            }
            Operation::Binary { lhs, rhs, .. } | Operation::Compare { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            Operation::Select {
                condition,
                on_true,
                on_false,
                ..
            } => vec![condition, on_true, on_false],
            Operation::Phi { incoming, .. } => incoming.iter().map(|(value, _)| value).collect(),
            Operation::Call {
                target, arguments, ..
            } => {
                let mut values = Vec::new();
                if let CallTarget::Indirect(value) = target {
                    values.push(value);
                }
                values.extend(arguments.iter());
                values
            }
            Operation::Return { value } => value.iter().collect(),
            Operation::Nop => Vec::new(),
        }
    }

    /// Get mutable references to the values this operation reads.
    pub fn values_read_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Operation::Alloca { count, .. } => vec![count],
            Operation::Load { pointer, .. } => vec![pointer],
            Operation::Store { pointer, value } => vec![pointer, value],
            Operation::Cast { src, .. } => vec![src],
            Operation::GetElementPtr { base, indices, .. } => {
                let mut values = vec![base];
                values.extend(indices.iter_mut());
                values
            }
            Operation::Binary { lhs, rhs, .. } | Operation::Compare { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            Operation::Select {
                condition,
                on_true,
                on_false,
                ..
            } => vec![condition, on_true, on_false],
            Operation::Phi { incoming, .. } => {
                incoming.iter_mut().map(|(value, _)| value).collect()
            }
            Operation::Call {
                target, arguments, ..
            } => {
                let mut values = Vec::new();
                if let CallTarget::Indirect(value) = target {
                    values.push(value);
                }
                values.extend(arguments.iter_mut());
                values
            }
            Operation::Return { value } => value.iter_mut().collect(),
            Operation::Nop => Vec::new(),
        }
    }

    /// Get the variables this operation reads.
    pub fn variables_read(&self) -> Vec<&Variable> {
        self.values_read()
            .into_iter()
            .filter_map(|value| value.variable())
            .collect()
    }
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<String>>()
        .join(", ")
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operation::Alloca {
                dst,
                allocated,
                count,
            } => write!(f, "{} = alloca {}, {}", dst, allocated, count),
            Operation::Load { dst, pointer } => write!(f, "{} = [{}]", dst, pointer),
            Operation::Store { pointer, value } => write!(f, "[{}] = {}", pointer, value),
            Operation::Cast { dst, kind, src } => write!(f, "{} = {} {}", dst, kind, src),
            Operation::GetElementPtr {
                dst,
                base,
                source,
                indices,
                inbounds,
            } => write!(
                f,
                "{} = gep{} {}, {}, {}",
                dst,
                if *inbounds { " inbounds" } else { "" },
                source,
                base,
                join_values(indices)
            ),
            Operation::Binary { dst, op, lhs, rhs } => {
                write!(f, "{} = {} {}, {}", dst, op, lhs, rhs)
            }
            Operation::Compare {
                dst,
                predicate,
                lhs,
                rhs,
            } => write!(f, "{} = cmp {} {}, {}", dst, predicate, lhs, rhs),
            Operation::Select {
                dst,
                condition,
                on_true,
                on_false,
            } => write!(f, "{} = {} ? {} : {}", dst, condition, on_true, on_false),
            Operation::Phi { dst, incoming } => write!(
                f,
                "{} = phi [{}]",
                dst,
                incoming
                    .iter()
                    .map(|(value, block)| format!("{} 0x{:X}", value, block))
                    .collect::<Vec<String>>()
                    .join(", ")
            ),
            Operation::Call {
                dst,
                target,
                arguments,
            } => match dst {
                Some(dst) => write!(f, "{} = call {}({})", dst, target, join_values(arguments)),
                None => write!(f, "call {}({})", target, join_values(arguments)),
            },
            Operation::Return { value } => match value {
                Some(value) => write!(f, "ret {}", value),
                None => write!(f, "ret"),
            },
            Operation::Nop => write!(f, "nop"),
        }
    }
}
