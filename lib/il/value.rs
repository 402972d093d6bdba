use crate::il::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An operand of an IL instruction.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Value {
    Variable(Variable),
    Argument(Argument),
    /// The address of a global variable.
    Global(String),
    /// The address of a function.
    Function(String),
    Constant(Constant),
    Null,
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Value::Variable(variable) => variable.ty().clone(),
            Value::Argument(argument) => argument.ty().clone(),
            Value::Global(_) | Value::Function(_) | Value::Null => Type::Pointer,
            Value::Constant(constant) => Type::Integer(constant.bits()),
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.ty().is_pointer()
    }

    pub fn variable(&self) -> Option<&Variable> {
        match self {
            Value::Variable(variable) => Some(variable),
            _ => None,
        }
    }

    pub fn argument(&self) -> Option<&Argument> {
        match self {
            Value::Argument(argument) => Some(argument),
            _ => None,
        }
    }

    pub fn constant(&self) -> Option<&Constant> {
        match self {
            Value::Constant(constant) => Some(constant),
            _ => None,
        }
    }

    /// Values which are the same at every point of the function they appear
    /// in: constants, null, and the addresses of globals and functions.
    pub fn is_immutable(&self) -> bool {
        matches!(
            self,
            Value::Global(_) | Value::Function(_) | Value::Constant(_) | Value::Null
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Variable(variable) => variable.fmt(f),
            Value::Argument(argument) => argument.fmt(f),
            Value::Global(name) => write!(f, "@{}", name),
            Value::Function(name) => write!(f, "@{}()", name),
            Value::Constant(constant) => constant.fmt(f),
            Value::Null => write!(f, "null"),
        }
    }
}

impl From<Constant> for Value {
    fn from(constant: Constant) -> Value {
        Value::Constant(constant)
    }
}
