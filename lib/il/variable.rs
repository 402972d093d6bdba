use crate::il::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An SSA variable, written by exactly one instruction.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Variable {
    name: String,
    ty: Type,
}

impl Variable {
    pub fn new<S>(name: S, ty: Type) -> Variable
    where
        S: Into<String>,
    {
        Variable {
            name: name.into(),
            ty,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}:{}", self.name, self.ty)
    }
}

impl From<Variable> for Value {
    fn from(variable: Variable) -> Value {
        Value::Variable(variable)
    }
}

/// A formal argument of a `Function`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Argument {
    index: usize,
    name: String,
    ty: Type,
}

impl Argument {
    pub fn new<S>(index: usize, name: S, ty: Type) -> Argument
    where
        S: Into<String>,
    {
        Argument {
            index,
            name: name.into(),
            ty,
        }
    }

    /// The position of this argument in its function's signature.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%arg{}.{}:{}", self.index, self.name, self.ty)
    }
}

impl From<Argument> for Value {
    fn from(argument: Argument) -> Value {
        Value::Argument(argument)
    }
}
