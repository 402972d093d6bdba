//! A representation of a module, holding every `Function` and
//! `GlobalVariable` by name.

use crate::il::*;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A collection of functions and globals.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Program {
    functions: BTreeMap<String, Function>,
    #[serde(default)]
    globals: BTreeMap<String, GlobalVariable>,
}

impl Program {
    /// Creates a new, empty `Program`.
    pub fn new() -> Program {
        Program {
            functions: BTreeMap::new(),
            globals: BTreeMap::new(),
        }
    }

    /// Get a function by name.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Get a mutable reference to a function by name.
    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.get_mut(name)
    }

    /// Get a function by name, or `Error::FunctionNotFound`.
    pub fn function_or_err(&self, name: &str) -> Result<&Function, Error> {
        self.function(name)
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))
    }

    /// Get all functions in this program, ordered by name.
    pub fn functions(&self) -> Vec<&Function> {
        self.functions.values().collect()
    }

    pub fn functions_mut(&mut self) -> Vec<&mut Function> {
        self.functions.values_mut().collect()
    }

    /// The names of every function with a body.
    pub fn defined_function_names(&self) -> Vec<String> {
        self.functions
            .values()
            .filter(|function| !function.is_declaration())
            .map(|function| function.name().to_string())
            .collect()
    }

    /// Add a function, replacing any function of the same name.
    pub fn add_function(&mut self, function: Function) {
        self.functions.insert(function.name().to_string(), function);
    }

    /// Get a global by name.
    pub fn global(&self, name: &str) -> Option<&GlobalVariable> {
        self.globals.get(name)
    }

    pub fn globals(&self) -> Vec<&GlobalVariable> {
        self.globals.values().collect()
    }

    /// Add a global, replacing any global of the same name.
    pub fn add_global(&mut self, global: GlobalVariable) {
        self.globals.insert(global.name().to_string(), global);
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for global in self.globals.values() {
            writeln!(f, "{}", global)?;
        }
        for function in self.functions.values() {
            writeln!(f, "{}", function)?;
        }
        Ok(())
    }
}
