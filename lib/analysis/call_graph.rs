//! Direct call sites of every function in a program.

use crate::il;
use crate::Error;
use std::collections::{BTreeMap, BTreeSet};

/// A direct call of a function.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallSite {
    caller: String,
    location: il::FunctionLocation,
    arguments: Vec<il::Value>,
}

impl CallSite {
    /// The name of the calling function.
    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn location(&self) -> &il::FunctionLocation {
        &self.location
    }

    pub fn arguments(&self) -> &[il::Value] {
        &self.arguments
    }

    pub fn argument(&self, index: usize) -> Option<&il::Value> {
        self.arguments.get(index)
    }
}

/// Callers of every function, and the functions whose address escapes.
#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    call_sites: BTreeMap<String, Vec<CallSite>>,
    address_taken: BTreeSet<String>,
}

impl CallGraph {
    pub fn new(program: &il::Program) -> Result<CallGraph, Error> {
        let mut call_sites: BTreeMap<String, Vec<CallSite>> = BTreeMap::new();
        let mut address_taken = BTreeSet::new();

        for function in program.functions() {
            for block in function.blocks() {
                for instruction in block.instructions() {
                    let location = il::FunctionLocation::new(block.index(), instruction.index());
                    if let il::Operation::Call {
                        target: il::CallTarget::Direct(callee),
                        arguments,
                        ..
                    } = instruction.operation()
                    {
                        call_sites
                            .entry(callee.clone())
                            .or_default()
                            .push(CallSite {
                                caller: function.name().to_string(),
                                location,
                                arguments: arguments.clone(),
                            });
                    }
                    for value in instruction.values_read() {
                        if let il::Value::Function(name) = value {
                            address_taken.insert(name.clone());
                        }
                    }
                }
            }
        }

        Ok(CallGraph {
            call_sites,
            address_taken,
        })
    }

    /// Every direct call of `callee`.
    pub fn call_sites(&self, callee: &str) -> &[CallSite] {
        self.call_sites
            .get(callee)
            .map(|sites| sites.as_slice())
            .unwrap_or(&[])
    }

    /// Returns `true` if the address of `function` is used as a value, so it
    /// may be called from sites we cannot see.
    pub fn is_address_taken(&self, function: &str) -> bool {
        self.address_taken.contains(function)
    }

    /// Returns `true` if every caller of `function` is known: it is not
    /// externally visible, its address is never taken, and it is called at
    /// least once.
    pub fn callers_are_known(&self, function: &il::Function) -> bool {
        !function.linkage().is_externally_visible()
            && !self.is_address_taken(function.name())
            && !self.call_sites(function.name()).is_empty()
    }
}
