//! Owned locations of instructions.
//!
//! A `FunctionLocation` names an instruction inside one function. A
//! `ProgramLocation` adds the name of that function.

use crate::il::*;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The location of an `Instruction` in a `Function`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct FunctionLocation {
    block: usize,
    instruction: usize,
}

impl FunctionLocation {
    pub fn new(block: usize, instruction: usize) -> FunctionLocation {
        FunctionLocation { block, instruction }
    }

    /// The index of the block holding the instruction.
    pub fn block(&self) -> usize {
        self.block
    }

    /// The index, not position, of the instruction in its block.
    pub fn instruction(&self) -> usize {
        self.instruction
    }

    /// Apply this location to a function.
    pub fn apply<'f>(&self, function: &'f Function) -> Result<&'f Instruction, Error> {
        function.control_flow_graph()?.instruction(self)
    }
}

impl fmt::Display for FunctionLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:X}:{:02X}", self.block, self.instruction)
    }
}

/// The location of an `Instruction` in a `Program`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ProgramLocation {
    function: String,
    location: FunctionLocation,
}

impl ProgramLocation {
    pub fn new<S>(function: S, location: FunctionLocation) -> ProgramLocation
    where
        S: Into<String>,
    {
        ProgramLocation {
            function: function.into(),
            location,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn function_location(&self) -> &FunctionLocation {
        &self.location
    }

    /// Apply this location to a program.
    pub fn apply<'p>(&self, program: &'p Program) -> Result<&'p Instruction, Error> {
        self.location.apply(program.function_or_err(&self.function)?)
    }
}

impl fmt::Display for ProgramLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}:{}", self.function, self.location)
    }
}
