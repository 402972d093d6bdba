use crate::graph;
use crate::il::*;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A basic block.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Block {
    /// The index of the block.
    index: usize,
    /// an internal counter for the next block-unique instruction.
    next_instruction_index: usize,
    /// The instructions for this block.
    instructions: Vec<Instruction>,
}

impl Block {
    pub(crate) fn new(index: usize) -> Block {
        Block {
            index,
            next_instruction_index: 0,
            instructions: Vec::new(),
        }
    }

    fn new_instruction_index(&mut self) -> usize {
        let instruction_index = self.next_instruction_index;
        self.next_instruction_index = instruction_index + 1;
        instruction_index
    }

    /// Returns the index of this block
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns this block's instructions
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instructions_mut(&mut self) -> &mut [Instruction] {
        &mut self.instructions
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The position in `instructions` of the instruction with the given
    /// index.
    pub fn position(&self, index: usize) -> Option<usize> {
        self.instructions
            .iter()
            .position(|instruction| instruction.index() == index)
    }

    /// Returns an instruction by index
    pub fn instruction(&self, index: usize) -> Result<&Instruction, Error> {
        self.instructions
            .iter()
            .find(|instruction| instruction.index() == index)
            .ok_or(Error::InstructionNotFound(self.index, index))
    }

    pub fn instruction_mut(&mut self, index: usize) -> Result<&mut Instruction, Error> {
        let block_index = self.index;
        self.instructions
            .iter_mut()
            .find(|instruction| instruction.index() == index)
            .ok_or(Error::InstructionNotFound(block_index, index))
    }

    /// Appends an operation and returns the new instruction.
    pub fn append_operation(&mut self, operation: Operation) -> &mut Instruction {
        let index = self.new_instruction_index();
        let position = self.instructions.len();
        self.instructions.insert(position, Instruction::new(index, operation));
        &mut self.instructions[position]
    }

    /// Inserts an operation at `position` in `instructions`.
    pub fn insert_operation(
        &mut self,
        position: usize,
        operation: Operation,
    ) -> Result<&mut Instruction, Error> {
        if position > self.instructions.len() {
            return Err(Error::Custom(format!(
                "Position {} is out of bounds for block 0x{:X}",
                position, self.index
            )));
        }
        let index = self.new_instruction_index();
        self.instructions
            .insert(position, Instruction::new(index, operation));
        Ok(&mut self.instructions[position])
    }

    /// Inserts an operation directly before the instruction with the given
    /// index.
    pub fn insert_before(
        &mut self,
        index: usize,
        operation: Operation,
    ) -> Result<&mut Instruction, Error> {
        let position = self
            .position(index)
            .ok_or(Error::InstructionNotFound(self.index, index))?;
        self.insert_operation(position, operation)
    }

    /// Inserts an operation directly after the instruction with the given
    /// index.
    pub fn insert_after(
        &mut self,
        index: usize,
        operation: Operation,
    ) -> Result<&mut Instruction, Error> {
        let position = self
            .position(index)
            .ok_or(Error::InstructionNotFound(self.index, index))?;
        self.insert_operation(position + 1, operation)
    }

    /// Deletes an instruction by its index
    pub fn remove_instruction(&mut self, index: usize) -> Result<Instruction, Error> {
        let position = self
            .position(index)
            .ok_or(Error::InstructionNotFound(self.index, index))?;
        Ok(self.instructions.remove(position))
    }

    /// The position new code must be inserted at to run last in this block.
    pub fn terminator_position(&self) -> usize {
        match self.instructions.last() {
            Some(instruction) if instruction.operation().is_return() => {
                self.instructions.len() - 1
            }
            _ => self.instructions.len(),
        }
    }

    /// The position of the first instruction which is not a phi.
    pub fn first_non_phi_position(&self) -> usize {
        self.instructions
            .iter()
            .position(|instruction| !instruction.operation().is_phi())
            .unwrap_or(self.instructions.len())
    }

    /// Clone this block and set a new index.
    pub fn clone_new_index(&self, index: usize) -> Block {
        let mut clone = self.clone();
        clone.index = index;
        clone
    }

    /// Adds an alloca operation to the end of this block.
    pub fn alloca(&mut self, dst: Variable, allocated: Type, count: Value) {
        self.append_operation(Operation::Alloca {
            dst,
            allocated,
            count,
        });
    }

    /// Adds a load operation to the end of this block.
    pub fn load(&mut self, dst: Variable, pointer: Value) {
        self.append_operation(Operation::Load { dst, pointer });
    }

    /// Adds a store operation to the end of this block.
    pub fn store(&mut self, pointer: Value, value: Value) {
        self.append_operation(Operation::Store { pointer, value });
    }

    pub fn cast(&mut self, dst: Variable, kind: CastKind, src: Value) {
        self.append_operation(Operation::Cast { dst, kind, src });
    }

    /// Adds an inbounds getelementptr operation to the end of this block.
    pub fn gep(&mut self, dst: Variable, source: Type, base: Value, indices: Vec<Value>) {
        self.append_operation(Operation::GetElementPtr {
            dst,
            base,
            source,
            indices,
            inbounds: true,
        });
    }

    pub fn binary(&mut self, dst: Variable, op: BinaryOperator, lhs: Value, rhs: Value) {
        self.append_operation(Operation::Binary { dst, op, lhs, rhs });
    }

    pub fn compare(&mut self, dst: Variable, predicate: ComparePredicate, lhs: Value, rhs: Value) {
        self.append_operation(Operation::Compare {
            dst,
            predicate,
            lhs,
            rhs,
        });
    }

    pub fn select(&mut self, dst: Variable, condition: Value, on_true: Value, on_false: Value) {
        self.append_operation(Operation::Select {
            dst,
            condition,
            on_true,
            on_false,
        });
    }

    /// Adds a phi operation to the end of this block.
    pub fn phi(&mut self, dst: Variable, incoming: Vec<(Value, usize)>) {
        self.append_operation(Operation::Phi { dst, incoming });
    }

    /// Adds a direct call to the end of this block.
    pub fn call<S>(&mut self, dst: Option<Variable>, function: S, arguments: Vec<Value>)
    where
        S: Into<String>,
    {
        self.append_operation(Operation::call(dst, function, arguments));
    }

    pub fn call_indirect(&mut self, dst: Option<Variable>, target: Value, arguments: Vec<Value>) {
        self.append_operation(Operation::Call {
            dst,
            target: CallTarget::Indirect(target),
            arguments,
        });
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.append_operation(Operation::Return { value });
    }

    pub fn nop(&mut self) {
        self.append_operation(Operation::Nop);
    }
}

impl graph::Vertex for Block {
    fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "[ Block: 0x{:X} ]", self.index)?;
        for instruction in self.instructions() {
            writeln!(f, "{}", instruction)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_keeps_indices_stable() {
        let mut block = Block::new(0);
        block.store(val_ptr("p"), const_(1, 32));
        block.ret(None);

        let inserted = block
            .insert_before(0, Operation::call(None, "hook", vec![val_ptr("p")]))
            .unwrap()
            .index();

        assert_eq!(inserted, 2);
        assert_eq!(block.position(0), Some(1));
        assert_eq!(block.instructions()[0].index(), 2);
        assert_eq!(block.terminator_position(), 2);

        block.insert_after(0, Operation::Nop).unwrap();
        assert_eq!(block.instructions()[2].operation(), &Operation::Nop);
        assert!(block.insert_before(17, Operation::Nop).is_err());
    }

    #[test]
    fn first_non_phi_position() {
        let mut block = Block::new(1);
        block.phi(int("i", 64), vec![(const_(0, 64), 0)]);
        block.nop();
        assert_eq!(block.first_non_phi_position(), 1);
    }
}
