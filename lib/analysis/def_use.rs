//! Definition and use locations of SSA variables.

use crate::il;
use crate::Error;
use rustc_hash::FxHashMap;

/// Definitions and uses of every variable of one function.
///
/// The IL is in SSA form, so every variable has at most one definition.
#[derive(Clone, Debug)]
pub struct DefUse<'f> {
    function: &'f il::Function,
    definitions: FxHashMap<&'f il::Variable, il::FunctionLocation>,
    uses: FxHashMap<&'f il::Variable, Vec<il::FunctionLocation>>,
}

impl<'f> DefUse<'f> {
    /// Compute definitions and uses for the given function.
    pub fn new(function: &'f il::Function) -> Result<DefUse<'f>, Error> {
        let mut definitions = FxHashMap::default();
        let mut uses: FxHashMap<&'f il::Variable, Vec<il::FunctionLocation>> =
            FxHashMap::default();

        for block in function.control_flow_graph()?.blocks() {
            for instruction in block.instructions() {
                let location = il::FunctionLocation::new(block.index(), instruction.index());
                if let Some(variable) = instruction.variable_written() {
                    if definitions.insert(variable, location).is_some() {
                        return Err(Error::Analysis(format!(
                            "{} is defined more than once in {}",
                            variable,
                            function.name()
                        )));
                    }
                }
                for variable in instruction.variables_read() {
                    uses.entry(variable).or_default().push(location);
                }
            }
        }

        Ok(DefUse {
            function,
            definitions,
            uses,
        })
    }

    pub fn function(&self) -> &'f il::Function {
        self.function
    }

    /// The location of the instruction defining `variable`.
    pub fn definition(&self, variable: &il::Variable) -> Option<il::FunctionLocation> {
        self.definitions.get(variable).cloned()
    }

    /// The instruction defining `variable`.
    pub fn defining_instruction(&self, variable: &il::Variable) -> Option<&'f il::Instruction> {
        let location = self.definitions.get(variable)?;
        location.apply(self.function).ok()
    }

    /// The operation defining the value, if the value is a variable.
    pub fn defining_operation(&self, value: &il::Value) -> Option<&'f il::Operation> {
        value
            .variable()
            .and_then(|variable| self.defining_instruction(variable))
            .map(|instruction| instruction.operation())
    }

    /// Every location reading `variable`.
    pub fn uses(&self, variable: &il::Variable) -> &[il::FunctionLocation] {
        self.uses
            .get(variable)
            .map(|uses| uses.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::*;

    #[test]
    fn definitions_and_uses() {
        let mut cfg = ControlFlowGraph::new();
        let index = {
            let block = cfg.new_block().unwrap();
            block.alloca(ptr("slot"), Type::Integer(32), const_(1, 64));
            block.store(val_ptr("slot"), const_(7, 32));
            block.load(int("x", 32), val_ptr("slot"));
            block.ret(Some(val_int("x", 32)));
            block.index()
        };
        cfg.set_entry(index).unwrap();
        let function = Function::new("f", vec![], Type::Integer(32), cfg);

        let def_use = DefUse::new(&function).unwrap();

        assert_eq!(
            def_use.definition(&ptr("slot")),
            Some(FunctionLocation::new(index, 0))
        );
        assert_eq!(def_use.uses(&ptr("slot")).len(), 2);
        assert!(def_use
            .defining_operation(&val_int("x", 32))
            .unwrap()
            .is_load());
        assert!(def_use.definition(&ptr("missing")).is_none());
    }

    #[test]
    fn double_definition_is_an_error() {
        let mut cfg = ControlFlowGraph::new();
        let index = {
            let block = cfg.new_block().unwrap();
            block.load(int("x", 32), val_ptr("p"));
            block.load(int("x", 32), val_ptr("p"));
            block.index()
        };
        cfg.set_entry(index).unwrap();
        let function = Function::new("f", vec![], Type::Void, cfg);

        assert!(DefUse::new(&function).is_err());
    }
}
