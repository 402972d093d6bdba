//! The concrete state of one executing function.

use crate::il;
use crate::Error;
use std::collections::BTreeMap;

/// The variables and arguments of one call.
#[derive(Debug, Clone)]
pub struct State {
    scalars: BTreeMap<String, il::Constant>,
    arguments: Vec<il::Constant>,
    /// The stack pointer when the call began.
    stack_pointer: u64,
}

impl State {
    pub fn new(arguments: Vec<il::Constant>, stack_pointer: u64) -> State {
        State {
            scalars: BTreeMap::new(),
            arguments,
            stack_pointer,
        }
    }

    /// Set the value of the given scalar to a concrete value.
    pub fn set_scalar<S: Into<String>>(&mut self, name: S, value: il::Constant) {
        self.scalars.insert(name.into(), value);
    }

    /// Get the concrete value of the given scalar.
    pub fn get_scalar(&self, name: &str) -> Option<&il::Constant> {
        self.scalars.get(name)
    }

    pub fn argument(&self, index: usize) -> Option<&il::Constant> {
        self.arguments.get(index)
    }

    pub fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    /// The value of an operand which does not name memory. Globals and
    /// functions are resolved by the caller.
    pub fn local(&self, value: &il::Value) -> Result<Option<il::Constant>, Error> {
        Ok(match value {
            il::Value::Variable(variable) => Some(
                self.get_scalar(variable.name())
                    .cloned()
                    .ok_or_else(|| {
                        Error::Executor(format!("{} used before it is defined", variable))
                    })?,
            ),
            il::Value::Argument(argument) => Some(
                self.argument(argument.index())
                    .cloned()
                    .ok_or_else(|| Error::Executor(format!("missing argument {}", argument)))?,
            ),
            il::Value::Constant(constant) => Some(constant.clone()),
            il::Value::Null => Some(il::Constant::new(0, il::POINTER_BITS)),
            il::Value::Global(_) | il::Value::Function(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locals_resolve_from_the_frame() {
        let mut state = State::new(vec![il::Constant::new(7, 32)], 0x9000);
        state.set_scalar("x", il::Constant::new(3, 8));

        let value = |v: il::Value| state.local(&v);
        assert_eq!(value(il::val_int("x", 8)).unwrap().unwrap().value(), 3);
        assert_eq!(
            value(il::Value::Argument(il::Argument::new(0, "n", il::Type::Integer(32))))
                .unwrap()
                .unwrap()
                .value(),
            7
        );
        assert!(value(il::val_int("y", 8)).is_err());
        assert!(value(il::global("g")).unwrap().is_none());
        assert_eq!(value(il::Value::Null).unwrap().unwrap().bits(), 64);
    }
}
