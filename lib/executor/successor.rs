use crate::il;

/// Where control goes after an operation executes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Successor {
    /// Continue with the next instruction, or the next block.
    FallThrough,
    /// Return from the executing function.
    Return(Option<il::Constant>),
}

impl Successor {
    pub fn is_return(&self) -> bool {
        matches!(self, Successor::Return(_))
    }
}
