//! An `Edge` is a direct edge between `Block` in `ControlFlowGraph`
//!
//! An IL `Edge` has an optional `Condition`. When the condition is present,
//! the `Edge` is taken only when its value tests the way the condition says:
//! nonzero for `Condition::True`, zero for `Condition::False`. When the
//! condition is not present, the `Edge` is unconditional and will always be
//! taken.
//!
//! To create a new edge, call `ControlFlowGraph::unconditional_edge` or
//! `ControlFlowGraph::conditional_edge`.

use crate::graph;
use crate::il::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The guard of a conditional `Edge`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Condition {
    /// Taken when the value is nonzero.
    True(Value),
    /// Taken when the value is zero.
    False(Value),
}

impl Condition {
    pub fn value(&self) -> &Value {
        match self {
            Condition::True(value) | Condition::False(value) => value,
        }
    }

    pub fn value_mut(&mut self) -> &mut Value {
        match self {
            Condition::True(value) | Condition::False(value) => value,
        }
    }

    /// Returns `true` if the edge is taken when the condition's value is
    /// nonzero.
    pub fn when_true(&self) -> bool {
        matches!(self, Condition::True(_))
    }

    /// Returns `true` if a concrete value for the condition takes the edge.
    pub fn is_satisfied_by(&self, value: u64) -> bool {
        match self {
            Condition::True(_) => value != 0,
            Condition::False(_) => value == 0,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Condition::True(value) => write!(f, "{}", value),
            Condition::False(value) => write!(f, "!{}", value),
        }
    }
}

/// Edge between IL blocks
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Edge {
    head: usize,
    tail: usize,
    condition: Option<Condition>,
    comment: Option<String>,
}

impl Edge {
    pub(crate) fn new(head: usize, tail: usize, condition: Option<Condition>) -> Edge {
        Edge {
            head,
            tail,
            condition,
            comment: None,
        }
    }

    /// Retrieve the condition for this `Edge`.
    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    /// Retrieve a mutable reference to the condition for this `Edge`
    pub fn condition_mut(&mut self) -> Option<&mut Condition> {
        self.condition.as_mut()
    }

    /// Retrieve the index of the head `Vertex` for this `Edge`.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Retrieve the index of the tail `Vertex` for this `Edge`.
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Set the comment for this `Edge`.
    pub fn set_comment(&mut self, comment: Option<String>) {
        self.comment = comment;
    }

    /// Get the comment for this `Edge`.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref comment) = self.comment {
            writeln!(f, "// {}", comment)?
        }
        if let Some(ref condition) = self.condition {
            write!(
                f,
                "(0x{:X}->0x{:X}) ? ({})",
                self.head, self.tail, condition
            )?
        } else {
            write!(f, "(0x{:X}->0x{:X})", self.head, self.tail)?
        }
        Ok(())
    }
}

impl graph::Edge for Edge {
    fn head(&self) -> usize {
        self.head
    }
    fn tail(&self) -> usize {
        self.tail
    }
}
