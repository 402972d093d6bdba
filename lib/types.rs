//! Useful types used across both the compile-time and run-time halves.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of memory access a guard validates.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    pub fn from_is_write(is_write: bool) -> AccessKind {
        if is_write {
            AccessKind::Write
        } else {
            AccessKind::Read
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, AccessKind::Write)
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AccessKind::Read => write!(f, "read"),
            AccessKind::Write => write!(f, "write"),
        }
    }
}
