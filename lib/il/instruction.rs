use crate::il::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An `Instruction` wraps an `Operation` with a block-unique index, an
/// optional comment, and metadata.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Instruction {
    operation: Operation,
    index: usize,
    comment: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl Instruction {
    pub fn new(index: usize, operation: Operation) -> Instruction {
        Instruction {
            operation,
            index,
            comment: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn operation_mut(&mut self) -> &mut Operation {
        &mut self.operation
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn set_comment(&mut self, comment: Option<String>) {
        self.comment = comment;
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|value| value.as_str())
    }

    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    pub fn set_metadata<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.insert(key.into(), value.into());
    }

    /// Builder form of `set_metadata`.
    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Instruction
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.set_metadata(key, value);
        self
    }

    pub fn all_metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn clone_new_index(&self, index: usize) -> Instruction {
        let mut clone = self.clone();
        clone.index = index;
        clone
    }

    pub fn variable_written(&self) -> Option<&Variable> {
        self.operation.variable_written()
    }

    pub fn values_read(&self) -> Vec<&Value> {
        self.operation.values_read()
    }

    pub fn variables_read(&self) -> Vec<&Variable> {
        self.operation.variables_read()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02X} {}", self.index, self.operation)?;
        if !self.metadata.is_empty() {
            write!(
                f,
                " !{{{}}}",
                self.metadata
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect::<Vec<String>>()
                    .join(", ")
            )?;
        }
        if let Some(ref comment) = self.comment {
            write!(f, " // {}", comment)?;
        }
        Ok(())
    }
}
