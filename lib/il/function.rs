use crate::il::*;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The visibility of a function or global outside of its module.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Linkage {
    External,
    Weak,
    Internal,
    Private,
}

impl Linkage {
    /// Returns `true` if code outside the module may reference the symbol.
    pub fn is_externally_visible(&self) -> bool {
        matches!(self, Linkage::External | Linkage::Weak)
    }
}

impl Default for Linkage {
    fn default() -> Linkage {
        Linkage::External
    }
}

/// A function with a signature and, unless it is only declared, a body.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Function {
    // The name of the function
    name: String,
    arguments: Vec<Argument>,
    return_type: Type,
    #[serde(default)]
    linkage: Linkage,
    // The `ControlFlowGraph` capturing semantics of the function
    control_flow_graph: Option<ControlFlowGraph>,
}

impl Function {
    /// Create a function defined by `control_flow_graph`.
    pub fn new<S>(
        name: S,
        arguments: Vec<Argument>,
        return_type: Type,
        control_flow_graph: ControlFlowGraph,
    ) -> Function
    where
        S: Into<String>,
    {
        Function {
            name: name.into(),
            arguments,
            return_type,
            linkage: Linkage::External,
            control_flow_graph: Some(control_flow_graph),
        }
    }

    /// Create a function which is declared, but defined elsewhere.
    pub fn declaration<S>(name: S, arguments: Vec<Argument>, return_type: Type) -> Function
    where
        S: Into<String>,
    {
        Function {
            name: name.into(),
            arguments,
            return_type,
            linkage: Linkage::External,
            control_flow_graph: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn argument(&self, index: usize) -> Option<&Argument> {
        self.arguments.get(index)
    }

    pub fn return_type(&self) -> &Type {
        &self.return_type
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub fn set_linkage(&mut self, linkage: Linkage) {
        self.linkage = linkage;
    }

    /// Builder form of `set_linkage`.
    pub fn with_linkage(mut self, linkage: Linkage) -> Function {
        self.linkage = linkage;
        self
    }

    pub fn is_declaration(&self) -> bool {
        self.control_flow_graph.is_none()
    }

    pub fn control_flow_graph(&self) -> Result<&ControlFlowGraph, Error> {
        self.control_flow_graph
            .as_ref()
            .ok_or_else(|| Error::FunctionHasNoBody(self.name.clone()))
    }

    pub fn control_flow_graph_mut(&mut self) -> Result<&mut ControlFlowGraph, Error> {
        let name = &self.name;
        self.control_flow_graph
            .as_mut()
            .ok_or_else(|| Error::FunctionHasNoBody(name.clone()))
    }

    pub fn block(&self, index: usize) -> Result<&Block, Error> {
        self.control_flow_graph()?.block(index)
    }

    /// Every block of this function, none for a declaration.
    pub fn blocks(&self) -> Vec<&Block> {
        self.control_flow_graph
            .as_ref()
            .map(|cfg| cfg.blocks())
            .unwrap_or_default()
    }

    pub fn edge(&self, head: usize, tail: usize) -> Result<&Edge, Error> {
        self.control_flow_graph()?.edge(head, tail)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "fn @{}({}) -> {}",
            self.name,
            self.arguments
                .iter()
                .map(|argument| argument.to_string())
                .collect::<Vec<String>>()
                .join(", "),
            self.return_type
        )?;
        match self.control_flow_graph {
            Some(ref cfg) => write!(f, " {{\n{}}}", cfg),
            None => write!(f, ";"),
        }
    }
}
