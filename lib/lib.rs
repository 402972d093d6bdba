//! CARAT: compiler-assisted region tracking for identity-mapped memory.
//!
//! CARAT has two halves which only make sense together.
//!
//! At compile time, passes over the IL in [`il`] keep a runtime informed of
//! every allocation, free, global and pointer escape, and insert guards in
//! front of memory accesses. A forward dataflow analysis and loop reasoning in
//! [`analysis`] decide which guards are redundant and which can be hoisted out
//! of loops. See [`instrument`].
//!
//! At run time, an address space in [`runtime`] tracks every live region,
//! enforces non-overlap and permissions, answers guard queries, and moves or
//! resizes regions while the guarded program keeps running.
//!
//! [`executor`] interprets IL concretely against a runtime, which lets an
//! instrumented program be replayed and its guards observed.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod analysis;
pub mod executor;
pub mod graph;
pub mod il;
pub mod instrument;
pub mod runtime;
#[cfg(test)]
mod tests;
pub mod transformation;
mod types;

pub use types::AccessKind;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("An error in the analysis: {0}")]
    Analysis(String),
    #[error("Control flow graph has no entry block")]
    ControlFlowGraphEntryNotFound,
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("Executor error: {0}")]
    Executor(String),
    #[error("Executor exceeded the limit of {0} steps")]
    ExecutorStepLimit(u64),
    #[error("Function `{0}` has no body")]
    FunctionHasNoBody(String),
    #[error("Function `{0}` not found")]
    FunctionNotFound(String),
    #[error("Unable to find edge {0} -> {1}")]
    GraphEdgeNotFound(usize, usize),
    #[error("Vertex {0} not found")]
    GraphVertexNotFound(usize),
    #[error("Guard violation: {access} of 0x{address:x}")]
    GuardViolation { address: u64, access: AccessKind },
    #[error("Instruction {1} not found in block {0}")]
    InstructionNotFound(usize, usize),
    #[error("Instrumentation failed: {0}")]
    Instrumentation(String),
    #[error("Invalid region: {0}")]
    InvalidRegion(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Memory fault at 0x{0:x}")]
    MemoryFault(u64),
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("Growing region 0x{0:x} collides with region 0x{1:x}")]
    RegionCollision(u64, u64),
    #[error("Region 0x{0:x} not found")]
    RegionNotFound(u64),
    #[error("Region 0x{0:x} overlaps a tracked region")]
    RegionOverlap(u64),
    #[error("Region 0x{0:x} is pinned")]
    RegionPinned(u64),
    #[error("Unexpected exception in address space `{0}`: {1}")]
    UnexpectedException(String, String),
    #[error("Verification of `{0}` failed: {1}")]
    Verification(String, String),
}

impl From<&str> for Error {
    fn from(s: &str) -> Error {
        Error::Custom(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::Custom(s)
    }
}
