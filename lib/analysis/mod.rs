//! Static analyses over the IL.
//!
//! Every analysis works on one function at a time, except the call graph.

pub mod call_graph;
pub mod custody;
pub mod def_use;
pub mod fixed_point;
pub mod loops;
pub mod scalar_evolution;

pub use self::call_graph::{CallGraph, CallSite};
pub use self::custody::DataCustody;
pub use self::def_use::DefUse;
pub use self::loops::{LoopInfo, NaturalLoop};
pub use self::scalar_evolution::{Evolution, InductionVariable, LoopBound, ScalarEvolution};
