//! Concrete execution over IL.
//!
//! The executor replays a program, instrumented or not, on a [`Machine`]
//! whose runtime answers the calls instrumentation injected. A guard that
//! fails halts execution with `Error::GuardViolation`, so running a program
//! shows both what its guards allow and what they stop.

mod driver;
pub mod eval;
mod memory;
mod state;
mod successor;

pub use self::driver::{Driver, DEFAULT_STEP_LIMIT, MAX_CALL_DEPTH};
pub use self::memory::{
    Image, Machine, FUNCTION_STRIDE, GLOBAL_BASE, HEAP_BASE, HEAP_SIZE, STACK_BASE, STACK_SIZE,
    TEXT_BASE,
};
pub use self::state::State;
pub use self::successor::Successor;
