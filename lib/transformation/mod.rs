//! Transformations over the IL which preserve its semantics.

mod loop_simplify;
mod verify;

pub use self::loop_simplify::loop_simplify;
pub use self::verify::{verify_function, verify_program};
