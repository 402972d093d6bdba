//! A `Constant` holds a single integer value.
//!
//! Currently, only constant values upto 64-bits are supported.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A constant value for the IL
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Constant {
    value: u64,
    bits: usize,
}

impl Constant {
    /// Create a new `Constant` with the given value and bitness.
    pub fn new(value: u64, bits: usize) -> Constant {
        Constant {
            value: Constant::trim(value, bits),
            bits,
        }
    }

    fn trim(value: u64, bits: usize) -> u64 {
        if bits >= 64 {
            value
        } else {
            value & ((1 << bits) - 1)
        }
    }

    /// Get the value of this `Constant`.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Get the value of this `Constant`, sign-extended from its width.
    pub fn value_signed(&self) -> i64 {
        if self.bits == 0 || self.bits >= 64 {
            self.value as i64
        } else {
            let shift = 64 - self.bits;
            ((self.value << shift) as i64) >> shift
        }
    }

    /// Get the number of bits for this `Constant`.
    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:X}:{}", self.value, self.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_trimmed_to_width() {
        assert_eq!(Constant::new(0x1ff, 8).value(), 0xff);
        assert_eq!(Constant::new(u64::MAX, 64).value(), u64::MAX);
        assert_eq!(Constant::new(0xff, 8).value_signed(), -1);
        assert_eq!(Constant::new(0x7f, 8).value_signed(), 127);
    }
}
