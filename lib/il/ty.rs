//! Types and their in-memory layout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The width of every pointer, in bits.
pub const POINTER_BITS: usize = 64;

/// The type of an IL value.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Type {
    Void,
    Integer(usize),
    /// An opaque pointer.
    Pointer,
    Array(Box<Type>, u64),
    Struct(Vec<Type>),
    Function,
}

fn align_to(offset: u64, alignment: u64) -> u64 {
    (offset + alignment - 1) / alignment * alignment
}

impl Type {
    pub fn array(element: Type, length: u64) -> Type {
        Type::Array(Box::new(element), length)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Integer(_))
    }

    /// The width of a first-class scalar, `None` for aggregates.
    pub fn bits(&self) -> Option<usize> {
        match self {
            Type::Integer(bits) => Some(*bits),
            Type::Pointer => Some(POINTER_BITS),
            _ => None,
        }
    }

    /// The ABI alignment of this type, in bytes.
    pub fn alignment(&self) -> u64 {
        match self {
            Type::Void | Type::Function => 1,
            Type::Integer(bits) => {
                let bytes = ((*bits as u64) + 7) / 8;
                bytes.max(1).next_power_of_two().min(8)
            }
            Type::Pointer => 8,
            Type::Array(element, _) => element.alignment(),
            Type::Struct(fields) => fields.iter().map(|f| f.alignment()).max().unwrap_or(1),
        }
    }

    /// The number of bytes an object of this type occupies, including tail
    /// padding.
    pub fn size_in_bytes(&self) -> u64 {
        match self {
            Type::Void | Type::Function => 0,
            Type::Integer(bits) => align_to((*bits as u64 + 7) / 8, self.alignment()),
            Type::Pointer => 8,
            Type::Array(element, length) => element.size_in_bytes() * length,
            Type::Struct(fields) => {
                let mut offset = 0;
                for field in fields {
                    offset = align_to(offset, field.alignment()) + field.size_in_bytes();
                }
                align_to(offset, self.alignment())
            }
        }
    }

    /// The byte offset of field `index` in a struct.
    pub fn field_offset(&self, index: usize) -> Option<u64> {
        match self {
            Type::Struct(fields) if index < fields.len() => {
                let mut offset = 0;
                for field in &fields[0..index] {
                    offset = align_to(offset, field.alignment()) + field.size_in_bytes();
                }
                Some(align_to(offset, fields[index].alignment()))
            }
            _ => None,
        }
    }

    /// The type reached by indexing into an aggregate.
    pub fn element_type(&self, index: usize) -> Option<&Type> {
        match self {
            Type::Array(element, _) => Some(element),
            Type::Struct(fields) => fields.get(index),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Integer(bits) => write!(f, "i{}", bits),
            Type::Pointer => write!(f, "ptr"),
            Type::Array(element, length) => write!(f, "[{} x {}]", length, element),
            Type::Struct(fields) => write!(
                f,
                "{{{}}}",
                fields
                    .iter()
                    .map(|field| field.to_string())
                    .collect::<Vec<String>>()
                    .join(", ")
            ),
            Type::Function => write!(f, "fn"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_layout() {
        assert_eq!(Type::Integer(1).size_in_bytes(), 1);
        assert_eq!(Type::Integer(24).size_in_bytes(), 4);
        assert_eq!(Type::Integer(64).alignment(), 8);
        assert_eq!(Type::Pointer.size_in_bytes(), 8);
    }

    #[test]
    fn struct_layout_includes_padding() {
        // { i8, i32, i8 } -> 0, 4, 8 and a total of 12
        let ty = Type::Struct(vec![Type::Integer(8), Type::Integer(32), Type::Integer(8)]);

        assert_eq!(ty.field_offset(0), Some(0));
        assert_eq!(ty.field_offset(1), Some(4));
        assert_eq!(ty.field_offset(2), Some(8));
        assert_eq!(ty.size_in_bytes(), 12);
        assert_eq!(ty.field_offset(3), None);
    }

    #[test]
    fn array_layout() {
        let ty = Type::array(Type::Struct(vec![Type::Pointer, Type::Integer(16)]), 10);
        assert_eq!(ty.size_in_bytes(), 160);
        assert_eq!(ty.to_string(), "[10 x {ptr, i16}]");
    }
}
