//! Concrete evaluation of the arithmetic, comparison and conversion
//! operations of the IL.

use crate::il;
use crate::Error;

fn bits_of(ty: &il::Type) -> Result<usize, Error> {
    ty.bits()
        .ok_or_else(|| Error::Executor(format!("{} is not a scalar type", ty)))
}

fn boolean(value: bool) -> il::Constant {
    il::Constant::new(value as u64, 1)
}

/// Evaluate a binary operation. The result has the width of `lhs`.
pub fn binary(
    op: il::BinaryOperator,
    lhs: &il::Constant,
    rhs: &il::Constant,
) -> Result<il::Constant, Error> {
    let bits = lhs.bits();
    let (l, r) = (lhs.value(), rhs.value());
    let shift = |amount: u64| -> Result<u32, Error> {
        if amount >= bits as u64 {
            Err(Error::Executor(format!(
                "shift of {} bits by {} bits",
                bits, amount
            )))
        } else {
            Ok(amount as u32)
        }
    };
    let nonzero = || {
        if r == 0 {
            Err(Error::Executor("Division by zero".to_string()))
        } else {
            Ok(())
        }
    };

    let value = match op {
        il::BinaryOperator::Add => l.wrapping_add(r),
        il::BinaryOperator::Sub => l.wrapping_sub(r),
        il::BinaryOperator::Mul => l.wrapping_mul(r),
        il::BinaryOperator::Udiv => {
            nonzero()?;
            l / r
        }
        il::BinaryOperator::Sdiv => {
            nonzero()?;
            lhs.value_signed().wrapping_div(rhs.value_signed()) as u64
        }
        il::BinaryOperator::Urem => {
            nonzero()?;
            l % r
        }
        il::BinaryOperator::Shl => l.wrapping_shl(shift(r)?),
        il::BinaryOperator::Lshr => l.wrapping_shr(shift(r)?),
        il::BinaryOperator::Ashr => lhs.value_signed().wrapping_shr(shift(r)?) as u64,
        il::BinaryOperator::And => l & r,
        il::BinaryOperator::Or => l | r,
        il::BinaryOperator::Xor => l ^ r,
    };
    Ok(il::Constant::new(value, bits))
}

/// Evaluate a comparison to a 1-bit constant.
pub fn compare(
    predicate: il::ComparePredicate,
    lhs: &il::Constant,
    rhs: &il::Constant,
) -> il::Constant {
    let (l, r) = (lhs.value(), rhs.value());
    let (ls, rs) = (lhs.value_signed(), rhs.value_signed());
    boolean(match predicate {
        il::ComparePredicate::Eq => l == r,
        il::ComparePredicate::Ne => l != r,
        il::ComparePredicate::Ult => l < r,
        il::ComparePredicate::Ule => l <= r,
        il::ComparePredicate::Ugt => l > r,
        il::ComparePredicate::Uge => l >= r,
        il::ComparePredicate::Slt => ls < rs,
        il::ComparePredicate::Sle => ls <= rs,
        il::ComparePredicate::Sgt => ls > rs,
        il::ComparePredicate::Sge => ls >= rs,
    })
}

/// Convert `src` to `ty`.
pub fn cast(kind: il::CastKind, src: &il::Constant, ty: &il::Type) -> Result<il::Constant, Error> {
    let bits = bits_of(ty)?;
    Ok(match kind {
        il::CastKind::SignExtend => il::Constant::new(src.value_signed() as u64, bits),
        il::CastKind::Bitcast
        | il::CastKind::PtrToInt
        | il::CastKind::IntToPtr
        | il::CastKind::ZeroExtend
        | il::CastKind::Truncate => il::Constant::new(src.value(), bits),
    })
}

/// The byte offset a `GetElementPtr` adds to its base.
pub fn element_offset(source: &il::Type, indices: &[il::Constant]) -> Result<u64, Error> {
    let mut indices = indices.iter();
    let mut offset = match indices.next() {
        Some(index) => (index.value_signed() as u64).wrapping_mul(source.size_in_bytes()),
        None => return Ok(0),
    };

    let mut ty = source;
    for index in indices {
        match ty {
            il::Type::Struct(_) => {
                let field = index.value() as usize;
                offset = offset.wrapping_add(ty.field_offset(field).ok_or_else(|| {
                    Error::Executor(format!("{} has no field {}", ty, field))
                })?);
                ty = ty.element_type(field).ok_or_else(|| {
                    Error::Executor(format!("{} has no field {}", ty, field))
                })?;
            }
            il::Type::Array(element, _) => {
                offset = offset.wrapping_add(
                    (index.value_signed() as u64).wrapping_mul(element.size_in_bytes()),
                );
                ty = &**element;
            }
            _ => {
                return Err(Error::Executor(format!(
                    "cannot index into {}",
                    ty
                )))
            }
        }
    }
    Ok(offset)
}
