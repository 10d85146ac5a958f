//! Binary and unary operators
//!
//! Same-tag i32, i64 and f64 operands take a direct path. Everything else
//! goes through [`promote`], which picks the common type by rank in the
//! lattice i8 < u8 < i16 < u16 < i32 < u32 < i64 < u64 < f32 < f64.
//!
//! Integer arithmetic wraps at the width of the result type. Shift amounts
//! are taken modulo the width. `/` always produces f64.

use core::cmp::Ordering;
use core::ffi::c_void;

use crate::convert::to_bool;
use crate::error::{RtError, RtResult};
use crate::exception::abi_value;
use crate::string;
use crate::value::{Value, ValueTag, values_equal};

// =============================================================================
// Opcodes
// =============================================================================

/// Binary opcodes, numbered as generated code passes them.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    Equal = 5,
    NotEqual = 6,
    Less = 7,
    LessEqual = 8,
    Greater = 9,
    GreaterEqual = 10,
    And = 11,
    Or = 12,
    BitAnd = 13,
    BitOr = 14,
    BitXor = 15,
    Shl = 16,
    Shr = 17,
}

impl BinaryOp {
    pub fn from_u8(raw: u8) -> Option<Self> {
        use BinaryOp::*;
        const ALL: [BinaryOp; 18] = [
            Add, Sub, Mul, Div, Mod, Equal, NotEqual, Less, LessEqual, Greater, GreaterEqual,
            And, Or, BitAnd, BitOr, BitXor, Shl, Shr,
        ];
        ALL.get(raw as usize).copied()
    }

    fn is_ordering(self) -> bool {
        matches!(
            self,
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual
        )
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            BinaryOp::Less => ord == Ordering::Less,
            BinaryOp::LessEqual => ord != Ordering::Greater,
            BinaryOp::Greater => ord == Ordering::Greater,
            BinaryOp::GreaterEqual => ord != Ordering::Less,
            _ => false,
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not = 0,
    Negate = 1,
    BitNot = 2,
}

impl UnaryOp {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(UnaryOp::Not),
            1 => Some(UnaryOp::Negate),
            2 => Some(UnaryOp::BitNot),
            _ => None,
        }
    }
}

// =============================================================================
// Promotion
// =============================================================================

/// Common type of a mixed numeric operation, or `None` when either side is
/// not numeric. Runes take part as i32.
pub fn promote(a: ValueTag, b: ValueTag) -> Option<ValueTag> {
    let ra = a.rank()?;
    let rb = b.rank()?;
    if a == ValueTag::F64 || b == ValueTag::F64 {
        return Some(ValueTag::F64);
    }
    if a == ValueTag::F32 || b == ValueTag::F32 {
        let other = if a == ValueTag::F32 { b } else { a };
        return Some(match other {
            ValueTag::I64 | ValueTag::U64 => ValueTag::F64,
            _ => ValueTag::F32,
        });
    }
    let a = if a == ValueTag::Rune { ValueTag::I32 } else { a };
    let b = if b == ValueTag::Rune { ValueTag::I32 } else { b };
    Some(if ra >= rb { a } else { b })
}

/// Integer payload, including runes.
fn int_of(v: Value) -> Option<i128> {
    match v {
        Value::Rune(r) => Some(r as i128),
        Value::U64(u) => Some(u as i128),
        other => other.as_i64().map(|i| i as i128),
    }
}

/// Truncate `v` to the width of `tag` and extend it back.
fn normalize(tag: ValueTag, v: i128) -> i128 {
    match tag {
        ValueTag::I8 => v as i8 as i128,
        ValueTag::I16 => v as i16 as i128,
        ValueTag::I32 => v as i32 as i128,
        ValueTag::U8 => v as u8 as i128,
        ValueTag::U16 => v as u16 as i128,
        ValueTag::U32 => v as u32 as i128,
        ValueTag::U64 => v as u64 as i128,
        _ => v as i64 as i128,
    }
}

fn make_int(tag: ValueTag, v: i128) -> Value {
    match tag {
        ValueTag::I8 => Value::I8(v as i8),
        ValueTag::I16 => Value::I16(v as i16),
        ValueTag::I32 => Value::I32(v as i32),
        ValueTag::U8 => Value::U8(v as u8),
        ValueTag::U16 => Value::U16(v as u16),
        ValueTag::U32 => Value::U32(v as u32),
        ValueTag::U64 => Value::U64(v as u64),
        _ => Value::I64(v as i64),
    }
}

fn make_float(tag: ValueTag, f: f64) -> Value {
    if tag == ValueTag::F32 {
        Value::F32(f as f32)
    } else {
        Value::F64(f)
    }
}

// =============================================================================
// Binary operations
// =============================================================================

#[inline]
fn i32_fast(op: BinaryOp, l: i32, r: i32) -> Option<RtResult<Value>> {
    let v = match op {
        BinaryOp::Add => Value::I32(l.wrapping_add(r)),
        BinaryOp::Sub => Value::I32(l.wrapping_sub(r)),
        BinaryOp::Mul => Value::I32(l.wrapping_mul(r)),
        BinaryOp::Mod if r == 0 => return Some(Err(RtError::division_by_zero())),
        BinaryOp::Mod => Value::I32(l.wrapping_rem(r)),
        BinaryOp::Equal => Value::Bool(l == r),
        BinaryOp::NotEqual => Value::Bool(l != r),
        BinaryOp::Less => Value::Bool(l < r),
        BinaryOp::LessEqual => Value::Bool(l <= r),
        BinaryOp::Greater => Value::Bool(l > r),
        BinaryOp::GreaterEqual => Value::Bool(l >= r),
        BinaryOp::BitAnd => Value::I32(l & r),
        BinaryOp::BitOr => Value::I32(l | r),
        BinaryOp::BitXor => Value::I32(l ^ r),
        BinaryOp::Shl => Value::I32(l.wrapping_shl(r as u32)),
        BinaryOp::Shr => Value::I32(l.wrapping_shr(r as u32)),
        _ => return None,
    };
    Some(Ok(v))
}

#[inline]
fn i64_fast(op: BinaryOp, l: i64, r: i64) -> Option<RtResult<Value>> {
    let v = match op {
        BinaryOp::Add => Value::I64(l.wrapping_add(r)),
        BinaryOp::Sub => Value::I64(l.wrapping_sub(r)),
        BinaryOp::Mul => Value::I64(l.wrapping_mul(r)),
        BinaryOp::Mod if r == 0 => return Some(Err(RtError::division_by_zero())),
        BinaryOp::Mod => Value::I64(l.wrapping_rem(r)),
        BinaryOp::Equal => Value::Bool(l == r),
        BinaryOp::NotEqual => Value::Bool(l != r),
        BinaryOp::Less => Value::Bool(l < r),
        BinaryOp::LessEqual => Value::Bool(l <= r),
        BinaryOp::Greater => Value::Bool(l > r),
        BinaryOp::GreaterEqual => Value::Bool(l >= r),
        BinaryOp::BitAnd => Value::I64(l & r),
        BinaryOp::BitOr => Value::I64(l | r),
        BinaryOp::BitXor => Value::I64(l ^ r),
        BinaryOp::Shl => Value::I64(l.wrapping_shl(r as u32)),
        BinaryOp::Shr => Value::I64(l.wrapping_shr(r as u32)),
        _ => return None,
    };
    Some(Ok(v))
}

#[inline]
fn f64_fast(op: BinaryOp, l: f64, r: f64) -> Option<Value> {
    let v = match op {
        BinaryOp::Add => Value::F64(l + r),
        BinaryOp::Sub => Value::F64(l - r),
        BinaryOp::Mul => Value::F64(l * r),
        BinaryOp::Div => Value::F64(l / r),
        BinaryOp::Mod => Value::F64(l % r),
        BinaryOp::Equal => Value::Bool(l == r),
        BinaryOp::NotEqual => Value::Bool(l != r),
        BinaryOp::Less => Value::Bool(l < r),
        BinaryOp::LessEqual => Value::Bool(l <= r),
        BinaryOp::Greater => Value::Bool(l > r),
        BinaryOp::GreaterEqual => Value::Bool(l >= r),
        _ => return None,
    };
    Some(v)
}

fn divide(left: Value, right: Value) -> RtResult<Value> {
    match (int_of(left), int_of(right)) {
        (Some(_), Some(0)) => Err(RtError::division_by_zero()),
        (Some(l), Some(r)) => Ok(Value::F64(l as f64 / r as f64)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => Ok(Value::F64(l / r)),
            _ => Err(non_numeric(left, right)),
        },
    }
}

fn non_numeric(left: Value, right: Value) -> RtError {
    RtError::type_mismatch(format!(
        "Cannot perform numeric operation on non-numeric types ({} and {})",
        left.type_name(),
        right.type_name()
    ))
}

fn float_op(op: BinaryOp, tag: ValueTag, l: f64, r: f64) -> RtResult<Value> {
    if op.is_ordering() {
        return Ok(Value::Bool(
            l.partial_cmp(&r).is_some_and(|ord| op.holds(ord)),
        ));
    }
    let f = match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Mod => l % r,
        _ => {
            return Err(RtError::type_mismatch(format!(
                "Invalid operation {op:?} for {}",
                tag.name()
            )));
        }
    };
    Ok(make_float(tag, f))
}

fn int_op(op: BinaryOp, tag: ValueTag, l: i128, r: i128) -> RtResult<Value> {
    if op.is_ordering() {
        return Ok(Value::Bool(op.holds(l.cmp(&r))));
    }
    let l = normalize(tag, l);
    let r = normalize(tag, r);
    let bits = tag.bits();
    let v = match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Mod if r == 0 => return Err(RtError::division_by_zero()),
        BinaryOp::Mod => l.wrapping_rem(r),
        BinaryOp::BitAnd => l & r,
        BinaryOp::BitOr => l | r,
        BinaryOp::BitXor => l ^ r,
        BinaryOp::Shl => l.wrapping_shl(r as u32 % bits),
        // `l` is already sign- or zero-extended for its type.
        BinaryOp::Shr => l.wrapping_shr(r as u32 % bits),
        _ => {
            return Err(RtError::type_mismatch(format!(
                "Invalid operation {op:?} for {}",
                tag.name()
            )));
        }
    };
    Ok(make_int(tag, normalize(tag, v)))
}

fn pointer_op(op: BinaryOp, left: Value, right: Value) -> Option<RtResult<Value>> {
    match (left, right) {
        (Value::Ptr(lp), Value::Ptr(rp)) => Some(match op {
            BinaryOp::Equal => Ok(Value::Bool(lp == rp)),
            BinaryOp::NotEqual => Ok(Value::Bool(lp != rp)),
            o if o.is_ordering() => Ok(Value::Bool(o.holds(lp.cmp(&rp)))),
            _ => Err(RtError::type_mismatch("Invalid operation for pointer type")),
        }),
        (Value::Ptr(p), r) if r.is_integer() => {
            let delta = int_of(r).unwrap_or(0) as isize;
            Some(match op {
                BinaryOp::Add => Ok(Value::Ptr(
                    (p as *mut u8).wrapping_offset(delta) as *mut c_void,
                )),
                BinaryOp::Sub => Ok(Value::Ptr(
                    (p as *mut u8).wrapping_offset(delta.wrapping_neg()) as *mut c_void,
                )),
                _ => Err(RtError::type_mismatch("Invalid operation for pointer type")),
            })
        }
        _ => None,
    }
}

/// Apply a binary operator. The result is a fresh value the caller owns.
pub fn binary_op(op: BinaryOp, left: Value, right: Value) -> RtResult<Value> {
    match (left, right) {
        (Value::I32(l), Value::I32(r)) => {
            if let Some(v) = i32_fast(op, l, r) {
                return v;
            }
        }
        (Value::I64(l), Value::I64(r)) => {
            if let Some(v) = i64_fast(op, l, r) {
                return v;
            }
        }
        (Value::F64(l), Value::F64(r)) => {
            if let Some(v) = f64_fast(op, l, r) {
                return Ok(v);
            }
        }
        _ => {}
    }

    match op {
        BinaryOp::Div => return divide(left, right),
        BinaryOp::Add if left.is_string() || right.is_string() => {
            return Ok(string::concat(left, right));
        }
        BinaryOp::And => return Ok(Value::Bool(to_bool(left) && to_bool(right))),
        BinaryOp::Or => return Ok(Value::Bool(to_bool(left) || to_bool(right))),
        BinaryOp::Equal => return Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::NotEqual => return Ok(Value::Bool(!values_equal(left, right))),
        _ => {}
    }

    if let Some(result) = pointer_op(op, left, right) {
        return result;
    }

    if op.is_ordering() {
        match (left, right) {
            (Value::Rune(l), Value::Rune(r)) => return Ok(Value::Bool(op.holds(l.cmp(&r)))),
            (Value::String(_), Value::String(_)) => {
                let l = left.as_str().unwrap_or_default();
                let r = right.as_str().unwrap_or_default();
                return Ok(Value::Bool(op.holds(l.as_bytes().cmp(r.as_bytes()))));
            }
            _ => {}
        }
    }

    let tag = promote(left.tag(), right.tag()).ok_or_else(|| non_numeric(left, right))?;
    if tag.is_float() {
        let l = left.as_f64().or_else(|| int_of(left).map(|v| v as f64));
        let r = right.as_f64().or_else(|| int_of(right).map(|v| v as f64));
        match (l, r) {
            (Some(l), Some(r)) => float_op(op, tag, l, r),
            _ => Err(non_numeric(left, right)),
        }
    } else {
        match (int_of(left), int_of(right)) {
            (Some(l), Some(r)) => int_op(op, tag, l, r),
            _ => Err(non_numeric(left, right)),
        }
    }
}

// =============================================================================
// Unary operations
// =============================================================================

/// Apply a unary operator.
///
/// Negation keeps the type of signed and float operands. Unsigned operands
/// and runes negate as i32 when they fit in it and as i64 otherwise.
pub fn unary_op(op: UnaryOp, operand: Value) -> RtResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!to_bool(operand))),
        UnaryOp::Negate => match operand {
            Value::I8(v) => Ok(Value::I8(v.wrapping_neg())),
            Value::I16(v) => Ok(Value::I16(v.wrapping_neg())),
            Value::I32(v) => Ok(Value::I32(v.wrapping_neg())),
            Value::I64(v) => Ok(Value::I64(v.wrapping_neg())),
            Value::F32(v) => Ok(Value::F32(-v)),
            Value::F64(v) => Ok(Value::F64(-v)),
            Value::U8(v) => Ok(Value::I32(-(v as i32))),
            Value::U16(v) => Ok(Value::I32(-(v as i32))),
            Value::Rune(v) => Ok(Value::I32(-(v as i32))),
            Value::U32(v) => Ok(Value::I64(-(v as i64))),
            Value::U64(v) => Ok(Value::I64((v as i64).wrapping_neg())),
            other => Err(RtError::type_mismatch(format!(
                "Cannot negate non-numeric type {}",
                other.type_name()
            ))),
        },
        UnaryOp::BitNot => match operand {
            Value::I8(v) => Ok(Value::I8(!v)),
            Value::I16(v) => Ok(Value::I16(!v)),
            Value::I32(v) => Ok(Value::I32(!v)),
            Value::I64(v) => Ok(Value::I64(!v)),
            Value::U8(v) => Ok(Value::U8(!v)),
            Value::U16(v) => Ok(Value::U16(!v)),
            Value::U32(v) => Ok(Value::U32(!v)),
            Value::U64(v) => Ok(Value::U64(!v)),
            other => Err(RtError::type_mismatch(format!(
                "Bitwise NOT requires integer type, got {}",
                other.type_name()
            ))),
        },
    }
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(i32, Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_binary_op(op: i32, left: Value, right: Value) -> Value {
    let result = u8::try_from(op)
        .ok()
        .and_then(BinaryOp::from_u8)
        .ok_or_else(|| RtError::runtime(format!("Unknown binary operation {op}")))
        .and_then(|op| binary_op(op, left, right));
    abi_value(result)
}

/// Signature: `(i32, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_unary_op(op: i32, operand: Value) -> Value {
    let result = u8::try_from(op)
        .ok()
        .and_then(UnaryOp::from_u8)
        .ok_or_else(|| RtError::runtime(format!("Unknown unary operation {op}")))
        .and_then(|op| unary_op(op, operand));
    abi_value(result)
}

/// `x + 1` for an i32 loop counter.
///
/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_i32_inc(value: Value) -> Value {
    match value {
        Value::I32(v) => Value::I32(v.wrapping_add(1)),
        other => abi_value(binary_op(BinaryOp::Add, other, Value::I32(1))),
    }
}

macro_rules! typed_fast_paths {
    ($variant:ident, $fast:ident, $both:ident; $($name:ident => $op:ident),* $(,)?) => {
        /// Whether both operands take this family's fast path.
        ///
        /// Signature: `(Value, Value) -> bool`
        #[unsafe(no_mangle)]
        pub extern "C" fn $both(left: Value, right: Value) -> bool {
            matches!((left, right), (Value::$variant(_), Value::$variant(_)))
        }

        $(
            /// Signature: `(Value, Value) -> Value`
            #[unsafe(no_mangle)]
            pub extern "C" fn $name(left: Value, right: Value) -> Value {
                let result = match (left, right) {
                    (Value::$variant(l), Value::$variant(r)) => $fast(BinaryOp::$op, l, r),
                    _ => None,
                };
                abi_value(result.unwrap_or_else(|| binary_op(BinaryOp::$op, left, right)))
            }
        )*
    };
}

typed_fast_paths! {
    I32, i32_fast, hml_both_i32;
    hml_i32_add => Add,
    hml_i32_sub => Sub,
    hml_i32_mul => Mul,
    hml_i32_div => Div,
    hml_i32_mod => Mod,
    hml_i32_lt => Less,
    hml_i32_le => LessEqual,
    hml_i32_gt => Greater,
    hml_i32_ge => GreaterEqual,
    hml_i32_eq => Equal,
    hml_i32_ne => NotEqual,
    hml_i32_bit_and => BitAnd,
    hml_i32_bit_or => BitOr,
    hml_i32_bit_xor => BitXor,
    hml_i32_lshift => Shl,
    hml_i32_rshift => Shr,
}

typed_fast_paths! {
    I64, i64_fast, hml_both_i64;
    hml_i64_add => Add,
    hml_i64_sub => Sub,
    hml_i64_mul => Mul,
    hml_i64_div => Div,
    hml_i64_mod => Mod,
    hml_i64_lt => Less,
    hml_i64_le => LessEqual,
    hml_i64_gt => Greater,
    hml_i64_ge => GreaterEqual,
    hml_i64_eq => Equal,
    hml_i64_ne => NotEqual,
    hml_i64_bit_and => BitAnd,
    hml_i64_bit_or => BitOr,
    hml_i64_bit_xor => BitXor,
    hml_i64_lshift => Shl,
    hml_i64_rshift => Shr,
}
