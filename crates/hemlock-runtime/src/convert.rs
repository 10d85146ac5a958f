//! Coercion and parsing
//!
//! Two entry points convert between value kinds:
//!
//! - [`convert_to_type`] implements type-annotation coercion. It widens and
//!   range-checks numerics and formats scalars as strings. It refuses to
//!   parse strings.
//! - [`parse_to_type`] implements constructor calls such as `i32("42")`. It
//!   parses strings and falls back to [`convert_to_type`] for everything
//!   else.
//!
//! Integer range checks run on `i128` so every i64 and u64 payload, and
//! every truncated float in that span, is checked exactly.

use crate::error::{RtError, RtResult};
use crate::exception::{abi_scalar, abi_value};
use crate::format::format_float_g;
use crate::value::{Value, ValueTag};

// =============================================================================
// Scalar accessors
// =============================================================================

/// Integer payload of an integer, bool or rune value.
fn int_payload(value: Value) -> Option<i128> {
    let v = match value {
        Value::I8(v) => v as i128,
        Value::I16(v) => v as i128,
        Value::I32(v) => v as i128,
        Value::I64(v) => v as i128,
        Value::U8(v) => v as i128,
        Value::U16(v) => v as i128,
        Value::U32(v) => v as i128,
        Value::U64(v) => v as i128,
        Value::Bool(b) => b as i128,
        Value::Rune(r) => r as i128,
        _ => return None,
    };
    Some(v)
}

/// An integer argument, as needed for indices, counts and sizes.
pub fn expect_int(value: Value, op: &str) -> RtResult<i64> {
    match value {
        Value::Bool(_) => Err(RtError::type_mismatch(format!(
            "{op}() expects integer, got bool"
        ))),
        Value::U64(v) => Ok(v as i64),
        other => int_payload(other).map(|v| v as i64).ok_or_else(|| {
            RtError::type_mismatch(format!(
                "{op}() expects integer, got {}",
                other.type_name()
            ))
        }),
    }
}

/// Truthiness. Null, false, zero and the empty string are false; every
/// other value is true.
pub fn to_bool(value: Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::F32(f) => f != 0.0,
        Value::F64(f) => f != 0.0,
        Value::String(_) => value.as_str().is_some_and(|s| !s.is_empty()),
        Value::Ptr(p) => !p.is_null(),
        other => int_payload(other).is_none_or(|v| v != 0),
    }
}

/// Numeric, bool or rune value as f64.
pub fn to_f64(value: Value) -> RtResult<f64> {
    match value {
        Value::F32(f) => Ok(f as f64),
        Value::F64(f) => Ok(f),
        other => int_payload(other).map(|v| v as f64).ok_or_else(|| {
            RtError::type_mismatch(format!("Cannot convert {} to f64", other.type_name()))
        }),
    }
}

/// Numeric value as i64. Floats truncate toward zero; other integers wrap.
pub fn to_i64(value: Value) -> RtResult<i64> {
    match value {
        Value::F32(f) => Ok(f as i64),
        Value::F64(f) => Ok(f as i64),
        other => int_payload(other).map(|v| v as i64).ok_or_else(|| {
            RtError::type_mismatch(format!("Cannot convert {} to i64", other.type_name()))
        }),
    }
}

pub fn to_i32(value: Value) -> RtResult<i32> {
    to_i64(value).map(|v| v as i32)
}

// =============================================================================
// Type-annotation coercion
// =============================================================================

/// Inclusive bounds and the printed range of an integer target.
fn int_bounds(tag: ValueTag) -> Option<(i128, i128, &'static str)> {
    let bounds = match tag {
        ValueTag::I8 => (i8::MIN as i128, i8::MAX as i128, "[-128, 127]"),
        ValueTag::I16 => (i16::MIN as i128, i16::MAX as i128, "[-32768, 32767]"),
        ValueTag::I32 => (
            i32::MIN as i128,
            i32::MAX as i128,
            "[-2147483648, 2147483647]",
        ),
        ValueTag::I64 => (
            i64::MIN as i128,
            i64::MAX as i128,
            "[-9223372036854775808, 9223372036854775807]",
        ),
        ValueTag::U8 => (0, u8::MAX as i128, "[0, 255]"),
        ValueTag::U16 => (0, u16::MAX as i128, "[0, 65535]"),
        ValueTag::U32 => (0, u32::MAX as i128, "[0, 4294967295]"),
        ValueTag::U64 => (0, u64::MAX as i128, "[0, 18446744073709551615]"),
        ValueTag::Rune => (0, 0x10FFFF, "[0, 0x10FFFF]"),
        _ => return None,
    };
    Some(bounds)
}

/// Truncate a float toward zero for an integer target. NaN and infinities
/// have no integer value.
fn truncate_float(f: f64, tag: ValueTag) -> RtResult<i128> {
    if !f.is_finite() {
        return Err(RtError::range(format!(
            "Value {} out of range for {}",
            format_float_g(f, 17),
            tag.name()
        )));
    }
    let t = f.trunc();
    if t.abs() >= 1.7e38 {
        return Err(RtError::range(format!(
            "Value {} out of range for {}",
            format_float_g(f, 17),
            tag.name()
        )));
    }
    Ok(t as i128)
}

fn make_int(v: i128, tag: ValueTag) -> RtResult<Value> {
    let Some((lo, hi, range)) = int_bounds(tag) else {
        return Err(RtError::type_mismatch(format!(
            "Cannot convert integer to {}",
            tag.name()
        )));
    };
    if v < lo || v > hi {
        return Err(RtError::range(format!(
            "Value {v} out of range for {} {range}",
            tag.name()
        )));
    }
    let value = match tag {
        ValueTag::I8 => Value::I8(v as i8),
        ValueTag::I16 => Value::I16(v as i16),
        ValueTag::I32 => Value::I32(v as i32),
        ValueTag::I64 => Value::I64(v as i64),
        ValueTag::U8 => Value::U8(v as u8),
        ValueTag::U16 => Value::U16(v as u16),
        ValueTag::U32 => Value::U32(v as u32),
        ValueTag::U64 => Value::U64(v as u64),
        _ => Value::Rune(v as u32),
    };
    Ok(value)
}

/// Scalar payload of a coercion source.
enum Scalar {
    Int(i128),
    Float(f64),
}

fn scalar_of(value: Value) -> Option<Scalar> {
    match value {
        Value::F32(f) => Some(Scalar::Float(f as f64)),
        Value::F64(f) => Some(Scalar::Float(f)),
        other => int_payload(other).map(Scalar::Int),
    }
}

fn scalar_to_string(value: Value, scalar: Scalar) -> String {
    match (value, scalar) {
        (Value::Bool(b), _) => b.to_string(),
        (Value::Rune(r), _) => char::from_u32(r).unwrap_or('\u{FFFD}').to_string(),
        (_, Scalar::Int(v)) => v.to_string(),
        (_, Scalar::Float(f)) => format_float_g(f, 17),
    }
}

fn convert_scalar(value: Value, scalar: Scalar, target: ValueTag) -> RtResult<Value> {
    match target {
        ValueTag::F32 => Ok(Value::F32(match scalar {
            Scalar::Int(v) => v as f32,
            Scalar::Float(f) => f as f32,
        })),
        ValueTag::F64 => Ok(Value::F64(match scalar {
            Scalar::Int(v) => v as f64,
            Scalar::Float(f) => f,
        })),
        ValueTag::Bool => Ok(Value::Bool(match scalar {
            Scalar::Int(v) => v != 0,
            Scalar::Float(f) => f != 0.0,
        })),
        ValueTag::String => Ok(Value::string(scalar_to_string(value, scalar))),
        tag if int_bounds(tag).is_some() => {
            let v = match scalar {
                Scalar::Int(v) => v,
                Scalar::Float(f) => truncate_float(f, tag)?,
            };
            make_int(v, tag)
        }
        _ => Err(RtError::type_mismatch(format!(
            "Cannot convert {} to {}",
            value.type_name(),
            target.name()
        ))),
    }
}

/// Coerce `value` to the primitive type `target`, as a type annotation does.
///
/// Returns a new reference. A value that already carries the target tag is
/// retained and returned unchanged.
pub fn convert_to_type(value: Value, target: ValueTag) -> RtResult<Value> {
    if value.tag() == target || (target == ValueTag::Function && value.is_function()) {
        value.retain();
        return Ok(value);
    }
    if let Some(scalar) = scalar_of(value) {
        return convert_scalar(value, scalar, target);
    }
    if value.is_string() {
        if target == ValueTag::Bool || target.is_numeric() {
            let name = target.name();
            return Err(RtError::type_mismatch(format!(
                "Cannot convert string to {name} via type annotation. Use {name}(\"...\") instead."
            )));
        }
    }
    Err(RtError::type_mismatch(format!(
        "Cannot convert {} to {}",
        value.type_name(),
        target.name()
    )))
}

// =============================================================================
// Parsing constructors
// =============================================================================

/// Parse an integer literal the way `strtoll` with base 0 does: optional
/// sign, then `0x` for hex, a leading `0` for octal, decimal otherwise.
fn parse_int_literal(text: &str) -> RtResult<i128> {
    let malformed = || RtError::parse(format!("Cannot parse '{text}' as integer"));
    let s = text.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, body) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    if body.is_empty() || !body.chars().all(|c| c.is_digit(radix)) {
        return Err(malformed());
    }
    // Only overflow can fail once the digits are known to be valid.
    let magnitude = i128::from_str_radix(body, radix)
        .map_err(|_| RtError::range(format!("Value {} out of range", text.trim())))?;
    Ok(if negative { -magnitude } else { magnitude })
}

fn is_hex_literal(text: &str) -> bool {
    let s = text.trim_start().trim_start_matches(['+', '-']);
    s.starts_with("0x") || s.starts_with("0X")
}

fn parse_number(text: &str) -> RtResult<Scalar> {
    if text.is_empty() {
        return Err(RtError::parse("Cannot convert empty string to number"));
    }
    let looks_float = !is_hex_literal(text) && text.contains(['.', 'e', 'E']);
    if looks_float {
        text.trim_start()
            .parse::<f64>()
            .map(Scalar::Float)
            .map_err(|_| RtError::parse(format!("Cannot parse '{text}' as number")))
    } else {
        parse_int_literal(text).map(Scalar::Int)
    }
}

/// Convert `value` to `target` as a constructor call does. Strings are
/// parsed; other values go through [`convert_to_type`].
pub fn parse_to_type(value: Value, target: ValueTag) -> RtResult<Value> {
    let Some(text) = value.as_str() else {
        return convert_to_type(value, target);
    };
    match target {
        ValueTag::Bool => match text {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(RtError::parse(
                "Cannot parse string as bool (expected 'true' or 'false')",
            )),
        },
        tag if tag.is_numeric() => {
            let scalar = parse_number(text)?;
            convert_scalar(value, scalar, tag)
        }
        _ => convert_to_type(value, target),
    }
}

// =============================================================================
// C ABI
// =============================================================================

fn tag_arg(raw: i32) -> RtResult<ValueTag> {
    u8::try_from(raw)
        .ok()
        .and_then(ValueTag::from_u8)
        .ok_or_else(|| RtError::type_mismatch(format!("Unknown type tag {raw}")))
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_to_bool(value: Value) -> i32 {
    to_bool(value) as i32
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_to_i32(value: Value) -> i32 {
    abi_scalar(to_i32(value))
}

/// Signature: `(Value) -> i64`
#[unsafe(no_mangle)]
pub extern "C" fn hml_to_i64(value: Value) -> i64 {
    abi_scalar(to_i64(value))
}

/// Signature: `(Value) -> f64`
#[unsafe(no_mangle)]
pub extern "C" fn hml_to_f64(value: Value) -> f64 {
    abi_scalar(to_f64(value))
}

/// Returns a new reference.
///
/// Signature: `(Value, i32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_convert_to_type(value: Value, tag: i32) -> Value {
    abi_value(tag_arg(tag).and_then(|t| convert_to_type(value, t)))
}

/// Returns a new reference.
///
/// Signature: `(Value, i32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_parse_to_type(value: Value, tag: i32) -> Value {
    abi_value(tag_arg(tag).and_then(|t| parse_to_type(value, t)))
}
