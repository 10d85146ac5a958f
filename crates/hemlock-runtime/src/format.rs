//! Printing and stringification
//!
//! Two renderings exist. [`to_display_string`] is what `print` writes: runes
//! appear as `'c'` or `U+XXXX`, arrays recursively as `[a, b]`, other
//! containers as `<kind>`. [`to_string`] is the string conversion used by
//! concatenation and `join`, where a rune becomes its UTF-8 character.

use core::ffi::c_char;
use core::fmt::Write;
use std::io::Write as _;

use smallvec::SmallVec;

use crate::value::Value;

// =============================================================================
// Float formatting
// =============================================================================

/// Format a float the way C's `%.<precision>g` does: `precision` significant
/// digits, trailing zeros stripped, exponent form outside `[1e-4, 1e<p>)`.
pub fn format_float_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return if value.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    let precision = precision.max(1);
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let sci = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exponent < -4 || exponent >= precision as i32 {
        let mantissa = strip_fraction_zeros(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.unsigned_abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        let fixed = format!("{:.*}", decimals, value);
        strip_fraction_zeros(&fixed).to_string()
    }
}

fn strip_fraction_zeros(text: &str) -> &str {
    if !text.contains('.') {
        return text;
    }
    text.trim_end_matches('0').trim_end_matches('.')
}

// =============================================================================
// Rendering
// =============================================================================

/// Text written by `print` for `value`.
pub fn to_display_string(value: Value) -> String {
    let mut out = String::new();
    let mut path = SmallVec::<[usize; 8]>::new();
    write_display(&mut out, value, &mut path);
    out
}

fn write_display(out: &mut String, value: Value, path: &mut SmallVec<[usize; 8]>) {
    match value {
        Value::Rune(r) => {
            if (32..127).contains(&r) {
                let _ = write!(out, "'{}'", r as u8 as char);
            } else {
                let _ = write!(out, "U+{r:04X}");
            }
        }
        Value::Array(_) => {
            let Some(cell) = value.as_array_cell() else {
                return;
            };
            let addr = value.cell_addr().unwrap_or_default();
            if path.contains(&addr) {
                out.push_str("[...]");
                return;
            }
            path.push(addr);
            out.push('[');
            let len = cell.len();
            for i in 0..len {
                if i > 0 {
                    out.push_str(", ");
                }
                if let Some(elem) = cell.get_raw(i) {
                    write_display(out, elem, path);
                }
            }
            out.push(']');
            path.pop();
        }
        other => write_scalar(out, other),
    }
}

fn write_scalar(out: &mut String, value: Value) {
    let _ = match value {
        Value::I8(v) => write!(out, "{v}"),
        Value::I16(v) => write!(out, "{v}"),
        Value::I32(v) => write!(out, "{v}"),
        Value::I64(v) => write!(out, "{v}"),
        Value::U8(v) => write!(out, "{v}"),
        Value::U16(v) => write!(out, "{v}"),
        Value::U32(v) => write!(out, "{v}"),
        Value::U64(v) => write!(out, "{v}"),
        Value::F32(v) => write!(out, "{}", format_float_g(v as f64, 6)),
        Value::F64(v) => write!(out, "{}", format_float_g(v, 6)),
        Value::Bool(b) => write!(out, "{b}"),
        Value::String(_) => write!(out, "{}", value.as_str().unwrap_or_default()),
        Value::Rune(r) => write!(out, "{}", char::from_u32(r).unwrap_or('\u{FFFD}')),
        Value::Ptr(p) => write!(out, "{p:p}"),
        Value::Buffer(p) => {
            let cell = unsafe { p.as_ref() };
            write!(
                out,
                "<buffer {:p} length={} capacity={}>",
                cell.data_ptr(),
                cell.len(),
                cell.capacity()
            )
        }
        Value::Array(_) => write!(out, "<array>"),
        Value::Object(_) => write!(out, "<object>"),
        Value::File(_) => write!(out, "<file>"),
        Value::Function(_) => write!(out, "<function>"),
        Value::Builtin(_) => write!(out, "<builtin>"),
        Value::Task(_) => write!(out, "<task>"),
        Value::Channel(_) => write!(out, "<channel>"),
        Value::Socket(_) => write!(out, "<socket>"),
        Value::Null => write!(out, "null"),
    };
}

/// String conversion used by concatenation, `join` and `to_string`.
pub fn to_string(value: Value) -> String {
    match value {
        Value::String(_) => value.as_str().unwrap_or_default().to_string(),
        Value::Rune(_) => {
            let mut out = String::new();
            write_scalar(&mut out, value);
            out
        }
        other => to_display_string(other),
    }
}

/// `print`: write the display form and a newline to stdout.
pub fn print(value: Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", to_display_string(value));
    let _ = stdout.flush();
}

/// `eprint`: write the display form and a newline to stderr.
pub fn eprint(value: Value) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", to_display_string(value));
    let _ = stderr.flush();
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_print(value: Value) {
    print(value);
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_eprint(value: Value) {
    eprint(value);
}

/// Convert any value to a fresh string (strings are returned retained).
///
/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_to_string(value: Value) -> Value {
    if value.is_string() {
        value.retain();
        return value;
    }
    Value::string(to_string(value))
}

/// Pointer to the NUL-terminated bytes of a string value, or null for any
/// other variant. Valid while the caller holds a reference to `value`.
///
/// Signature: `(Value) -> ptr`
#[unsafe(no_mangle)]
pub extern "C" fn hml_to_string_ptr(value: Value) -> *const c_char {
    match value {
        Value::String(p) => unsafe { p.as_ref() }.c_str_ptr(),
        _ => core::ptr::null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_format_float_g() {
        assert_eq!(format_float_g(3.5, 6), "3.5");
        assert_eq!(format_float_g(0.1, 6), "0.1");
        assert_eq!(format_float_g(100.0, 6), "100");
        assert_eq!(format_float_g(1e20, 6), "1e+20");
        assert_eq!(format_float_g(1234567.0, 6), "1.23457e+06");
        assert_eq!(format_float_g(0.00001, 6), "1e-05");
        assert_eq!(format_float_g(-2.25, 6), "-2.25");
        assert_eq!(format_float_g(f64::INFINITY, 6), "inf");
        assert_eq!(format_float_g(0.1, 17), "0.10000000000000001");
    }

    #[test]
    fn test_display_scalars() {
        assert_eq!(to_display_string(Value::I32(-7)), "-7");
        assert_eq!(to_display_string(Value::U64(u64::MAX)), "18446744073709551615");
        assert_eq!(to_display_string(Value::Bool(true)), "true");
        assert_eq!(to_display_string(Value::Null), "null");
        assert_eq!(to_display_string(Value::Rune('A' as u32)), "'A'");
        assert_eq!(to_display_string(Value::Rune(0x1F600)), "U+1F600");
        assert_eq!(to_string(Value::Rune(0xE9)), "é");
    }

    #[test]
    fn test_display_array() {
        let arr = Value::array();
        crate::array::push(arr, Value::I32(1)).unwrap();
        crate::array::push(arr, Value::F64(2.5)).unwrap();
        let s = Value::string_from("hi");
        crate::array::push(arr, s).unwrap();
        s.release();
        let obj = Value::object();
        crate::array::push(arr, obj).unwrap();
        obj.release();
        assert_snapshot!(to_display_string(arr), @"[1, 2.5, hi, <object>]");
        arr.release();
    }

    #[test]
    fn test_display_self_referencing_array() {
        let arr = Value::array();
        crate::array::push(arr, Value::I32(1)).unwrap();
        crate::array::push(arr, arr).unwrap();
        assert_snapshot!(to_display_string(arr), @"[1, [...]]");
        // Break the cycle before releasing.
        crate::array::pop(arr).unwrap().release();
        arr.release();
    }

    #[test]
    fn test_to_string_abi_retains_strings() {
        let s = Value::string_from("same");
        let t = hml_to_string(s);
        assert_eq!(s.refcount(), 2);
        t.release();
        let n = hml_to_string(Value::F64(1.0));
        assert_eq!(n.as_str(), Some("1"));
        n.release();
        s.release();
    }
}
