//! UTF-8 string cells and string operations
//!
//! A [`StrCell`] owns its text followed by a NUL terminator so the bytes can
//! be handed to C unchanged. The codepoint count is cached and invalidated
//! by the in-place append path, which is the only mutation strings allow.
//!
//! Character positions (`char_at`, `substr`, `find`) count codepoints;
//! `byte_at` and `slice` work on byte offsets.

use core::cell::UnsafeCell;
use core::ffi::c_char;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::convert::expect_int;
use crate::error::{RtError, RtResult};
use crate::exception::abi_value;
use crate::format;
use crate::memory::{HeapCell, RcHeader};
use crate::value::Value;

/// Cached codepoint count meaning "not computed yet".
const CHAR_LEN_DIRTY: usize = usize::MAX;

/// Minimum capacity reserved when the append path grows a string.
const MIN_APPEND_CAPACITY: usize = 32;

// =============================================================================
// String cell
// =============================================================================

pub struct StrCell {
    pub(crate) header: RcHeader,
    /// Text plus a trailing NUL.
    buf: UnsafeCell<String>,
    char_len: AtomicUsize,
}

impl StrCell {
    pub(crate) fn new(mut text: String) -> Self {
        text.reserve_exact(1);
        text.push('\0');
        Self {
            header: RcHeader::new(),
            buf: UnsafeCell::new(text),
            char_len: AtomicUsize::new(CHAR_LEN_DIRTY),
        }
    }

    fn buf(&self) -> &String {
        unsafe { &*self.buf.get() }
    }

    pub(crate) fn as_str(&self) -> &str {
        let buf = self.buf();
        &buf[..buf.len() - 1]
    }

    pub(crate) fn c_str_ptr(&self) -> *const c_char {
        self.buf().as_ptr() as *const c_char
    }

    pub(crate) fn char_len(&self) -> usize {
        let cached = self.char_len.load(Ordering::Relaxed);
        if cached != CHAR_LEN_DIRTY {
            return cached;
        }
        let count = self.as_str().chars().count();
        self.char_len.store(count, Ordering::Relaxed);
        count
    }

    /// Append `extra` in place with geometric growth.
    ///
    /// # Safety
    ///
    /// The caller must hold the only reference, and `extra` must not borrow
    /// from this cell.
    unsafe fn append(&self, extra: &str) {
        let buf = unsafe { &mut *self.buf.get() };
        let need = buf.len() + extra.len();
        if need > buf.capacity() {
            let new_cap = (buf.capacity() * 2).max(need).max(MIN_APPEND_CAPACITY);
            buf.reserve_exact(new_cap - buf.len());
        }
        buf.pop();
        buf.push_str(extra);
        buf.push('\0');
        self.char_len.store(CHAR_LEN_DIRTY, Ordering::Relaxed);
    }
}

impl HeapCell for StrCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn str_arg<'a>(value: &'a Value, op: &str) -> RtResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| RtError::type_mismatch(format!("{op}() requires string")))
}

// =============================================================================
// Queries
// =============================================================================

pub fn byte_length(s: Value) -> RtResult<usize> {
    Ok(str_arg(&s, "byte_length")?.len())
}

pub fn char_length(s: Value) -> RtResult<usize> {
    match s {
        Value::String(p) => Ok(unsafe { p.as_ref() }.char_len()),
        _ => Err(RtError::type_mismatch("length requires string")),
    }
}

/// Codepoint at `index` as a rune, or null when out of range.
pub fn char_at(s: Value, index: i64) -> RtResult<Value> {
    let text = str_arg(&s, "char_at")?;
    if index < 0 {
        return Ok(Value::Null);
    }
    Ok(text
        .chars()
        .nth(index as usize)
        .map_or(Value::Null, Value::rune))
}

/// Byte at `index` as a u8, or null when out of range.
pub fn byte_at(s: Value, index: i64) -> RtResult<Value> {
    let text = str_arg(&s, "byte_at")?;
    if index < 0 {
        return Ok(Value::Null);
    }
    Ok(text
        .as_bytes()
        .get(index as usize)
        .map_or(Value::Null, |b| Value::U8(*b)))
}

/// Codepoint index of the first occurrence of `needle`, or -1.
pub fn find(s: Value, needle: Value) -> RtResult<i64> {
    let text = str_arg(&s, "find")?;
    let needle = str_arg(&needle, "find")?;
    if needle.is_empty() {
        return Ok(0);
    }
    Ok(match text.find(needle) {
        Some(pos) => text[..pos].chars().count() as i64,
        None => -1,
    })
}

pub fn contains(s: Value, needle: Value) -> RtResult<bool> {
    Ok(find(s, needle)? >= 0)
}

pub fn starts_with(s: Value, prefix: Value) -> RtResult<bool> {
    Ok(str_arg(&s, "starts_with")?.starts_with(str_arg(&prefix, "starts_with")?))
}

pub fn ends_with(s: Value, suffix: Value) -> RtResult<bool> {
    Ok(str_arg(&s, "ends_with")?.ends_with(str_arg(&suffix, "ends_with")?))
}

// =============================================================================
// Derived strings
// =============================================================================

/// Up to `len` codepoints starting at codepoint `start`. Bounds are clamped.
pub fn substr(s: Value, start: i64, len: i64) -> RtResult<Value> {
    let text = str_arg(&s, "substr")?;
    let start = start.max(0) as usize;
    let len = len.max(0) as usize;
    let out: String = text.chars().skip(start).take(len).collect();
    Ok(Value::string(out))
}

/// Bytes `[start, end)`, clamped to the string. Offsets that split a UTF-8
/// sequence are rejected.
pub fn slice(s: Value, start: i64, end: i64) -> RtResult<Value> {
    let text = str_arg(&s, "slice")?;
    let len = text.len() as i64;
    let start = start.clamp(0, len) as usize;
    let end = end.clamp(start as i64, len) as usize;
    match text.get(start..end) {
        Some(part) => Ok(Value::string_from(part)),
        None => Err(RtError::range(format!(
            "slice({start}, {end}) does not fall on character boundaries"
        ))),
    }
}

/// Split on `delim`. An empty delimiter yields one entry per character.
pub fn split(s: Value, delim: Value) -> RtResult<Value> {
    let text = str_arg(&s, "split")?;
    let delim = str_arg(&delim, "split")?;
    let parts: Vec<Value> = if delim.is_empty() {
        text.chars()
            .map(|c| Value::string(c.to_string()))
            .collect()
    } else {
        text.split(delim).map(Value::string_from).collect()
    };
    Ok(Value::array_from(parts))
}

/// Strip spaces, tabs, newlines and carriage returns from both ends.
pub fn trim(s: Value) -> RtResult<Value> {
    let text = str_arg(&s, "trim")?;
    Ok(Value::string_from(
        text.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\n' | '\r')),
    ))
}

pub fn to_upper(s: Value) -> RtResult<Value> {
    Ok(Value::string(str_arg(&s, "to_upper")?.to_uppercase()))
}

pub fn to_lower(s: Value) -> RtResult<Value> {
    Ok(Value::string(str_arg(&s, "to_lower")?.to_lowercase()))
}

/// Replace the first occurrence. Returns `s` itself, retained, when there is
/// nothing to replace.
pub fn replace(s: Value, old: Value, new: Value) -> RtResult<Value> {
    let text = str_arg(&s, "replace")?;
    let old = str_arg(&old, "replace")?;
    let new = str_arg(&new, "replace")?;
    if old.is_empty() || !text.contains(old) {
        s.retain();
        return Ok(s);
    }
    Ok(Value::string(text.replacen(old, new, 1)))
}

/// Replace every occurrence. Returns `s` itself, retained, when there is
/// nothing to replace.
pub fn replace_all(s: Value, old: Value, new: Value) -> RtResult<Value> {
    let text = str_arg(&s, "replace_all")?;
    let old = str_arg(&old, "replace_all")?;
    let new = str_arg(&new, "replace_all")?;
    if old.is_empty() || !text.contains(old) {
        s.retain();
        return Ok(s);
    }
    Ok(Value::string(text.replace(old, new)))
}

/// `s` repeated `count` times; a non-positive count yields `""`.
pub fn repeat(s: Value, count: i64) -> RtResult<Value> {
    let text = str_arg(&s, "repeat")?;
    if count <= 0 {
        return Ok(Value::string(String::new()));
    }
    let total = text
        .len()
        .checked_mul(count as usize)
        .ok_or_else(|| RtError::exhausted("repeat() result too large"))?;
    let mut out = String::new();
    out.try_reserve_exact(total)
        .map_err(|_| RtError::exhausted("repeat() result too large"))?;
    for _ in 0..count {
        out.push_str(text);
    }
    Ok(Value::string(out))
}

/// Array of the string's codepoints as runes.
pub fn chars(s: Value) -> RtResult<Value> {
    let text = str_arg(&s, "chars")?;
    Ok(Value::array_from(text.chars().map(Value::rune).collect()))
}

/// Array of the string's bytes as u8 values.
pub fn bytes(s: Value) -> RtResult<Value> {
    let text = str_arg(&s, "bytes")?;
    Ok(Value::array_from(
        text.as_bytes().iter().map(|b| Value::U8(*b)).collect(),
    ))
}

/// Buffer holding a copy of the string's bytes.
pub fn to_bytes(s: Value) -> RtResult<Value> {
    let text = str_arg(&s, "to_bytes")?;
    Ok(Value::buffer_from(text.as_bytes().to_vec()))
}

/// Concatenate the string forms of two values.
pub fn concat(a: Value, b: Value) -> Value {
    concat_many(&[a, b])
}

/// Concatenate the string forms of any number of values.
pub fn concat_many(parts: &[Value]) -> Value {
    let mut out = String::new();
    for part in parts {
        match part.as_str() {
            Some(text) => out.push_str(text),
            None => out.push_str(&format::to_string(*part)),
        }
    }
    Value::string(out)
}

/// `dest = dest + src`, mutating in place when `dest` is a string with a
/// single owner and `src` is a string or rune. Otherwise a fresh
/// concatenation replaces `dest` and the old value is released.
pub fn append_inplace(dest: &mut Value, src: Value) {
    if let Value::String(cell) = *dest {
        let cell = unsafe { cell.as_ref() };
        if cell.header.count() == 1 {
            match src {
                Value::Rune(r) => {
                    let mut utf8 = [0u8; 4];
                    let c = char::from_u32(r).unwrap_or('\u{FFFD}');
                    unsafe { cell.append(c.encode_utf8(&mut utf8)) };
                    return;
                }
                Value::String(other) => {
                    let extra = unsafe { other.as_ref() }.as_str();
                    if src.cell_addr() == dest.cell_addr() {
                        let copy = extra.to_owned();
                        unsafe { cell.append(&copy) };
                    } else {
                        unsafe { cell.append(extra) };
                    }
                    return;
                }
                _ => {}
            }
        }
    }
    let joined = concat(*dest, src);
    core::mem::replace(dest, joined).release();
}

// =============================================================================
// C ABI
// =============================================================================

fn bool_value(result: RtResult<bool>) -> Value {
    abi_value(result.map(Value::Bool))
}

fn int_value(result: RtResult<i64>) -> Value {
    abi_value(result.map(|n| Value::I32(n as i32)))
}

/// Codepoint count.
///
/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_length(s: Value) -> Value {
    int_value(char_length(s).map(|n| n as i64))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_byte_length(s: Value) -> Value {
    int_value(byte_length(s).map(|n| n as i64))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_char_at(s: Value, index: Value) -> Value {
    abi_value(expect_int(index, "char_at").and_then(|i| char_at(s, i)))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_byte_at(s: Value, index: Value) -> Value {
    abi_value(expect_int(index, "byte_at").and_then(|i| byte_at(s, i)))
}

/// Signature: `(Value, Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_substr(s: Value, start: Value, len: Value) -> Value {
    abi_value((|| substr(s, expect_int(start, "substr")?, expect_int(len, "substr")?))())
}

/// Signature: `(Value, Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_slice(s: Value, start: Value, end: Value) -> Value {
    abi_value((|| slice(s, expect_int(start, "slice")?, expect_int(end, "slice")?))())
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_find(s: Value, needle: Value) -> Value {
    int_value(find(s, needle))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_contains(s: Value, needle: Value) -> Value {
    bool_value(contains(s, needle))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_split(s: Value, delim: Value) -> Value {
    abi_value(split(s, delim))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_trim(s: Value) -> Value {
    abi_value(trim(s))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_to_upper(s: Value) -> Value {
    abi_value(to_upper(s))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_to_lower(s: Value) -> Value {
    abi_value(to_lower(s))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_starts_with(s: Value, prefix: Value) -> Value {
    bool_value(starts_with(s, prefix))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_ends_with(s: Value, suffix: Value) -> Value {
    bool_value(ends_with(s, suffix))
}

/// Signature: `(Value, Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_replace(s: Value, old: Value, new: Value) -> Value {
    abi_value(replace(s, old, new))
}

/// Signature: `(Value, Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_replace_all(s: Value, old: Value, new: Value) -> Value {
    abi_value(replace_all(s, old, new))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_repeat(s: Value, count: Value) -> Value {
    abi_value(expect_int(count, "repeat").and_then(|n| repeat(s, n)))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_chars(s: Value) -> Value {
    abi_value(chars(s))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_bytes(s: Value) -> Value {
    abi_value(bytes(s))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_to_bytes(s: Value) -> Value {
    abi_value(to_bytes(s))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_string_concat(a: Value, b: Value) -> Value {
    concat(a, b)
}

/// Signature: `(ptr, i32) -> Value`
///
/// # Safety
///
/// `parts` must point at `count` valid Values, or be null with `count == 0`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_string_concat_many(parts: *const Value, count: i32) -> Value {
    if parts.is_null() || count <= 0 {
        return Value::string(String::new());
    }
    let parts = unsafe { core::slice::from_raw_parts(parts, count as usize) };
    concat_many(parts)
}

/// Signature: `(ptr, Value) -> ()`
///
/// # Safety
///
/// `dest` must point at a valid Value owning one reference.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_string_append_inplace(dest: *mut Value, src: Value) {
    if let Some(dest) = unsafe { dest.as_mut() } {
        append_inplace(dest, src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Value {
        Value::string_from(text)
    }

    fn text_of(value: Value) -> String {
        let out = value.as_str().unwrap().to_string();
        value.release();
        out
    }

    #[test]
    fn test_lengths() {
        let v = s("héllo");
        assert_eq!(byte_length(v).unwrap(), 6);
        assert_eq!(char_length(v).unwrap(), 5);
        // Cached value survives a second query.
        assert_eq!(char_length(v).unwrap(), 5);
        v.release();
    }

    #[test]
    fn test_char_and_byte_at() {
        let v = s("aé");
        assert!(matches!(char_at(v, 1).unwrap(), Value::Rune(0xE9)));
        assert!(char_at(v, 2).unwrap().is_null());
        assert!(char_at(v, -1).unwrap().is_null());
        assert!(matches!(byte_at(v, 0).unwrap(), Value::U8(b'a')));
        assert!(byte_at(v, 3).unwrap().is_null());
        v.release();
    }

    #[test]
    fn test_find_and_contains() {
        let v = s("naïve text");
        let needle = s("text");
        let empty = s("");
        let missing = s("zzz");
        assert_eq!(find(v, needle).unwrap(), 6);
        assert_eq!(find(v, empty).unwrap(), 0);
        assert_eq!(find(v, missing).unwrap(), -1);
        assert!(contains(v, needle).unwrap());
        for value in [v, needle, empty, missing] {
            value.release();
        }
    }

    #[test]
    fn test_substr_and_slice() {
        let v = s("héllo");
        assert_eq!(text_of(substr(v, 1, 3).unwrap()), "éll");
        assert_eq!(text_of(substr(v, 4, 10).unwrap()), "o");
        assert_eq!(text_of(slice(v, 0, 1).unwrap()), "h");
        assert_eq!(text_of(slice(v, 3, 100).unwrap()), "llo");
        assert!(slice(v, 0, 2).is_err());
        v.release();
    }

    #[test]
    fn test_split() {
        let v = s("a,b,,c");
        let comma = s(",");
        let parts = split(v, comma).unwrap();
        assert_eq!(format::to_display_string(parts), "[a, b, , c]");
        parts.release();

        let empty = s("");
        let chars = split(v, empty).unwrap();
        assert_eq!(crate::array::len(chars).unwrap(), 6);
        chars.release();
        for value in [v, comma, empty] {
            value.release();
        }
    }

    #[test]
    fn test_trim_case_repeat() {
        let v = s(" \t hi there\r\n");
        assert_eq!(text_of(trim(v).unwrap()), "hi there");
        assert_eq!(text_of(to_upper(v).unwrap()), " \t HI THERE\r\n");
        v.release();
        let ab = s("ab");
        assert_eq!(text_of(repeat(ab, 3).unwrap()), "ababab");
        assert_eq!(text_of(repeat(ab, 0).unwrap()), "");
        assert_eq!(text_of(repeat(ab, -2).unwrap()), "");
        ab.release();
    }

    #[test]
    fn test_replace_returns_same_string_when_absent() {
        let v = s("aaa");
        let a = s("a");
        let b = s("b");
        let x = s("x");
        assert_eq!(text_of(replace(v, a, b).unwrap()), "baa");
        assert_eq!(text_of(replace_all(v, a, b).unwrap()), "bbb");
        let same = replace(v, x, b).unwrap();
        assert_eq!(same.cell_addr(), v.cell_addr());
        assert_eq!(v.refcount(), 2);
        same.release();
        for value in [v, a, b, x] {
            value.release();
        }
    }

    #[test]
    fn test_chars_bytes_to_bytes() {
        let v = s("hé");
        let runes = chars(v).unwrap();
        assert_eq!(crate::array::len(runes).unwrap(), 2);
        runes.release();
        let raw = bytes(v).unwrap();
        assert_eq!(crate::array::len(raw).unwrap(), 3);
        raw.release();
        let buf = to_bytes(v).unwrap();
        assert_eq!(crate::buffer::len(buf).unwrap(), 3);
        buf.release();
        v.release();
    }

    #[test]
    fn test_concat_stringifies() {
        let a = s("n=");
        let out = concat_many(&[a, Value::I32(5), Value::Bool(false), Value::Rune('!' as u32)]);
        assert_eq!(text_of(out), "n=5false!");
        a.release();
    }

    #[test]
    fn test_append_inplace_mutates_sole_owner() {
        let mut dest = s("ab");
        let observer = dest;
        let tail = s("cd");
        append_inplace(&mut dest, tail);
        append_inplace(&mut dest, Value::Rune('é' as u32));
        assert_eq!(dest.cell_addr(), observer.cell_addr());
        assert_eq!(observer.as_str(), Some("abcdé"));
        assert_eq!(char_length(observer).unwrap(), 5);
        tail.release();
        dest.release();
    }

    #[test]
    fn test_append_inplace_self() {
        let mut dest = s("ab");
        let src = dest;
        append_inplace(&mut dest, src);
        assert_eq!(dest.as_str(), Some("abab"));
        dest.release();
    }

    #[test]
    fn test_append_shared_makes_copy() {
        let mut dest = s("ab");
        let keeper = dest;
        keeper.retain();
        let tail = s("c");
        append_inplace(&mut dest, tail);
        assert_ne!(dest.cell_addr(), keeper.cell_addr());
        assert_eq!(keeper.as_str(), Some("ab"));
        assert_eq!(keeper.refcount(), 1);
        assert_eq!(dest.as_str(), Some("abc"));
        dest.release();
        keeper.release();
        tail.release();
    }

    #[test]
    fn test_c_str_is_terminated() {
        let v = s("abc");
        let ptr = format::hml_to_string_ptr(v);
        let c = unsafe { core::ffi::CStr::from_ptr(ptr) };
        assert_eq!(c.to_bytes(), b"abc");
        v.release();
    }
}
