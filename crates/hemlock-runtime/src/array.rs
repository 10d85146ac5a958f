//! Dynamic arrays
//!
//! An [`ArrayCell`] owns its elements. Values passed in are retained by the
//! array; values handed out by `get`, `first` and `last` are retained for
//! the caller, while `pop`, `shift` and `remove` transfer the array's own
//! reference. Typed arrays check every inserted value against their element
//! tag.
//!
//! Containers carry no lock: sharing a mutable array between threads needs
//! external coordination.

use core::cell::UnsafeCell;

use crate::call::call_function;
use crate::convert::{expect_int, to_bool};
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value};
use crate::format;
use crate::memory::{HeapCell, RcHeader, ReleaseList};
use crate::value::{Owned, Value, ValueTag, values_equal};

/// Smallest capacity allocated once an array grows.
const MIN_CAPACITY: usize = 4;

// =============================================================================
// Array cell
// =============================================================================

pub struct ArrayCell {
    pub(crate) header: RcHeader,
    elems: UnsafeCell<Vec<Value>>,
    elem_type: Option<ValueTag>,
}

impl ArrayCell {
    pub(crate) fn new(elem_type: Option<ValueTag>) -> Self {
        Self {
            header: RcHeader::new(),
            elems: UnsafeCell::new(Vec::new()),
            elem_type,
        }
    }

    /// Takes over one reference to each element.
    pub(crate) fn from_vec(elems: Vec<Value>) -> Self {
        Self {
            header: RcHeader::new(),
            elems: UnsafeCell::new(elems),
            elem_type: None,
        }
    }

    fn elems(&self) -> &Vec<Value> {
        unsafe { &*self.elems.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn elems_mut(&self) -> &mut Vec<Value> {
        unsafe { &mut *self.elems.get() }
    }

    pub(crate) fn len(&self) -> usize {
        self.elems().len()
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.elems().capacity()
    }

    /// Element at `index` without retaining it.
    pub(crate) fn get_raw(&self, index: usize) -> Option<Value> {
        self.elems().get(index).copied()
    }

    /// Snapshot of the elements, none retained.
    pub(crate) fn to_vec_raw(&self) -> Vec<Value> {
        self.elems().clone()
    }

    /// Grow for `extra` more elements: double or exactly what is needed,
    /// never below [`MIN_CAPACITY`].
    fn reserve_for(&self, extra: usize) -> RtResult<()> {
        let elems = self.elems_mut();
        let need = elems.len() + extra;
        if need <= elems.capacity() {
            return Ok(());
        }
        let new_cap = (elems.capacity() * 2).max(need).max(MIN_CAPACITY);
        elems
            .try_reserve_exact(new_cap - elems.len())
            .map_err(|_| RtError::exhausted("array allocation failed"))
    }

    fn check_elem(&self, value: Value) -> RtResult<()> {
        match self.elem_type {
            Some(tag) if value.tag() != tag => Err(RtError::type_mismatch(format!(
                "Type mismatch in typed array: expected {}, got {}",
                tag.name(),
                value.type_name()
            ))),
            _ => Ok(()),
        }
    }
}

impl HeapCell for ArrayCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }

    fn drain_children(&mut self, out: &mut ReleaseList) {
        out.extend(self.elems.get_mut().drain(..));
    }
}

fn cell<'a>(arr: &'a Value, op: &str) -> RtResult<&'a ArrayCell> {
    arr.as_array_cell()
        .ok_or_else(|| RtError::type_mismatch(format!("{op}() requires array")))
}

fn bounds(index: i64, len: usize) -> RtResult<usize> {
    if index < 0 || index as usize >= len {
        return Err(RtError::index_out_of_bounds(index, len));
    }
    Ok(index as usize)
}

// =============================================================================
// Element access
// =============================================================================

pub fn len(arr: Value) -> RtResult<usize> {
    Ok(cell(&arr, "length")?.len())
}

/// Element at `index`, retained.
pub fn get(arr: Value, index: i64) -> RtResult<Value> {
    let c = cell(&arr, "get")?;
    let i = bounds(index, c.len())?;
    let value = c.elems()[i];
    value.retain();
    Ok(value)
}

/// Replace the element at `index`. The array retains `value` and releases
/// the previous element.
pub fn set(arr: Value, index: i64, value: Value) -> RtResult<()> {
    let c = cell(&arr, "set")?;
    let i = bounds(index, c.len())?;
    c.check_elem(value)?;
    value.retain();
    let old = core::mem::replace(&mut c.elems_mut()[i], value);
    old.release();
    Ok(())
}

/// First element, retained, or null when empty.
pub fn first(arr: Value) -> RtResult<Value> {
    let c = cell(&arr, "first")?;
    Ok(c.get_raw(0).map_or(Value::Null, |v| {
        v.retain();
        v
    }))
}

/// Last element, retained, or null when empty.
pub fn last(arr: Value) -> RtResult<Value> {
    let c = cell(&arr, "last")?;
    Ok(c.elems().last().copied().map_or(Value::Null, |v| {
        v.retain();
        v
    }))
}

// =============================================================================
// Mutation
// =============================================================================

pub fn push(arr: Value, value: Value) -> RtResult<()> {
    let c = cell(&arr, "push")?;
    c.check_elem(value)?;
    c.reserve_for(1)?;
    value.retain();
    c.elems_mut().push(value);
    Ok(())
}

/// Remove and return the last element, or null when empty.
pub fn pop(arr: Value) -> RtResult<Value> {
    Ok(cell(&arr, "pop")?.elems_mut().pop().unwrap_or(Value::Null))
}

/// Remove and return the first element, or null when empty.
pub fn shift(arr: Value) -> RtResult<Value> {
    let c = cell(&arr, "shift")?;
    let elems = c.elems_mut();
    if elems.is_empty() {
        return Ok(Value::Null);
    }
    Ok(elems.remove(0))
}

pub fn unshift(arr: Value, value: Value) -> RtResult<()> {
    insert(arr, 0, value)
}

/// Insert before `index`; `index == len` appends.
pub fn insert(arr: Value, index: i64, value: Value) -> RtResult<()> {
    let c = cell(&arr, "insert")?;
    let len = c.len();
    if index < 0 || index as usize > len {
        return Err(RtError::index_out_of_bounds(index, len));
    }
    c.check_elem(value)?;
    c.reserve_for(1)?;
    value.retain();
    c.elems_mut().insert(index as usize, value);
    Ok(())
}

/// Remove the element at `index` and return it.
pub fn remove(arr: Value, index: i64) -> RtResult<Value> {
    let c = cell(&arr, "remove")?;
    let i = bounds(index, c.len())?;
    Ok(c.elems_mut().remove(i))
}

pub fn clear(arr: Value) -> RtResult<()> {
    let c = cell(&arr, "clear")?;
    let old: ReleaseList = c.elems_mut().drain(..).collect();
    for value in old {
        value.release();
    }
    Ok(())
}

pub fn reverse(arr: Value) -> RtResult<()> {
    cell(&arr, "reverse")?.elems_mut().reverse();
    Ok(())
}

// =============================================================================
// Queries and derived arrays
// =============================================================================

/// Index of the first element equal to `needle`, or -1.
pub fn find(arr: Value, needle: Value) -> RtResult<i64> {
    let c = cell(&arr, "find")?;
    Ok(c.elems()
        .iter()
        .position(|v| values_equal(*v, needle))
        .map_or(-1, |i| i as i64))
}

pub fn contains(arr: Value, needle: Value) -> RtResult<bool> {
    Ok(find(arr, needle)? >= 0)
}

/// Fresh array of elements `[start, end)`.
pub fn slice(arr: Value, start: i64, end: i64) -> RtResult<Value> {
    let c = cell(&arr, "slice")?;
    let len = c.len();
    if start < 0 || start as usize > len {
        return Err(RtError::index_out_of_bounds(start, len));
    }
    if end < start || end as usize > len {
        return Err(RtError::index_out_of_bounds(end, len));
    }
    let part: Vec<Value> = c.elems()[start as usize..end as usize].to_vec();
    for v in &part {
        v.retain();
    }
    Ok(Value::array_from(part))
}

/// Join the string forms of the elements with `sep`.
pub fn join(arr: Value, sep: Value) -> RtResult<Value> {
    let c = cell(&arr, "join")?;
    let sep = sep
        .as_str()
        .ok_or_else(|| RtError::type_mismatch("join() requires string separator"))?;
    let parts: Vec<String> = c.elems().iter().map(|v| format::to_string(*v)).collect();
    Ok(Value::string(parts.join(sep)))
}

/// Fresh array holding the elements of `a` followed by those of `b`.
pub fn concat(a: Value, b: Value) -> RtResult<Value> {
    let left = cell(&a, "concat")?;
    let right = cell(&b, "concat")?;
    let mut joined = Vec::with_capacity(left.len() + right.len());
    joined.extend_from_slice(left.elems());
    joined.extend_from_slice(right.elems());
    for v in &joined {
        v.retain();
    }
    Ok(Value::array_from(joined))
}

// =============================================================================
// Higher-order operations
// =============================================================================

/// Element `i` retained for the duration of a callback, or `None` once the
/// callback shrank the array below `i`.
fn element_for_callback(arr: Value, i: usize) -> Option<Owned> {
    arr.as_array_cell()
        .and_then(|c| c.get_raw(i))
        .map(Owned::retained)
}

pub fn map(arr: Value, func: Value) -> RtResult<Value> {
    cell(&arr, "map")?;
    let out = Owned::new(Value::array());
    let mut i = 0;
    while let Some(elem) = element_for_callback(arr, i) {
        let mapped = Owned::new(call_function(func, &[elem.get()])?);
        push(out.get(), mapped.get())?;
        i += 1;
    }
    Ok(out.into_raw())
}

pub fn filter(arr: Value, func: Value) -> RtResult<Value> {
    cell(&arr, "filter")?;
    let out = Owned::new(Value::array());
    let mut i = 0;
    while let Some(elem) = element_for_callback(arr, i) {
        let keep = Owned::new(call_function(func, &[elem.get()])?);
        if to_bool(keep.get()) {
            push(out.get(), elem.get())?;
        }
        i += 1;
    }
    Ok(out.into_raw())
}

/// Fold with `func(acc, elem)`. A null `initial` starts from the first
/// element, which is an error on an empty array.
pub fn reduce(arr: Value, func: Value, initial: Value) -> RtResult<Value> {
    let c = cell(&arr, "reduce")?;
    let mut start = 0;
    let mut acc = if initial.is_null() {
        match c.get_raw(0) {
            Some(v) => {
                start = 1;
                Owned::retained(v)
            }
            None => {
                return Err(RtError::type_mismatch(
                    "reduce() of empty array with no initial value",
                ));
            }
        }
    } else {
        Owned::retained(initial)
    };
    let mut i = start;
    while let Some(elem) = element_for_callback(arr, i) {
        acc = Owned::new(call_function(func, &[acc.get(), elem.get()])?);
        i += 1;
    }
    Ok(acc.into_raw())
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(Value, Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_push(arr: Value, value: Value) {
    abi_unit(push(arr, value));
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_pop(arr: Value) -> Value {
    abi_value(pop(arr))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_shift(arr: Value) -> Value {
    abi_value(shift(arr))
}

/// Signature: `(Value, Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_unshift(arr: Value, value: Value) {
    abi_unit(unshift(arr, value));
}

/// Signature: `(Value, Value, Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_insert(arr: Value, index: Value, value: Value) {
    abi_unit(expect_int(index, "insert").and_then(|i| insert(arr, i, value)));
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_remove(arr: Value, index: Value) -> Value {
    abi_value(expect_int(index, "remove").and_then(|i| remove(arr, i)))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_get(arr: Value, index: Value) -> Value {
    abi_value(expect_int(index, "get").and_then(|i| get(arr, i)))
}

/// Signature: `(Value, Value, Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_set(arr: Value, index: Value, value: Value) {
    abi_unit(expect_int(index, "set").and_then(|i| set(arr, i, value)));
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_length(arr: Value) -> Value {
    abi_value(len(arr).map(|n| Value::I32(n as i32)))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_first(arr: Value) -> Value {
    abi_value(first(arr))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_last(arr: Value) -> Value {
    abi_value(last(arr))
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_clear(arr: Value) {
    abi_unit(clear(arr));
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_reverse(arr: Value) {
    abi_unit(reverse(arr));
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_find(arr: Value, needle: Value) -> Value {
    abi_value(find(arr, needle).map(|i| Value::I32(i as i32)))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_contains(arr: Value, needle: Value) -> Value {
    abi_value(contains(arr, needle).map(Value::Bool))
}

/// Signature: `(Value, Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_slice(arr: Value, start: Value, end: Value) -> Value {
    abi_value((|| slice(arr, expect_int(start, "slice")?, expect_int(end, "slice")?))())
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_join(arr: Value, sep: Value) -> Value {
    abi_value(join(arr, sep))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_concat(a: Value, b: Value) -> Value {
    abi_value(concat(a, b))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_map(arr: Value, func: Value) -> Value {
    abi_value(map(arr, func))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_filter(arr: Value, func: Value) -> Value {
    abi_value(filter(arr, func))
}

/// Signature: `(Value, Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_array_reduce(arr: Value, func: Value, initial: Value) -> Value {
    abi_value(reduce(arr, func, initial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtErrorKind;

    fn ints(values: &[i32]) -> Value {
        let arr = Value::array();
        for v in values {
            push(arr, Value::I32(*v)).unwrap();
        }
        arr
    }

    #[test]
    fn test_push_pop_is_noop() {
        let arr = ints(&[1, 2]);
        push(arr, Value::I32(3)).unwrap();
        assert!(matches!(pop(arr).unwrap(), Value::I32(3)));
        assert_eq!(format::to_display_string(arr), "[1, 2]");
        arr.release();
    }

    #[test]
    fn test_growth_policy() {
        let arr = Value::array();
        push(arr, Value::Null).unwrap();
        assert_eq!(arr.as_array_cell().unwrap().capacity(), 4);
        for _ in 0..4 {
            push(arr, Value::Null).unwrap();
        }
        assert_eq!(arr.as_array_cell().unwrap().capacity(), 8);
        arr.release();
    }

    #[test]
    fn test_get_set_bounds() {
        let arr = ints(&[10, 20]);
        assert!(matches!(get(arr, 1).unwrap(), Value::I32(20)));
        let err = get(arr, 2).unwrap_err();
        assert!(matches!(
            err.kind(),
            RtErrorKind::IndexOutOfBounds { index: 2, len: 2 }
        ));
        assert!(get(arr, -1).is_err());
        set(arr, 0, Value::I32(5)).unwrap();
        assert!(set(arr, 9, Value::I32(5)).is_err());
        assert_eq!(format::to_display_string(arr), "[5, 20]");
        arr.release();
    }

    #[test]
    fn test_typed_array_rejects_mismatch() {
        let arr = Value::array_with_type(ValueTag::I32);
        push(arr, Value::I32(1)).unwrap();
        push(arr, Value::I32(2)).unwrap();
        let err = push(arr, Value::F64(3.5)).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::TypeMismatch(_)));
        assert_eq!(len(arr).unwrap(), 2);
        assert!(set(arr, 0, Value::Bool(true)).is_err());
        arr.release();
    }

    #[test]
    fn test_shift_unshift_insert_remove() {
        let arr = ints(&[2, 3]);
        unshift(arr, Value::I32(1)).unwrap();
        insert(arr, 3, Value::I32(4)).unwrap();
        assert!(insert(arr, 9, Value::I32(0)).is_err());
        assert!(matches!(remove(arr, 1).unwrap(), Value::I32(2)));
        assert!(matches!(shift(arr).unwrap(), Value::I32(1)));
        assert_eq!(format::to_display_string(arr), "[3, 4]");
        clear(arr).unwrap();
        assert!(pop(arr).unwrap().is_null());
        assert!(shift(arr).unwrap().is_null());
        assert!(first(arr).unwrap().is_null());
        assert!(last(arr).unwrap().is_null());
        arr.release();
    }

    #[test]
    fn test_element_ownership() {
        let s = Value::string_from("x");
        let arr = Value::array();
        push(arr, s).unwrap();
        assert_eq!(s.refcount(), 2);
        let got = get(arr, 0).unwrap();
        assert_eq!(s.refcount(), 3);
        got.release();
        let popped = pop(arr).unwrap();
        assert_eq!(s.refcount(), 2);
        popped.release();
        arr.release();
        assert_eq!(s.refcount(), 1);
        s.release();
    }

    #[test]
    fn test_find_slice_join_concat_reverse() {
        let arr = ints(&[1, 2, 3, 4]);
        assert_eq!(find(arr, Value::F64(3.0)).unwrap(), 2);
        assert_eq!(find(arr, Value::I32(9)).unwrap(), -1);
        assert!(contains(arr, Value::I32(4)).unwrap());

        let part = slice(arr, 1, 3).unwrap();
        assert_eq!(format::to_display_string(part), "[2, 3]");
        assert!(slice(arr, 3, 1).is_err());
        assert!(slice(arr, 0, 5).is_err());

        let sep = Value::string_from("-");
        let joined = join(arr, sep).unwrap();
        assert_eq!(joined.as_str(), Some("1-2-3-4"));

        let both = concat(arr, part).unwrap();
        assert_eq!(len(both).unwrap(), 6);

        reverse(arr).unwrap();
        assert_eq!(format::to_display_string(arr), "[4, 3, 2, 1]");
        for v in [arr, part, sep, joined, both] {
            v.release();
        }
    }
}
