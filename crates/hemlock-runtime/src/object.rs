//! Objects: ordered field maps
//!
//! Fields keep insertion order. Setting an existing field replaces its value
//! in place; deleting a field closes the gap. Lookups are linear.

use core::cell::UnsafeCell;
use core::ffi::{CStr, c_char};

use crate::convert::expect_int;
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value};
use crate::memory::{HeapCell, RcHeader, ReleaseList};
use crate::types;
use crate::value::Value;

const INITIAL_FIELDS: usize = 4;

// =============================================================================
// Object cell
// =============================================================================

pub struct ObjectCell {
    pub(crate) header: RcHeader,
    fields: UnsafeCell<Vec<(Box<str>, Value)>>,
    type_name: UnsafeCell<Option<Box<str>>>,
}

impl ObjectCell {
    pub(crate) fn new() -> Self {
        Self {
            header: RcHeader::new(),
            fields: UnsafeCell::new(Vec::new()),
            type_name: UnsafeCell::new(None),
        }
    }

    fn fields(&self) -> &Vec<(Box<str>, Value)> {
        unsafe { &*self.fields.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn fields_mut(&self) -> &mut Vec<(Box<str>, Value)> {
        unsafe { &mut *self.fields.get() }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields().iter().position(|(k, _)| &**k == name)
    }

    /// Field value without retaining it.
    pub(crate) fn get_raw(&self, name: &str) -> Option<Value> {
        self.position(name).map(|i| self.fields()[i].1)
    }

    pub(crate) fn len(&self) -> usize {
        self.fields().len()
    }

    /// Snapshot of the fields, values not retained.
    pub(crate) fn entries_raw(&self) -> Vec<(String, Value)> {
        self.fields()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    pub(crate) fn type_name(&self) -> Option<&str> {
        unsafe { &*self.type_name.get() }.as_deref()
    }

    pub(crate) fn set_type_name_unchecked(&self, name: &str) {
        unsafe { *self.type_name.get() = Some(name.into()) };
    }
}

impl HeapCell for ObjectCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }

    fn drain_children(&mut self, out: &mut ReleaseList) {
        out.extend(self.fields.get_mut().drain(..).map(|(_, v)| v));
    }
}

fn cell<'a>(obj: &'a Value, op: &str) -> RtResult<&'a ObjectCell> {
    obj.as_object_cell()
        .ok_or_else(|| RtError::type_mismatch(format!("{op} requires object")))
}

// =============================================================================
// Operations
// =============================================================================

/// Field value, retained, or null when absent.
pub fn get_field(obj: Value, name: &str) -> RtResult<Value> {
    let c = cell(&obj, "Property access")?;
    Ok(c.get_raw(name).map_or(Value::Null, |v| {
        v.retain();
        v
    }))
}

/// Field value, retained. A missing field is an error.
pub fn get_field_required(obj: Value, name: &str) -> RtResult<Value> {
    let c = cell(&obj, "Property access")?;
    match c.get_raw(name) {
        Some(v) => {
            v.retain();
            Ok(v)
        }
        None => Err(RtError::missing_field(format!(
            "Object has no field '{name}'"
        ))),
    }
}

/// Insert or replace a field. The object retains `value`.
pub fn set_field(obj: Value, name: &str, value: Value) -> RtResult<()> {
    let c = cell(&obj, "Property assignment")?;
    value.retain();
    match c.position(name) {
        Some(i) => {
            let old = core::mem::replace(&mut c.fields_mut()[i].1, value);
            old.release();
        }
        None => {
            let fields = c.fields_mut();
            if fields.len() == fields.capacity() {
                let grow = fields.capacity().max(INITIAL_FIELDS);
                fields.reserve_exact(grow);
            }
            fields.push((name.into(), value));
        }
    }
    Ok(())
}

pub fn has_field(obj: Value, name: &str) -> RtResult<bool> {
    Ok(cell(&obj, "has()")?.position(name).is_some())
}

/// Remove a field. Returns whether it existed.
pub fn delete_field(obj: Value, name: &str) -> RtResult<bool> {
    let c = cell(&obj, "delete()")?;
    match c.position(name) {
        Some(i) => {
            let (_, old) = c.fields_mut().remove(i);
            old.release();
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Array of field names in insertion order.
pub fn keys(obj: Value) -> RtResult<Value> {
    let c = cell(&obj, "keys()")?;
    let names = c
        .fields()
        .iter()
        .map(|(k, _)| Value::string_from(k))
        .collect();
    Ok(Value::array_from(names))
}

pub fn num_fields(obj: Value) -> RtResult<usize> {
    Ok(cell(&obj, "Field count")?.len())
}

/// Name of the field at `index`, as a fresh string.
pub fn key_at(obj: Value, index: i64) -> RtResult<Value> {
    let c = cell(&obj, "Object key access")?;
    let fields = c.fields();
    if index < 0 || index as usize >= fields.len() {
        return Err(RtError::index_out_of_bounds(index, fields.len()));
    }
    Ok(Value::string_from(&fields[index as usize].0))
}

/// Value of the field at `index`, retained.
pub fn value_at(obj: Value, index: i64) -> RtResult<Value> {
    let c = cell(&obj, "Object value access")?;
    let fields = c.fields();
    if index < 0 || index as usize >= fields.len() {
        return Err(RtError::index_out_of_bounds(index, fields.len()));
    }
    let v = fields[index as usize].1;
    v.retain();
    Ok(v)
}

/// The object's type name, if one was attached.
pub fn type_name(obj: Value) -> RtResult<Option<String>> {
    Ok(cell(&obj, "type_name()")?.type_name().map(str::to_string))
}

/// Attach a registered type to `obj`, validating its fields and filling in
/// defaults for missing optional ones.
pub fn set_type_name(obj: Value, name: &str) -> RtResult<()> {
    types::validate_object(obj, name, &[])
}

// =============================================================================
// C ABI
// =============================================================================

fn name_arg<'a>(name: *const c_char) -> RtResult<&'a str> {
    if name.is_null() {
        return Err(RtError::null_dereference("field name"));
    }
    unsafe { CStr::from_ptr(name) }
        .to_str()
        .map_err(|_| RtError::type_mismatch("field name is not valid UTF-8"))
}

/// Signature: `(Value, ptr) -> Value`
///
/// # Safety
///
/// `name` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_object_get_field(obj: Value, name: *const c_char) -> Value {
    abi_value(name_arg(name).and_then(|n| get_field(obj, n)))
}

/// Signature: `(Value, ptr) -> Value`
///
/// # Safety
///
/// `name` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_object_get_field_required(obj: Value, name: *const c_char) -> Value {
    abi_value(name_arg(name).and_then(|n| get_field_required(obj, n)))
}

/// Signature: `(Value, ptr, Value) -> ()`
///
/// # Safety
///
/// `name` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_object_set_field(obj: Value, name: *const c_char, value: Value) {
    abi_unit(name_arg(name).and_then(|n| set_field(obj, n, value)));
}

/// Signature: `(Value, ptr) -> i32`
///
/// # Safety
///
/// `name` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_object_has_field(obj: Value, name: *const c_char) -> i32 {
    name_arg(name)
        .and_then(|n| has_field(obj, n))
        .unwrap_or(false) as i32
}

/// Signature: `(Value, ptr) -> i32`
///
/// # Safety
///
/// `name` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_object_delete_field(obj: Value, name: *const c_char) -> i32 {
    name_arg(name)
        .and_then(|n| delete_field(obj, n))
        .unwrap_or(false) as i32
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_object_keys(obj: Value) -> Value {
    abi_value(keys(obj))
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_object_num_fields(obj: Value) -> i32 {
    num_fields(obj).unwrap_or(0) as i32
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_object_key_at(obj: Value, index: Value) -> Value {
    abi_value(expect_int(index, "key_at").and_then(|i| key_at(obj, i)))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_object_value_at(obj: Value, index: Value) -> Value {
    abi_value(expect_int(index, "value_at").and_then(|i| value_at(obj, i)))
}

/// Signature: `(Value, ptr) -> ()`
///
/// # Safety
///
/// `name` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_object_set_type_name(obj: Value, name: *const c_char) {
    abi_unit(name_arg(name).and_then(|n| set_type_name(obj, n)));
}
