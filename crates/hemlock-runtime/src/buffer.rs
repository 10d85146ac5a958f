//! Raw byte buffers
//!
//! A buffer can be released early with [`free`]; the cell stays alive until
//! its last reference drops, but every later access, including a second
//! free, fails with UseAfterFree.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::convert::expect_int;
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value};
use crate::memory::{HeapCell, RcHeader};
use crate::value::Value;

pub struct BufferCell {
    pub(crate) header: RcHeader,
    bytes: UnsafeCell<Vec<u8>>,
    freed: AtomicBool,
}

impl BufferCell {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self {
            header: RcHeader::new(),
            bytes: UnsafeCell::new(bytes),
            freed: AtomicBool::new(false),
        }
    }

    fn bytes(&self) -> &Vec<u8> {
        unsafe { &*self.bytes.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self) -> &mut Vec<u8> {
        unsafe { &mut *self.bytes.get() }
    }

    pub(crate) fn data_ptr(&self) -> *const u8 {
        self.bytes().as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.bytes().capacity()
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }
}

impl HeapCell for BufferCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }
}

fn live_cell<'a>(buf: &'a Value, op: &str) -> RtResult<&'a BufferCell> {
    let Value::Buffer(p) = *buf else {
        return Err(RtError::type_mismatch(format!("{op} requires buffer")));
    };
    let cell = unsafe { p.as_ref() };
    if cell.is_freed() {
        return Err(RtError::use_after_free(format!(
            "{op}: buffer used after free()"
        )));
    }
    Ok(cell)
}

fn bounds(index: i64, len: usize) -> RtResult<usize> {
    if index < 0 || index as usize >= len {
        return Err(RtError::index_out_of_bounds(index, len));
    }
    Ok(index as usize)
}

/// Byte at `index` as a u8.
pub fn get(buf: Value, index: i64) -> RtResult<Value> {
    let cell = live_cell(&buf, "Buffer index")?;
    let i = bounds(index, cell.len())?;
    Ok(Value::U8(cell.bytes()[i]))
}

/// Store the low 8 bits of `byte` at `index`.
pub fn set(buf: Value, index: i64, byte: i64) -> RtResult<()> {
    let cell = live_cell(&buf, "Buffer index assignment")?;
    let i = bounds(index, cell.len())?;
    cell.bytes_mut()[i] = byte as u8;
    Ok(())
}

pub fn len(buf: Value) -> RtResult<usize> {
    Ok(live_cell(&buf, "length")?.len())
}

pub fn capacity(buf: Value) -> RtResult<usize> {
    Ok(live_cell(&buf, "capacity")?.capacity())
}

/// Pointer to the buffer's bytes, valid until the buffer is freed or
/// released.
pub fn as_ptr(buf: Value) -> RtResult<Value> {
    let cell = live_cell(&buf, "buffer_ptr()")?;
    Ok(Value::Ptr(cell.bytes_mut().as_mut_ptr() as *mut c_void))
}

/// Copy `count` bytes from `src` into the start of the buffer.
///
/// # Safety
///
/// `src` must be valid for reads of `count` bytes.
pub unsafe fn copy_from_ptr(buf: Value, src: *const u8, count: usize) -> RtResult<()> {
    let cell = live_cell(&buf, "buffer_copy_from_ptr()")?;
    if src.is_null() {
        return Err(RtError::null_dereference("buffer_copy_from_ptr()"));
    }
    let dest = cell.bytes_mut();
    if count > dest.len() {
        return Err(RtError::index_out_of_bounds(count as i64, dest.len()));
    }
    let bytes = unsafe { core::slice::from_raw_parts(src, count) };
    dest[..count].copy_from_slice(bytes);
    Ok(())
}

/// Drop the buffer's storage now. A second call fails.
pub fn free(buf: Value) -> RtResult<()> {
    let Value::Buffer(p) = buf else {
        return Err(RtError::type_mismatch("free() requires buffer"));
    };
    let cell = unsafe { p.as_ref() };
    if cell.freed.swap(true, Ordering::AcqRel) {
        return Err(RtError::use_after_free("double free detected"));
    }
    *cell.bytes_mut() = Vec::new();
    Ok(())
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_buffer_get(buf: Value, index: Value) -> Value {
    abi_value(expect_int(index, "Buffer index").and_then(|i| get(buf, i)))
}

/// Signature: `(Value, Value, Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_buffer_set(buf: Value, index: Value, byte: Value) {
    abi_unit((|| set(buf, expect_int(index, "Buffer index")?, expect_int(byte, "Buffer value")?))());
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_buffer_length(buf: Value) -> Value {
    abi_value(len(buf).map(|n| Value::I32(n as i32)))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_buffer_capacity(buf: Value) -> Value {
    abi_value(capacity(buf).map(|n| Value::I32(n as i32)))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_buffer_ptr(buf: Value) -> Value {
    abi_value(as_ptr(buf))
}

/// Signature: `(Value, Value, Value) -> ()`
///
/// # Safety
///
/// `src` must be a pointer value valid for reads of `count` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_buffer_copy_from_ptr(buf: Value, src: Value, count: Value) {
    abi_unit((|| {
        let Value::Ptr(src) = src else {
            return Err(RtError::type_mismatch(
                "buffer_copy_from_ptr() expects a pointer argument",
            ));
        };
        let count = expect_int(count, "buffer_copy_from_ptr()")?.max(0) as usize;
        unsafe { copy_from_ptr(buf, src as *const u8, count) }
    })());
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_buffer_free(buf: Value) {
    abi_unit(free(buf));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtErrorKind;

    #[test]
    fn test_get_set() {
        let buf = Value::buffer(4);
        assert_eq!(len(buf).unwrap(), 4);
        assert!(capacity(buf).unwrap() >= 4);
        set(buf, 2, 0x1ff).unwrap();
        assert!(matches!(get(buf, 2).unwrap(), Value::U8(0xff)));
        assert!(matches!(get(buf, 0).unwrap(), Value::U8(0)));
        let err = get(buf, 4).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::IndexOutOfBounds { .. }));
        buf.release();
    }

    #[test]
    fn test_copy_from_ptr() {
        let buf = Value::buffer(3);
        let src = [7u8, 8, 9];
        unsafe { copy_from_ptr(buf, src.as_ptr(), 3) }.unwrap();
        assert!(matches!(get(buf, 1).unwrap(), Value::U8(8)));
        assert!(unsafe { copy_from_ptr(buf, src.as_ptr(), 4) }.is_err());
        let Value::Ptr(p) = as_ptr(buf).unwrap() else {
            panic!("expected pointer");
        };
        assert_eq!(unsafe { *(p as *const u8) }, 7);
        buf.release();
    }

    #[test]
    fn test_double_free_detected() {
        let buf = Value::buffer(8);
        free(buf).unwrap();
        let err = free(buf).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::UseAfterFree(_)));
        assert_eq!(err.to_string(), "double free detected");
        assert!(get(buf, 0).is_err());
        buf.release();
    }
}
