//! Raw memory and opaque pointers
//!
//! `alloc` hands out untyped memory addressed through `ptr` values. The
//! allocation size is kept in a small header in front of the returned
//! address so `free` needs only the pointer. Typed reads and writes are
//! unaligned and fail with NullDereference on a null pointer.

use core::alloc::Layout;
use core::ffi::c_void;

use crate::convert::{expect_int, to_f64};
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value};
use crate::value::Value;

/// Bytes reserved in front of each allocation for its size.
const ALLOC_HEADER: usize = 16;

fn layout_for(size: usize) -> RtResult<Layout> {
    let total = size
        .checked_add(ALLOC_HEADER)
        .ok_or_else(|| RtError::exhausted("alloc() size overflow"))?;
    Layout::from_size_align(total, ALLOC_HEADER)
        .map_err(|_| RtError::exhausted("alloc() size overflow"))
}

/// Allocate `size` zeroed bytes.
pub fn alloc(size: i64) -> RtResult<Value> {
    if size < 0 {
        return Err(RtError::range(format!(
            "alloc() size must be non-negative, got {size}"
        )));
    }
    let layout = layout_for(size as usize)?;
    let base = unsafe { std::alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return Err(RtError::exhausted(format!(
            "alloc() could not allocate {size} bytes"
        )));
    }
    unsafe {
        (base as *mut usize).write(size as usize);
        Ok(Value::Ptr(base.add(ALLOC_HEADER) as *mut c_void))
    }
}

/// Release memory obtained from [`alloc`]. Freeing null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or come from [`alloc`] and not have been freed.
pub unsafe fn free(ptr: Value) -> RtResult<()> {
    let p = match ptr {
        Value::Ptr(p) => p,
        other => {
            return Err(RtError::type_mismatch(format!(
                "free() expects a pointer, got {}",
                other.type_name()
            )));
        }
    };
    if p.is_null() {
        return Ok(());
    }
    unsafe {
        let base = (p as *mut u8).sub(ALLOC_HEADER);
        let size = (base as *const usize).read();
        let layout = layout_for(size)?;
        std::alloc::dealloc(base, layout);
    }
    Ok(())
}

pub(crate) fn raw_ptr(ptr: Value, op: &'static str) -> RtResult<*mut c_void> {
    match ptr {
        Value::Ptr(p) if p.is_null() => Err(RtError::null_dereference(op)),
        Value::Ptr(p) => Ok(p),
        other => Err(RtError::type_mismatch(format!(
            "{op}() expects a pointer argument, got {}",
            other.type_name()
        ))),
    }
}

/// `ptr + offset` bytes.
pub fn offset(ptr: Value, offset: i64) -> RtResult<Value> {
    match ptr {
        Value::Ptr(p) => Ok(Value::Ptr(
            (p as *mut u8).wrapping_offset(offset as isize) as *mut c_void,
        )),
        other => Err(RtError::type_mismatch(format!(
            "ptr_offset() expects a pointer argument, got {}",
            other.type_name()
        ))),
    }
}

pub fn is_null(ptr: Value) -> bool {
    matches!(ptr, Value::Ptr(p) if p.is_null())
}

fn int_arg(value: Value, op: &str) -> RtResult<i64> {
    expect_int(value, op)
}

fn float_arg(value: Value, op: &str) -> RtResult<f64> {
    to_f64(value).map_err(|_| {
        RtError::type_mismatch(format!("{op}() expects a numeric value, got {}", value.type_name()))
    })
}

macro_rules! ptr_access {
    ($($read:ident / $write:ident / $abi_read:ident / $abi_write:ident: $ty:ty => $variant:ident via $conv:ident;)*) => {
        $(
            /// # Safety
            ///
            /// `ptr` must be null or valid for an unaligned read of the type.
            pub unsafe fn $read(ptr: Value) -> RtResult<Value> {
                let p = raw_ptr(ptr, stringify!($read))?;
                Ok(Value::$variant(unsafe { (p as *const $ty).read_unaligned() }))
            }

            /// # Safety
            ///
            /// `ptr` must be null or valid for an unaligned write of the type.
            pub unsafe fn $write(ptr: Value, value: Value) -> RtResult<()> {
                let p = raw_ptr(ptr, stringify!($write))?;
                let raw = $conv(value, stringify!($write))? as $ty;
                unsafe { (p as *mut $ty).write_unaligned(raw) };
                Ok(())
            }

            /// Signature: `(Value) -> Value`
            ///
            /// # Safety
            ///
            /// See the Rust function of the same operation.
            #[unsafe(no_mangle)]
            pub unsafe extern "C" fn $abi_read(ptr: Value) -> Value {
                abi_value(unsafe { $read(ptr) })
            }

            /// Signature: `(Value, Value) -> ()`
            ///
            /// # Safety
            ///
            /// See the Rust function of the same operation.
            #[unsafe(no_mangle)]
            pub unsafe extern "C" fn $abi_write(ptr: Value, value: Value) {
                abi_unit(unsafe { $write(ptr, value) });
            }
        )*
    };
}

ptr_access! {
    read_i8 / write_i8 / hml_ptr_read_i8 / hml_ptr_write_i8: i8 => I8 via int_arg;
    read_i16 / write_i16 / hml_ptr_read_i16 / hml_ptr_write_i16: i16 => I16 via int_arg;
    read_i32 / write_i32 / hml_ptr_read_i32 / hml_ptr_write_i32: i32 => I32 via int_arg;
    read_i64 / write_i64 / hml_ptr_read_i64 / hml_ptr_write_i64: i64 => I64 via int_arg;
    read_u8 / write_u8 / hml_ptr_read_u8 / hml_ptr_write_u8: u8 => U8 via int_arg;
    read_u16 / write_u16 / hml_ptr_read_u16 / hml_ptr_write_u16: u16 => U16 via int_arg;
    read_u32 / write_u32 / hml_ptr_read_u32 / hml_ptr_write_u32: u32 => U32 via int_arg;
    read_u64 / write_u64 / hml_ptr_read_u64 / hml_ptr_write_u64: u64 => U64 via int_arg;
    read_f32 / write_f32 / hml_ptr_read_f32 / hml_ptr_write_f32: f32 => F32 via float_arg;
    read_f64 / write_f64 / hml_ptr_read_f64 / hml_ptr_write_f64: f64 => F64 via float_arg;
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_alloc(size: Value) -> Value {
    abi_value(expect_int(size, "alloc").and_then(alloc))
}

/// Signature: `(Value) -> ()`
///
/// # Safety
///
/// `ptr` must be null or come from `hml_alloc` and not have been freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_free(ptr: Value) {
    abi_unit(unsafe { free(ptr) });
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_ptr_offset(ptr: Value, delta: Value) -> Value {
    abi_value(expect_int(delta, "ptr_offset").and_then(|d| offset(ptr, d)))
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_ptr_is_null(ptr: Value) -> i32 {
    is_null(ptr) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtErrorKind;

    #[test]
    fn test_alloc_read_write_free() {
        let p = alloc(16).unwrap();
        unsafe {
            assert!(matches!(read_i64(p).unwrap(), Value::I64(0)));
            write_i32(p, Value::I32(-5)).unwrap();
            assert!(matches!(read_i32(p).unwrap(), Value::I32(-5)));
            let q = offset(p, 8).unwrap();
            write_f64(q, Value::I32(2)).unwrap();
            assert!(matches!(read_f64(q).unwrap(), Value::F64(x) if x == 2.0));
            write_u8(p, Value::I32(300)).unwrap();
            assert!(matches!(read_u8(p).unwrap(), Value::U8(44)));
            free(p).unwrap();
        }
    }

    #[test]
    fn test_null_dereference() {
        let null = Value::Ptr(core::ptr::null_mut());
        assert!(is_null(null));
        let err = unsafe { read_i32(null) }.unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::NullDereference(_)));
        assert!(unsafe { free(null) }.is_ok());
    }

    #[test]
    fn test_non_pointer_rejected() {
        let err = unsafe { read_i32(Value::I32(1)) }.unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::TypeMismatch(_)));
        assert!(alloc(-1).is_err());
    }
}
