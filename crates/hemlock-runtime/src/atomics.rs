//! Sequentially consistent atomics on raw memory
//!
//! Each operation takes a `ptr` value addressing a naturally aligned 32- or
//! 64-bit integer, typically memory from `alloc`. Fetch operations return
//! the previous value; compare-and-swap returns whether it stored.

use core::sync::atomic::{AtomicI32, AtomicI64, Ordering, fence as atomic_fence};

use crate::convert::expect_int;
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value};
use crate::pointer::raw_ptr;
use crate::value::Value;

const ORDER: Ordering = Ordering::SeqCst;

/// View `ptr` as an atomic cell.
///
/// # Safety
///
/// A non-null `ptr` must address live memory of the atomic's size for as
/// long as the returned reference is used.
unsafe fn atomic_at<'a, A>(ptr: Value, op: &'static str) -> RtResult<&'a A> {
    let p = raw_ptr(ptr, op)?;
    if (p as usize) % core::mem::align_of::<A>() != 0 {
        return Err(RtError::range(format!(
            "{op}() requires a pointer aligned to {} bytes",
            core::mem::align_of::<A>()
        )));
    }
    Ok(unsafe { &*(p as *const A) })
}

macro_rules! atomic_width {
    (
        $ty:ty, $atomic:ty, $variant:ident;
        $load:ident / $abi_load:ident,
        $store:ident / $abi_store:ident,
        $exchange:ident / $abi_exchange:ident,
        $cas:ident / $abi_cas:ident;
        $($fetch:ident / $abi_fetch:ident => $method:ident),* $(,)?
    ) => {
        /// # Safety
        ///
        /// `ptr` must be null or address live, aligned memory.
        pub unsafe fn $load(ptr: Value) -> RtResult<Value> {
            let cell = unsafe { atomic_at::<$atomic>(ptr, concat!("atomic_", stringify!($load))) }?;
            Ok(Value::$variant(cell.load(ORDER)))
        }

        /// # Safety
        ///
        /// `ptr` must be null or address live, aligned memory.
        pub unsafe fn $store(ptr: Value, value: Value) -> RtResult<()> {
            const OP: &str = concat!("atomic_", stringify!($store));
            let cell = unsafe { atomic_at::<$atomic>(ptr, OP) }?;
            cell.store(expect_int(value, OP)? as $ty, ORDER);
            Ok(())
        }

        /// # Safety
        ///
        /// `ptr` must be null or address live, aligned memory.
        pub unsafe fn $exchange(ptr: Value, value: Value) -> RtResult<Value> {
            const OP: &str = concat!("atomic_", stringify!($exchange));
            let cell = unsafe { atomic_at::<$atomic>(ptr, OP) }?;
            Ok(Value::$variant(cell.swap(expect_int(value, OP)? as $ty, ORDER)))
        }

        /// # Safety
        ///
        /// `ptr` must be null or address live, aligned memory.
        pub unsafe fn $cas(ptr: Value, expected: Value, desired: Value) -> RtResult<bool> {
            const OP: &str = concat!("atomic_", stringify!($cas));
            let cell = unsafe { atomic_at::<$atomic>(ptr, OP) }?;
            let expected = expect_int(expected, OP)? as $ty;
            let desired = expect_int(desired, OP)? as $ty;
            Ok(cell.compare_exchange(expected, desired, ORDER, ORDER).is_ok())
        }

        $(
            /// Returns the previous value.
            ///
            /// # Safety
            ///
            /// `ptr` must be null or address live, aligned memory.
            pub unsafe fn $fetch(ptr: Value, value: Value) -> RtResult<Value> {
                const OP: &str = concat!("atomic_", stringify!($fetch));
                let cell = unsafe { atomic_at::<$atomic>(ptr, OP) }?;
                Ok(Value::$variant(cell.$method(expect_int(value, OP)? as $ty, ORDER)))
            }

            /// Signature: `(Value, Value) -> Value`
            ///
            /// # Safety
            ///
            /// See the Rust function of the same operation.
            #[unsafe(no_mangle)]
            pub unsafe extern "C" fn $abi_fetch(ptr: Value, value: Value) -> Value {
                abi_value(unsafe { $fetch(ptr, value) })
            }
        )*

        /// Signature: `(Value) -> Value`
        ///
        /// # Safety
        ///
        /// See the Rust function of the same operation.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $abi_load(ptr: Value) -> Value {
            abi_value(unsafe { $load(ptr) })
        }

        /// Signature: `(Value, Value) -> ()`
        ///
        /// # Safety
        ///
        /// See the Rust function of the same operation.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $abi_store(ptr: Value, value: Value) {
            abi_unit(unsafe { $store(ptr, value) });
        }

        /// Signature: `(Value, Value) -> Value`
        ///
        /// # Safety
        ///
        /// See the Rust function of the same operation.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $abi_exchange(ptr: Value, value: Value) -> Value {
            abi_value(unsafe { $exchange(ptr, value) })
        }

        /// Signature: `(Value, Value, Value) -> Value`
        ///
        /// # Safety
        ///
        /// See the Rust function of the same operation.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $abi_cas(ptr: Value, expected: Value, desired: Value) -> Value {
            abi_value(unsafe { $cas(ptr, expected, desired) }.map(Value::Bool))
        }
    };
}

atomic_width! {
    i32, AtomicI32, I32;
    load_i32 / hml_atomic_load_i32,
    store_i32 / hml_atomic_store_i32,
    exchange_i32 / hml_atomic_exchange_i32,
    cas_i32 / hml_atomic_cas_i32;
    add_i32 / hml_atomic_add_i32 => fetch_add,
    sub_i32 / hml_atomic_sub_i32 => fetch_sub,
    and_i32 / hml_atomic_and_i32 => fetch_and,
    or_i32 / hml_atomic_or_i32 => fetch_or,
    xor_i32 / hml_atomic_xor_i32 => fetch_xor,
}

atomic_width! {
    i64, AtomicI64, I64;
    load_i64 / hml_atomic_load_i64,
    store_i64 / hml_atomic_store_i64,
    exchange_i64 / hml_atomic_exchange_i64,
    cas_i64 / hml_atomic_cas_i64;
    add_i64 / hml_atomic_add_i64 => fetch_add,
    sub_i64 / hml_atomic_sub_i64 => fetch_sub,
    and_i64 / hml_atomic_and_i64 => fetch_and,
    or_i64 / hml_atomic_or_i64 => fetch_or,
    xor_i64 / hml_atomic_xor_i64 => fetch_xor,
}

/// Full sequentially consistent fence.
pub fn fence() {
    atomic_fence(ORDER);
}

/// Signature: `() -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_atomic_fence() {
    fence();
}
