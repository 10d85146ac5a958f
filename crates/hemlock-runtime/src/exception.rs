//! Exceptions
//!
//! Inside the runtime every fallible operation returns [`RtResult`]. An
//! error becomes a thrown value only when it is *raised*: at an `extern "C"`
//! boundary (see [`abi_value`]) or when it reaches a [`protect`] scope.
//! Raising stores the value in the innermost exception frame and sets the
//! thread's pending flag, which generated code tests after each runtime
//! call. With no frame on the stack the exception is uncaught: it is printed
//! and the process exits with status 1.

use core::ffi::{CStr, c_char};
use std::io::Write as _;

use crate::convert::to_bool;
use crate::defer;
use crate::error::{RtError, RtErrorKind, RtResult};
use crate::format::to_display_string;
use crate::tls::{Frame, with_thread_state};
use crate::value::{Owned, Value};

// =============================================================================
// Frames
// =============================================================================

/// Push a new exception frame. Returns the frame depth after the push.
pub fn push_context() -> usize {
    with_thread_state(|ts| {
        let mut frames = ts.frames.borrow_mut();
        frames.push(Frame::default());
        frames.len()
    })
}

/// Pop the innermost frame, releasing any value still in flight in it.
pub fn pop_context() {
    let frame = with_thread_state(|ts| ts.frames.borrow_mut().pop());
    if let Some(value) = frame.and_then(|f| f.in_flight) {
        value.release();
    }
}

/// Number of active exception frames on this thread.
pub fn context_depth() -> usize {
    with_thread_state(|ts| ts.frames.borrow().len())
}

/// The value in flight in the innermost frame, retained, or null.
pub fn get_value() -> Value {
    with_thread_state(|ts| {
        let frames = ts.frames.borrow();
        match frames.last().and_then(|f| f.in_flight) {
            Some(v) => {
                v.retain();
                v
            }
            None => Value::Null,
        }
    })
}

/// Whether an exception is travelling towards its catch site.
pub fn exception_pending() -> bool {
    with_thread_state(|ts| ts.pending.get())
}

/// Clear the pending flag. The in-flight value stays in its frame until the
/// frame is popped.
pub fn clear_pending() {
    with_thread_state(|ts| ts.pending.set(false));
}

/// Move the in-flight value out of the innermost frame and clear the pending
/// flag. The caller owns the returned reference.
pub fn take_in_flight() -> Value {
    with_thread_state(|ts| {
        ts.pending.set(false);
        ts.frames
            .borrow_mut()
            .last_mut()
            .and_then(|f| f.in_flight.take())
            .unwrap_or(Value::Null)
    })
}

// =============================================================================
// Raising
// =============================================================================

fn uncaught(value: Value) -> ! {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "Uncaught exception: {}", to_display_string(value));
    let _ = stderr.flush();
    std::process::exit(1);
}

/// Store `err` as the thrown value of the innermost frame and mark it
/// pending. Exits the process when no frame is active.
pub fn raise(err: RtError) {
    if matches!(err.kind(), RtErrorKind::Propagated) {
        with_thread_state(|ts| ts.pending.set(true));
        return;
    }
    let value = err.into_value();
    let displaced = with_thread_state(|ts| {
        let mut frames = ts.frames.borrow_mut();
        let frame = frames.last_mut()?;
        ts.pending.set(true);
        Some(frame.in_flight.replace(value))
    });
    match displaced {
        Some(old) => {
            if let Some(old) = old {
                old.release();
            }
        }
        None => uncaught(value),
    }
}

/// Build the error that throws `value`. The exception takes its own
/// reference; the caller's reference is untouched.
pub fn throw(value: Value) -> RtError {
    RtError::user(Owned::retained(value))
}

/// Runtime failure with a formatted diagnostic, caught as a string value.
pub fn runtime_error(msg: impl std::fmt::Display) -> RtError {
    RtError::runtime(msg)
}

/// Drop an error nobody will catch, logging it.
pub(crate) fn discard(err: RtError, context: &str) {
    match err.kind() {
        RtErrorKind::Propagated => {
            let value = take_in_flight();
            tracing::warn!(
                context,
                error = %to_display_string(value),
                "exception swallowed"
            );
            value.release();
        }
        _ => tracing::warn!(context, error = %err, "exception swallowed"),
    }
}

/// Finish an ABI call that produces a value: errors are raised and the call
/// yields null.
pub(crate) fn abi_value(result: RtResult<Value>) -> Value {
    result.unwrap_or_else(|err| {
        raise(err);
        Value::Null
    })
}

pub(crate) fn abi_unit(result: RtResult<()>) {
    if let Err(err) = result {
        raise(err);
    }
}

pub(crate) fn abi_scalar<T: Default>(result: RtResult<T>) -> T {
    result.unwrap_or_else(|err| {
        raise(err);
        T::default()
    })
}

// =============================================================================
// Protected scopes
// =============================================================================

/// Run `body` inside its own exception frame.
///
/// Defers pushed while the body runs are executed on both exits, in LIFO
/// order, before this returns. On failure the thrown value is returned with
/// the reference the frame held.
pub fn protect<T>(body: impl FnOnce() -> RtResult<T>) -> Result<T, Owned> {
    let mark = defer::depth();
    push_context();
    let result = body();
    let outcome = match result {
        Ok(value) => Ok(value),
        Err(err) => {
            raise(err);
            Err(Owned::new(take_in_flight()))
        }
    };
    defer::unwind_to(mark);
    pop_context();
    outcome
}

// =============================================================================
// Assertions
// =============================================================================

/// Throw `message` (or "assertion failed" when it is not a string) unless
/// `condition` is truthy.
pub fn assert(condition: Value, message: Value) -> RtResult<()> {
    if to_bool(condition) {
        return Ok(());
    }
    if message.is_string() {
        Err(throw(message))
    } else {
        Err(RtError::user(Owned::new(Value::string_from(
            "assertion failed",
        ))))
    }
}

/// Print `panic: <message>` and exit with status 1. Not catchable.
pub fn panic(message: Value) -> ! {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "panic: {}", to_display_string(message));
    let _ = stderr.flush();
    std::process::exit(1);
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `() -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_exception_push() -> i32 {
    push_context() as i32
}

/// Signature: `() -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_exception_pop() {
    pop_context();
}

/// Signature: `() -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_exception_get_value() -> Value {
    get_value()
}

/// Signature: `() -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_exception_pending() -> i32 {
    exception_pending() as i32
}

/// Signature: `() -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_exception_clear() {
    clear_pending();
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_throw(value: Value) {
    raise(throw(value));
}

/// Signature: `(ptr) -> ()`
///
/// # Safety
///
/// `msg` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_runtime_error(msg: *const c_char) {
    let text = if msg.is_null() {
        std::borrow::Cow::Borrowed("runtime error")
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy()
    };
    raise(runtime_error(text));
}

/// Signature: `(Value, Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_assert(condition: Value, message: Value) {
    abi_unit(assert(condition, message));
}

/// Signature: `(Value) -> !`
#[unsafe(no_mangle)]
pub extern "C" fn hml_panic(message: Value) -> ! {
    panic(message)
}
