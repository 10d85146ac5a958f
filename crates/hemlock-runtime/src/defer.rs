//! Deferred cleanup
//!
//! A per-thread LIFO stack of actions. Generated code pushes an entry for
//! each `defer` statement and pops it on every exit edge of the enclosing
//! function; [`protect`](crate::exception::protect) unwinds to its entry
//! mark on both normal and exceptional exit.

use core::ffi::c_void;

use smallvec::SmallVec;

use crate::call::call_function;
use crate::error::RtResult;
use crate::exception::{abi_unit, discard};
use crate::tls::with_thread_state;
use crate::value::{Owned, Value};

/// Native cleanup callback.
pub type DeferFn = extern "C" fn(*mut c_void);

pub(crate) enum DeferEntry {
    Native { func: DeferFn, arg: *mut c_void },
    Call { func: Owned, args: SmallVec<[Owned; 4]> },
}

impl DeferEntry {
    fn run(self) -> RtResult<()> {
        match self {
            DeferEntry::Native { func, arg } => {
                func(arg);
                Ok(())
            }
            DeferEntry::Call { func, args } => {
                let argv: SmallVec<[Value; 4]> = args.iter().map(Owned::get).collect();
                call_function(func.get(), &argv)?.release();
                Ok(())
            }
        }
    }
}

fn push_entry(entry: DeferEntry) {
    with_thread_state(|ts| ts.defers.borrow_mut().push(entry));
}

/// Register a native callback.
pub fn push(func: DeferFn, arg: *mut c_void) {
    push_entry(DeferEntry::Native { func, arg });
}

/// Register a call of `func` with no arguments. The entry keeps its own
/// reference to `func` until it has run.
pub fn push_call(func: Value) {
    push_call_with_args(func, &[]);
}

/// Register a call of `func` with `args`, each retained by the entry.
pub fn push_call_with_args(func: Value, args: &[Value]) {
    push_entry(DeferEntry::Call {
        func: Owned::retained(func),
        args: args.iter().copied().map(Owned::retained).collect(),
    });
}

/// Number of entries on this thread's stack.
pub fn depth() -> usize {
    with_thread_state(|ts| ts.defers.borrow().len())
}

/// Run the most recent entry. An empty stack is a no-op.
pub fn pop_and_execute() -> RtResult<()> {
    // The borrow ends before the entry runs; it may push defers of its own.
    let entry = with_thread_state(|ts| ts.defers.borrow_mut().pop());
    match entry {
        Some(entry) => entry.run(),
        None => Ok(()),
    }
}

/// Run entries until only `mark` remain. Failures are logged and skipped so
/// every entry gets its turn.
pub fn unwind_to(mark: usize) {
    while depth() > mark {
        if let Err(err) = pop_and_execute() {
            discard(err, "deferred call");
        }
    }
}

/// Run every entry on this thread's stack.
pub fn execute_all() {
    unwind_to(0);
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(ptr, ptr) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_defer_push(func: DeferFn, arg: *mut c_void) {
    push(func, arg);
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_defer_push_call(func: Value) {
    push_call(func);
}

/// Signature: `(Value, ptr, i32) -> ()`
///
/// # Safety
///
/// `args` must point to `count` initialized values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_defer_push_call_with_args(func: Value, args: *const Value, count: i32) {
    let args = if args.is_null() || count <= 0 {
        &[][..]
    } else {
        unsafe { core::slice::from_raw_parts(args, count as usize) }
    };
    push_call_with_args(func, args);
}

/// Signature: `() -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_defer_pop_and_execute() {
    abi_unit(pop_and_execute());
}

/// Signature: `() -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_defer_execute_all() {
    execute_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;
    use crate::call::builtin_args;
    use crate::error::RtError;
    use crate::exception::{protect, throw};

    thread_local! {
        static LOG: std::cell::RefCell<Vec<usize>> = const { std::cell::RefCell::new(Vec::new()) };
    }

    extern "C" fn record(arg: *mut c_void) {
        LOG.with(|log| log.borrow_mut().push(arg as usize));
    }

    fn take_log() -> Vec<usize> {
        LOG.with(|log| core::mem::take(&mut *log.borrow_mut()))
    }

    #[test]
    fn test_lifo_on_normal_exit() {
        let result = protect(|| {
            push(record, 1 as *mut c_void);
            push(record, 2 as *mut c_void);
            push(record, 3 as *mut c_void);
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(take_log(), vec![3, 2, 1]);
        assert_eq!(depth(), 0);
    }

    #[test]
    fn test_lifo_on_exceptional_exit() {
        let e = Value::string_from("E");
        let caught = protect(|| -> RtResult<()> {
            push(record, 1 as *mut c_void);
            push(record, 2 as *mut c_void);
            Err(throw(e))
        })
        .unwrap_err();
        assert_eq!(take_log(), vec![2, 1]);
        assert_eq!(caught.get().as_str(), Some("E"));
        drop(caught);
        e.release();
    }

    extern "C" fn push_arg(args: *const Value, count: i32) -> Value {
        let args = unsafe { builtin_args(args, count) };
        if let [target, item] = args {
            let _ = array::push(*target, *item);
        }
        Value::Null
    }

    #[test]
    fn test_deferred_call_retains_until_run() {
        let f = Value::builtin("push_arg", push_arg);
        let target = Value::array();
        let item = Value::string_from("done");
        push_call_with_args(f, &[target, item]);
        assert_eq!(item.refcount(), 2);
        pop_and_execute().unwrap();
        assert_eq!(array::len(target).unwrap(), 1);
        assert_eq!(item.refcount(), 2);
        for v in [f, target, item] {
            v.release();
        }
    }

    extern "C" fn always_fails(_args: *const Value, _count: i32) -> Value {
        crate::exception::raise(RtError::runtime("cleanup failed"));
        Value::Null
    }

    #[test]
    fn test_failing_defer_does_not_stop_unwind() {
        let f = Value::builtin("always_fails", always_fails);
        let result = protect(|| {
            push(record, 9 as *mut c_void);
            push_call(f);
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(take_log(), vec![9]);
        f.release();
    }
}
