//! Per-thread runtime state.
//!
//! The exception stack, defer stack, call-depth guard, method receiver and
//! worker identity are all thread-local. They are consolidated into a single
//! [`ThreadState`] struct, created lazily on first access from each thread.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicU32, Ordering};

use smallvec::SmallVec;

use crate::config::DEFAULT_STACK_LIMIT;
use crate::defer::DeferEntry;
use crate::value::Value;

/// Stack limit given to threads that have not set their own.
static INITIAL_STACK_LIMIT: AtomicU32 = AtomicU32::new(DEFAULT_STACK_LIMIT);

pub(crate) fn set_initial_stack_limit(limit: u32) {
    INITIAL_STACK_LIMIT.store(limit, Ordering::Relaxed);
}

// =============================================================================
// Exception frames
// =============================================================================

/// One protected region. `in_flight` holds the thrown value (one owned
/// reference) between a raise and the catch site picking it up.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    pub(crate) in_flight: Option<Value>,
}

// =============================================================================
// Thread-local state
// =============================================================================

pub(crate) struct ThreadState {
    pub(crate) frames: RefCell<SmallVec<[Frame; 8]>>,
    /// Set while an exception is travelling towards its catch site.
    pub(crate) pending: Cell<bool>,
    pub(crate) defers: RefCell<Vec<DeferEntry>>,
    pub(crate) call_depth: Cell<u32>,
    pub(crate) stack_limit: Cell<u32>,
    /// Receiver of the method call currently executing (one owned reference).
    pub(crate) self_value: Cell<Value>,
    /// Index of the pool worker running on this thread, if any.
    pub(crate) worker_index: Cell<Option<usize>>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            frames: RefCell::new(SmallVec::new()),
            pending: Cell::new(false),
            defers: RefCell::new(Vec::new()),
            call_depth: Cell::new(0),
            stack_limit: Cell::new(INITIAL_STACK_LIMIT.load(Ordering::Relaxed)),
            self_value: Cell::new(Value::Null),
            worker_index: Cell::new(None),
        }
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        for frame in self.frames.get_mut().drain(..) {
            if let Some(value) = frame.in_flight {
                value.release();
            }
        }
        // Defer entries release their captures when dropped.
        self.defers.get_mut().clear();
        self.self_value.replace(Value::Null).release();
    }
}

std::thread_local! {
    static THREAD_STATE: ThreadState = ThreadState::new();
}

/// Run `f` with this thread's runtime state.
///
/// Never hold a `RefCell` borrow from the state across a call back into
/// user code.
pub(crate) fn with_thread_state<R>(f: impl FnOnce(&ThreadState) -> R) -> R {
    THREAD_STATE.with(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        with_thread_state(|ts| {
            assert!(!ts.pending.get());
            assert_eq!(ts.call_depth.get(), 0);
            assert!(ts.self_value.get().is_null());
            assert!(ts.worker_index.get().is_none());
        });
    }

    #[test]
    fn test_state_is_per_thread() {
        with_thread_state(|ts| ts.call_depth.set(7));
        let other = std::thread::spawn(|| with_thread_state(|ts| ts.call_depth.get()))
            .join()
            .unwrap();
        assert_eq!(other, 0);
        with_thread_state(|ts| {
            assert_eq!(ts.call_depth.get(), 7);
            ts.call_depth.set(0);
        });
    }
}
