//! Work-stealing scheduler
//!
//! A fixed pool of worker threads, each with its own Chase–Lev deque, fed by
//! a bounded submission queue for work coming from outside the pool. Tasks
//! and native work items both run here.

use core::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

mod deque;
mod pool;
mod work_item;

pub use pool::{PoolStats, ThreadPool, current_worker_id};
pub use work_item::{WorkFn, WorkHandle, WorkItem};

use crate::config::RuntimeConfig;
use crate::error::{RtError, RtResult};
use crate::exception::abi_unit;

pub const DEQUE_INITIAL_CAPACITY: usize = 64;
pub const DEQUE_MAX_CAPACITY: usize = 65_536;
pub const SUBMISSION_QUEUE_CAPACITY: usize = 4_096;
/// Random victims tried before an idle worker parks.
pub const STEAL_ATTEMPTS: usize = 32;
pub const IDLE_SLEEP: Duration = Duration::from_micros(100);

// =============================================================================
// Global pool
// =============================================================================

static GLOBAL: Mutex<Option<Arc<ThreadPool>>> = Mutex::new(None);

/// Start the process-wide pool with `workers` threads (0 picks the hardware
/// parallelism). No-op if it is already running.
pub fn init_global(workers: usize) -> RtResult<Arc<ThreadPool>> {
    let mut slot = GLOBAL.lock();
    if let Some(pool) = slot.as_ref() {
        return Ok(Arc::clone(pool));
    }
    let config = RuntimeConfig {
        workers: (workers > 0).then_some(workers),
        ..RuntimeConfig::default()
    };
    let pool = Arc::new(ThreadPool::new(config.resolved_workers())?);
    *slot = Some(Arc::clone(&pool));
    Ok(pool)
}

/// The process-wide pool, started from the environment on first use.
pub fn global() -> RtResult<Arc<ThreadPool>> {
    if let Some(pool) = GLOBAL.lock().as_ref() {
        return Ok(Arc::clone(pool));
    }
    init_global(RuntimeConfig::from_env().resolved_workers())
}

/// Stop the process-wide pool, draining queued work first. A later
/// [`global`] starts a fresh one.
pub fn shutdown_global() {
    let pool = GLOBAL.lock().take();
    if let Some(pool) = pool {
        if pool::on_worker() {
            tracing::warn!("pool shutdown requested from a worker thread; ignored");
            *GLOBAL.lock() = Some(pool);
            return;
        }
        pool.shutdown();
    }
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(i32) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_thread_pool_init(workers: i32) {
    abi_unit(init_global(workers.max(0) as usize).map(drop));
}

/// Signature: `() -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_thread_pool_shutdown() {
    shutdown_global();
}

/// Queue `func(data, ctx)` on the global pool. The returned item must be
/// released with `hml_work_item_free`. Null on failure.
///
/// Signature: `(ptr, ptr, ptr) -> ptr`
#[unsafe(no_mangle)]
pub extern "C" fn hml_thread_pool_submit(
    func: WorkFn,
    data: *mut c_void,
    ctx: *mut c_void,
) -> *const WorkItem {
    let result = global().and_then(|pool| pool.submit(func, data, ctx));
    match result {
        Ok(handle) => handle.into_raw(),
        Err(err) => {
            crate::exception::raise(err);
            core::ptr::null()
        }
    }
}

/// Block until the item has run; returns its result.
///
/// Signature: `(ptr) -> ptr`
///
/// # Safety
///
/// `item` must come from `hml_thread_pool_submit` and not be freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_work_item_wait(item: *const WorkItem) -> *mut c_void {
    if item.is_null() {
        crate::exception::raise(RtError::null_dereference("work item"));
        return core::ptr::null_mut();
    }
    unsafe { &*item }.wait()
}

/// Signature: `(ptr) -> ()`
///
/// # Safety
///
/// `item` must be null or come from `hml_thread_pool_submit`, and is
/// invalid afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_work_item_free(item: *const WorkItem) {
    if !item.is_null() {
        drop(unsafe { WorkHandle::from_raw(item) });
    }
}

/// Index of the worker running the caller, or -1 off the pool.
///
/// Signature: `() -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_thread_pool_current_worker_id() -> i32 {
    current_worker_id().map_or(-1, |i| i as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    extern "C" fn square(data: *mut c_void, _ctx: *mut c_void) -> *mut c_void {
        let n = data as usize;
        (n * n) as *mut c_void
    }

    extern "C" fn worker_id(_data: *mut c_void, _ctx: *mut c_void) -> *mut c_void {
        (hml_thread_pool_current_worker_id() + 1) as usize as *mut c_void
    }

    #[test]
    #[serial]
    fn test_global_submit_and_wait() {
        hml_thread_pool_init(3);
        let items: Vec<_> = (0..50usize)
            .map(|i| hml_thread_pool_submit(square, i as *mut c_void, core::ptr::null_mut()))
            .collect();
        for (i, item) in items.into_iter().enumerate() {
            assert!(!item.is_null());
            let got = unsafe { hml_work_item_wait(item) } as usize;
            assert_eq!(got, i * i);
            unsafe { hml_work_item_free(item) };
        }
        hml_thread_pool_shutdown();
    }

    #[test]
    #[serial]
    fn test_work_runs_on_a_worker() {
        let pool = init_global(2).unwrap();
        assert_eq!(pool.num_workers(), 2);
        let handle = pool.submit(worker_id, core::ptr::null_mut(), core::ptr::null_mut()).unwrap();
        let id = handle.wait() as usize;
        assert!((1..=2).contains(&id));
        assert_eq!(hml_thread_pool_current_worker_id(), -1);
        shutdown_global();
    }

    #[test]
    #[serial]
    fn test_global_restarts_after_shutdown() {
        let first = init_global(2).unwrap();
        shutdown_global();
        let second = global().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        shutdown_global();
    }
}
