//! Units of work and their completion handles

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::pool;

/// Native work callback: `(data, ctx) -> result`.
pub type WorkFn = extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void;

enum Job {
    Native {
        func: WorkFn,
        data: *mut c_void,
        ctx: *mut c_void,
    },
    Boxed(Box<dyn FnOnce() + Send>),
}

pub struct WorkItem {
    job: Mutex<Option<Job>>,
    data: *mut c_void,
    result: AtomicPtr<c_void>,
    completed: AtomicBool,
    lock: Mutex<()>,
    done: Condvar,
}

// The submitter of a native item vouches for `data` and `ctx` being usable
// from a worker thread.
unsafe impl Send for WorkItem {}
unsafe impl Sync for WorkItem {}

impl WorkItem {
    fn with_job(job: Job, data: *mut c_void) -> Arc<Self> {
        Arc::new(Self {
            job: Mutex::new(Some(job)),
            data,
            result: AtomicPtr::new(core::ptr::null_mut()),
            completed: AtomicBool::new(false),
            lock: Mutex::new(()),
            done: Condvar::new(),
        })
    }

    pub(crate) fn native(func: WorkFn, data: *mut c_void, ctx: *mut c_void) -> Arc<Self> {
        Self::with_job(Job::Native { func, data, ctx }, data)
    }

    pub(crate) fn boxed(f: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Self::with_job(Job::Boxed(Box::new(f)), core::ptr::null_mut())
    }

    #[cfg(test)]
    pub(crate) fn data_ptr(&self) -> *mut c_void {
        self.data
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Run the job, store its result and wake waiters. A second call is a
    /// no-op.
    pub(crate) fn execute(&self) {
        let Some(job) = self.job.lock().take() else {
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| match job {
            Job::Native { func, data, ctx } => func(data, ctx),
            Job::Boxed(f) => {
                f();
                core::ptr::null_mut()
            }
        }));
        match outcome {
            Ok(result) => self.result.store(result, Ordering::Relaxed),
            Err(_) => tracing::error!("work item panicked"),
        }
        self.completed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.done.notify_all();
    }

    /// Block until the item has run and return its result.
    ///
    /// On a pool worker the wait keeps executing queued work, so nested
    /// waits cannot starve the pool.
    pub fn wait(&self) -> *mut c_void {
        while !self.is_complete() {
            if pool::help_once() {
                continue;
            }
            let mut guard = self.lock.lock();
            if !self.is_complete() {
                let timeout = if pool::on_worker() {
                    super::IDLE_SLEEP
                } else {
                    Duration::from_millis(50)
                };
                self.done.wait_for(&mut guard, timeout);
            }
        }
        self.result.load(Ordering::Relaxed)
    }
}

/// Handle returned by [`submit`](super::ThreadPool::submit).
#[derive(Clone)]
pub struct WorkHandle(pub(crate) Arc<WorkItem>);

impl WorkHandle {
    pub fn wait(&self) -> *mut c_void {
        self.0.wait()
    }

    pub fn is_complete(&self) -> bool {
        self.0.is_complete()
    }

    pub(crate) fn into_raw(self) -> *const WorkItem {
        Arc::into_raw(self.0)
    }

    /// # Safety
    ///
    /// `ptr` must come from [`WorkHandle::into_raw`] and not have been
    /// reclaimed yet.
    pub(crate) unsafe fn from_raw(ptr: *const WorkItem) -> Self {
        WorkHandle(unsafe { Arc::from_raw(ptr) })
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("data", &self.data)
            .field("completed", &self.is_complete())
            .finish()
    }
}

impl std::fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WorkHandle").field(&self.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn echo(data: *mut c_void, _ctx: *mut c_void) -> *mut c_void {
        data
    }

    #[test]
    fn test_native_item_runs_once() {
        let item = WorkItem::native(echo, 0x40 as *mut c_void, core::ptr::null_mut());
        assert_eq!(
            format!("{item:?}"),
            "WorkItem { data: 0x40, completed: false }"
        );
        item.execute();
        item.execute();
        assert!(item.is_complete());
        assert_eq!(item.wait(), 0x40 as *mut c_void);
        let handle = WorkHandle(item);
        assert_eq!(
            format!("{handle:?}"),
            "WorkHandle(WorkItem { data: 0x40, completed: true })"
        );
    }
}
