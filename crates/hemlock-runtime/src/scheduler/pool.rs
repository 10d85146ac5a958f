//! Fixed-size worker pool
//!
//! Each worker owns a [`Deque`]. Work submitted from a worker goes onto its
//! own deque; work from any other thread goes through the shared submission
//! queue. An idle worker looks at its deque, then the submission queue, then
//! tries to steal from randomly chosen peers before parking briefly on the
//! submission queue.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::deque::Deque;
use super::work_item::{WorkHandle, WorkItem};
use super::{
    DEQUE_INITIAL_CAPACITY, DEQUE_MAX_CAPACITY, IDLE_SLEEP, STEAL_ATTEMPTS,
    SUBMISSION_QUEUE_CAPACITY,
};
use crate::config::{MAX_WORKERS, MIN_WORKERS};
use crate::error::{RtError, RtResult};
use crate::tls::with_thread_state;

// =============================================================================
// Submission queue
// =============================================================================

struct SubmissionQueue {
    items: Mutex<VecDeque<Arc<WorkItem>>>,
    not_empty: Condvar,
    capacity: usize,
}

impl SubmissionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, item: Arc<WorkItem>) -> Result<(), Arc<WorkItem>> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Arc<WorkItem>> {
        self.items.lock().pop_front()
    }

    fn pop_wait(&self, timeout: Duration) -> Option<Arc<WorkItem>> {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.not_empty.wait_for(&mut items, timeout);
        }
        items.pop_front()
    }

    fn wake_all(&self) {
        let _items = self.items.lock();
        self.not_empty.notify_all();
    }
}

// =============================================================================
// Shared pool state
// =============================================================================

struct WorkerSlot {
    deque: Deque,
    executed: AtomicU64,
    stolen: AtomicU64,
}

struct Shared {
    workers: Box<[WorkerSlot]>,
    submission: SubmissionQueue,
    shutdown: AtomicBool,
}

impl Shared {
    fn steal(&self, index: usize, rng: &mut fastrand::Rng) -> Option<Arc<WorkItem>> {
        let n = self.workers.len();
        if n <= 1 {
            return None;
        }
        for _ in 0..STEAL_ATTEMPTS {
            let mut victim = rng.usize(..n);
            if victim == index {
                victim = (victim + 1) % n;
            }
            if let Some(item) = self.workers[victim].deque.steal() {
                self.workers[index].stolen.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(worker = index, victim, "stole work item");
                return Some(item);
            }
        }
        None
    }

    fn find_work(&self, index: usize, rng: &mut fastrand::Rng) -> Option<Arc<WorkItem>> {
        self.workers[index]
            .deque
            .pop()
            .or_else(|| self.submission.pop())
            .or_else(|| self.steal(index, rng))
    }

    fn run(&self, index: usize, item: Arc<WorkItem>) {
        item.execute();
        self.workers[index].executed.fetch_add(1, Ordering::Relaxed);
    }
}

struct WorkerContext {
    shared: Arc<Shared>,
    index: usize,
    rng: fastrand::Rng,
}

std::thread_local! {
    static WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Whether the current thread is a pool worker.
pub(crate) fn on_worker() -> bool {
    WORKER.with(|w| w.borrow().is_some())
}

/// On a worker, run one queued item if there is one. Returns whether an item
/// was run. Used by waits so a blocked worker keeps the pool moving.
pub(crate) fn help_once() -> bool {
    let found = WORKER.with(|w| {
        let mut ctx = w.borrow_mut();
        let ctx = ctx.as_mut()?;
        let item = ctx.shared.find_work(ctx.index, &mut ctx.rng)?;
        Some((Arc::clone(&ctx.shared), ctx.index, item))
    });
    match found {
        // The borrow is released before running: the item may wait itself.
        Some((shared, index, item)) => {
            shared.run(index, item);
            true
        }
        None => false,
    }
}

fn worker_main(shared: Arc<Shared>, index: usize) {
    with_thread_state(|ts| ts.worker_index.set(Some(index)));
    let seed = (index as u64).wrapping_mul(1_103_515_245).wrapping_add(12_345);
    WORKER.with(|w| {
        *w.borrow_mut() = Some(WorkerContext {
            shared: Arc::clone(&shared),
            index,
            rng: fastrand::Rng::with_seed(seed),
        });
    });
    tracing::debug!(worker = index, "worker started");

    while !shared.shutdown.load(Ordering::Acquire) {
        if help_once() {
            continue;
        }
        if let Some(item) = shared.submission.pop_wait(IDLE_SLEEP) {
            shared.run(index, item);
        }
    }
    while help_once() {}

    WORKER.with(|w| w.borrow_mut().take());
    with_thread_state(|ts| ts.worker_index.set(None));
    tracing::debug!(worker = index, "worker stopped");
}

// =============================================================================
// Thread pool
// =============================================================================

/// Totals across all workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub executed: u64,
    pub stolen: u64,
    /// Items waiting in deques and the submission queue.
    pub queued: usize,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Start a pool of `workers` threads, clamped to
    /// [`MIN_WORKERS`, `MAX_WORKERS`].
    pub fn new(workers: usize) -> RtResult<Self> {
        let n = workers.clamp(MIN_WORKERS, MAX_WORKERS);
        let shared = Arc::new(Shared {
            workers: (0..n)
                .map(|_| WorkerSlot {
                    deque: Deque::new(DEQUE_INITIAL_CAPACITY, DEQUE_MAX_CAPACITY),
                    executed: AtomicU64::new(0),
                    stolen: AtomicU64::new(0),
                })
                .collect(),
            submission: SubmissionQueue::new(SUBMISSION_QUEUE_CAPACITY),
            shutdown: AtomicBool::new(false),
        });
        let pool = Self {
            shared,
            threads: Mutex::new(Vec::with_capacity(n)),
        };
        for index in 0..n {
            let shared = Arc::clone(&pool.shared);
            let handle = std::thread::Builder::new()
                .name(format!("hemlock-worker-{index}"))
                .spawn(move || worker_main(shared, index))
                // Dropping `pool` stops the workers already started.
                .map_err(|e| RtError::exhausted(format!("cannot start worker thread: {e}")))?;
            pool.threads.lock().push(handle);
        }
        tracing::debug!(workers = n, "thread pool started");
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    fn current_worker_of_this_pool(&self) -> Option<usize> {
        WORKER.with(|w| {
            w.borrow()
                .as_ref()
                .filter(|ctx| Arc::ptr_eq(&ctx.shared, &self.shared))
                .map(|ctx| ctx.index)
        })
    }

    fn enqueue(&self, item: Arc<WorkItem>) -> RtResult<WorkHandle> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(RtError::runtime("thread pool is shut down"));
        }
        let handle = WorkHandle(Arc::clone(&item));
        let item = match self.current_worker_of_this_pool() {
            Some(index) => match self.shared.workers[index].deque.push(item) {
                Ok(()) => return Ok(handle),
                Err(item) => item,
            },
            None => item,
        };
        self.shared
            .submission
            .push(item)
            .map_err(|_| RtError::exhausted("thread pool submission queue is full"))?;
        Ok(handle)
    }

    /// Queue a native callback.
    pub fn submit(
        &self,
        func: super::WorkFn,
        data: *mut core::ffi::c_void,
        ctx: *mut core::ffi::c_void,
    ) -> RtResult<WorkHandle> {
        self.enqueue(WorkItem::native(func, data, ctx))
    }

    /// Queue a Rust closure.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) -> RtResult<WorkHandle> {
        self.enqueue(WorkItem::boxed(f))
    }

    pub fn stats(&self) -> PoolStats {
        let init = PoolStats {
            queued: self.shared.submission.items.lock().len(),
            ..PoolStats::default()
        };
        self.shared.workers.iter().fold(init, |acc, w| PoolStats {
            executed: acc.executed + w.executed.load(Ordering::Relaxed),
            stolen: acc.stolen + w.stolen.load(Ordering::Relaxed),
            queued: acc.queued + w.deque.len(),
        })
    }

    /// Stop the workers after they drain queued work, and join them.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.submission.wake_all();
        let threads = core::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        // Items left in the submission queue after every worker exited.
        while let Some(item) = self.shared.submission.pop() {
            item.execute();
        }
        tracing::debug!(stats = ?self.stats(), "thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Index of the pool worker running on this thread.
pub fn current_worker_id() -> Option<usize> {
    with_thread_state(|ts| ts.worker_index.get())
}
