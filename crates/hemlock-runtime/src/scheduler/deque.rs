//! Chase–Lev work-stealing deque
//!
//! The owning worker pushes and pops at the bottom without locking. Thieves
//! take from the top and race each other (and the owner, for the last item)
//! with a CAS on `top`. Growing the ring takes the resize lock; retired rings
//! stay alive until the deque is dropped because a thief may still be
//! reading a slot from one.

use core::sync::atomic::{AtomicI64, AtomicPtr, Ordering, fence};
use std::sync::Arc;

use parking_lot::Mutex;

use super::work_item::WorkItem;

struct Ring {
    slots: Box<[AtomicPtr<WorkItem>]>,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            slots: (0..capacity)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect(),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn get(&self, index: i64) -> *mut WorkItem {
        self.slots[index as usize & (self.capacity() - 1)].load(Ordering::Relaxed)
    }

    fn put(&self, index: i64, item: *mut WorkItem) {
        self.slots[index as usize & (self.capacity() - 1)].store(item, Ordering::Relaxed);
    }
}

pub(crate) struct Deque {
    bottom: AtomicI64,
    top: AtomicI64,
    ring: AtomicPtr<Ring>,
    /// Rings replaced by a resize. Guarded by the resize lock.
    retired: Mutex<Vec<Box<Ring>>>,
    max_capacity: usize,
}

impl Deque {
    pub(crate) fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        let ring = Box::new(Ring::new(initial_capacity.next_power_of_two()));
        Self {
            bottom: AtomicI64::new(0),
            top: AtomicI64::new(0),
            ring: AtomicPtr::new(Box::into_raw(ring)),
            retired: Mutex::new(Vec::new()),
            max_capacity,
        }
    }

    fn ring(&self) -> &Ring {
        // SAFETY: the current ring is only freed in Drop; replaced rings are
        // kept in `retired`.
        unsafe { &*self.ring.load(Ordering::Acquire) }
    }

    /// Approximate number of queued items.
    pub(crate) fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn grow(&self, top: i64, bottom: i64) -> Option<&Ring> {
        let mut retired = self.retired.lock();
        let old = self.ring();
        let capacity = old.capacity() * 2;
        if capacity > self.max_capacity {
            return None;
        }
        let ring = Box::new(Ring::new(capacity));
        for i in top..bottom {
            ring.put(i, old.get(i));
        }
        let new = Box::into_raw(ring);
        let old = self.ring.swap(new, Ordering::Release);
        // SAFETY: `old` came from Box::into_raw and is no longer current.
        retired.push(unsafe { Box::from_raw(old) });
        tracing::trace!(capacity, "deque grown");
        // SAFETY: just installed; freed only in Drop.
        Some(unsafe { &*new })
    }

    /// Push at the bottom. Owner only. Hands the item back when the deque is
    /// at its maximum capacity.
    pub(crate) fn push(&self, item: Arc<WorkItem>) -> Result<(), Arc<WorkItem>> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut ring = self.ring();
        if (b - t) as usize >= ring.capacity() - 1 {
            match self.grow(t, b) {
                Some(grown) => ring = grown,
                None => return Err(item),
            }
        }
        ring.put(b, Arc::into_raw(item).cast_mut());
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Pop from the bottom. Owner only.
    pub(crate) fn pop(&self) -> Option<Arc<WorkItem>> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let ring = self.ring();
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }
        let item = ring.get(b);
        if t == b {
            // Last item: race the thieves for it.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }
        // SAFETY: the slot held a pointer from Arc::into_raw, and winning the
        // slot transfers that strong count to us.
        Some(unsafe { Arc::from_raw(item) })
    }

    /// Take from the top. Any thread.
    pub(crate) fn steal(&self) -> Option<Arc<WorkItem>> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return None;
        }
        let item = self.ring().get(t);
        self.top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .ok()?;
        // SAFETY: see `pop`.
        Some(unsafe { Arc::from_raw(item) })
    }
}

impl Drop for Deque {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        // SAFETY: exclusive access; the pointer came from Box::into_raw.
        drop(unsafe { Box::from_raw(*self.ring.get_mut()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn item(tag: usize) -> Arc<WorkItem> {
        WorkItem::native(noop, tag as *mut _, core::ptr::null_mut())
    }

    extern "C" fn noop(_data: *mut core::ffi::c_void, _ctx: *mut core::ffi::c_void) -> *mut core::ffi::c_void {
        core::ptr::null_mut()
    }

    fn tag(item: &WorkItem) -> usize {
        item.data_ptr() as usize
    }

    #[test]
    fn test_owner_is_lifo_thief_is_fifo() {
        let dq = Deque::new(8, 64);
        for i in 1..=3 {
            dq.push(item(i)).unwrap();
        }
        assert_eq!(tag(&dq.pop().unwrap()), 3);
        assert_eq!(tag(&dq.steal().unwrap()), 1);
        assert_eq!(tag(&dq.pop().unwrap()), 2);
        assert!(dq.pop().is_none());
        assert!(dq.steal().is_none());
        assert!(dq.is_empty());
    }

    #[test]
    fn test_grows_until_max_capacity() {
        let dq = Deque::new(4, 16);
        let mut accepted = 0;
        for i in 0..32 {
            if dq.push(item(i)).is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 15);
        assert_eq!(dq.len(), 15);
        for expected in (0..15).rev() {
            assert_eq!(tag(&dq.pop().unwrap()), expected);
        }
    }

    #[test]
    fn test_concurrent_steals_take_each_item_once() {
        const ITEMS: usize = 10_000;
        let dq = Arc::new(Deque::new(64, 1 << 16));
        let taken = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let dq = Arc::clone(&dq);
                let taken = Arc::clone(&taken);
                let sum = Arc::clone(&sum);
                std::thread::spawn(move || {
                    while taken.load(Ordering::SeqCst) < ITEMS {
                        if let Some(it) = dq.steal() {
                            sum.fetch_add(tag(&it), Ordering::SeqCst);
                            taken.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for i in 1..=ITEMS {
            dq.push(item(i)).unwrap();
            if i % 3 == 0 {
                if let Some(it) = dq.pop() {
                    sum.fetch_add(tag(&it), Ordering::SeqCst);
                    taken.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        while let Some(it) = dq.pop() {
            sum.fetch_add(tag(&it), Ordering::SeqCst);
            taken.fetch_add(1, Ordering::SeqCst);
        }
        for t in thieves {
            t.join().unwrap();
        }
        assert_eq!(taken.load(Ordering::SeqCst), ITEMS);
        assert_eq!(sum.load(Ordering::SeqCst), ITEMS * (ITEMS + 1) / 2);
    }
}
