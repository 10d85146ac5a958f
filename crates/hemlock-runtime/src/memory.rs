//! Reference-counted cell allocation
//!
//! Every non-POD [`Value`](crate::value::Value) points at a heap cell whose
//! first field is an [`RcHeader`]. Cells are allocated through
//! [`alloc_cell`] and freed by [`release_cell`] when the count drops to zero.
//! Freeing a container drains its contents into a worklist instead of
//! recursing, so deeply nested structures cannot overflow the native stack.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering, fence};

use smallvec::SmallVec;

use crate::value::Value;

/// Worklist used while releasing a tree of cells.
pub(crate) type ReleaseList = SmallVec<[Value; 16]>;

// =============================================================================
// RC header
// =============================================================================

/// Reference count stored at the start of every heap cell.
///
/// Layout: `[count: u32]`. A freshly allocated cell starts at 1, owned by
/// the Value returned from its constructor.
#[repr(C)]
#[derive(Debug)]
pub struct RcHeader {
    count: AtomicU32,
}

impl RcHeader {
    pub(crate) const fn new() -> Self {
        Self {
            count: AtomicU32::new(1),
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the count. Returns `true` when the caller dropped the last
    /// reference and must free the cell.
    pub(crate) fn decrement(&self) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        if prev == 1 {
            fence(Ordering::Acquire);
            return true;
        }
        false
    }
}

impl Default for RcHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Heap cells
// =============================================================================

/// A heap cell managed by the runtime's reference counting.
pub(crate) trait HeapCell {
    fn header(&self) -> &RcHeader;

    /// Move every owned Value out of the cell so the caller can release them
    /// after the cell itself is gone.
    fn drain_children(&mut self, _out: &mut ReleaseList) {}
}

static LIVE_CELLS: AtomicUsize = AtomicUsize::new(0);

/// Addresses of allocated cells, so releases of freed cells are caught
/// before their header is touched.
#[cfg(feature = "debug_runtime")]
static TRACKED: std::sync::LazyLock<dashmap::DashMap<usize, &'static str>> =
    std::sync::LazyLock::new(dashmap::DashMap::new);

#[cfg(feature = "debug_runtime")]
pub(crate) fn is_tracked(addr: usize) -> bool {
    TRACKED.contains_key(&addr)
}

/// Number of heap cells currently allocated, process-wide.
pub fn live_cells() -> usize {
    LIVE_CELLS.load(Ordering::Relaxed)
}

/// Move `cell` to the heap and return an owning pointer with count 1.
pub(crate) fn alloc_cell<T: HeapCell>(cell: T) -> NonNull<T> {
    LIVE_CELLS.fetch_add(1, Ordering::Relaxed);
    let ptr = NonNull::from(Box::leak(Box::new(cell)));
    #[cfg(feature = "debug_runtime")]
    TRACKED.insert(ptr.as_ptr() as usize, core::any::type_name::<T>());
    #[cfg(feature = "debug_runtime")]
    tracing::trace!(
        cell = core::any::type_name::<T>(),
        ptr = ?ptr,
        "alloc"
    );
    ptr
}

/// Drop one reference to `ptr`, freeing the cell when it was the last one.
/// Contained values are pushed onto `out` for the caller to release.
///
/// # Safety
///
/// `ptr` must come from [`alloc_cell`] and the caller must own one reference.
pub(crate) unsafe fn release_cell<T: HeapCell>(ptr: NonNull<T>, out: &mut ReleaseList) {
    #[cfg(feature = "debug_runtime")]
    if !is_tracked(ptr.as_ptr() as usize) {
        tracing::warn!(
            cell = core::any::type_name::<T>(),
            ptr = ?ptr,
            "release of a freed cell"
        );
        return;
    }
    if !unsafe { ptr.as_ref() }.header().decrement() {
        return;
    }
    #[cfg(feature = "debug_runtime")]
    TRACKED.remove(&(ptr.as_ptr() as usize));
    let mut cell = unsafe { Box::from_raw(ptr.as_ptr()) };
    cell.drain_children(out);
    drop(cell);
    LIVE_CELLS.fetch_sub(1, Ordering::Relaxed);
    #[cfg(feature = "debug_runtime")]
    tracing::trace!(
        cell = core::any::type_name::<T>(),
        ptr = ?ptr,
        "free"
    );
}

/// Release every value in the worklist, including anything their cells own.
pub(crate) fn drain_release_list(list: &mut ReleaseList) {
    while let Some(value) = list.pop() {
        unsafe { value.release_into(list) };
    }
}
