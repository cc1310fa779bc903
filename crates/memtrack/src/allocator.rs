use std::alloc::{GlobalAlloc, Layout, System};

use crate::guard::{self, ReentrancyGuard};
use crate::registry::{self, AllocKind, Registry};
use crate::site::{active_site, is_untracked};

/// Global allocator that records allocations made inside call-site scopes.
///
/// Everything else passes straight through to the inner allocator, so a
/// program only pays for bookkeeping where it asked for it with
/// [`track_block!`](crate::track_block), `#[memtrack::track]` or
/// [`SiteGuard`](crate::SiteGuard).
///
/// ```rust,no_run
/// use memtrack::TrackingAllocator;
///
/// #[global_allocator]
/// static GLOBAL: TrackingAllocator = TrackingAllocator::new();
///
/// fn main() {
///     let kept = memtrack::track_block!({ vec![0u8; 64] });
///     memtrack::report();
///     drop(kept);
/// }
/// ```
pub struct TrackingAllocator<A = System> {
    inner: A,
    registry: &'static Registry,
    guard: &'static ReentrancyGuard,
}

impl TrackingAllocator {
    pub const fn new() -> Self {
        Self::with_registry(System, registry::registry(), guard::guard())
    }
}

impl Default for TrackingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> TrackingAllocator<A> {
    pub const fn with_registry(
        inner: A,
        registry: &'static Registry,
        guard: &'static ReentrancyGuard,
    ) -> Self {
        Self {
            inner,
            registry,
            guard,
        }
    }

    #[inline]
    fn record(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        if let Some(site) = active_site() {
            self.registry
                .add_allocation(ptr as usize, layout, site, AllocKind::Scalar);
        }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        self.record(ptr, layout);
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        self.record(ptr, layout);
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if is_untracked() {
            unsafe { self.inner.dealloc(ptr, layout) };
            return;
        }

        let Some(ticket) = self.guard.enter(ptr as usize) else {
            // Denied: the block stays allocated and its record (if any) stays live.
            return;
        };
        self.registry.take(ptr as usize);
        drop(ticket);
        unsafe { self.inner.dealloc(ptr, layout) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if is_untracked() {
            return unsafe { self.inner.realloc(ptr, layout, new_size) };
        }

        let old = ptr as usize;
        let record = self.registry.take(old);
        let moved = unsafe { self.inner.realloc(ptr, layout, new_size) };
        // SAFETY: the caller guarantees `new_size` rounded up to `align` fits isize.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };

        match record {
            Some(record) if moved.is_null() => self.registry.restore(old, record, layout),
            Some(record) => self.registry.restore(moved as usize, record, new_layout),
            None => self.record(moved, new_layout),
        }
        moved
    }
}
