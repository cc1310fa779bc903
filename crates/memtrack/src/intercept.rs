//! Explicit, call-site-aware allocation entry points.
//!
//! [`new!`](crate::new) and [`new_array!`](crate::new_array) expand to
//! [`new_at`] / [`new_array_at`] with the caller's `file!()` and `line!()`;
//! [`delete`] and [`delete_array`] are the matching releases. All of them go
//! through an [`Interceptor`] bound to the global registry and guard, and
//! allocate directly from [`System`], so they work with or without
//! [`TrackingAllocator`](crate::TrackingAllocator) installed.

use std::alloc::{handle_alloc_error, GlobalAlloc, Layout, System};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

use crate::guard::{self, ReentrancyGuard};
use crate::output;
use crate::registry::{self, AllocKind, Registry};
use crate::site::CallSite;

/// The underlying allocator could not satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    pub layout: Layout,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory allocation of {} bytes (align {}) failed",
            self.layout.size(),
            self.layout.align()
        )
    }
}

impl std::error::Error for AllocError {}

/// What a release call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Null pointer, nothing to do.
    Null,
    /// Record removed and memory returned.
    Freed,
    /// No record existed; memory returned anyway.
    Untracked,
    /// Guard denied entry; neither the record nor the memory were touched.
    Dropped,
}

/// Allocation entry points wired to a registry and a guard.
pub struct Interceptor<'r, A = System> {
    registry: &'r Registry,
    guard: &'r ReentrancyGuard,
    alloc: A,
}

/// Interceptor over the global registry and guard.
#[inline]
pub fn interceptor() -> Interceptor<'static> {
    Interceptor::new(registry::registry(), guard::guard())
}

impl<'r> Interceptor<'r> {
    pub const fn new(registry: &'r Registry, guard: &'r ReentrancyGuard) -> Self {
        Self::with_allocator(registry, guard, System)
    }
}

impl<'r, A: GlobalAlloc> Interceptor<'r, A> {
    pub const fn with_allocator(registry: &'r Registry, guard: &'r ReentrancyGuard, alloc: A) -> Self {
        Self {
            registry,
            guard,
            alloc,
        }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn guard(&self) -> &'r ReentrancyGuard {
        self.guard
    }

    pub fn allocate(&self, layout: Layout, site: CallSite) -> Result<NonNull<u8>, AllocError> {
        self.allocate_kind(layout, site, AllocKind::Scalar)
    }

    pub fn allocate_array(&self, layout: Layout, site: CallSite) -> Result<NonNull<u8>, AllocError> {
        self.allocate_kind(layout, site, AllocKind::Array)
    }

    fn allocate_kind(
        &self,
        layout: Layout,
        site: CallSite,
        kind: AllocKind,
    ) -> Result<NonNull<u8>, AllocError> {
        let block = unsafe { self.alloc.alloc(storage_layout(layout)) };
        let block = NonNull::new(block).ok_or(AllocError { layout })?;
        self.registry
            .add_allocation(block.as_ptr() as usize, layout, site, kind);
        Ok(block)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live block obtained from this interceptor's
    /// allocator with `layout`.
    pub unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) -> Release {
        unsafe { self.release(ptr, layout, AllocKind::Scalar) }
    }

    /// Same as [`deallocate`](Self::deallocate); the location is accepted
    /// and ignored.
    ///
    /// # Safety
    ///
    /// See [`deallocate`](Self::deallocate).
    pub unsafe fn deallocate_at(&self, ptr: *mut u8, layout: Layout, _site: CallSite) -> Release {
        unsafe { self.release(ptr, layout, AllocKind::Scalar) }
    }

    /// # Safety
    ///
    /// See [`deallocate`](Self::deallocate).
    pub unsafe fn deallocate_array(&self, ptr: *mut u8, layout: Layout) -> Release {
        unsafe { self.release(ptr, layout, AllocKind::Array) }
    }

    /// # Safety
    ///
    /// See [`deallocate`](Self::deallocate).
    pub unsafe fn deallocate_array_at(
        &self,
        ptr: *mut u8,
        layout: Layout,
        _site: CallSite,
    ) -> Release {
        unsafe { self.release(ptr, layout, AllocKind::Array) }
    }

    unsafe fn release(&self, ptr: *mut u8, layout: Layout, kind: AllocKind) -> Release {
        if ptr.is_null() {
            return Release::Null;
        }

        let address = ptr as usize;
        let Some(ticket) = self.guard.enter(address) else {
            return Release::Dropped;
        };

        let removed = self.registry.remove_allocation(address);
        // The slot must be idle again before the block can be handed out anew.
        drop(ticket);

        let outcome = match removed {
            Some(record) => {
                if record.kind != kind {
                    output::warn(format_args!(
                        "{} allocation at {:#x} from {} released through the {} path",
                        record.kind.as_str(),
                        address,
                        record.site,
                        kind.as_str()
                    ));
                }
                Release::Freed
            }
            None => Release::Untracked,
        };

        unsafe { self.alloc.dealloc(ptr, storage_layout(layout)) };
        outcome
    }
}

/// Zero-sized requests still get a distinct block so they can be recorded.
#[inline]
fn storage_layout(layout: Layout) -> Layout {
    if layout.size() == 0 {
        // SAFETY: size 1 rounded up to an existing power-of-two alignment
        // cannot overflow isize.
        unsafe { Layout::from_size_align_unchecked(1, layout.align()) }
    } else {
        layout
    }
}

/// Moves `value` into a tracked block attributed to `site`.
///
/// Allocation failure goes to [`handle_alloc_error`], as with `Box::new`.
pub fn new_at<T>(value: T, site: CallSite) -> NonNull<T> {
    let layout = Layout::new::<T>();
    let block = interceptor()
        .allocate(layout, site)
        .unwrap_or_else(|e| handle_alloc_error(e.layout))
        .cast::<T>();
    unsafe { block.as_ptr().write(value) };
    block
}

/// Fills a tracked block with `len` clones of `value`, attributed to `site`.
///
/// # Panics
///
/// Panics if the array would exceed `isize::MAX` bytes, as `Vec` does.
pub fn new_array_at<T: Clone>(value: T, len: usize, site: CallSite) -> NonNull<[T]> {
    let layout = Layout::array::<T>(len).expect("capacity overflow");
    let block = interceptor()
        .allocate_array(layout, site)
        .unwrap_or_else(|e| handle_alloc_error(e.layout))
        .cast::<T>();

    let mut partial = PartialArray {
        block,
        written: 0,
        layout,
    };
    if len > 0 {
        let elements = block.as_ptr();
        for i in 0..len - 1 {
            unsafe { elements.add(i).write(value.clone()) };
            partial.written += 1;
        }
        unsafe { elements.add(len - 1).write(value) };
    }
    mem::forget(partial);

    NonNull::slice_from_raw_parts(block, len)
}

/// Releases a half-filled array if a `clone` panics.
struct PartialArray<T> {
    block: NonNull<T>,
    written: usize,
    layout: Layout,
}

impl<T> Drop for PartialArray<T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.block.as_ptr(), self.written));
            interceptor().deallocate_array(self.block.as_ptr().cast(), self.layout);
        }
    }
}

/// Drops the value and releases a block from [`new!`](crate::new).
///
/// # Safety
///
/// `ptr` must come from [`new_at`] (or [`new!`](crate::new)) and must not be
/// used afterwards.
pub unsafe fn delete<T>(ptr: NonNull<T>) -> Release {
    unsafe {
        ptr::drop_in_place(ptr.as_ptr());
        interceptor().deallocate(ptr.as_ptr().cast(), Layout::new::<T>())
    }
}

/// Drops the elements and releases a block from [`new_array!`](crate::new_array).
///
/// # Safety
///
/// `ptr` must come from [`new_array_at`] (or [`new_array!`](crate::new_array))
/// and must not be used afterwards.
pub unsafe fn delete_array<T>(ptr: NonNull<[T]>) -> Release {
    let layout = Layout::for_value(unsafe { ptr.as_ref() });
    unsafe {
        ptr::drop_in_place(ptr.as_ptr());
        interceptor().deallocate_array(ptr.as_ptr().cast(), layout)
    }
}

/// Per-type opt-in to tracked allocation.
///
/// Every method captures its caller's location and labels the record with
/// the type's name. Implement it with `#[derive(TrackedAlloc)]` or an empty
/// `impl`.
///
/// ```rust
/// use memtrack::TrackedAlloc;
///
/// struct Node {
///     value: u32,
/// }
///
/// impl TrackedAlloc for Node {}
///
/// let node = Node::tracked_new(Node { value: 7 });
/// assert!(memtrack::registry().contains(node.as_ptr() as usize));
/// unsafe { Node::tracked_delete(node) };
/// ```
pub trait TrackedAlloc: Sized {
    #[track_caller]
    fn tracked_new(value: Self) -> NonNull<Self> {
        let site = CallSite::caller().with_label(std::any::type_name::<Self>());
        new_at(value, site)
    }

    #[track_caller]
    fn tracked_new_array(value: Self, len: usize) -> NonNull<[Self]>
    where
        Self: Clone,
    {
        let site = CallSite::caller().with_label(std::any::type_name::<Self>());
        new_array_at(value, len, site)
    }

    /// # Safety
    ///
    /// See [`delete`].
    unsafe fn tracked_delete(ptr: NonNull<Self>) -> Release {
        unsafe { delete(ptr) }
    }

    /// # Safety
    ///
    /// See [`delete_array`].
    unsafe fn tracked_delete_array(ptr: NonNull<[Self]>) -> Release {
        unsafe { delete_array(ptr) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardMode;
    use std::cell::Cell;
    use std::panic;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn int_layout() -> Layout {
        Layout::new::<i32>()
    }

    fn local() -> (Registry, ReentrancyGuard) {
        let registry = Registry::new();
        registry.set_warn_unknown(false);
        (registry, ReentrancyGuard::new())
    }

    #[test]
    fn test_single_int_leak_is_reported_with_site() {
        let (registry, guard) = local();
        let layer = Interceptor::new(&registry, &guard);

        let block = layer
            .allocate(int_layout(), CallSite::new("a.cpp", 10))
            .unwrap();

        let report = registry.snapshot();
        assert_eq!(report.leak_count, 1);
        assert_eq!(report.leaks[0].size, 4);
        assert_eq!(report.leaks[0].location(), "a.cpp:10");
        assert_eq!(report.leaks[0].address, block.as_ptr() as usize);

        assert_eq!(
            unsafe { layer.deallocate(block.as_ptr(), int_layout()) },
            Release::Freed
        );
    }

    #[test]
    fn test_array_released_through_array_path_leaves_nothing() {
        let (registry, guard) = local();
        let layer = Interceptor::new(&registry, &guard);
        let layout = Layout::array::<i32>(10).unwrap();

        let block = layer
            .allocate_array(layout, CallSite::new("a.cpp", 20))
            .unwrap();
        assert_eq!(registry.get(block.as_ptr() as usize).unwrap().size, 40);

        let outcome = unsafe { layer.deallocate_array(block.as_ptr(), layout) };

        assert_eq!(outcome, Release::Freed);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_n_unreleased_allocations_are_reported() {
        let (registry, guard) = local();
        let layer = Interceptor::new(&registry, &guard);

        let mut blocks = Vec::new();
        for (i, size) in [8usize, 16, 24, 32, 48].into_iter().enumerate() {
            let layout = Layout::from_size_align(size, 8).unwrap();
            let site = CallSite::new("n.rs", 100 + i as u32);
            blocks.push((layer.allocate(layout, site).unwrap(), layout, site));
        }

        let report = registry.snapshot();
        assert_eq!(report.leak_count, 5);
        for (block, layout, site) in &blocks {
            let leak = report
                .leaks
                .iter()
                .find(|l| l.address == block.as_ptr() as usize)
                .unwrap();
            assert_eq!(leak.size, layout.size());
            assert_eq!(leak.line, site.line);
        }

        for (block, layout, _) in blocks {
            unsafe { layer.deallocate(block.as_ptr(), layout) };
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_of_untracked_block_warns_and_keeps_registry() {
        let (registry, guard) = local();
        let layer = Interceptor::new(&registry, &guard);
        let tracked = layer.allocate(int_layout(), CallSite::new("t.rs", 1)).unwrap();

        let foreign = unsafe { System.alloc(int_layout()) };
        assert!(!foreign.is_null());

        let outcome = unsafe { layer.deallocate(foreign, int_layout()) };

        assert_eq!(outcome, Release::Untracked);
        assert_eq!(registry.unknown_releases(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(tracked.as_ptr() as usize));

        unsafe { layer.deallocate(tracked.as_ptr(), int_layout()) };
    }

    #[test]
    fn test_null_release_is_noop() {
        let (registry, guard) = local();
        let layer = Interceptor::new(&registry, &guard);

        let outcome = unsafe { layer.deallocate(ptr::null_mut(), int_layout()) };

        assert_eq!(outcome, Release::Null);
        assert_eq!(registry.unknown_releases(), 0);
    }

    #[test]
    fn test_location_forms_converge() {
        let (registry, guard) = local();
        let layer = Interceptor::new(&registry, &guard);
        let site = CallSite::new("forms.rs", 5);
        let layout = Layout::array::<u64>(3).unwrap();

        let scalar = layer.allocate(int_layout(), site).unwrap();
        let array = layer.allocate_array(layout, site).unwrap();

        unsafe {
            assert_eq!(layer.deallocate_at(scalar.as_ptr(), int_layout(), site), Release::Freed);
            assert_eq!(layer.deallocate_array_at(array.as_ptr(), layout, site), Release::Freed);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mismatched_release_still_frees() {
        let (registry, guard) = local();
        let layer = Interceptor::new(&registry, &guard);
        let layout = Layout::array::<f64>(5).unwrap();

        let block = layer.allocate_array(layout, CallSite::new("m.rs", 1)).unwrap();
        let outcome = unsafe { layer.deallocate(block.as_ptr(), layout) };

        assert_eq!(outcome, Release::Freed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_zero_sized_request_is_recorded() {
        let (registry, guard) = local();
        let layer = Interceptor::new(&registry, &guard);
        let layout = Layout::array::<i32>(0).unwrap();

        let block = layer.allocate_array(layout, CallSite::new("z.rs", 1)).unwrap();
        assert_eq!(registry.get(block.as_ptr() as usize).unwrap().size, 0);

        unsafe { layer.deallocate_array(block.as_ptr(), layout) };
        assert!(registry.is_empty());
    }

    struct FailingAlloc;

    unsafe impl GlobalAlloc for FailingAlloc {
        unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
            ptr::null_mut()
        }

        unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {}
    }

    #[test]
    fn test_exhaustion_propagates_and_records_nothing() {
        let (registry, guard) = local();
        let layer = Interceptor::with_allocator(&registry, &guard, FailingAlloc);

        let err = layer
            .allocate(int_layout(), CallSite::new("oom.rs", 1))
            .unwrap_err();

        assert_eq!(err.layout, int_layout());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_releases_of_distinct_addresses_per_address_guard() {
        let registry = Registry::new();
        let guard = ReentrancyGuard::new();
        let layer = Interceptor::new(&registry, &guard);
        let site = CallSite::new("race.rs", 1);

        for _ in 0..200 {
            let a = layer.allocate(int_layout(), site).unwrap().as_ptr() as usize;
            let b = layer.allocate(int_layout(), site).unwrap().as_ptr() as usize;
            let barrier = Barrier::new(2);

            thread::scope(|s| {
                for address in [a, b] {
                    let layer = &layer;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        let outcome =
                            unsafe { layer.deallocate(address as *mut u8, int_layout()) };
                        assert_eq!(outcome, Release::Freed);
                    });
                }
            });
        }

        assert!(registry.is_empty());
        assert_eq!(guard.dropped_releases(), 0);
    }

    #[test]
    fn test_single_slot_guard_drops_colliding_release() {
        let registry = Registry::new();
        let guard = ReentrancyGuard::with_mode(GuardMode::SingleSlot);
        let layer = Interceptor::new(&registry, &guard);
        let site = CallSite::new("legacy.rs", 1);

        let a = layer.allocate(int_layout(), site).unwrap();
        let b = layer.allocate(int_layout(), site).unwrap();

        // Hold the single slot as if `a` were mid-release on another thread.
        let in_flight = guard.enter(a.as_ptr() as usize).unwrap();
        let outcome = unsafe { layer.deallocate(b.as_ptr(), int_layout()) };
        drop(in_flight);

        assert_eq!(outcome, Release::Dropped);
        assert_eq!(guard.dropped_releases(), 1);
        assert!(registry.contains(b.as_ptr() as usize));

        unsafe {
            assert_eq!(layer.deallocate(a.as_ptr(), int_layout()), Release::Freed);
            assert_eq!(layer.deallocate(b.as_ptr(), int_layout()), Release::Freed);
        }
        assert!(registry.is_empty());
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Tagged(u32);

    impl TrackedAlloc for Tagged {}

    #[test]
    fn test_tracked_alloc_labels_with_type_name() {
        let expected_line = line!() + 1;
        let node = Tagged::tracked_new(Tagged(3));
        let address = node.as_ptr() as usize;

        let record = registry::registry().get(address).unwrap();
        assert_eq!(record.site.file, file!());
        assert_eq!(record.site.line, expected_line);
        assert!(record.site.label.unwrap().ends_with("Tagged"));
        assert_eq!(unsafe { node.as_ref() }, &Tagged(3));

        assert_eq!(unsafe { Tagged::tracked_delete(node) }, Release::Freed);
        assert!(!registry::registry().contains(address));
    }

    #[test]
    fn test_new_array_at_clones_and_deletes() {
        let site = CallSite::new("arr.rs", 9);
        let values = new_array_at(String::from("x"), 4, site);
        let address = values.as_ptr() as *mut u8 as usize;

        let record = registry::registry().get(address).unwrap();
        assert_eq!(record.kind, AllocKind::Array);
        assert_eq!(record.size, 4 * std::mem::size_of::<String>());
        assert!(unsafe { values.as_ref() }.iter().all(|s| s == "x"));

        assert_eq!(unsafe { delete_array(values) }, Release::Freed);
        assert!(!registry::registry().contains(address));
    }

    /// Hands out one fixed block. Once the block is free again, a second
    /// owner is given the same address and releases it before `dealloc`
    /// returns to the first one.
    struct ReusedOnFree<'a> {
        block: *mut u8,
        registry: &'a Registry,
        guard: &'a ReentrancyGuard,
        reuse: Cell<bool>,
        second: Cell<Option<Release>>,
    }

    unsafe impl GlobalAlloc for ReusedOnFree<'_> {
        unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
            self.block
        }

        unsafe fn dealloc(&self, _ptr: *mut u8, layout: Layout) {
            if !self.reuse.replace(false) {
                return;
            }
            let owner = Interceptor::with_allocator(self.registry, self.guard, self);
            let block = owner
                .allocate(layout, CallSite::new("owner_b.rs", 2))
                .unwrap();
            self.second
                .set(Some(unsafe { owner.deallocate(block.as_ptr(), layout) }));
        }
    }

    unsafe impl GlobalAlloc for &ReusedOnFree<'_> {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            unsafe { (**self).alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe { (**self).dealloc(ptr, layout) }
        }
    }

    #[test]
    fn test_address_reused_during_release_is_not_dropped() {
        let (registry, guard) = local();
        let mut storage = [0u64; 2];
        let backing = ReusedOnFree {
            block: storage.as_mut_ptr().cast(),
            registry: &registry,
            guard: &guard,
            reuse: Cell::new(true),
            second: Cell::new(None),
        };
        let layer = Interceptor::with_allocator(&registry, &guard, &backing);

        let block = layer
            .allocate(int_layout(), CallSite::new("owner_a.rs", 1))
            .unwrap();
        let first = unsafe { layer.deallocate(block.as_ptr(), int_layout()) };

        assert_eq!(first, Release::Freed);
        assert_eq!(backing.second.get(), Some(Release::Freed));
        assert!(registry.is_empty());
        assert_eq!(guard.dropped_releases(), 0);
    }

    static FRAGILE_CLONES: AtomicUsize = AtomicUsize::new(0);
    static FRAGILE_DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Fragile;

    impl Clone for Fragile {
        fn clone(&self) -> Self {
            if FRAGILE_CLONES.fetch_add(1, Ordering::SeqCst) == 2 {
                panic!("third clone fails");
            }
            Fragile
        }
    }

    impl Drop for Fragile {
        fn drop(&mut self) {
            FRAGILE_DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_new_array_at_releases_block_when_clone_panics() {
        let site = CallSite::new("fragile_clone.rs", 3);

        let result = panic::catch_unwind(|| new_array_at(Fragile, 5, site));

        assert!(result.is_err());
        // two clones written plus the original value
        assert_eq!(FRAGILE_DROPS.load(Ordering::SeqCst), 3);
        assert_eq!(
            registry::registry()
                .snapshot()
                .from_file("fragile_clone.rs")
                .count(),
            0
        );
    }
}
