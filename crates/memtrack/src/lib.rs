//! Call-site aware memory leak detection.
//!
//! Every tracked allocation is recorded in a process-wide registry keyed by
//! address, together with the file and line that requested it. Releasing the
//! block removes the record, so whatever is left when [`report`] runs is a
//! leak.
//!
//! There are two ways in:
//!
//! - the explicit entry points [`new!`], [`new_array!`], [`delete`] and
//!   [`delete_array`] (or the per-type [`TrackedAlloc`] trait), which capture
//!   the caller's location directly;
//! - the [`TrackingAllocator`] global allocator, which records allocations
//!   made inside [`track_block!`], `#[memtrack::track]` or [`SiteGuard`]
//!   scopes and lets everything else through untouched.
//!
//! ```rust
//! let value = memtrack::new!(42u32);
//! let report = memtrack::registry().snapshot();
//! assert!(report.leaks.iter().any(|leak| leak.address == value.as_ptr() as usize));
//!
//! unsafe { memtrack::delete(value) };
//! memtrack::report();
//! ```

pub use memtrack_macros::{check, track, TrackedAlloc};

mod allocator;
mod config;
mod guard;
mod intercept;
pub mod output;
mod registry;
mod site;

pub use allocator::TrackingAllocator;
pub use config::{configure, init, Config, ConfigBuilder, FORMAT_ENV, GUARD_ENV, QUIET_ENV};
pub use guard::{guard, GuardMode, GuardTicket, ParseGuardModeError, ReentrancyGuard, GUARD_SLOTS};
pub use intercept::{
    delete, delete_array, interceptor, new_array_at, new_at, AllocError, Interceptor, Release,
    TrackedAlloc,
};
pub use output::{format_bytes, Format, Leak, LeakReport, ParseFormatError, Reporter};
pub use registry::{registry, AllocKind, AllocationRecord, Registry};
pub use site::{untracked, CallSite, SiteGuard};

/// Prints every live allocation in the global registry.
///
/// Uses the [`Format`] set through [`configure`]; never fails and never
/// changes the registry.
pub fn report() {
    registry().report();
}

/// Hands a snapshot of the global registry to a custom [`Reporter`].
pub fn report_with(reporter: &dyn Reporter) -> Result<(), Box<dyn std::error::Error>> {
    registry().report_with(reporter)
}

/// Runs `f`, then [`report`]s. Returns whatever `f` returned.
pub fn check<R>(f: impl FnOnce() -> R) -> R {
    let _report = ReportGuard::new();
    f()
}

/// Calls [`report`] when dropped. Used by `#[memtrack::check]`.
#[must_use = "the report is printed when the guard is dropped"]
pub struct ReportGuard {
    _private: (),
}

impl ReportGuard {
    #[inline]
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for ReportGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        report();
    }
}

/// Allocates `value` through the tracker, recording the caller's file and line.
///
/// Returns a `NonNull<T>` to be released with [`delete`].
///
/// ```rust
/// let answer = memtrack::new!(42u64);
/// assert_eq!(unsafe { *answer.as_ref() }, 42);
/// unsafe { memtrack::delete(answer) };
/// ```
#[macro_export]
macro_rules! new {
    ($value:expr $(,)?) => {
        $crate::new_at($value, $crate::CallSite::new(file!(), line!()))
    };
}

/// Allocates `len` clones of `value` through the tracker, recording the
/// caller's file and line. Release with [`delete_array`].
///
/// ```rust
/// let buffer = memtrack::new_array![0i32; 10];
/// assert_eq!(buffer.len(), 10);
/// unsafe { memtrack::delete_array(buffer) };
/// ```
#[macro_export]
macro_rules! new_array {
    ($value:expr; $len:expr) => {
        $crate::new_array_at($value, $len, $crate::CallSite::new(file!(), line!()))
    };
}

/// Attributes allocations made by a block through [`TrackingAllocator`] to the
/// macro's location, optionally under a label.
///
/// ```rust
/// let names = memtrack::track_block!("load_names", {
///     vec![String::from("a"), String::from("b")]
/// });
/// assert_eq!(names.len(), 2);
/// ```
#[macro_export]
macro_rules! track_block {
    ($label:literal, $body:expr) => {{
        let __memtrack_label: &'static str = $label;
        let __memtrack_scope = $crate::SiteGuard::enter(
            $crate::CallSite::new(file!(), line!()).with_label(__memtrack_label),
        );
        let __memtrack_out = $body;
        ::core::mem::drop(__memtrack_scope);
        __memtrack_out
    }};
    ($body:expr) => {{
        let __memtrack_scope = $crate::SiteGuard::enter($crate::CallSite::new(file!(), line!()));
        let __memtrack_out = $body;
        ::core::mem::drop(__memtrack_scope);
        __memtrack_out
    }};
}
