use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;

/// Where an allocation was requested.
///
/// Captured at the call site, either by the [`new!`](crate::new) family of
/// macros (`file!()`/`line!()`), by `#[track_caller]` in
/// [`TrackedAlloc`](crate::TrackedAlloc), or by entering a call-site scope
/// for the global allocator hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
    pub label: Option<&'static str>,
}

impl CallSite {
    #[inline]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self {
            file,
            line,
            label: None,
        }
    }

    #[inline]
    pub const fn with_label(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    #[inline]
    pub fn from_location(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }

    /// Location of whoever called the `#[track_caller]` function this is used in.
    #[inline]
    #[track_caller]
    pub fn caller() -> Self {
        Self::from_location(Location::caller())
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(label) = self.label {
            write!(f, " ({})", label)?;
        }
        Ok(())
    }
}

// Both cells are read from inside the global allocator, so they must stay
// const-initialised and free of destructors.
thread_local! {
    static ACTIVE_SITE: Cell<Option<CallSite>> = const { Cell::new(None) };
    static UNTRACKED: Cell<bool> = const { Cell::new(false) };
}

/// Site that global-hook allocations on this thread are attributed to, if any.
///
/// Returns `None` while the thread is inside the tracker's own bookkeeping.
#[inline]
pub(crate) fn active_site() -> Option<CallSite> {
    if is_untracked() {
        return None;
    }
    ACTIVE_SITE.try_with(Cell::get).ok().flatten()
}

#[inline]
pub(crate) fn is_untracked() -> bool {
    UNTRACKED.try_with(Cell::get).unwrap_or(true)
}

/// Attributes allocations made through [`TrackingAllocator`](crate::TrackingAllocator)
/// on the current thread to `site` until dropped.
///
/// Scopes nest; dropping an inner scope restores the outer site. The guard is
/// `!Send` because the site lives in a thread-local.
#[must_use = "the call-site scope ends when the guard is dropped"]
pub struct SiteGuard {
    previous: Option<CallSite>,
    _not_send: PhantomData<*const ()>,
}

impl SiteGuard {
    #[inline]
    pub fn enter(site: CallSite) -> Self {
        let previous = ACTIVE_SITE
            .try_with(|active| active.replace(Some(site)))
            .ok()
            .flatten();
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for SiteGuard {
    #[inline]
    fn drop(&mut self) {
        let _ = ACTIVE_SITE.try_with(|active| active.set(self.previous));
    }
}

/// Marks the current thread as running tracker bookkeeping.
///
/// While held, the global hook passes every allocation and release straight to
/// the underlying allocator.
pub(crate) struct Untracked {
    previous: bool,
}

impl Untracked {
    #[inline]
    pub(crate) fn enter() -> Self {
        let previous = UNTRACKED.try_with(|flag| flag.replace(true)).unwrap_or(true);
        Self { previous }
    }
}

impl Drop for Untracked {
    #[inline]
    fn drop(&mut self) {
        let _ = UNTRACKED.try_with(|flag| flag.set(self.previous));
    }
}

/// Runs `f` outside any call-site scope.
///
/// Allocations made by `f` are not recorded. Releases still reach the
/// registry, so tracked blocks freed inside `f` do not linger as leaks.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let previous = ACTIVE_SITE
        .try_with(|active| active.replace(None))
        .ok()
        .flatten();
    let _restore = SiteGuard {
        previous,
        _not_send: PhantomData,
    };
    f()
}
