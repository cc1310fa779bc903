use serde::{Deserialize, Serialize};
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::output::{self, Leak, LeakReport, Reporter};
use crate::site::{CallSite, Untracked};

/// Which family of entry points produced an allocation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AllocKind {
    Scalar,
    Array,
}

impl AllocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocKind::Scalar => "scalar",
            AllocKind::Array => "array",
        }
    }
}

/// Metadata for one live allocation. The address is the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub size: usize,
    pub align: usize,
    pub site: CallSite,
    pub kind: AllocKind,
}

/// Process-wide map from live address to [`AllocationRecord`].
///
/// Every operation holds the lock for its whole duration and runs with the
/// current thread marked untracked, so the map's own node allocations never
/// reach the registry again.
pub struct Registry {
    live: Mutex<BTreeMap<usize, AllocationRecord>>,
    warn_unknown: AtomicBool,
    unknown_releases: AtomicUsize,
    overwritten: AtomicUsize,
}

static GLOBAL_REGISTRY: Registry = Registry::new();

/// The registry shared by [`report`](crate::report), the `new!` macros and
/// [`TrackingAllocator::new`](crate::TrackingAllocator::new).
#[inline]
pub const fn registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            live: Mutex::new(BTreeMap::new()),
            warn_unknown: AtomicBool::new(true),
            unknown_releases: AtomicUsize::new(0),
            overwritten: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, AllocationRecord>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a successful allocation.
    ///
    /// A live record at the same address is replaced. That can only happen if
    /// a block was released behind the tracker's back, so the replacement is
    /// counted and reported.
    pub fn add_allocation(&self, address: usize, layout: Layout, site: CallSite, kind: AllocKind) {
        let _untracked = Untracked::enter();
        let record = AllocationRecord {
            size: layout.size(),
            align: layout.align(),
            site,
            kind,
        };

        let previous = self.lock().insert(address, record);

        if let Some(previous) = previous {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
            output::warn(format_args!(
                "allocation at {:#x} from {} replaced a live record from {}",
                address, site, previous.site
            ));
        }
    }

    /// Removes the record for `address`.
    ///
    /// Releasing an address the registry never saw is not an error: it writes
    /// a warning (unless disabled) and leaves the registry untouched.
    pub fn remove_allocation(&self, address: usize) -> Option<AllocationRecord> {
        let _untracked = Untracked::enter();
        let removed = self.lock().remove(&address);

        if removed.is_none() {
            self.unknown_releases.fetch_add(1, Ordering::Relaxed);
            if self.warn_unknown.load(Ordering::Relaxed) {
                output::warn(format_args!(
                    "attempt to remove unknown allocation: {:#x}\n\t(if this shows after program termination, it pertains to the release of runtime memory)",
                    address
                ));
            }
        }

        removed
    }

    /// Removes without warning. Used by the global hook, which sees every
    /// release in the process and tracks only a few of them.
    #[inline]
    pub(crate) fn take(&self, address: usize) -> Option<AllocationRecord> {
        let _untracked = Untracked::enter();
        self.lock().remove(&address)
    }

    /// Puts back a record previously taken with [`take`](Self::take), at
    /// `address` and with `layout`. Used around `realloc`, which keeps the
    /// record's site and kind across the move.
    pub(crate) fn restore(&self, address: usize, record: AllocationRecord, layout: Layout) {
        let _untracked = Untracked::enter();
        self.lock().insert(
            address,
            AllocationRecord {
                size: layout.size(),
                align: layout.align(),
                ..record
            },
        );
    }

    pub fn get(&self, address: usize) -> Option<AllocationRecord> {
        let _untracked = Untracked::enter();
        self.lock().get(&address).copied()
    }

    pub fn contains(&self, address: usize) -> bool {
        self.get(address).is_some()
    }

    pub fn len(&self) -> usize {
        let _untracked = Untracked::enter();
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent copy of every live record, in address order.
    pub fn snapshot(&self) -> LeakReport {
        let _untracked = Untracked::enter();
        let leaks = self
            .lock()
            .iter()
            .map(|(&address, record)| Leak::new(address, record))
            .collect();
        LeakReport::new(leaks)
    }

    /// Prints the live allocations with the configured [`Format`](crate::Format).
    pub fn report(&self) {
        let _untracked = Untracked::enter();
        let reporter = crate::config::format().reporter();
        let _ = self.report_with(reporter.as_ref());
    }

    pub fn report_with(&self, reporter: &dyn Reporter) -> Result<(), Box<dyn std::error::Error>> {
        let snapshot = self.snapshot();
        let _untracked = Untracked::enter();
        reporter.report(&snapshot)
    }

    pub fn set_warn_unknown(&self, enabled: bool) {
        self.warn_unknown.store(enabled, Ordering::Relaxed);
    }

    /// Releases of addresses that had no record.
    pub fn unknown_releases(&self) -> usize {
        self.unknown_releases.load(Ordering::Relaxed)
    }

    /// Allocations that replaced a live record at the same address.
    pub fn overwritten_allocations(&self) -> usize {
        self.overwritten.load(Ordering::Relaxed)
    }
}
