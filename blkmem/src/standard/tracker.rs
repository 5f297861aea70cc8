//! Process-wide shadow list of live standard allocations
//!
//! Only maintained with debug assertions. In optimized builds every query
//! behaves as if the list were empty and every pointer were known.

use std::ptr::NonNull;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{config::DEBUG_CHECKS, diag::Site, util::UsizePtr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShadowEntry {
    pub size: usize,
    pub site: Site,
    /// Allocation order, used to list entries the way they were created
    pub seq: u64,
}

#[derive(Debug, Default)]
struct Tracker {
    entries: FxHashMap<usize, ShadowEntry>,
    mem_used: usize,
    next_seq: u64,
}

impl Tracker {
    fn insert(&mut self, addr: usize, size: usize, site: Site) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let old = self.entries.insert(addr, ShadowEntry { size, site, seq });
        debug_assert!(old.is_none(), "address handed out twice");
        self.mem_used += size;
    }

    fn remove(&mut self, addr: usize) -> Option<ShadowEntry> {
        let entry = self.entries.remove(&addr)?;
        self.mem_used -= entry.size;
        Some(entry)
    }
}

static TRACKER: Mutex<Option<Tracker>> = Mutex::new(None);

fn with_tracker<R>(f: impl FnOnce(&mut Tracker) -> R) -> R {
    let mut guard = TRACKER.lock();
    f(guard.get_or_insert_with(Tracker::default))
}

pub(crate) fn record(ptr: NonNull<u8>, size: usize, site: Site) {
    if !DEBUG_CHECKS {
        return;
    }
    with_tracker(|t| t.insert(UsizePtr::from(ptr).0, size, site));
}

/// Remove `ptr` from the list, returning whether it was a live allocation
///
/// Without tracking every pointer counts as live.
pub(crate) fn forget(ptr: NonNull<u8>) -> bool {
    if !DEBUG_CHECKS {
        return true;
    }
    with_tracker(|t| t.remove(UsizePtr::from(ptr).0).is_some())
}

pub(crate) fn contains(ptr: NonNull<u8>) -> bool {
    if !DEBUG_CHECKS {
        return true;
    }
    with_tracker(|t| t.entries.contains_key(&UsizePtr::from(ptr).0))
}

/// Swap the entry of a successfully reallocated block
pub(crate) fn replace(old: NonNull<u8>, new: NonNull<u8>, size: usize, site: Site) {
    if !DEBUG_CHECKS {
        return;
    }
    with_tracker(|t| {
        t.remove(UsizePtr::from(old).0);
        t.insert(UsizePtr::from(new).0, size, site);
    });
}

pub(crate) fn memory_used() -> usize {
    with_tracker(|t| t.mem_used)
}

/// All live entries in allocation order, plus the running byte counter
pub(crate) fn snapshot() -> (Vec<(UsizePtr, ShadowEntry)>, usize) {
    with_tracker(|t| {
        let mut entries = t
            .entries
            .iter()
            .map(|(addr, e)| (UsizePtr(*addr), *e))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(_, e)| e.seq);
        (entries, t.mem_used)
    })
}
