//! Per-tier clock (second-chance) page replacer (spec.md §4.3).
//!
//! Grounded on `examples/original_source/include/buf/buf_mgr.h`'s
//! `ConcurrentClockReplacer` (a fixed-capacity circular slot array, a clock
//! hand, second-chance bit owned by the PD rather than the replacer) and on
//! the teacher's `src/buffer/eviction.rs` clock-sweep loop for the Rust
//! mutex-guarded-`Vec` shape.

use parking_lot::Mutex;

use crate::common::PageId;

/// Sweeps tracked page ids looking for an unpinned, not-recently-referenced
/// victim. `evict_dirty` records whether this tier's eviction path is
/// allowed to write back dirty pages directly or must route through the
/// write-ahead log first (DRAM: `false`, flush-before-evict under logging;
/// NVM: `true`, persistence is the arena's `msync`, not the WAL).
pub struct ClockReplacer {
    slots: Mutex<ClockState>,
    pub evict_dirty: bool,
}

struct ClockState {
    entries: Vec<Option<PageId>>,
    hand: usize,
}

impl ClockReplacer {
    pub fn new(capacity: usize, evict_dirty: bool) -> Self {
        Self {
            slots: Mutex::new(ClockState {
                entries: vec![None; capacity],
                hand: 0,
            }),
            evict_dirty,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().entries.len()
    }

    /// Registers `pid` as eviction-eligible, taking the first free slot.
    /// Returns `false` (caller must grow capacity or evict first) if full.
    pub fn track(&self, pid: PageId) -> bool {
        let mut s = self.slots.lock();
        if let Some(slot) = s.entries.iter_mut().find(|e| e.is_none()) {
            *slot = Some(pid);
            true
        } else {
            false
        }
    }

    /// Removes `pid` from tracking (e.g. once pinned-and-removed, or freed).
    pub fn untrack(&self, pid: PageId) {
        let mut s = self.slots.lock();
        for e in s.entries.iter_mut() {
            if *e == Some(pid) {
                *e = None;
                return;
            }
        }
    }

    /// Sweeps the clock looking for a victim. `is_pinned` and
    /// `is_referenced_and_clear` are supplied by the caller because pin
    /// counts and the second-chance bit live on the page descriptor, not
    /// here (spec.md §4.3: "the replacer consults, but does not own, PD
    /// state"). Untracks and returns the first unpinned, unreferenced pid
    /// found; gives every other candidate one second chance before it does.
    pub fn find_victim(
        &self,
        is_pinned: impl Fn(PageId) -> bool,
        is_referenced_and_clear: impl Fn(PageId) -> bool,
    ) -> Option<PageId> {
        let mut s = self.slots.lock();
        let capacity = s.entries.len();
        if capacity == 0 {
            return None;
        }
        for _ in 0..(2 * capacity) {
            let idx = s.hand;
            s.hand = (s.hand + 1) % capacity;
            let Some(pid) = s.entries[idx] else {
                continue;
            };
            if is_pinned(pid) {
                continue;
            }
            if is_referenced_and_clear(pid) {
                continue;
            }
            s.entries[idx] = None;
            return Some(pid);
        }
        None
    }

    pub fn tracked_count(&self) -> usize {
        self.slots.lock().entries.iter().filter(|e| e.is_some()).count()
    }
}
