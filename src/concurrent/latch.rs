//! Optimistic versioned latch (spec.md §3, §9).
//!
//! A single 64-bit atomic word: bit 0 is the obsolete marker, bit 1 is the
//! exclusive-write flag, bits 2+ are a monotonically increasing version.
//! Grounded on `examples/original_source/include/buf/buf_mgr.h`'s `OptLock`
//! for the exact bit layout and on the teacher's
//! `src/buffer/lockfree_latch.rs` for doing this with a bare `AtomicU64`
//! rather than a `RwLock` — per spec.md §9, this must not be emulated with
//! a read-write mutex; the performance model depends on lock-free reads.

use std::sync::atomic::{AtomicU64, Ordering};

const OBSOLETE_BIT: u64 = 0b1;
const WRITE_BIT: u64 = 0b10;
const VERSION_STEP: u64 = 0b100;

#[derive(Debug)]
pub struct OptimisticLatch {
    word: AtomicU64,
}

impl Default for OptimisticLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticLatch {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(VERSION_STEP),
        }
    }

    #[inline]
    fn is_locked(version: u64) -> bool {
        version & WRITE_BIT != 0
    }

    #[inline]
    pub fn is_obsolete(version: u64) -> bool {
        version & OBSOLETE_BIT != 0
    }

    /// Snapshots the current version. The caller should restart if the
    /// returned word has the write bit set.
    pub fn read_lock_or_restart(&self) -> (u64, bool) {
        let version = self.word.load(Ordering::Acquire);
        let needs_restart = Self::is_locked(version) || Self::is_obsolete(version);
        (version, needs_restart)
    }

    /// Validates that no write has happened since `start_version` was
    /// observed by [`read_lock_or_restart`].
    pub fn validate(&self, start_version: u64) -> bool {
        self.word.load(Ordering::Acquire) == start_version
    }

    /// CASes the write bit on; returns `false` (needs restart) on conflict.
    pub fn upgrade_to_write_or_restart(&self, version: u64) -> bool {
        self.word
            .compare_exchange(
                version,
                version + WRITE_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn write_lock_or_restart(&self) -> bool {
        let (version, needs_restart) = self.read_lock_or_restart();
        if needs_restart {
            return false;
        }
        self.upgrade_to_write_or_restart(version)
    }

    /// Releases the write lock: clears the write bit and advances the
    /// version in one step.
    pub fn write_unlock(&self) {
        self.word.fetch_add(VERSION_STEP, Ordering::AcqRel);
    }

    pub fn write_unlock_obsolete(&self) {
        self.word.fetch_add(VERSION_STEP | OBSOLETE_BIT, Ordering::AcqRel);
    }

    pub fn current_version(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }
}

/// RAII guard releasing an acquired write latch on drop.
pub struct WriteGuard<'a> {
    latch: &'a OptimisticLatch,
}

impl OptimisticLatch {
    pub fn lock_exclusive(&self) -> WriteGuard<'_> {
        loop {
            if self.write_lock_or_restart() {
                return WriteGuard { latch: self };
            }
            std::hint::spin_loop();
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.latch.write_unlock();
    }
}
