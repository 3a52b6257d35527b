//! Leaky buffers: a lock-free bounded pool of reusable DRAM frames
//! (spec.md §4.2, §9).
//!
//! Grounded on `examples/original_source/include/buf/leaky_buffer.h`'s
//! `LeakyBuffer<T>` (an array of atomic slot pointers, `Get`/`Put` via CAS,
//! "leaking" a fresh allocation when the pool is momentarily empty rather
//! than blocking) and on the teacher's `src/buffer/frame_manager.rs`
//! `PerCoreFramePool` for the per-pool capacity/stats idiom.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// A bounded, lock-free pool of `Box<T>` frames. `get` pops a pooled frame
/// if one is available or else allocates a fresh one via `make` — pool
/// underflow never blocks the caller, it just "leaks" past the pool
/// (the allocation is reclaimed normally by `Box`'s `Drop` once the caller
/// drops it instead of returning it).
pub struct LeakyBuffer<T> {
    slots: Vec<AtomicPtr<T>>,
    len_hint: AtomicUsize,
}

impl<T> LeakyBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicPtr::new(std::ptr::null_mut()));
        Self {
            slots,
            len_hint: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate count of currently pooled frames (racy, for stats only).
    pub fn len_hint(&self) -> usize {
        self.len_hint.load(Ordering::Relaxed)
    }

    /// Returns a pooled frame if one is available, else `None` — the
    /// caller decides how to allocate a fresh one (kept generic so callers
    /// needing fallible allocation, e.g. `NvmArena`, can propagate errors).
    pub fn try_get(&self) -> Option<Box<T>> {
        for slot in &self.slots {
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                self.len_hint.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: non-null slot pointers are always frames this pool
                // itself boxed and stored via `put`.
                return Some(unsafe { Box::from_raw(ptr) });
            }
        }
        None
    }

    pub fn get_or_else(&self, make: impl FnOnce() -> T) -> Box<T> {
        self.try_get().unwrap_or_else(|| Box::new(make()))
    }

    /// Returns `frame` to the pool, or drops it if the pool is full.
    pub fn put(&self, frame: Box<T>) {
        let raw = Box::into_raw(frame);
        for slot in &self.slots {
            if slot
                .compare_exchange(
                    std::ptr::null_mut(),
                    raw,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.len_hint.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Pool full: drop it rather than leak memory.
        // SAFETY: `raw` came from `Box::into_raw` above and was never stored.
        drop(unsafe { Box::from_raw(raw) });
    }
}

impl<T> Drop for LeakyBuffer<T> {
    fn drop(&mut self) {
        for slot in &self.slots {
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: see `try_get`.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

unsafe impl<T: Send> Send for LeakyBuffer<T> {}
unsafe impl<T: Send> Sync for LeakyBuffer<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;

    #[test]
    fn get_or_else_allocates_when_pool_empty() {
        let pool: LeakyBuffer<Page> = LeakyBuffer::new(4);
        let frame = pool.get_or_else(Page::zeroed);
        assert_eq!(frame.as_slice().len(), crate::common::PAGE_SIZE);
    }

    #[test]
    fn put_then_get_reuses_the_same_allocation() {
        let pool: LeakyBuffer<Page> = LeakyBuffer::new(4);
        let frame = pool.get_or_else(Page::zeroed);
        let raw_addr = frame.data.as_ptr() as usize;
        pool.put(frame);
        assert_eq!(pool.len_hint(), 1);
        let reused = pool.get_or_else(Page::zeroed);
        assert_eq!(reused.data.as_ptr() as usize, raw_addr);
        assert_eq!(pool.len_hint(), 0);
    }

    #[test]
    fn pool_beyond_capacity_drops_instead_of_leaking() {
        let pool: LeakyBuffer<Page> = LeakyBuffer::new(1);
        pool.put(Box::new(Page::zeroed()));
        pool.put(Box::new(Page::zeroed()));
        assert_eq!(pool.len_hint(), 1);
    }

    #[test]
    fn concurrent_put_get_never_double_hands_out_a_frame() {
        let pool = std::sync::Arc::new(LeakyBuffer::<Page>::new(8));
        for _ in 0..8 {
            pool.put(Box::new(Page::zeroed()));
        }
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                let f = pool.get_or_else(Page::zeroed);
                f.data.as_ptr() as usize
            }));
        }
        let addrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut sorted = addrs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), addrs.len());
    }
}
