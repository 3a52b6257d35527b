//! `PageAccessor`: the pinned, RAII handle returned by the buffer manager
//! for a resident page (spec.md §4.5).
//!
//! Grounded on the teacher's `src/buffer/page_cache.rs` `FrameGuard` (pin on
//! construction, unpin on drop) and on the nested `PageAccessor` class in
//! `examples/original_source/include/buf/buf_mgr.h`, whose
//! `PrepareForRead`/`PrepareForWrite` operate per-call rather than holding a
//! session-long latch — each read/write below does its own
//! snapshot-validate-or-restart (reads) or CAS-acquire-mutate-release
//! (writes) against the underlying [`PageDescriptor`].
use std::sync::Arc;

use crate::buffer::descriptor::PageDescriptor;
use crate::common::{PageId, NVM_BLOCK_SIZE};

/// A pinned reference to one tier-resident copy of a page. Dropping it
/// unpins the underlying [`PageDescriptor`], making it eligible for the
/// clock replacer again.
pub struct PageAccessor {
    pid: PageId,
    pd: Arc<PageDescriptor>,
}

impl PageAccessor {
    /// Wraps an already-pinned PD. Callers (the buffer manager) are
    /// responsible for having called `pd.pin()` first.
    pub(crate) fn new(pid: PageId, pd: Arc<PageDescriptor>) -> Self {
        Self { pid, pd }
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn is_dirty(&self) -> bool {
        self.pd.with_read_retry(|s| s.is_dirty())
    }

    /// Reads one logical block, zero-filling if it isn't resident yet
    /// (a freshly allocated page's unwritten blocks read as zero).
    pub fn read_block(&self, logical_block: usize) -> [u8; NVM_BLOCK_SIZE] {
        self.pd.mark_referenced();
        self.pd
            .with_read_retry(|s| s.read_block(logical_block).map(|b| {
                let mut out = [0u8; NVM_BLOCK_SIZE];
                out.copy_from_slice(b);
                out
            }))
            .unwrap_or([0u8; NVM_BLOCK_SIZE])
    }

    pub fn write_block(&self, logical_block: usize, data: &[u8; NVM_BLOCK_SIZE]) {
        self.pd.mark_referenced();
        self.pd.with_write(|s| s.write_block(logical_block, data));
    }

    /// Copies the full page image out. Only meaningful for `Full` payloads;
    /// mini-pages return only their packed blocks via `read_block`.
    pub fn read_full(&self) -> Option<Box<crate::page::Page>> {
        self.pd.mark_referenced();
        self.pd.with_read_retry(|s| s.full_page().cloned()).map(Box::new)
    }

    pub fn clear_dirty(&self) {
        self.pd.with_write(|s| s.clear_dirty());
    }

    /// Explicit, readable alternative to letting the guard drop.
    pub fn finish(self) {}
}

impl Drop for PageAccessor {
    fn drop(&mut self) {
        self.pd.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PAGE_SIZE;

    #[test]
    fn write_then_read_block_round_trips() {
        let pd = PageDescriptor::new_empty_full(1);
        pd.pin();
        let acc = PageAccessor::new(1, pd.clone());
        acc.write_block(0, &[7u8; NVM_BLOCK_SIZE]);
        assert_eq!(acc.read_block(0), [7u8; NVM_BLOCK_SIZE]);
        assert!(acc.is_dirty());
    }

    #[test]
    fn unwritten_block_reads_as_zero() {
        let pd = PageDescriptor::new_empty_full(2);
        pd.pin();
        let acc = PageAccessor::new(2, pd);
        assert_eq!(acc.read_block(3), [0u8; NVM_BLOCK_SIZE]);
    }

    #[test]
    fn drop_unpins_the_descriptor() {
        let pd = PageDescriptor::new_empty_full(3);
        pd.pin();
        assert_eq!(pd.pin_count(), 1);
        {
            let acc = PageAccessor::new(3, pd.clone());
            assert_eq!(pd.pin_count(), 1);
            acc.finish();
        }
        assert_eq!(pd.pin_count(), 0);
    }

    #[test]
    fn read_full_returns_whole_page_image() {
        let pd = PageDescriptor::new_empty_full(4);
        pd.pin();
        let acc = PageAccessor::new(4, pd);
        acc.write_block(0, &[1u8; NVM_BLOCK_SIZE]);
        let full = acc.read_full().unwrap();
        assert_eq!(full.as_slice().len(), PAGE_SIZE);
        assert_eq!(full.block(0)[0], 1);
    }
}
