//! Page descriptors: the per-tier metadata node (`PageDescriptor`, "PD") and
//! the tier-spanning handle a page id resolves to in the mapping table
//! (`SharedPageDescriptor`, "SPD"). Spec.md §3.
//!
//! Grounded on `examples/original_source/include/buf/buf_mgr.h`'s
//! `PageDesc`/`SharedPageDesc` for the two-level shape (one SPD owns up to
//! one DRAM PD and up to one NVM PD simultaneously, invariant I5) and on the
//! teacher's `src/buffer/page_cache.rs` `BufferFrame`/`FrameGuard` for the
//! pin-count/dirty-flag bookkeeping idiom translated to safe Rust.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::mini_page::MiniPage;
use crate::common::{PageId, INVALID_PID};
use crate::concurrent::OptimisticLatch;
use crate::page::{BlockBitmap, Page};

/// Which tier a [`PageDescriptor`] is resident in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TierTag {
    DramFull = 0,
    DramMini = 1,
    NvmFull = 2,
    Invalid = 3,
}

impl From<u8> for TierTag {
    fn from(v: u8) -> Self {
        match v {
            0 => TierTag::DramFull,
            1 => TierTag::DramMini,
            2 => TierTag::NvmFull,
            _ => TierTag::Invalid,
        }
    }
}

/// A raw pointer into the NVM arena's mmap region. The arena, not this
/// struct, owns the mapping; `NvmFull` PDs merely name an offset into it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NvmSlot(pub *mut u8);

unsafe impl Send for NvmSlot {}
unsafe impl Sync for NvmSlot {}

pub(crate) enum Payload {
    Empty,
    Full(Box<Page>),
    Mini(MiniPage),
    Nvm(NvmSlot),
}

/// Everything protected by a [`PageDescriptor`]'s optimistic latch: which
/// blocks are resident/dirty, and where the bytes actually live.
pub struct PageState {
    residency: BlockBitmap,
    dirty_bitmap: BlockBitmap,
    payload: Payload,
}

impl PageState {
    pub fn residency(&self) -> BlockBitmap {
        self.residency
    }

    pub fn dirty_bitmap(&self) -> BlockBitmap {
        self.dirty_bitmap
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_bitmap.is_empty()
    }

    /// Reads one logical block, returning `None` if it is not resident.
    pub fn read_block(&self, logical_block: usize) -> Option<&[u8]> {
        if !self.residency.test(logical_block) {
            return None;
        }
        match &self.payload {
            Payload::Full(page) => Some(page.block(logical_block)),
            Payload::Mini(mini) => mini.block(logical_block),
            Payload::Nvm(_) | Payload::Empty => None,
        }
    }

    /// Marks a block dirty and writes `data` into it. For `Full`/`Mini`
    /// payloads this mutates DRAM directly; for `Nvm` payloads the caller
    /// writes through the raw pointer separately (NVM pages are mutated via
    /// `nvm_ptr`, not by copying into a DRAM buffer first).
    pub fn write_block(&mut self, logical_block: usize, data: &[u8]) {
        self.residency.set(logical_block);
        self.dirty_bitmap.set(logical_block);
        match &mut self.payload {
            Payload::Full(page) => page.block_mut(logical_block).copy_from_slice(data),
            Payload::Mini(mini) => mini.admit(logical_block, data),
            Payload::Nvm(_) | Payload::Empty => {}
        }
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_bitmap.clear_all();
    }

    pub fn mini_page(&self) -> Option<&MiniPage> {
        match &self.payload {
            Payload::Mini(mini) => Some(mini),
            _ => None,
        }
    }

    pub fn full_page(&self) -> Option<&Page> {
        match &self.payload {
            Payload::Full(page) => Some(page),
            _ => None,
        }
    }

    pub fn full_page_mut(&mut self) -> Option<&mut Page> {
        match &mut self.payload {
            Payload::Full(page) => Some(page),
            _ => None,
        }
    }

    pub(crate) fn nvm_ptr(&self) -> Option<*mut u8> {
        match &self.payload {
            Payload::Nvm(slot) => Some(slot.0),
            _ => None,
        }
    }

    /// Copies this page's full byte image into `dest` (which must be
    /// exactly `PAGE_SIZE` long), zero-filling blocks absent from a
    /// mini-page. Used when migrating DRAM payloads to the NVM tier or SSD.
    pub(crate) fn copy_full_bytes_into(&self, dest: &mut [u8]) {
        match &self.payload {
            Payload::Full(page) => dest.copy_from_slice(page.as_slice()),
            Payload::Mini(mini) => mini.unpack_into_slice(dest),
            Payload::Nvm(_) | Payload::Empty => dest.fill(0),
        }
    }

    /// Marks every block dirty (used when a migrated copy inherits the
    /// dirtiness of the page it replaced).
    pub(crate) fn mark_all_dirty(&mut self) {
        self.residency.set_all();
        self.dirty_bitmap.set_all();
    }

    /// Takes ownership of a `Full` payload's boxed page, leaving `Empty`
    /// behind. Used to return a DRAM frame to the reuse pool on eviction.
    pub(crate) fn take_full_box(&mut self) -> Option<Box<Page>> {
        match std::mem::replace(&mut self.payload, Payload::Empty) {
            Payload::Full(page) => Some(page),
            other => {
                self.payload = other;
                None
            }
        }
    }

    /// Would admitting `logical_block` overflow a mini-page's block cap?
    pub fn mini_page_would_overflow(&self, logical_block: usize) -> bool {
        match &self.payload {
            Payload::Mini(mini) => mini.would_overflow(logical_block),
            _ => false,
        }
    }

    /// Unpacks a mini-page into a freshly zeroed full page image, replacing
    /// the payload in place. Caller (under the exclusive latch) is
    /// responsible for flipping the owning PD's tier tag to `DramFull`.
    pub fn promote_mini_to_full(&mut self) {
        let mini = match &self.payload {
            Payload::Mini(mini) => mini,
            _ => panic!("promote_mini_to_full called on a non-mini payload"),
        };
        let mut full = Page::zeroed();
        mini.unpack_into(&mut full);
        self.payload = Payload::Full(Box::new(full));
    }
}

/// One tier-resident copy of a page plus its optimistic latch and clock
/// replacer bookkeeping (pin count, referenced bit).
pub struct PageDescriptor {
    pid: PageId,
    tier: AtomicU8,
    pub latch: OptimisticLatch,
    pin: AtomicI32,
    referenced: AtomicBool,
    state: UnsafeCell<PageState>,
}

unsafe impl Send for PageDescriptor {}
unsafe impl Sync for PageDescriptor {}

impl PageDescriptor {
    pub fn new_full(pid: PageId, page: Page) -> Arc<Self> {
        Self::build(pid, TierTag::DramFull, Payload::Full(Box::new(page)), BlockBitmap::full())
    }

    pub fn new_full_boxed(pid: PageId, page: Box<Page>) -> Arc<Self> {
        Self::build(pid, TierTag::DramFull, Payload::Full(page), BlockBitmap::full())
    }

    pub fn new_empty_full(pid: PageId) -> Arc<Self> {
        Self::build(pid, TierTag::DramFull, Payload::Full(Box::new(Page::zeroed())), BlockBitmap::empty())
    }

    pub fn new_mini(pid: PageId) -> Arc<Self> {
        Self::build(pid, TierTag::DramMini, Payload::Mini(MiniPage::empty()), BlockBitmap::empty())
    }

    pub(crate) fn new_nvm(pid: PageId, ptr: *mut u8) -> Arc<Self> {
        Self::build(pid, TierTag::NvmFull, Payload::Nvm(NvmSlot(ptr)), BlockBitmap::full())
    }

    fn build(pid: PageId, tier: TierTag, payload: Payload, residency: BlockBitmap) -> Arc<Self> {
        Arc::new(Self {
            pid,
            tier: AtomicU8::new(tier as u8),
            latch: OptimisticLatch::new(),
            pin: AtomicI32::new(0),
            referenced: AtomicBool::new(false),
            state: UnsafeCell::new(PageState {
                residency,
                dirty_bitmap: BlockBitmap::empty(),
                payload,
            }),
        })
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn tier(&self) -> TierTag {
        TierTag::from(self.tier.load(Ordering::Acquire))
    }

    fn set_tier(&self, tier: TierTag) {
        self.tier.store(tier as u8, Ordering::Release);
    }

    pub fn pin_count(&self) -> i32 {
        self.pin.load(Ordering::Acquire)
    }

    pub fn pin(&self) -> i32 {
        self.pin.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn unpin(&self) -> i32 {
        self.pin.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn mark_referenced(&self) {
        self.referenced.store(true, Ordering::Release);
    }

    /// Clock replacer's second-chance test: reads and clears the bit.
    pub fn test_and_clear_referenced(&self) -> bool {
        self.referenced.swap(false, Ordering::AcqRel)
    }

    /// Optimistic read: runs `f` against a snapshot of the page state and
    /// returns `None` if a concurrent writer invalidated it. Callers must
    /// retry (spec.md §4.5's "prepare-for-read, validate, restart" loop).
    pub fn with_read<R>(&self, f: impl Fn(&PageState) -> R) -> Option<R> {
        let (version, needs_restart) = self.latch.read_lock_or_restart();
        if needs_restart {
            return None;
        }
        // SAFETY: mutation only happens inside `with_write`, which holds the
        // latch exclusively for its whole critical section; `validate` below
        // proves no such section ran between our snapshot and this read.
        let result = f(unsafe { &*self.state.get() });
        if self.latch.validate(version) {
            Some(result)
        } else {
            None
        }
    }

    pub fn with_read_retry<R>(&self, f: impl Fn(&PageState) -> R) -> R {
        loop {
            if let Some(r) = self.with_read(&f) {
                return r;
            }
            std::hint::spin_loop();
        }
    }

    /// Exclusive access: acquires the write latch, runs `f`, then releases
    /// and advances the version.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut PageState) -> R) -> R {
        let _guard = self.latch.lock_exclusive();
        // SAFETY: the write latch above is held for the whole call.
        f(unsafe { &mut *self.state.get() })
    }

    /// Promotes a mini-page PD to a full DRAM page in place, under the
    /// exclusive latch (spec.md §3's "reader restarts into the promoted
    /// full page" open question, resolved in DESIGN.md).
    pub fn promote_to_full(&self) {
        self.with_write(|state| state.promote_mini_to_full());
        self.set_tier(TierTag::DramFull);
    }
}

/// The tier-spanning handle a page id maps to. Owns up to one DRAM PD
/// (`Full` or `Mini`) and up to one NVM PD at a time (invariant I5); each
/// tier has its own install/evict mutex independent of the PDs' own
/// optimistic latches, serializing the tier-transition races described in
/// spec.md §4.2.
pub struct SharedPageDescriptor {
    pid: PageId,
    pub dram_latch: Mutex<()>,
    pub nvm_latch: Mutex<()>,
    dram: Mutex<Option<Arc<PageDescriptor>>>,
    nvm: Mutex<Option<Arc<PageDescriptor>>>,
    on_ssd: AtomicBool,
}

impl SharedPageDescriptor {
    pub fn new() -> Self {
        Self::for_pid(INVALID_PID)
    }

    pub fn for_pid(pid: PageId) -> Self {
        Self {
            pid,
            dram_latch: Mutex::new(()),
            nvm_latch: Mutex::new(()),
            dram: Mutex::new(None),
            nvm: Mutex::new(None),
            on_ssd: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn dram(&self) -> Option<Arc<PageDescriptor>> {
        self.dram.lock().clone()
    }

    pub fn nvm(&self) -> Option<Arc<PageDescriptor>> {
        self.nvm.lock().clone()
    }

    pub fn install_dram(&self, pd: Arc<PageDescriptor>) {
        *self.dram.lock() = Some(pd);
    }

    pub fn install_nvm(&self, pd: Arc<PageDescriptor>) {
        *self.nvm.lock() = Some(pd);
    }

    pub fn evict_dram(&self) -> Option<Arc<PageDescriptor>> {
        self.dram.lock().take()
    }

    pub fn evict_nvm(&self) -> Option<Arc<PageDescriptor>> {
        self.nvm.lock().take()
    }

    pub fn is_on_ssd(&self) -> bool {
        self.on_ssd.load(Ordering::Acquire)
    }

    pub fn set_on_ssd(&self, v: bool) {
        self.on_ssd.store(v, Ordering::Release);
    }

    /// True once the SPD has no resident copy anywhere and no SSD backing,
    /// i.e. it is a candidate for removal from the mapping table.
    pub fn is_vacant(&self) -> bool {
        self.dram.lock().is_none() && self.nvm.lock().is_none() && !self.is_on_ssd()
    }
}

impl Default for SharedPageDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_through_optimistic_latch() {
        let pd = PageDescriptor::new_empty_full(7);
        pd.with_write(|s| s.write_block(3, &[9u8; crate::common::NVM_BLOCK_SIZE]));
        let got = pd.with_read_retry(|s| s.read_block(3).map(|b| b[0]));
        assert_eq!(got, Some(9));
        assert!(pd.with_read_retry(|s| s.is_dirty()));
    }

    #[test]
    fn mini_page_promotes_to_full_and_keeps_data() {
        let pd = PageDescriptor::new_mini(11);
        pd.with_write(|s| s.write_block(5, &[4u8; crate::common::NVM_BLOCK_SIZE]));
        assert_eq!(pd.tier(), TierTag::DramMini);
        pd.promote_to_full();
        assert_eq!(pd.tier(), TierTag::DramFull);
        let got = pd.with_read_retry(|s| s.read_block(5).map(|b| b[0]));
        assert_eq!(got, Some(4));
    }

    #[test]
    fn shared_descriptor_holds_one_dram_and_one_nvm_pd_at_once() {
        let spd = SharedPageDescriptor::for_pid(1);
        spd.install_dram(PageDescriptor::new_empty_full(1));
        spd.install_nvm(PageDescriptor::new_nvm(1, std::ptr::null_mut()));
        assert!(spd.dram().is_some());
        assert!(spd.nvm().is_some());
        assert!(!spd.is_vacant());
    }
}
