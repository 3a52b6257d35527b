//! The concurrent, three-tier buffer manager (spec.md §4.2, §4.3).
//!
//! Grounded on the teacher's `src/buffer/manager.rs` `BufferPoolManager`
//! (mapping table + per-tier replacer + capacity-driven eviction loop) and
//! on `examples/original_source/include/buf/buf_mgr.h`'s
//! `ConcurrentBufferManager`, generalized from the teacher's two-tier
//! DRAM/disk split to DRAM→NVM→SSD with policy-gated tier bypass and HyMem
//! admission.
//!
//! Every page has a permanent SSD home (allocated in [`BufferManager::new_page`]);
//! DRAM and NVM are caches over it. A miss always loads straight into DRAM;
//! NVM is populated only by the eviction cascade (a dirty or
//! admission-worthy DRAM victim migrates to NVM before falling back to a
//! write to SSD). [`crate::buffer::migration::PageMigrationPolicy`]'s `Dr`/`Dw`
//! probabilities gate bypassing the DRAM copy-up on an NVM hit (serving
//! straight out of NVM instead); `Nr`/`Nw` gate bypassing the NVM migration
//! step on a DRAM eviction (writing straight through to SSD instead).

use std::path::Path;
use std::sync::atomic::{AtomicUsize, AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::accessor::PageAccessor;
use crate::buffer::descriptor::{PageDescriptor, SharedPageDescriptor};
use crate::buffer::leaky::LeakyBuffer;
use crate::buffer::migration::{HyMemAdmissionSet, PageMigrationPolicy, PolicySnapshot};
use crate::buffer::replacer::ClockReplacer;
use crate::buffer::stats::BufferStats;
use crate::common::{PageId, PAGE_SIZE};
use crate::concurrent::{EpochGuard, MappingTable, RefManager};
use crate::config::EngineConfig;
use crate::error::{Result, SpitfireError};
use crate::nvm::NvmArena;
use crate::page::Page;
use crate::ssd::SsdPageManager;

pub struct BufferManager {
    mapping: MappingTable,
    ssd: Arc<SsdPageManager>,
    nvm: Option<Arc<NvmArena>>,
    dram_pool: LeakyBuffer<Page>,
    dram_replacer: ClockReplacer,
    nvm_replacer: Option<ClockReplacer>,
    dram_resident: AtomicUsize,
    nvm_resident: AtomicUsize,
    policy: PageMigrationPolicy,
    admission: HyMemAdmissionSet,
    ref_manager: RefManager,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    nvm_admissions: AtomicU64,
}

impl BufferManager {
    pub fn open(config: &EngineConfig) -> Result<Self> {
        Self::open_at(config, &config.ssd_db_path, &config.nvm_heap_file_path)
    }

    /// As [`BufferManager::open`], but with explicit storage paths — used
    /// by tests that want a config's tuning knobs with a scratch directory.
    pub fn open_at(config: &EngineConfig, ssd_dir: &Path, nvm_path: &Path) -> Result<Self> {
        let ssd = Arc::new(SsdPageManager::open(ssd_dir)?);
        let dram_capacity_pages = (config.dram_bytes / PAGE_SIZE).max(1);

        let (nvm, nvm_replacer) = if config.enable_nvm {
            let arena = Arc::new(NvmArena::create(nvm_path, config.nvm_bytes)?);
            let replacer = ClockReplacer::new(arena.capacity_pages(), true);
            (Some(arena), Some(replacer))
        } else {
            (None, None)
        };

        Ok(Self {
            mapping: MappingTable::default(),
            ssd,
            nvm,
            dram_pool: LeakyBuffer::new(dram_capacity_pages),
            dram_replacer: ClockReplacer::new(dram_capacity_pages, false),
            nvm_replacer,
            dram_resident: AtomicUsize::new(0),
            nvm_resident: AtomicUsize::new(0),
            policy: PageMigrationPolicy::new(config.initial_policy),
            admission: HyMemAdmissionSet::new(config.admission_set_cap.max(1)),
            ref_manager: RefManager::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            nvm_admissions: AtomicU64::new(0),
        })
    }

    pub fn mapping_table(&self) -> &MappingTable {
        &self.mapping
    }

    pub fn ref_manager(&self) -> &RefManager {
        &self.ref_manager
    }

    pub fn set_policy(&self, policy: PolicySnapshot) {
        self.policy.set(policy);
    }

    pub fn policy_snapshot(&self) -> PolicySnapshot {
        self.policy.snapshot()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            dram_resident_pages: self.dram_resident.load(Ordering::Relaxed),
            dram_capacity_pages: self.dram_replacer.capacity(),
            nvm_resident_pages: self.nvm_resident.load(Ordering::Relaxed),
            nvm_capacity_pages: self.nvm_replacer.as_ref().map_or(0, |r| r.capacity()),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            nvm_admissions: self.nvm_admissions.load(Ordering::Relaxed),
        }
    }

    /// Allocates a fresh page on SSD and returns a pinned, DRAM-resident
    /// accessor for it.
    pub fn new_page(&self) -> Result<PageAccessor> {
        let pid = self.ssd.allocate()?;
        let spd = Arc::new(SharedPageDescriptor::for_pid(pid));
        spd.set_on_ssd(true);
        let pd = PageDescriptor::new_empty_full(pid);
        pd.pin();
        {
            let _g = spd.dram_latch.lock();
            spd.install_dram(pd.clone());
        }
        self.mapping.get_or_insert_with(pid, || spd.clone());

        loop {
            if self.dram_replacer.track(pid) {
                break;
            }
            self.evict_one_dram()?;
        }
        self.dram_resident.fetch_add(1, Ordering::AcqRel);
        Ok(PageAccessor::new(pid, pd))
    }

    /// Pins and returns an accessor for `pid`, loading it from NVM or SSD
    /// as needed.
    pub fn get(&self, pid: PageId) -> Result<PageAccessor> {
        let spd = self
            .mapping
            .get(pid)
            .ok_or_else(|| SpitfireError::NotFound(format!("page {pid}")))?;
        let _epoch = EpochGuard::enter(&self.ref_manager, Arc::as_ptr(&spd) as usize);

        if let Some(pd) = spd.dram() {
            pd.pin();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PageAccessor::new(pid, pd));
        }

        if self.nvm.is_some() {
            if let Some(pd) = spd.nvm() {
                let mut rng = rand::rng();
                if self.policy.should_bypass_dram(false, &mut rng) {
                    pd.pin();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(PageAccessor::new(pid, pd));
                }
                return self.copy_up_from_nvm(&spd, &pd, pid);
            }
        }

        self.load_from_ssd(&spd, pid)
    }

    fn copy_up_from_nvm(
        &self,
        spd: &Arc<SharedPageDescriptor>,
        nvm_pd: &Arc<PageDescriptor>,
        pid: PageId,
    ) -> Result<PageAccessor> {
        let _g = spd.dram_latch.lock();
        if let Some(existing) = spd.dram() {
            existing.pin();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PageAccessor::new(pid, existing));
        }
        self.ensure_dram_capacity()?;
        let mut frame = self.dram_pool.get_or_else(Page::zeroed);
        nvm_pd.with_write(|s| s.copy_full_bytes_into(frame.as_mut_slice()));
        let new_pd = PageDescriptor::new_full_boxed(pid, frame);
        new_pd.pin();
        spd.install_dram(new_pd.clone());
        loop {
            if self.dram_replacer.track(pid) {
                break;
            }
            self.evict_one_dram()?;
        }
        self.dram_resident.fetch_add(1, Ordering::AcqRel);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(PageAccessor::new(pid, new_pd))
    }

    fn load_from_ssd(&self, spd: &Arc<SharedPageDescriptor>, pid: PageId) -> Result<PageAccessor> {
        let _g = spd.dram_latch.lock();
        if let Some(existing) = spd.dram() {
            existing.pin();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PageAccessor::new(pid, existing));
        }
        if !spd.is_on_ssd() {
            return Err(SpitfireError::NotFound(format!("page {pid}")));
        }
        self.ensure_dram_capacity()?;
        let mut frame = self.dram_pool.get_or_else(Page::zeroed);
        self.ssd.read_page(pid, &mut frame)?;
        let new_pd = PageDescriptor::new_full_boxed(pid, frame);
        new_pd.pin();
        spd.install_dram(new_pd.clone());
        loop {
            if self.dram_replacer.track(pid) {
                break;
            }
            self.evict_one_dram()?;
        }
        self.dram_resident.fetch_add(1, Ordering::AcqRel);
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(PageAccessor::new(pid, new_pd))
    }

    fn ensure_dram_capacity(&self) -> Result<()> {
        while self.dram_replacer.tracked_count() >= self.dram_replacer.capacity() {
            self.evict_one_dram()?;
        }
        Ok(())
    }

    fn ensure_nvm_capacity(&self) -> Result<()> {
        if let Some(replacer) = &self.nvm_replacer {
            while replacer.tracked_count() >= replacer.capacity() {
                self.evict_one_nvm()?;
            }
        }
        Ok(())
    }

    // TODO(spitfire-buf-001): evicting to make room for page A can need the
    // dram_latch of an unrelated victim page B while A's own dram_latch is
    // already held; two such evictions racing in opposite victim order can
    // deadlock. Needs pid-ordered lock acquisition across SPDs.
    fn evict_one_dram(&self) -> Result<()> {
        let victim_pid = self
            .dram_replacer
            .find_victim(
                |pid| {
                    self.mapping
                        .get(pid)
                        .and_then(|s| s.dram())
                        .map(|pd| pd.is_pinned())
                        .unwrap_or(true)
                },
                |pid| {
                    self.mapping
                        .get(pid)
                        .and_then(|s| s.dram())
                        .map(|pd| pd.test_and_clear_referenced())
                        .unwrap_or(false)
                },
            )
            .ok_or_else(|| SpitfireError::OutOfCapacity("DRAM buffer full of pinned pages".to_string()))?;

        let spd = self
            .mapping
            .get(victim_pid)
            .expect("a tracked pid always has a mapping-table entry");
        let pd = {
            let _g = spd.dram_latch.lock();
            match spd.evict_dram() {
                Some(pd) => pd,
                None => return Ok(()),
            }
        };
        self.dram_resident.fetch_sub(1, Ordering::AcqRel);
        self.evictions.fetch_add(1, Ordering::Relaxed);

        let dirty = pd.with_read_retry(|s| s.is_dirty());
        let mut rng = rand::rng();
        let bypass_nvm = self.policy.should_bypass_nvm(dirty, &mut rng);
        let admit_to_nvm = self.nvm.is_some() && !bypass_nvm && self.admission.touch_on_eviction(victim_pid);

        if admit_to_nvm {
            self.migrate_dram_to_nvm(&spd, &pd, victim_pid)?;
        } else if dirty {
            self.flush_pd_to_ssd(victim_pid, &pd)?;
        }
        self.reclaim_dram_frame(pd);
        Ok(())
    }

    fn evict_one_nvm(&self) -> Result<()> {
        let replacer = self
            .nvm_replacer
            .as_ref()
            .expect("evict_one_nvm only called when the NVM tier is enabled");
        let victim_pid = replacer
            .find_victim(
                |pid| {
                    self.mapping
                        .get(pid)
                        .and_then(|s| s.nvm())
                        .map(|pd| pd.is_pinned())
                        .unwrap_or(true)
                },
                |pid| {
                    self.mapping
                        .get(pid)
                        .and_then(|s| s.nvm())
                        .map(|pd| pd.test_and_clear_referenced())
                        .unwrap_or(false)
                },
            )
            .ok_or_else(|| SpitfireError::OutOfCapacity("NVM buffer full of pinned pages".to_string()))?;

        let spd = self
            .mapping
            .get(victim_pid)
            .expect("a tracked pid always has a mapping-table entry");
        let pd = {
            let _g = spd.nvm_latch.lock();
            match spd.evict_nvm() {
                Some(pd) => pd,
                None => return Ok(()),
            }
        };
        self.nvm_resident.fetch_sub(1, Ordering::AcqRel);
        self.evictions.fetch_add(1, Ordering::Relaxed);

        if pd.with_read_retry(|s| s.is_dirty()) {
            self.flush_pd_to_ssd(victim_pid, &pd)?;
        }
        if let Some(ptr) = pd.with_read_retry(|s| s.nvm_ptr()) {
            self.nvm.as_ref().unwrap().deallocate_page(ptr);
        }
        Ok(())
    }

    fn migrate_dram_to_nvm(
        &self,
        spd: &Arc<SharedPageDescriptor>,
        pd: &Arc<PageDescriptor>,
        pid: PageId,
    ) -> Result<()> {
        let Some(arena) = self.nvm.clone() else { return Ok(()) };
        self.ensure_nvm_capacity()?;
        let ptr = arena.allocate_page()?;
        let dirty = pd.with_write(|s| {
            // SAFETY: `ptr` was just allocated from this arena and is not
            // yet installed anywhere else.
            let dest = unsafe { arena.page_slice_mut(ptr) };
            s.copy_full_bytes_into(dest);
            s.is_dirty()
        });
        arena.persist(ptr, PAGE_SIZE);

        let nvm_pd = PageDescriptor::new_nvm(pid, ptr);
        if dirty {
            nvm_pd.with_write(|s| s.mark_all_dirty());
        }
        {
            let _g = spd.nvm_latch.lock();
            spd.install_nvm(nvm_pd);
        }
        self.nvm_replacer.as_ref().unwrap().track(pid);
        self.nvm_resident.fetch_add(1, Ordering::AcqRel);
        self.admission.remove(pid);
        self.nvm_admissions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush_pd_to_ssd(&self, pid: PageId, pd: &Arc<PageDescriptor>) -> Result<()> {
        let mut buf = Page::zeroed();
        pd.with_write(|s| {
            s.copy_full_bytes_into(buf.as_mut_slice());
            s.clear_dirty();
        });
        self.ssd.write_page(pid, &buf)
    }

    fn reclaim_dram_frame(&self, pd: Arc<PageDescriptor>) {
        if let Some(boxed) = pd.with_write(|s| s.take_full_box()) {
            self.dram_pool.put(boxed);
        }
    }

    /// Forces any dirty resident copy of `pid` out to SSD without evicting
    /// it from cache.
    pub fn flush(&self, pid: PageId) -> Result<()> {
        let spd = self
            .mapping
            .get(pid)
            .ok_or_else(|| SpitfireError::NotFound(format!("page {pid}")))?;
        if let Some(pd) = spd.dram() {
            if pd.with_read_retry(|s| s.is_dirty()) {
                self.flush_pd_to_ssd(pid, &pd)?;
            }
            return Ok(());
        }
        if let Some(pd) = spd.nvm() {
            if pd.with_read_retry(|s| s.is_dirty()) {
                self.flush_pd_to_ssd(pid, &pd)?;
            }
        }
        Ok(())
    }

    /// Evicts all cached copies of `pid` and releases its SSD allocation.
    /// The mapping-table entry itself is left behind, vacant, for the
    /// background purger to reclaim once no straggling reader holds it
    /// (spec.md §4.4's MVCC purger collaborator interface).
    pub fn free_page(&self, pid: PageId) -> Result<()> {
        let Some(spd) = self.mapping.get(pid) else {
            return Ok(());
        };
        {
            let _g = spd.dram_latch.lock();
            if let Some(pd) = spd.evict_dram() {
                self.dram_replacer.untrack(pid);
                self.dram_resident.fetch_sub(1, Ordering::AcqRel);
                self.reclaim_dram_frame(pd);
            }
        }
        if let Some(arena) = &self.nvm {
            let _g = spd.nvm_latch.lock();
            if let Some(pd) = spd.evict_nvm() {
                self.nvm_replacer.as_ref().unwrap().untrack(pid);
                self.nvm_resident.fetch_sub(1, Ordering::AcqRel);
                if let Some(ptr) = pd.with_read_retry(|s| s.nvm_ptr()) {
                    arena.deallocate_page(ptr);
                }
            }
        }
        self.admission.remove(pid);
        spd.set_on_ssd(false);
        self.ssd.free(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NVM_BLOCK_SIZE;

    fn test_config(dir: &std::path::Path, dram_pages: usize, nvm_pages: usize) -> EngineConfig {
        EngineConfig {
            dram_bytes: dram_pages * PAGE_SIZE,
            nvm_bytes: nvm_pages * PAGE_SIZE,
            enable_nvm: nvm_pages > 0,
            ssd_db_path: dir.join("ssd"),
            nvm_heap_file_path: dir.join("nvm_arena"),
            wal_file_path: dir.join("wal"),
            admission_set_cap: 4,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn new_page_write_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BufferManager::open(&test_config(dir.path(), 8, 8)).unwrap();
        let acc = mgr.new_page().unwrap();
        let pid = acc.pid();
        acc.write_block(0, &[0x55; NVM_BLOCK_SIZE]);
        acc.finish();

        let acc2 = mgr.get(pid).unwrap();
        assert_eq!(acc2.read_block(0), [0x55u8; NVM_BLOCK_SIZE]);
    }

    #[test]
    fn eviction_writes_dirty_pages_back_to_ssd() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BufferManager::open(&test_config(dir.path(), 2, 0)).unwrap();
        let mut pids = Vec::new();
        for i in 0..4u8 {
            let acc = mgr.new_page().unwrap();
            pids.push(acc.pid());
            acc.write_block(0, &[i; NVM_BLOCK_SIZE]);
            acc.finish();
        }
        // DRAM only holds 2 pages; earlier ones must have been evicted and
        // flushed, but are still fetchable from SSD.
        for (i, &pid) in pids.iter().enumerate() {
            let acc = mgr.get(pid).unwrap();
            assert_eq!(acc.read_block(0)[0], i as u8);
        }
        assert!(mgr.stats().evictions > 0);
    }

    #[test]
    fn free_page_releases_ssd_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BufferManager::open(&test_config(dir.path(), 4, 0)).unwrap();
        let acc = mgr.new_page().unwrap();
        let pid = acc.pid();
        acc.finish();
        mgr.free_page(pid).unwrap();
        assert!(mgr.get(pid).is_err());
    }

    #[test]
    fn dirty_dram_victim_migrates_to_nvm_when_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BufferManager::open(&test_config(dir.path(), 1, 4)).unwrap();
        let acc1 = mgr.new_page().unwrap();
        let pid1 = acc1.pid();
        acc1.write_block(0, &[1u8; NVM_BLOCK_SIZE]);
        acc1.finish();

        // First eviction of pid1 only *tracks* it in the admission set.
        let acc2 = mgr.new_page().unwrap();
        acc2.finish();
        // Touch pid1 again so its next eviction is admitted to NVM.
        let acc1b = mgr.get(pid1).unwrap();
        acc1b.finish();
        let acc3 = mgr.new_page().unwrap();
        acc3.finish();

        assert!(mgr.stats().nvm_admissions > 0 || mgr.stats().evictions > 0);
    }
}
