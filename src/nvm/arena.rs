//! The NVM Page Allocator: a single memory-mapped arena of page-aligned
//! frames backed by an atomic free-bit bitmap (spec.md §3, §6).
//!
//! Grounded on `examples/original_source/include/buf/buf_mgr.h`'s
//! `NVMPageAllocator` (`AllocatePage`/`DeallocatePage` over a
//! `mmap`-backed region) and the teacher's `src/buffer/hugepages.rs` for
//! the raw `libc::mmap`/`madvise` idiom.

use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bitmap::AtomicBitmap;
use crate::common::PAGE_SIZE;
use crate::error::{Result, SpitfireError};

/// The arena is pre-sized to this multiple of the configured NVM buffer
/// capacity, to absorb fragmentation (spec.md §3).
pub const ARENA_OVERSIZE_FACTOR: f64 = 1.1;

pub struct NvmArena {
    mmap_base: *mut u8,
    mmap_len: usize,
    num_pages: usize,
    bitmap: AtomicBitmap,
    last_pos: AtomicUsize,
    _file: std::fs::File,
}

// SAFETY: the mmap'd region is page-aligned shared memory; all mutation
// goes through the atomic bitmap plus per-page exclusive access enforced
// above this layer by the buffer manager's latches.
unsafe impl Send for NvmArena {}
unsafe impl Sync for NvmArena {}

impl NvmArena {
    /// Creates (or truncates) the backing file and maps `num_pages` worth
    /// of page-aligned capacity.
    pub fn create(path: &Path, configured_bytes: usize) -> Result<Self> {
        let num_pages = ((configured_bytes as f64 * ARENA_OVERSIZE_FACTOR) / PAGE_SIZE as f64)
            .ceil() as usize;
        let num_pages = num_pages.max(1);
        let mmap_len = num_pages * PAGE_SIZE;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(mmap_len as u64)?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SpitfireError::IOError("mmap of NVM arena failed".to_string()));
        }

        Ok(Self {
            mmap_base: base as *mut u8,
            mmap_len,
            num_pages,
            bitmap: AtomicBitmap::new(num_pages),
            last_pos: AtomicUsize::new(0),
            _file: file,
        })
    }

    pub fn capacity_pages(&self) -> usize {
        self.num_pages
    }

    /// Busy-loops briefly on contention; repeated failure across a bounded
    /// number of attempts is treated as fatal by the caller, per spec.md §7.
    pub fn allocate_page(&self) -> Result<*mut u8> {
        for _ in 0..64 {
            let hint = self.last_pos.load(Ordering::Relaxed);
            if let Some(slot) = self.bitmap.take_first_unset(hint) {
                self.last_pos.store(slot, Ordering::Relaxed);
                let ptr = unsafe { self.mmap_base.add(slot * PAGE_SIZE) };
                return Ok(ptr);
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
        Err(SpitfireError::OutOfMemory(
            "NVM arena exhausted after repeated retries".to_string(),
        ))
    }

    pub fn deallocate_page(&self, ptr: *mut u8) {
        let diff = (ptr as usize).wrapping_sub(self.mmap_base as usize);
        debug_assert_eq!(diff % PAGE_SIZE, 0);
        let slot = diff / PAGE_SIZE;
        self.bitmap.clear(slot);
    }

    /// Returns a byte slice view into one NVM page. Safety is the caller's
    /// responsibility: the slice must not outlive the page's tenancy and
    /// access must be externally serialized (the owning PD's latches).
    ///
    /// # Safety
    /// `ptr` must have been returned by [`NvmArena::allocate_page`] on this
    /// arena and not yet deallocated.
    pub unsafe fn page_slice<'a>(&'a self, ptr: *mut u8) -> &'a [u8] {
        std::slice::from_raw_parts(ptr, PAGE_SIZE)
    }

    /// # Safety
    /// Same requirements as [`NvmArena::page_slice`].
    pub unsafe fn page_slice_mut<'a>(&'a self, ptr: *mut u8) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(ptr, PAGE_SIZE)
    }

    /// Flushes a byte range back to the backing file, standing in for
    /// `clflush`+`sfence` on real persistent memory (spec.md §9's
    /// hardware-fence notes apply to the log buffer's hot path; ordinary
    /// page persistence here goes through `msync`).
    pub fn persist(&self, ptr: *const u8, len: usize) {
        let offset = (ptr as usize).wrapping_sub(self.mmap_base as usize);
        let page_aligned_start = (offset / PAGE_SIZE) * PAGE_SIZE;
        let aligned_len = (offset - page_aligned_start + len).next_multiple_of(PAGE_SIZE);
        unsafe {
            libc::msync(
                self.mmap_base.add(page_aligned_start) as *mut libc::c_void,
                aligned_len,
                libc::MS_SYNC,
            );
        }
    }
}

impl Drop for NvmArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap_base as *mut libc::c_void, self.mmap_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_write_read_deallocate() {
        let dir = tempfile::tempdir().unwrap();
        let arena = NvmArena::create(&dir.path().join("arena"), PAGE_SIZE * 4).unwrap();
        let ptr = arena.allocate_page().unwrap();
        unsafe {
            let slice = arena.page_slice_mut(ptr);
            slice.fill(0x42);
            assert!(arena.page_slice(ptr).iter().all(|&b| b == 0x42));
        }
        arena.deallocate_page(ptr);
        let ptr2 = arena.allocate_page().unwrap();
        assert_eq!(ptr, ptr2);
    }

    #[test]
    fn oversizes_arena_by_configured_factor() {
        let dir = tempfile::tempdir().unwrap();
        let configured = 100 * PAGE_SIZE;
        let arena = NvmArena::create(&dir.path().join("arena"), configured).unwrap();
        assert!(arena.capacity_pages() >= 110);
    }
}
