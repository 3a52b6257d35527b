//! The SSD Page Manager (spec.md §4.1).
//!
//! Owns a directory of `heapfile.<N>` files. All public operations hold a
//! single manager-level mutex — SSD I/O dominates, so contention on the
//! mutex is negligible next to a syscall, matching the teacher's
//! `src/storage/disk.rs` choice of one coarse lock around file operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{file_no_of, make_pid, offset_in_file_of, PageId};
use crate::error::{Result, SpitfireError};
use crate::page::Page;
use crate::ssd::heap_file::HeapFile;

const HEAP_FILE_PREFIX: &str = "heapfile.";

/// Hard ceiling on the number of heap files a single manager will create.
/// Spec.md §7: reaching this is fatal, because it is configured far above
/// any practical working-set size.
const MAX_HEAP_FILES: usize = 1 << 20;

struct Inner {
    dir: PathBuf,
    files: Vec<Arc<HeapFile>>,
    last_allocated_from: usize,
}

pub struct SsdPageManager {
    state: Mutex<Inner>,
}

impl SsdPageManager {
    /// Opens (or creates) the heap-file directory, discovering any existing
    /// `heapfile.<N>` files already present.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut discovered: Vec<(u32, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix(HEAP_FILE_PREFIX) {
                if let Ok(n) = suffix.parse::<u32>() {
                    discovered.push((n, entry.path()));
                }
            }
        }
        discovered.sort_by_key(|(n, _)| *n);

        let mut files = Vec::with_capacity(discovered.len());
        for (_, path) in &discovered {
            files.push(Arc::new(HeapFile::open(path)?));
        }
        if files.is_empty() {
            files.push(Arc::new(HeapFile::create(&heap_file_path(dir, 0))?));
        }

        Ok(Self {
            state: Mutex::new(Inner {
                dir: dir.to_path_buf(),
                files,
                last_allocated_from: 0,
            }),
        })
    }

    /// Scans heap files round-robin starting from the last successful
    /// index, returning the first free page slot. Creates a new heap file
    /// if every existing one is full.
    pub fn allocate(&self) -> Result<PageId> {
        let mut inner = self.state.lock();
        let n = inner.files.len();
        for step in 0..n {
            let idx = (inner.last_allocated_from + step) % n;
            if let Some(slot) = inner.files[idx].allocate(0) {
                inner.last_allocated_from = idx;
                return Ok(make_pid(idx as u32, slot));
            }
        }
        if inner.files.len() >= MAX_HEAP_FILES {
            return Err(SpitfireError::OutOfCapacity(
                "heap file table full".to_string(),
            ));
        }
        let new_idx = inner.files.len() as u32;
        let path = heap_file_path(&inner.dir, new_idx);
        let new_file = Arc::new(HeapFile::create(&path)?);
        let slot = new_file
            .allocate(0)
            .expect("freshly created heap file has free slots");
        inner.files.push(new_file);
        inner.last_allocated_from = new_idx as usize;
        Ok(make_pid(new_idx, slot))
    }

    pub fn free(&self, pid: PageId) -> Result<()> {
        let inner = self.state.lock();
        let file = inner.file_for(pid)?;
        file.free(offset_in_file_of(pid))
    }

    pub fn read_page(&self, pid: PageId, page: &mut Page) -> Result<()> {
        let inner = self.state.lock();
        let file = inner.file_for(pid)?;
        file.read_page(offset_in_file_of(pid), page)
    }

    pub fn write_page(&self, pid: PageId, page: &Page) -> Result<()> {
        let inner = self.state.lock();
        let file = inner.file_for(pid)?;
        file.write_page(offset_in_file_of(pid), page)
    }

    /// Removes all heap files under the directory without removing the
    /// directory itself.
    pub fn destroy(dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(HEAP_FILE_PREFIX) {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

impl Inner {
    fn file_for(&self, pid: PageId) -> Result<&Arc<HeapFile>> {
        let idx = file_no_of(pid) as usize;
        self.files
            .get(idx)
            .ok_or_else(|| SpitfireError::NotFound(format!("heap file {idx} for pid {pid}")))
    }
}

fn heap_file_path(dir: &Path, n: u32) -> PathBuf {
    dir.join(format!("{HEAP_FILE_PREFIX}{n}"))
}
