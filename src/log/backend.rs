//! A single NVM-mapped, append-only log file (spec.md §4.4, §6).
//!
//! Grounded on `examples/original_source/include/buf/buf_mgr.h`'s
//! `NVMLogFileBackend` and its `Init`/`Extend`/`Shrink`/`Append` bodies in
//! `src/buf/logging.cpp`: a single `mmap`'d region, grown by doubling (via
//! unmap-then-remap rather than `mremap`, matching the original's
//! `PosixEnv::MMapNVMFile`/`MUNMapNVMFile` pairing) whenever an append would
//! overflow the current capacity, and shrunk back to its initial capacity
//! after a rotation. Reuses [`crate::nvm::arena::NvmArena`]'s raw
//! `libc::mmap` idiom rather than that struct itself, since a log file's
//! single contiguous append cursor has nothing in common with the arena's
//! per-page allocation bitmap.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use crate::common::Lsn;
use crate::error::{Result, SpitfireError};

/// Fixed header at the front of every log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MainRecord {
    pub latest_checkpoint: Lsn,
    pub start_lsn: Lsn,
}

pub const MAIN_RECORD_SIZE: usize = 16;

impl MainRecord {
    fn encode(&self) -> [u8; MAIN_RECORD_SIZE] {
        let mut buf = [0u8; MAIN_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.latest_checkpoint.to_le_bytes());
        buf[8..16].copy_from_slice(&self.start_lsn.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            latest_checkpoint: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            start_lsn: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}

pub struct NvmLogFileBackend {
    path: PathBuf,
    file: std::fs::File,
    mmap_base: *mut u8,
    file_capacity: usize,
    initial_capacity: usize,
    write_pos: usize,
}

// SAFETY: all mutation of the mapped region is serialized by the owning
// `LogManager`'s rotation path (only one thread ever remaps or advances
// `write_pos`); concurrent record bytes are written elsewhere, by the
// concurrent log buffer, before being handed to this backend as one
// contiguous `append`.
unsafe impl Send for NvmLogFileBackend {}
unsafe impl Sync for NvmLogFileBackend {}

impl NvmLogFileBackend {
    pub fn create(path: &Path, initial_capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(initial_capacity as u64)?;
        let mmap_base = Self::map(&file, initial_capacity)?;
        let mut backend = Self {
            path: path.to_path_buf(),
            file,
            mmap_base,
            file_capacity: initial_capacity,
            initial_capacity,
            write_pos: 0,
        };
        backend.write_main_record(&MainRecord::default());
        backend.write_pos = MAIN_RECORD_SIZE;
        Ok(backend)
    }

    fn map(file: &std::fs::File, len: usize) -> Result<*mut u8> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SpitfireError::IOError("mmap of log file failed".to_string()));
        }
        Ok(base as *mut u8)
    }

    pub fn read_main_record(&self) -> MainRecord {
        let bytes = unsafe { std::slice::from_raw_parts(self.mmap_base, MAIN_RECORD_SIZE) };
        MainRecord::decode(bytes)
    }

    pub fn write_main_record(&mut self, record: &MainRecord) {
        let bytes = record.encode();
        unsafe {
            std::slice::from_raw_parts_mut(self.mmap_base, MAIN_RECORD_SIZE)
                .copy_from_slice(&bytes);
        }
        self.persist(0, MAIN_RECORD_SIZE);
    }

    /// Resets the append cursor to just past the header, for a freshly
    /// rotated-into file.
    pub fn seek_past_header(&mut self) {
        self.write_pos = MAIN_RECORD_SIZE;
    }

    pub fn next_writing_position(&self) -> usize {
        self.write_pos
    }

    pub fn current_capacity(&self) -> usize {
        self.file_capacity
    }

    pub fn free_space(&self) -> usize {
        self.file_capacity - self.write_pos
    }

    /// Appends `data` at the current cursor, doubling the file (remapping)
    /// first if it doesn't fit. Returns the byte offset the data was
    /// written at.
    pub fn append(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() > self.free_space() {
            self.extend()?;
        }
        let offset = self.write_pos;
        unsafe {
            std::slice::from_raw_parts_mut(self.mmap_base.add(offset), data.len())
                .copy_from_slice(data);
        }
        self.persist(offset, data.len());
        self.write_pos += data.len();
        Ok(offset)
    }

    fn remap(&mut self, new_capacity: usize) -> Result<()> {
        unsafe {
            libc::munmap(self.mmap_base as *mut libc::c_void, self.file_capacity);
        }
        self.file.set_len(new_capacity as u64)?;
        self.mmap_base = Self::map(&self.file, new_capacity)?;
        self.file_capacity = new_capacity;
        Ok(())
    }

    /// Doubles the file's capacity. Fatal on failure per spec.md §4.4's
    /// failure semantics ("failure to remap is fatal").
    fn extend(&mut self) -> Result<()> {
        let new_capacity = self.file_capacity * 2;
        self.remap(new_capacity)
    }

    /// Truncates the file back to its initial capacity, called after a
    /// rotation has moved writers onto the other backend.
    pub fn shrink(&mut self) -> Result<()> {
        if self.file_capacity == self.initial_capacity {
            return Ok(());
        }
        self.remap(self.initial_capacity)
    }

    fn persist(&self, offset: usize, len: usize) {
        let page_size = 4096usize;
        let aligned_start = (offset / page_size) * page_size;
        let aligned_len = (offset - aligned_start + len).next_multiple_of(page_size);
        unsafe {
            libc::msync(
                self.mmap_base.add(aligned_start) as *mut libc::c_void,
                aligned_len,
                libc::MS_SYNC,
            );
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads `len` bytes starting at `offset`, for recovery replay.
    pub fn read_at(&self, offset: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mmap_base.add(offset), len) }
    }
}

impl Drop for NvmLogFileBackend {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap_base as *mut libc::c_void, self.file_capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = NvmLogFileBackend::create(&dir.path().join("wal.1"), 4096).unwrap();
        backend.write_main_record(&MainRecord {
            latest_checkpoint: 7,
            start_lsn: 100,
        });
        let read_back = backend.read_main_record();
        assert_eq!(read_back.latest_checkpoint, 7);
        assert_eq!(read_back.start_lsn, 100);
    }

    #[test]
    fn append_advances_cursor_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = NvmLogFileBackend::create(&dir.path().join("wal.1"), 4096).unwrap();
        let off1 = backend.append(&[1, 2, 3]).unwrap();
        let off2 = backend.append(&[4, 5]).unwrap();
        assert_eq!(off1, MAIN_RECORD_SIZE);
        assert_eq!(off2, MAIN_RECORD_SIZE + 3);
        assert_eq!(backend.read_at(off1, 3), &[1, 2, 3]);
        assert_eq!(backend.read_at(off2, 2), &[4, 5]);
    }

    #[test]
    fn append_beyond_capacity_doubles_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = NvmLogFileBackend::create(&dir.path().join("wal.1"), 64).unwrap();
        let payload = vec![0xAB; 100];
        let off = backend.append(&payload).unwrap();
        assert_eq!(backend.current_capacity(), 128);
        assert_eq!(backend.read_at(off, 100), &payload[..]);
    }

    #[test]
    fn shrink_truncates_back_to_initial_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = NvmLogFileBackend::create(&dir.path().join("wal.1"), 64).unwrap();
        backend.append(&vec![0u8; 100]).unwrap();
        assert_eq!(backend.current_capacity(), 128);
        backend.seek_past_header();
        backend.shrink().unwrap();
        assert_eq!(backend.current_capacity(), 64);
    }
}
