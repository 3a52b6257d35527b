//! Engine configuration.
//!
//! Grounded on the teacher's `BufferPoolConfig` in `src/buffer/manager.rs`:
//! a plain struct with a `Default` impl rather than a mandatory builder.
//! Field set matches spec.md §6's Config options table exactly.

use crate::buffer::migration::PolicySnapshot;
use crate::common::PAGE_SIZE;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// DRAM buffer capacity, in bytes.
    pub dram_bytes: usize,
    /// NVM buffer capacity, in bytes.
    pub nvm_bytes: usize,
    /// If false, the system is two-tier DRAM+SSD.
    pub enable_nvm: bool,
    /// Allow mini-page admission in DRAM.
    pub enable_mini_page: bool,
    /// Enable the HyMem admission set and force clean-page admission to NVM.
    pub enable_hymem: bool,
    /// O_DIRECT on heap files; buffers must be 512-byte aligned when set.
    pub enable_direct_io: bool,
    /// Cap of the HyMem admission set.
    pub admission_set_cap: usize,
    /// Directory containing `heapfile.<N>` SSD heap files.
    pub ssd_db_path: std::path::PathBuf,
    /// Path to the NVM arena file.
    pub nvm_heap_file_path: std::path::PathBuf,
    /// Path prefix for the two log files (`<wal_file_path>.1` / `.2`).
    pub wal_file_path: std::path::PathBuf,
    /// Initial migration policy.
    pub initial_policy: PolicySnapshot,
    /// Capacity of the in-memory concurrent log buffer.
    pub log_buffer_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        const DEFAULT_NUM_PAGES: usize = 500;
        Self {
            dram_bytes: DEFAULT_NUM_PAGES * PAGE_SIZE,
            nvm_bytes: 3 * DEFAULT_NUM_PAGES * PAGE_SIZE,
            enable_nvm: true,
            enable_mini_page: false,
            enable_hymem: false,
            enable_direct_io: false,
            admission_set_cap: 10,
            ssd_db_path: std::path::PathBuf::from("./data"),
            nvm_heap_file_path: std::path::PathBuf::from("./data/nvm_arena"),
            wal_file_path: std::path::PathBuf::from("./data/wal"),
            initial_policy: PolicySnapshot::default(),
            log_buffer_capacity: 2 * 1024 * 1024,
        }
    }
}
