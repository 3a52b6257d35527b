//! Write-ahead logging: record encoding, the concurrent log buffer, the
//! on-disk log files, and the background page cleaner (spec.md §4.4, §6).

pub mod backend;
pub mod cleaner;
pub mod manager;
pub mod record;
pub mod ring;

pub use backend::{MainRecord, NvmLogFileBackend, MAIN_RECORD_SIZE};
pub use cleaner::PageCleaner;
pub use manager::LogManager;
pub use record::LogRecord;
pub use ring::ConcurrentLogBuffer;
