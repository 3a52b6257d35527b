//! Error taxonomy for the buffer manager and its collaborators.
//!
//! Mirrors the flat `thiserror` enum style used throughout the codebase:
//! each externally-meaningful failure mode gets its own variant carrying a
//! short message, plus one `#[from]` arm for transparent `?`-propagation of
//! OS-level I/O failures.

use thiserror::Error;

/// The complete set of statuses a public buffer-manager entry point can
/// return. `PageEvicted` is raised internally by racing evictors and is
/// always retried before it would otherwise cross a public boundary.
#[derive(Error, Debug)]
pub enum SpitfireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error("page evicted during access: {0}")]
    PageEvicted(String),

    #[error("out of capacity: {0}")]
    OutOfCapacity(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("not enough space: {0}")]
    NotEnoughSpace(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

pub type Result<T> = std::result::Result<T, SpitfireError>;
