//! NVM arena allocation (spec.md §3, §6).

pub mod arena;

pub use arena::NvmArena;
