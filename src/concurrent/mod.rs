//! Lock-free and epoch-reclaimed concurrency primitives shared by the
//! buffer manager (spec.md §5).

pub mod epoch;
pub mod latch;
pub mod mapping_table;

pub use epoch::{EpochGuard, RefManager};
pub use latch::OptimisticLatch;
pub use mapping_table::MappingTable;
