//! The MVCC purger: a background thread that reclaims pages no longer
//! visible to any active transaction (spec.md §4.6).
//!
//! Grounded on `examples/original_source/include/engine/table.h`'s
//! `HeapTable::PurgePages` (unlink-then-evict-then-free sequence) and
//! `src/buf/concur_buf_mgr.cpp`'s `EvictPurgablePages`, generalized behind a
//! [`PurgeCollaborator`] trait: spec.md §1/§10.7 explicitly keeps the
//! heap-table/MVTO transaction manager out of scope, so the purger here
//! depends only on the minimal `min_active_tid` + `collect_purgable_pages`
//! + unlink seam the original's table layer exposes to its buffer manager,
//! not on a table implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::BufferManager;
use crate::common::{PageId, TxnId};

const PURGE_PERIOD: Duration = Duration::from_secs(10);

/// One registered table (or table-like collaborator) the purger consults
/// every cycle. `collect_purgable_pages` must scan the collaborator's own
/// version metadata and return page ids with no tuple visible at or after
/// `min_active_tid`; `unlink` is called once those pages have been evicted,
/// so the collaborator can drop them from its own structures before their
/// pids are freed on SSD.
pub trait PurgeCollaborator: Send + Sync {
    fn collect_purgable_pages(&self, min_active_tid: TxnId) -> Vec<PageId>;
    fn unlink(&self, pids: &[PageId]);
}

/// Supplies the purger's view of the oldest transaction still active. A
/// thin seam standing in for spec.md's out-of-scope MVTO transaction
/// manager.
pub trait ActiveTransactionOracle: Send + Sync {
    fn min_active_tid(&self) -> TxnId;
}

pub struct MvccPurger {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MvccPurger {
    pub fn start(
        buf_mgr: Arc<BufferManager>,
        oracle: Arc<dyn ActiveTransactionOracle>,
        collaborators: Vec<Arc<dyn PurgeCollaborator>>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop2.load(Ordering::Acquire) {
                std::thread::sleep(PURGE_PERIOD);
                if stop2.load(Ordering::Acquire) {
                    break;
                }
                run_one_cycle(&buf_mgr, oracle.as_ref(), &collaborators);
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MvccPurger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_one_cycle(
    buf_mgr: &BufferManager,
    oracle: &dyn ActiveTransactionOracle,
    collaborators: &[Arc<dyn PurgeCollaborator>],
) {
    let min_active_tid = oracle.min_active_tid();
    for collaborator in collaborators {
        let purgable = collaborator.collect_purgable_pages(min_active_tid);
        if purgable.is_empty() {
            continue;
        }
        tracing::debug!(count = purgable.len(), "purging pages");
        collaborator.unlink(&purgable);
        for pid in purgable {
            if let Err(e) = buf_mgr.free_page(pid) {
                tracing::warn!(pid, "purge failed to free page: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64;

    struct FixedOracle(TxnId);
    impl ActiveTransactionOracle for FixedOracle {
        fn min_active_tid(&self) -> TxnId {
            self.0
        }
    }

    /// A minimal in-memory stand-in for a heap table, used only to test
    /// the purger's collection/unlink/free cycle end to end.
    struct TableCollector {
        pages: Mutex<Vec<(PageId, TxnId)>>,
        unlinked: AtomicU64,
    }

    impl PurgeCollaborator for TableCollector {
        fn collect_purgable_pages(&self, min_active_tid: TxnId) -> Vec<PageId> {
            self.pages
                .lock()
                .iter()
                .filter(|&&(_, end_ts)| end_ts < min_active_tid)
                .map(|&(pid, _)| pid)
                .collect()
        }

        fn unlink(&self, pids: &[PageId]) {
            self.unlinked.fetch_add(pids.len() as u64, Ordering::SeqCst);
            self.pages.lock().retain(|(pid, _)| !pids.contains(pid));
        }
    }

    #[test]
    fn purge_cycle_frees_pages_the_collaborator_reports_as_dead() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(
            BufferManager::open(&EngineConfig {
                dram_bytes: 8 * crate::common::PAGE_SIZE,
                nvm_bytes: 0,
                enable_nvm: false,
                ssd_db_path: dir.path().join("ssd"),
                nvm_heap_file_path: dir.path().join("nvm_arena"),
                wal_file_path: dir.path().join("wal"),
                ..EngineConfig::default()
            })
            .unwrap(),
        );
        let acc = mgr.new_page().unwrap();
        let dead_pid = acc.pid();
        acc.finish();

        let collector = Arc::new(TableCollector {
            pages: Mutex::new(vec![(dead_pid, 5)]),
            unlinked: AtomicU64::new(0),
        });
        let oracle = Arc::new(FixedOracle(10));
        run_one_cycle(&mgr, oracle.as_ref(), &[collector.clone() as Arc<dyn PurgeCollaborator>]);

        assert_eq!(collector.unlinked.load(Ordering::SeqCst), 1);
        assert!(mgr.get(dead_pid).is_err());
    }
}
