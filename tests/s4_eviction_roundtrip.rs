//! S4: allocate ten pages against a four-page DRAM budget, write a
//! distinct pattern to each, then read all ten back — every pattern must
//! survive the resulting eviction churn.

use spitfire::common::{NVM_BLOCK_SIZE, PAGE_SIZE};
use spitfire::config::EngineConfig;
use spitfire::BufferManager;

#[test]
fn ten_pages_over_a_four_page_budget_all_read_back_correctly() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = BufferManager::open(&EngineConfig {
        dram_bytes: 4 * PAGE_SIZE,
        nvm_bytes: 0,
        enable_nvm: false,
        ssd_db_path: dir.path().join("ssd"),
        nvm_heap_file_path: dir.path().join("nvm_arena"),
        wal_file_path: dir.path().join("wal"),
        ..EngineConfig::default()
    })
    .unwrap();

    let mut pids = Vec::new();
    for i in 0..10u8 {
        let acc = mgr.new_page().unwrap();
        pids.push(acc.pid());
        let pattern = [i; NVM_BLOCK_SIZE];
        for b in 0..PAGE_SIZE / NVM_BLOCK_SIZE {
            acc.write_block(b, &pattern);
        }
        acc.finish();
    }

    let stats = mgr.stats();
    assert!(stats.evictions >= 6, "expected at least 6 evictions, saw {}", stats.evictions);

    for (i, &pid) in pids.iter().enumerate() {
        let acc = mgr.get(pid).unwrap();
        let expected = [i as u8; NVM_BLOCK_SIZE];
        for b in 0..PAGE_SIZE / NVM_BLOCK_SIZE {
            assert_eq!(acc.read_block(b), expected, "page {i} block {b} mismatch");
        }
        acc.finish();
    }
}
