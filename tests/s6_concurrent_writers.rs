//! S6: many threads hammering a shared, undersized buffer pool with
//! random writes from across real OS threads (so the mapping table,
//! clock replacer, and eviction cascade all see genuine concurrent
//! traffic), while a shadow map records each write's outcome under a
//! single lock covering the write-and-record step so there is an
//! unambiguous serialization to check read-backs against: every
//! recorded (pid, block) must read back exactly the last byte the
//! shadow map saw for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;

use spitfire::common::{NVM_BLOCK_SIZE, PAGE_SIZE};
use spitfire::config::EngineConfig;
use spitfire::BufferManager;

const NUM_PAGES: usize = 64;
const NUM_THREADS: usize = 8;
const WRITES_PER_THREAD: usize = 500;

#[test]
fn concurrent_writers_never_lose_a_linearized_write() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = Arc::new(
        BufferManager::open(&EngineConfig {
            // Deliberately undersized relative to NUM_PAGES so the run
            // churns through evictions while writers race.
            dram_bytes: 8 * PAGE_SIZE,
            nvm_bytes: 0,
            enable_nvm: false,
            ssd_db_path: dir.path().join("ssd"),
            nvm_heap_file_path: dir.path().join("nvm_arena"),
            wal_file_path: dir.path().join("wal"),
            ..EngineConfig::default()
        })
        .unwrap(),
    );

    let pids: Vec<u64> = (0..NUM_PAGES)
        .map(|_| {
            let acc = mgr.new_page().unwrap();
            let pid = acc.pid();
            acc.finish();
            pid
        })
        .collect();
    let pids = Arc::new(pids);

    // Guards both the buffer-manager write and the shadow-map update for
    // one (pid, block) pair, so the map always reflects a valid
    // serialization of the concurrent writes.
    let shadow: Arc<Mutex<HashMap<(u64, usize), u8>>> = Arc::new(Mutex::new(HashMap::new()));
    let any_error = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for thread_id in 0..NUM_THREADS {
        let mgr = Arc::clone(&mgr);
        let pids = Arc::clone(&pids);
        let shadow = Arc::clone(&shadow);
        let any_error = Arc::clone(&any_error);
        handles.push(std::thread::spawn(move || {
            let mut rng = rand::rng();
            let byte = thread_id as u8;
            for _ in 0..WRITES_PER_THREAD {
                let pid = pids[rng.random_range(0..pids.len())];
                let block = rng.random_range(0..PAGE_SIZE / NVM_BLOCK_SIZE);
                let data = [byte; NVM_BLOCK_SIZE];

                let mut guard = shadow.lock().unwrap();
                match mgr.get(pid) {
                    Ok(acc) => {
                        acc.write_block(block, &data);
                        guard.insert((pid, block), byte);
                        acc.finish();
                    }
                    Err(_) => any_error.store(true, Ordering::SeqCst),
                }
                drop(guard);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(!any_error.load(Ordering::SeqCst), "a concurrent get/write failed");

    let shadow = shadow.lock().unwrap();
    for (&(pid, block), &expected_byte) in shadow.iter() {
        let acc = mgr.get(pid).unwrap();
        let observed = acc.read_block(block);
        acc.finish();
        assert_eq!(
            observed,
            [expected_byte; NVM_BLOCK_SIZE],
            "pid {pid} block {block} diverged from its shadow-map linearization"
        );
    }
}
