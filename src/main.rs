// Entry point for the spitfire-bench binary: opens a buffer manager
// against a scratch data directory, drives a small synthetic workload
// through it, and prints the resulting tier statistics.

use std::time::Duration;

use spitfire::buffer::PolicySnapshot;
use spitfire::{BufferManager, EngineConfig, VERSION};

fn main() -> spitfire::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    print_banner();

    let install_dir = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let data_dir = install_dir.join("data");
    let config = EngineConfig {
        ssd_db_path: data_dir.join("ssd"),
        nvm_heap_file_path: data_dir.join("nvm_arena"),
        wal_file_path: data_dir.join("wal"),
        ..EngineConfig::default()
    };

    tracing::info!(data_dir = %data_dir.display(), "opening buffer manager");
    let mgr = BufferManager::open(&config)?;

    run_warmup(&mgr)?;

    let stats = mgr.stats();
    tracing::info!(
        hit_ratio = stats.hit_ratio(),
        "warmup complete, current tier occupancy"
    );
    println!("{stats:#?}");

    Ok(())
}

/// Allocates a handful of pages, touches them, and nudges the migration
/// policy once so the demo exercises more than just the allocation path.
fn run_warmup(mgr: &BufferManager) -> spitfire::Result<()> {
    const WARMUP_PAGES: usize = 32;

    let mut pids = Vec::with_capacity(WARMUP_PAGES);
    for _ in 0..WARMUP_PAGES {
        let acc = mgr.new_page()?;
        pids.push(acc.pid());
        acc.finish();
    }

    for &pid in &pids {
        let acc = mgr.get(pid)?;
        let block = [0xABu8; spitfire::common::NVM_BLOCK_SIZE];
        acc.write_block(0, &block);
        acc.finish();
    }

    mgr.set_policy(PolicySnapshot {
        dr: 0.1,
        dw: 0.1,
        nr: 0.2,
        nw: 0.2,
    });

    std::thread::sleep(Duration::from_millis(10));
    Ok(())
}

fn print_banner() {
    println!(
        r#"
   _____       _ _  __ _
  / ____|     (_) |/ _(_)
 | (___  _ __  _| |_| |_ _ __ ___
  \___ \| '_ \| |  _| | '__/ _ \
  ____) | |_) | | | | | | |  __/
 |_____/| .__/|_|_| |_|_|_|  \___|
        | |
        |_|  v{VERSION} - three-tier buffer manager
"#
    );
}
