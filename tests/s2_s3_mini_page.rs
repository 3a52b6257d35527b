//! S2/S3: narrow-write admission and promotion for mini-pages.
//!
//! `BufferManager` does not yet route a narrow first write into a
//! `DRAM_MINI` descriptor (see DESIGN.md's buffer/ known-gap note), so
//! these scenarios are exercised directly against `buffer::mini_page`,
//! the module that owns the packed-storage and promotion-threshold
//! behavior the scenarios describe.

use spitfire::buffer::MiniPage;
use spitfire::common::{MINI_PAGE_MAX_BLOCKS, NVM_BLOCK_SIZE};

#[test]
fn s2_narrow_admission_packs_one_block_and_reads_it_back() {
    let mut mp = MiniPage::empty();
    let data = [0x01u8; NVM_BLOCK_SIZE];
    mp.admit(4, &data);

    assert_eq!(mp.num_blocks(), 1);
    assert_eq!(mp.block(4).unwrap(), &data[..]);
    assert!(mp.is_sorted());
}

#[test]
fn s3_admitting_past_capacity_reports_overflow_for_promotion() {
    let mut mp = MiniPage::empty();
    for b in 0..MINI_PAGE_MAX_BLOCKS {
        mp.admit(b, &[b as u8; NVM_BLOCK_SIZE]);
    }
    assert!(mp.is_full());

    let next_block = MINI_PAGE_MAX_BLOCKS;
    assert!(mp.would_overflow(next_block));

    for b in 0..MINI_PAGE_MAX_BLOCKS {
        assert_eq!(mp.block(b).unwrap()[0], b as u8);
    }
}

#[test]
fn p10_block_pointers_stay_strictly_increasing_under_out_of_order_admission() {
    let mut mp = MiniPage::empty();
    for &b in &[7usize, 2, 9, 0, 5] {
        mp.admit(b, &[b as u8; NVM_BLOCK_SIZE]);
    }
    assert!(mp.is_sorted());
    let pointers = mp.block_pointers();
    for w in pointers.windows(2) {
        assert!(w[0] < w[1]);
    }
}
