//! Lock-free atomic bit set, shared by the SSD allocation bitmap and the
//! NVM arena's free-bit bitmap.
//!
//! Grounded on `examples/original_source/include/util/bitmaps.h`'s
//! `AtomicBitmap` (`TakeFirstNotSet` scanning from a hint, `Clear`) and the
//! teacher's preference for `AtomicU64`-word bit-twiddling
//! (`src/buffer/hugepages.rs`'s free-bit arena).

use std::sync::atomic::{AtomicU64, Ordering};

pub struct AtomicBitmap {
    words: Vec<AtomicU64>,
    num_bits: usize,
}

impl AtomicBitmap {
    pub fn new(num_bits: usize) -> Self {
        let num_words = num_bits.div_ceil(64);
        let mut words = Vec::with_capacity(num_words);
        words.resize_with(num_words, || AtomicU64::new(0));
        Self { words, num_bits }
    }

    pub fn len_bits(&self) -> usize {
        self.num_bits
    }

    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.num_bits);
        let word = self.words[bit / 64].load(Ordering::Acquire);
        (word >> (bit % 64)) & 1 == 1
    }

    /// Sets the bit, returning whether it was already set.
    pub fn set(&self, bit: usize) -> bool {
        debug_assert!(bit < self.num_bits);
        let mask = 1u64 << (bit % 64);
        let old = self.words[bit / 64].fetch_or(mask, Ordering::AcqRel);
        old & mask != 0
    }

    pub fn clear(&self, bit: usize) {
        debug_assert!(bit < self.num_bits);
        let mask = 1u64 << (bit % 64);
        self.words[bit / 64].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Scans starting at `hint` (wrapping) for the first zero bit, CASes it
    /// to one, and returns its index. Returns `None` if the bitmap is full.
    pub fn take_first_unset(&self, hint: usize) -> Option<usize> {
        let num_words = self.words.len();
        if num_words == 0 {
            return None;
        }
        let start_word = (hint / 64) % num_words;
        for step in 0..num_words {
            let w = (start_word + step) % num_words;
            loop {
                let cur = self.words[w].load(Ordering::Acquire);
                if cur == u64::MAX {
                    break;
                }
                let bit_in_word = (!cur).trailing_zeros() as usize;
                let global_bit = w * 64 + bit_in_word;
                if global_bit >= self.num_bits {
                    break;
                }
                let mask = 1u64 << bit_in_word;
                match self.words[w].compare_exchange_weak(
                    cur,
                    cur | mask,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(global_bit),
                    Err(_) => continue,
                }
            }
        }
        None
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.load(Ordering::Relaxed).count_ones() as usize).sum()
    }

    /// Serializes the bitmap into a byte buffer for persisting the tail
    /// bitmap page. Little-endian word order, matching the log record wire
    /// format's endianness convention for consistency.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.words.len() * 8);
        for w in &self.words {
            out.extend_from_slice(&w.load(Ordering::Relaxed).to_le_bytes());
        }
        out
    }

    pub fn load_from_bytes(num_bits: usize, bytes: &[u8]) -> Self {
        let num_words = num_bits.div_ceil(64);
        let mut words = Vec::with_capacity(num_words);
        for i in 0..num_words {
            let start = i * 8;
            let word = if start + 8 <= bytes.len() {
                u64::from_le_bytes(bytes[start..start + 8].try_into().unwrap())
            } else {
                0
            };
            words.push(AtomicU64::new(word));
        }
        Self { words, num_bits }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_first_unset_then_full() {
        let bm = AtomicBitmap::new(4);
        for _ in 0..4 {
            assert!(bm.take_first_unset(0).is_some());
        }
        assert!(bm.take_first_unset(0).is_none());
    }

    #[test]
    fn clear_makes_bit_reusable() {
        let bm = AtomicBitmap::new(4);
        let b = bm.take_first_unset(0).unwrap();
        assert!(bm.test(b));
        bm.clear(b);
        assert!(!bm.test(b));
        assert_eq!(bm.take_first_unset(0), Some(b));
    }

    #[test]
    fn roundtrips_through_bytes() {
        let bm = AtomicBitmap::new(128);
        bm.set(5);
        bm.set(70);
        let bytes = bm.to_bytes();
        let bm2 = AtomicBitmap::load_from_bytes(128, &bytes);
        assert!(bm2.test(5));
        assert!(bm2.test(70));
        assert!(!bm2.test(6));
    }
}
