use std::sync::Arc;

use bitvec::prelude::*;

use crate::util::{low_mask, word_at};

/// Words per superblock (512 bits).
const SUPER_WORDS: usize = 8;

/// Rank directory over a shared bit vector:
/// - one absolute 1-count per 512-bit superblock
/// - the tail inside a superblock is popcounted on the fly (at most 7 words + a partial)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankIndex {
    bv: Arc<BitVec<u64, Lsb0>>,
    len_bits: usize,
    superblocks: Vec<u64>,
}

impl RankIndex {
    pub fn new(bv: Arc<BitVec<u64, Lsb0>>) -> Self {
        let len_bits = bv.len();
        let words = bv.as_raw_slice();
        let n_super = words.len().div_ceil(SUPER_WORDS);
        let mut superblocks = Vec::with_capacity(n_super + 1);
        let mut sum = 0u64;
        for s in 0..n_super {
            superblocks.push(sum);
            let hi = ((s + 1) * SUPER_WORDS).min(words.len());
            for wi in s * SUPER_WORDS..hi {
                sum += word_at(words, len_bits, wi).count_ones() as u64;
            }
        }
        superblocks.push(sum);
        Self { bv, len_bits, superblocks }
    }

    pub fn vector(&self) -> &Arc<BitVec<u64, Lsb0>> {
        &self.bv
    }

    pub fn len(&self) -> usize {
        self.len_bits
    }

    pub fn is_empty(&self) -> bool {
        self.len_bits == 0
    }

    /// Total number of ones.
    pub fn count_ones(&self) -> usize {
        self.superblocks.last().copied().unwrap_or(0) as usize
    }

    /// Ones in the prefix [0..idx).
    pub fn rank1(&self, idx: usize) -> usize {
        assert!(idx <= self.len_bits, "rank index {idx} past length {}", self.len_bits);
        if self.len_bits == 0 {
            return 0;
        }
        let words = self.bv.as_raw_slice();
        let widx = idx >> 6;
        let s = widx / SUPER_WORDS;
        let mut ans = self.superblocks[s];
        for wi in s * SUPER_WORDS..widx {
            ans += word_at(words, self.len_bits, wi).count_ones() as u64;
        }
        let k = (idx & 63) as u32;
        if k != 0 {
            ans += (word_at(words, self.len_bits, widx) & low_mask(k)).count_ones() as u64;
        }
        ans as usize
    }

    #[inline]
    pub fn rank0(&self, idx: usize) -> usize {
        idx - self.rank1(idx)
    }
}
