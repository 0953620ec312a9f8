use bitvec::prelude::*;

/// Mask with the low `k` bits set (0..=64).
#[inline]
pub fn low_mask(k: u32) -> u64 {
    if k >= 64 { u64::MAX } else { (1u64 << k) - 1 }
}

/// Word `widx` of a Lsb0 bit vector with the unused tail of the last word cleared.
#[inline]
pub fn word_at(words: &[u64], len_bits: usize, widx: usize) -> u64 {
    if widx >= words.len() {
        return 0;
    }
    let mut w = words[widx];
    if widx + 1 == words.len() {
        let rem = len_bits & 63;
        if rem != 0 {
            w &= low_mask(rem as u32);
        }
    }
    w
}

/// Smallest `e` with `2^e >= x` (0 for x <= 1).
#[inline]
pub fn ceil_log2(x: u64) -> u32 {
    if x <= 1 { 0 } else { 64 - (x - 1).leading_zeros() }
}

pub fn bitvector_from_bools(bits: &[bool]) -> BitVec<u64, Lsb0> {
    let mut bv: BitVec<u64, Lsb0> = BitVec::with_capacity(bits.len());
    bv.extend(bits.iter().copied());
    bv
}

pub fn bitvector_from_u8(bits: &[u8]) -> BitVec<u64, Lsb0> {
    let mut bv: BitVec<u64, Lsb0> = BitVec::with_capacity(bits.len());
    bv.extend(bits.iter().map(|&b| b != 0));
    bv
}
