// ============================================================
// Randomness seam for isolation rounds
// ============================================================

use crate::error::SamplerError;

/// Source of the bits that decide which items join an isolation round and which
/// labels they carry. One round announces its demand with `prepare`, then reads
/// it back with `take_bits`.
pub trait LabelSource {
    /// Announce that about `bits` bits will be read before the next `prepare`.
    fn prepare(&mut self, _bits: usize) -> Result<(), SamplerError> {
        Ok(())
    }

    /// Next `count` bits (0..=64) packed into the low end of a word.
    fn take_bits(&mut self, count: u32) -> Result<u64, SamplerError>;

    /// Probability-`2^-level` coin: true iff `level` fresh bits are all zero.
    #[inline]
    fn coin(&mut self, level: u32) -> Result<bool, SamplerError> {
        if level == 0 {
            return Ok(true);
        }
        Ok(self.take_bits(level)? == 0)
    }
}

impl<T: LabelSource + ?Sized> LabelSource for &mut T {
    #[inline]
    fn prepare(&mut self, bits: usize) -> Result<(), SamplerError> {
        (**self).prepare(bits)
    }
    #[inline]
    fn take_bits(&mut self, count: u32) -> Result<u64, SamplerError> {
        (**self).take_bits(count)
    }
}

impl<T: LabelSource + ?Sized> LabelSource for Box<T> {
    #[inline]
    fn prepare(&mut self, bits: usize) -> Result<(), SamplerError> {
        (**self).prepare(bits)
    }
    #[inline]
    fn take_bits(&mut self, count: u32) -> Result<u64, SamplerError> {
        (**self).take_bits(count)
    }
}
