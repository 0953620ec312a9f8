//! Isolation label sources: true (pseudo)randomness or a small-bias sample.

use bitvec::prelude::*;
use rand_xoshiro::{Xoshiro256PlusPlus, rand_core::{RngCore, SeedableRng}};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::biased::BiasedSampler;
use crate::error::SamplerError;
use crate::gf2::IrreducibleCache;
use crate::traits::LabelSource;
use crate::util::low_mask;

/// Uniform bits from a seeded xoshiro generator.
#[derive(Debug, Clone)]
pub struct UniformLabels {
    rng: Xoshiro256PlusPlus,
}

impl UniformLabels {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self { rng: Xoshiro256PlusPlus::seed_from_u64(seed) }
    }
}

impl LabelSource for UniformLabels {
    #[inline]
    fn take_bits(&mut self, count: u32) -> Result<u64, SamplerError> {
        if count == 0 {
            return Ok(0);
        }
        Ok(self.rng.next_u64() & low_mask(count))
    }
}

/// Bits read from epsilon-biased samples. Only the `2m` seed bits of each sample come
/// from the underlying generator.
#[derive(Debug, Clone)]
pub struct BiasedLabels {
    seeds: Xoshiro256PlusPlus,
    epsilon: f64,
    cache: IrreducibleCache,
    buffer: BitVec<u64, Lsb0>,
    cursor: usize,
    seed_bits_used: u64,
}

impl BiasedLabels {
    pub fn new(seed: u64, epsilon: f64) -> Result<Self, SamplerError> {
        if !(epsilon > 0.0 && epsilon <= 1.0) {
            return Err(SamplerError::InvalidBias(epsilon));
        }
        Ok(Self {
            seeds: Xoshiro256PlusPlus::seed_from_u64(seed),
            epsilon,
            cache: IrreducibleCache::new(),
            buffer: BitVec::new(),
            cursor: 0,
            seed_bits_used: 0,
        })
    }

    /// True random bits spent on sample seeds so far.
    pub fn seed_bits_used(&self) -> u64 {
        self.seed_bits_used
    }

    fn refill(&mut self, len: usize) -> Result<(), SamplerError> {
        let sampler = BiasedSampler::new(len.max(1), self.epsilon, &mut self.cache)?;
        self.buffer = sampler.sample(&mut self.seeds)?;
        self.cursor = 0;
        self.seed_bits_used += sampler.seed_bits() as u64;
        trace!(len, degree = sampler.degree(), "drew biased sample");
        Ok(())
    }
}

impl LabelSource for BiasedLabels {
    fn prepare(&mut self, bits: usize) -> Result<(), SamplerError> {
        if bits == 0 {
            return Ok(());
        }
        self.refill(bits)
    }

    fn take_bits(&mut self, count: u32) -> Result<u64, SamplerError> {
        if count == 0 {
            return Ok(0);
        }
        let count = count as usize;
        if self.cursor + count > self.buffer.len() {
            // Overdrawn round: continue from another independent sample.
            let len = self.buffer.len().max(count).max(64);
            self.refill(len)?;
        }
        let v = self.buffer[self.cursor..self.cursor + count].load_le::<u64>();
        self.cursor += count;
        Ok(v)
    }
}

/// Which label source an extraction uses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Randomness {
    Uniform { seed: u64 },
    Biased { seed: u64, epsilon: f64 },
}

impl Randomness {
    pub fn seed(&self) -> u64 {
        match *self {
            Randomness::Uniform { seed } | Randomness::Biased { seed, .. } => seed,
        }
    }

    pub fn into_source(self) -> Result<Box<dyn LabelSource + Send>, SamplerError> {
        Ok(match self {
            Randomness::Uniform { seed } => Box::new(UniformLabels::seed_from_u64(seed)),
            Randomness::Biased { seed, epsilon } => Box::new(BiasedLabels::new(seed, epsilon)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_is_seeded() {
        let mut a = UniformLabels::seed_from_u64(3);
        let mut b = UniformLabels::seed_from_u64(3);
        for count in [0u32, 1, 7, 32, 64] {
            let x = a.take_bits(count).unwrap();
            assert_eq!(x, b.take_bits(count).unwrap());
            assert!(count == 64 || x <= low_mask(count));
        }
    }

    #[test]
    fn coin_level_zero_always_true() {
        let mut s = UniformLabels::seed_from_u64(1);
        assert!((0..100).all(|_| s.coin(0).unwrap()));
    }

    #[test]
    fn coin_rate_tracks_level() {
        let mut s = UniformLabels::seed_from_u64(11);
        let heads = (0..8000).filter(|_| s.coin(2).unwrap()).count();
        // Expected 2000.
        assert!((1700..2300).contains(&heads), "heads={heads}");
    }

    #[test]
    fn biased_reads_prepared_sample_in_order() {
        let mut s = BiasedLabels::new(42, 1.0 / 32.0).unwrap();
        s.prepare(96).unwrap();
        let snapshot = s.buffer.clone();
        assert_eq!(snapshot.len(), 96);
        let first = s.take_bits(10).unwrap();
        assert_eq!(first, snapshot[..10].load_le::<u64>());
        let second = s.take_bits(5).unwrap();
        assert_eq!(second, snapshot[10..15].load_le::<u64>());
        assert!(s.seed_bits_used() > 0);
    }

    #[test]
    fn biased_refills_when_overdrawn() {
        let mut s = BiasedLabels::new(9, 0.25).unwrap();
        s.prepare(8).unwrap();
        for _ in 0..50 {
            s.take_bits(20).unwrap();
        }
        assert!(s.seed_bits_used() > 2 * 5);
    }

    #[test]
    fn biased_is_deterministic() {
        let mut a = BiasedLabels::new(77, 1.0 / 128.0).unwrap();
        let mut b = BiasedLabels::new(77, 1.0 / 128.0).unwrap();
        a.prepare(500).unwrap();
        b.prepare(500).unwrap();
        for _ in 0..40 {
            assert_eq!(a.take_bits(12).unwrap(), b.take_bits(12).unwrap());
        }
    }

    #[test]
    fn rejects_bad_epsilon() {
        assert!(BiasedLabels::new(0, 0.0).is_err());
        assert!(Randomness::Biased { seed: 0, epsilon: 2.0 }.into_source().is_err());
        assert!(Randomness::Uniform { seed: 0 }.into_source().is_ok());
    }
}
