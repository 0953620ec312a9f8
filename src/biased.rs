//! Small-bias bit sequences by powering in GF(2^m).
//!
//! Bit `i` of a sample is `<x^i, y>` over GF(2) for a random nonzero `x` and a random `y`.
//! Any nonempty set of positions has parity bias at most `(n - 1) / 2^m <= epsilon`,
//! and a sample is fully described by its `2m` seed bits.

use bitvec::prelude::*;
use rand_xoshiro::rand_core::RngCore;

use crate::error::SamplerError;
use crate::gf2::{Gf2mField, IrreducibleCache, MAX_DEGREE};
use crate::util::low_mask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasedSampler {
    len: usize,
    field: Gf2mField,
}

/// `m = ceil(log2(len / epsilon))`, at least 1.
pub fn field_degree(len: usize, epsilon: f64) -> Result<u32, SamplerError> {
    if len == 0 {
        return Err(SamplerError::EmptyLength);
    }
    if !(epsilon > 0.0 && epsilon <= 1.0) {
        return Err(SamplerError::InvalidBias(epsilon));
    }
    let target = (len as f64 / epsilon).log2().ceil();
    if !target.is_finite() || target > MAX_DEGREE as f64 {
        return Err(crate::error::FieldError::DegreeOutOfRange {
            degree: if target.is_finite() { target as u32 } else { u32::MAX },
            max: MAX_DEGREE,
        }
        .into());
    }
    Ok((target as u32).max(1))
}

impl BiasedSampler {
    pub fn new(len: usize, epsilon: f64, cache: &mut IrreducibleCache) -> Result<Self, SamplerError> {
        let m = field_degree(len, epsilon)?;
        let field = Gf2mField::with_degree(m, cache)?;
        Ok(Self { len, field })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn degree(&self) -> u32 {
        self.field.degree()
    }

    pub fn modulus(&self) -> u64 {
        self.field.modulus()
    }

    /// True random bits consumed by one sample.
    pub fn seed_bits(&self) -> u32 {
        2 * self.field.degree()
    }

    /// The sample determined by the seed `(x, y)`.
    pub fn sample_from(&self, x: u64, y: u64) -> Result<BitVec<u64, Lsb0>, SamplerError> {
        if x == 0 {
            return Err(SamplerError::ZeroGenerator);
        }
        let x = self.field.element(x)?;
        let y = self.field.element(y)?;

        let mut out: BitVec<u64, Lsb0> = BitVec::with_capacity(self.len);
        let mut power = self.field.one();
        for _ in 0..self.len {
            out.push(power.dot(&y));
            power = power * x;
        }
        Ok(out)
    }

    /// Draws `x != 0` (by rejection) and `y`, `m` bits each, then expands them.
    pub fn sample<R: RngCore>(&self, rng: &mut R) -> Result<BitVec<u64, Lsb0>, SamplerError> {
        let mask = low_mask(self.field.degree());
        let x = loop {
            let v = rng.next_u64() & mask;
            if v != 0 {
                break v;
            }
        };
        let y = rng.next_u64() & mask;
        self.sample_from(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xoshiro::{Xoshiro256PlusPlus, rand_core::SeedableRng};

    fn parity(sample: &BitVec<u64, Lsb0>, subset: u64) -> bool {
        sample.iter_ones().filter(|&i| (subset >> i) & 1 == 1).count() % 2 == 1
    }

    #[test]
    fn degree_choice() {
        assert_eq!(field_degree(8, 0.25).unwrap(), 5);
        assert_eq!(field_degree(16, 0.1).unwrap(), 8);
        assert_eq!(field_degree(1, 1.0).unwrap(), 1);
        assert_eq!(field_degree(1000, 1.0 / 1024.0).unwrap(), 20);
        assert_eq!(field_degree(0, 0.5), Err(SamplerError::EmptyLength));
        assert_eq!(field_degree(4, 0.0), Err(SamplerError::InvalidBias(0.0)));
        assert_eq!(field_degree(4, 1.5), Err(SamplerError::InvalidBias(1.5)));
        assert!(field_degree(1 << 20, 1e-30).is_err());
    }

    #[test]
    fn sampler_shape() {
        let mut cache = IrreducibleCache::new();
        let s = BiasedSampler::new(100, 0.01, &mut cache).unwrap();
        assert_eq!(s.degree(), 14);
        assert_eq!(s.seed_bits(), 28);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        assert_eq!(s.sample(&mut rng).unwrap().len(), 100);
        assert_eq!(s.sample_from(0, 3), Err(SamplerError::ZeroGenerator));
        assert!(s.sample_from(1 << 14, 3).is_err());
    }

    #[test]
    fn first_bit_is_constant_term_of_y() {
        // x^0 = 1, so bit 0 is the lowest coefficient of y.
        let mut cache = IrreducibleCache::new();
        let s = BiasedSampler::new(10, 0.5, &mut cache).unwrap();
        assert_eq!(s.sample_from(3, 1).unwrap()[0], true);
        assert_eq!(s.sample_from(3, 2).unwrap()[0], false);
    }

    #[test]
    fn deterministic_given_seed() {
        let mut cache = IrreducibleCache::new();
        let s = BiasedSampler::new(500, 1.0 / 64.0, &mut cache).unwrap();
        let mut r1 = Xoshiro256PlusPlus::seed_from_u64(99);
        let mut r2 = Xoshiro256PlusPlus::seed_from_u64(99);
        assert_eq!(s.sample(&mut r1).unwrap(), s.sample(&mut r2).unwrap());
    }

    /// Exact bias over the whole seed space, for every nonempty subset of positions.
    #[test]
    fn exhaustive_bias_within_epsilon() {
        let n = 8;
        let eps = 0.25;
        let mut cache = IrreducibleCache::new();
        let s = BiasedSampler::new(n, eps, &mut cache).unwrap();
        let m = s.degree();
        let samples: Vec<_> = (1..(1u64 << m))
            .flat_map(|x| (0..(1u64 << m)).map(move |y| (x, y)))
            .map(|(x, y)| s.sample_from(x, y).unwrap())
            .collect();
        let total = samples.len() as f64;
        for subset in 1u64..(1 << n) {
            let ones = samples.iter().filter(|smp| parity(smp, subset)).count() as f64;
            let bias = (ones / total - 0.5).abs();
            assert!(bias <= eps, "subset={subset:#b} bias={bias}");
        }
    }

    /// Empirical bias over random seeds for all subsets of size at most 3.
    #[test]
    fn empirical_bias_small_subsets() {
        let n = 24;
        let eps = 1.0 / 16.0;
        let draws = 4000;
        let mut cache = IrreducibleCache::new();
        let s = BiasedSampler::new(n, eps, &mut cache).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2024);
        let samples: Vec<_> = (0..draws).map(|_| s.sample(&mut rng).unwrap()).collect();

        // Four standard deviations of sampling noise on top of epsilon.
        let tolerance = eps + 4.0 * (0.25 / draws as f64).sqrt();
        let mut subsets = Vec::new();
        for i in 0..n {
            subsets.push(1u64 << i);
            for j in (i + 1)..n {
                subsets.push((1u64 << i) | (1u64 << j));
                for k in (j + 1)..n {
                    subsets.push((1u64 << i) | (1u64 << j) | (1u64 << k));
                }
            }
        }
        for subset in subsets {
            let ones = samples.iter().filter(|smp| parity(smp, subset)).count() as f64;
            let bias = (ones / draws as f64 - 0.5).abs();
            assert!(bias <= tolerance, "subset={subset:#b} bias={bias}");
        }
    }
}
