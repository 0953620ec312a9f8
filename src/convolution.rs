//! Weighted boolean convolution: `c[k] = OR over idx with a[idx] = 1 of b[k - w[idx]]`.
//!
//! All kernels share one integer core. Per-item coefficients are folded into a per-weight
//! vector, the weight axis is cut into blocks, and each block is either applied directly
//! (it holds a single distinct weight, so it is one shifted copy of `b`) or gathered into
//! one transform-backed product. Work then scales with the number of distinct weights,
//! not the number of items.

use std::ops::Range;
use std::time::{Duration, Instant};

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ShapeError;
use crate::ntt;

pub type BitVector = BitVec<u64, Lsb0>;

/// Longest supported output range `0..full_len`. Correlating a pending mask of this
/// length with `b` still fits in one transform.
pub const MAX_OUTPUT_LEN: usize = ntt::MAX_TRANSFORM_LEN / 2;

/// Offset `w[idx]` of every item index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightMap(Vec<u64>);

impl WeightMap {
    pub fn new(weights: Vec<u64>) -> Self {
        Self(weights)
    }

    /// `w[idx] = idx`, the plain (unweighted) convolution.
    pub fn identity(n: usize) -> Self {
        Self((0..n as u64).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> u64 {
        self.0[idx]
    }

    pub fn max(&self) -> Option<u64> {
        self.0.iter().copied().max()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }
}

impl From<Vec<u64>> for WeightMap {
    fn from(v: Vec<u64>) -> Self {
        Self(v)
    }
}

/// A validated `(a, b, w)` triple. Read-only for the duration of every call that uses it.
#[derive(Debug, Clone)]
pub struct Instance {
    a: BitVector,
    b: BitVector,
    w: WeightMap,
    active: Vec<usize>,
    full_len: usize,
}

impl Instance {
    pub fn new(a: BitVector, b: BitVector, w: WeightMap) -> Result<Self, ShapeError> {
        if w.len() != a.len() {
            return Err(ShapeError::LengthMismatch { name: "w", got: w.len(), expected: a.len() });
        }
        let full_len = if a.is_empty() || b.is_empty() {
            0
        } else {
            let span = w.max().map_or(0, |m| m as u128 + 1);
            let len = (a.len() as u128).max(span) + b.len() as u128 - 1;
            if len > MAX_OUTPUT_LEN as u128 {
                return Err(ShapeError::TooLarge { len: len.min(usize::MAX as u128) as usize, limit: MAX_OUTPUT_LEN });
            }
            len as usize
        };
        let active: Vec<usize> = a.iter_ones().collect();
        Ok(Self { a, b, w, active, full_len })
    }

    pub fn a(&self) -> &BitVector {
        &self.a
    }

    pub fn b(&self) -> &BitVector {
        &self.b
    }

    pub fn weights(&self) -> &WeightMap {
        &self.w
    }

    /// Number of items (`|a|`).
    pub fn n_items(&self) -> usize {
        self.a.len()
    }

    /// Items with `a[idx] = 1`, ascending.
    pub fn active_items(&self) -> &[usize] {
        &self.active
    }

    /// Length of the output range `0..full_len` outside of which every position is 0.
    pub fn full_len(&self) -> usize {
        self.full_len
    }

    /// `a[idx] = 1` and `b[k - w[idx]] = 1` with the lookup in range.
    #[inline]
    pub fn is_contributor(&self, idx: usize, k: usize) -> bool {
        if idx >= self.a.len() || !self.a[idx] {
            return false;
        }
        let w = self.w.get(idx);
        if (k as u64) < w {
            return false;
        }
        let j = (k as u64 - w) as usize;
        j < self.b.len() && self.b[j]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Blocks applied as a single shifted add.
    pub direct_blocks: u64,
    /// Blocks routed through the transform.
    pub dense_blocks: u64,
    pub transforms: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ConvolutionEngine {
    block_len: Option<usize>,
    stats: KernelStats,
}

impl ConvolutionEngine {
    pub fn new(block_len: Option<usize>) -> Self {
        Self { block_len: block_len.filter(|&b| b > 0), stats: KernelStats::default() }
    }

    pub fn stats(&self) -> KernelStats {
        self.stats
    }

    fn block_len_for(&self, span: usize) -> usize {
        self.block_len.unwrap_or_else(|| {
            let root = (span as f64).sqrt().ceil() as usize;
            root.next_power_of_two().max(64)
        })
    }

    /// Feasibility bits over `range`; positions past `full_len` are 0.
    pub fn convolve(&mut self, inst: &Instance, range: Range<usize>) -> Result<BitVector, ShapeError> {
        let counts = self.multiplicities(inst, range)?;
        let mut out: BitVector = BitVec::with_capacity(counts.len());
        out.extend(counts.iter().map(|&c| c > 0));
        Ok(out)
    }

    /// Number of contributors at each position of `range`.
    pub fn multiplicities(&mut self, inst: &Instance, range: Range<usize>) -> Result<Vec<u64>, ShapeError> {
        check_range(&range)?;
        let full = self.weighted_full(inst, |_| 1)?;
        Ok(slice_padded(&full, range))
    }

    /// `sum of coeffs[idx]` over the contributors at each position of `range`.
    pub fn weighted_sums(
        &mut self,
        inst: &Instance,
        coeffs: &[u64],
        range: Range<usize>,
    ) -> Result<Vec<u64>, ShapeError> {
        if coeffs.len() != inst.n_items() {
            return Err(ShapeError::CoefficientCount { got: coeffs.len(), expected: inst.n_items() });
        }
        check_range(&range)?;
        let full = self.weighted_full(inst, |idx| coeffs[idx])?;
        Ok(slice_padded(&full, range))
    }

    /// `hits[v] = sum over i of b[i] * mask[v + i]`, for every `v < mask.len()`.
    pub fn correlate(&mut self, mask: &BitVector, b: &BitVector) -> Result<Vec<u64>, ShapeError> {
        let start = Instant::now();
        let len = mask.len();
        if len == 0 || b.not_any() || mask.not_any() {
            return Ok(vec![0; len]);
        }
        let nb = b.len();
        let reversed: Vec<u64> = (0..nb).map(|i| b[nb - 1 - i] as u64).collect();
        let m: Vec<u64> = mask.iter().by_vals().map(u64::from).collect();
        let bound = b.count_ones().min(mask.count_ones()) as u128;
        let prod = ntt::multiply(&reversed, &m, bound)?;
        let hits = (0..len).map(|v| prod[v + nb - 1]).collect();

        self.stats.transforms += 1;
        self.stats.elapsed += start.elapsed();
        Ok(hits)
    }

    fn weighted_full(&mut self, inst: &Instance, coeff: impl Fn(usize) -> u64) -> Result<Vec<u64>, ShapeError> {
        let start = Instant::now();
        let full_len = inst.full_len();
        let mut out = vec![0u64; full_len];
        if full_len == 0 {
            return Ok(out);
        }

        // Fold items into per-weight coefficients.
        let span = inst
            .active_items()
            .iter()
            .map(|&idx| inst.weights().get(idx) as usize + 1)
            .max()
            .unwrap_or(0);
        let mut by_weight = vec![0u64; span];
        let mut total: u128 = 0;
        for &idx in inst.active_items() {
            let c = coeff(idx);
            if c == 0 {
                continue;
            }
            let slot = &mut by_weight[inst.weights().get(idx) as usize];
            *slot = slot.wrapping_add(c);
            total += c as u128;
        }
        if total == 0 {
            return Ok(out);
        }
        if total > u64::MAX as u128 {
            return Err(ShapeError::CoefficientOverflow { bound: total });
        }

        let b_ones: Vec<usize> = inst.b().iter_ones().collect();
        let block = self.block_len_for(span);

        // Classify blocks by how many distinct weights they hold.
        let mut singles: Vec<usize> = Vec::new();
        let mut dense_blocks: Vec<usize> = Vec::new();
        for (bi, chunk) in by_weight.chunks(block).enumerate() {
            let mut nonzero = chunk.iter().enumerate().filter(|&(_, &c)| c != 0);
            match (nonzero.next(), nonzero.next()) {
                (None, _) => {}
                (Some((off, _)), None) => singles.push(bi * block + off),
                (Some(_), Some(_)) => dense_blocks.push(bi),
            }
        }

        // Shifted adds stop paying off once they cost more than one transform.
        let transform_len = (span + inst.b().len()).next_power_of_two();
        let transform_cost = 3 * transform_len * (transform_len.trailing_zeros() as usize + 1);
        if singles.len().saturating_mul(b_ones.len()) > transform_cost {
            for &v in &singles {
                dense_blocks.push(v / block);
            }
            dense_blocks.sort_unstable();
            dense_blocks.dedup();
            singles.clear();
        }

        for &v in &singles {
            let c = by_weight[v];
            for &j in &b_ones {
                out[v + j] += c;
            }
        }

        if !dense_blocks.is_empty() {
            let lo = dense_blocks[0] * block;
            let hi = ((dense_blocks[dense_blocks.len() - 1] + 1) * block).min(span);
            let mut dense = vec![0u64; hi - lo];
            let mut dense_total: u128 = 0;
            for &bi in &dense_blocks {
                let s = bi * block;
                let e = (s + block).min(span);
                for v in s..e {
                    dense[v - lo] = by_weight[v];
                    dense_total += by_weight[v] as u128;
                }
            }
            let b_vals: Vec<u64> = inst.b().iter().by_vals().map(u64::from).collect();
            let prod = ntt::multiply(&dense, &b_vals, dense_total)?;
            for (i, &x) in prod.iter().enumerate() {
                out[lo + i] += x;
            }
            self.stats.transforms += 1;
        }

        self.stats.direct_blocks += singles.len() as u64;
        self.stats.dense_blocks += dense_blocks.len() as u64;
        self.stats.elapsed += start.elapsed();
        trace!(span, block, direct = singles.len(), dense = dense_blocks.len(), "weighted kernel");
        Ok(out)
    }
}

fn check_range(range: &Range<usize>) -> Result<(), ShapeError> {
    if range.start > range.end {
        return Err(ShapeError::RangeOutOfBounds { lo: range.start, hi: range.end, len: range.end });
    }
    Ok(())
}

fn slice_padded(full: &[u64], range: Range<usize>) -> Vec<u64> {
    let mut out = vec![0u64; range.len()];
    let hi = range.end.min(full.len());
    if range.start < hi {
        out[..hi - range.start].copy_from_slice(&full[range.start..hi]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::bitvector_from_u8;
    use rand_xoshiro::{Xoshiro256PlusPlus, rand_core::{RngCore, SeedableRng}};

    fn brute_counts(inst: &Instance) -> Vec<u64> {
        let mut c = vec![0u64; inst.full_len()];
        for k in 0..inst.full_len() {
            c[k] = (0..inst.n_items()).filter(|&idx| inst.is_contributor(idx, k)).count() as u64;
        }
        c
    }

    fn brute_sums(inst: &Instance, coeffs: &[u64]) -> Vec<u64> {
        (0..inst.full_len())
            .map(|k| (0..inst.n_items()).filter(|&idx| inst.is_contributor(idx, k)).map(|idx| coeffs[idx]).sum())
            .collect()
    }

    fn random_instance(rng: &mut Xoshiro256PlusPlus, n: usize, nb: usize, max_w: u64) -> Instance {
        let a: Vec<u8> = (0..n).map(|_| (rng.next_u64() % 2) as u8).collect();
        let b: Vec<u8> = (0..nb).map(|_| (rng.next_u64() % 2) as u8).collect();
        let w: Vec<u64> = (0..n).map(|_| rng.next_u64() % (max_w + 1)).collect();
        Instance::new(bitvector_from_u8(&a), bitvector_from_u8(&b), WeightMap::new(w)).unwrap()
    }

    #[test]
    fn concrete_scenario() {
        let inst = Instance::new(
            bitvector_from_u8(&[1, 0, 1, 0]),
            bitvector_from_u8(&[0, 1, 1, 0]),
            WeightMap::new(vec![0, 1, 2, 3]),
        )
        .unwrap();
        assert_eq!(inst.full_len(), 7);
        let mut engine = ConvolutionEngine::default();
        let c = engine.convolve(&inst, 0..7).unwrap();
        let bits: Vec<bool> = c.iter().by_vals().collect();
        assert_eq!(bits, vec![false, true, true, true, true, false, false]);
        assert_eq!(engine.multiplicities(&inst, 0..7).unwrap(), vec![0, 1, 1, 1, 1, 0, 0]);
        // Sub-range and padding past the end.
        assert_eq!(engine.multiplicities(&inst, 3..9).unwrap(), vec![1, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn matches_brute_force_random() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1234);
        for trial in 0..30 {
            let n = 1 + (rng.next_u64() % 300) as usize;
            let nb = 1 + (rng.next_u64() % 300) as usize;
            let max_w = rng.next_u64() % 400;
            let inst = random_instance(&mut rng, n, nb, max_w);
            let expected = brute_counts(&inst);
            for block in [None, Some(1), Some(4), Some(1 << 20)] {
                let mut engine = ConvolutionEngine::new(block);
                let got = engine.multiplicities(&inst, 0..inst.full_len()).unwrap();
                assert_eq!(got, expected, "trial={trial} block={block:?}");
            }
        }
    }

    #[test]
    fn weighted_sums_match_brute_force() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(99);
        for _ in 0..10 {
            let inst = random_instance(&mut rng, 200, 150, 250);
            let coeffs: Vec<u64> = (0..inst.n_items()).map(|_| rng.next_u64() % (1 << 30)).collect();
            let mut engine = ConvolutionEngine::default();
            let got = engine.weighted_sums(&inst, &coeffs, 0..inst.full_len()).unwrap();
            assert_eq!(got, brute_sums(&inst, &coeffs));
        }
    }

    #[test]
    fn repeated_weights_use_direct_blocks() {
        // Five distinct weights far apart: every block holds at most one.
        let n = 400;
        let w: Vec<u64> = (0..n).map(|i| (i % 5) as u64 * 1000).collect();
        let a = BitVec::<u64, Lsb0>::repeat(true, n);
        let b = bitvector_from_u8(&[1, 0, 1, 1, 0, 1]);
        let inst = Instance::new(a, b, WeightMap::new(w)).unwrap();
        let mut engine = ConvolutionEngine::new(Some(64));
        let got = engine.multiplicities(&inst, 0..inst.full_len()).unwrap();
        assert_eq!(got, brute_counts(&inst));
        let stats = engine.stats();
        assert_eq!(stats.direct_blocks, 5);
        assert_eq!(stats.dense_blocks, 0);
        assert_eq!(stats.transforms, 0);
    }

    #[test]
    fn correlate_matches_naive() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(8);
        let mask: BitVector = (0..900).map(|_| rng.next_u64() % 4 == 0).collect();
        let b: BitVector = (0..300).map(|_| rng.next_u64() % 2 == 0).collect();
        let mut engine = ConvolutionEngine::default();
        let hits = engine.correlate(&mask, &b).unwrap();
        for v in 0..mask.len() {
            let naive = (0..b.len()).filter(|&i| b[i] && v + i < mask.len() && mask[v + i]).count() as u64;
            assert_eq!(hits[v], naive, "v={v}");
        }
    }

    #[test]
    fn instance_validation() {
        let err = Instance::new(bitvector_from_u8(&[1, 1]), bitvector_from_u8(&[1]), WeightMap::new(vec![0]))
            .unwrap_err();
        assert_eq!(err, ShapeError::LengthMismatch { name: "w", got: 1, expected: 2 });

        let empty = Instance::new(BitVec::new(), bitvector_from_u8(&[1]), WeightMap::default()).unwrap();
        assert_eq!(empty.full_len(), 0);
        let mut engine = ConvolutionEngine::default();
        assert_eq!(engine.convolve(&empty, 0..3).unwrap().count_ones(), 0);
    }

    #[test]
    fn oversized_output_is_rejected() {
        let two = || bitvector_from_u8(&[1, 1]);
        let err = Instance::new(two(), two(), WeightMap::new(vec![0, 1 << 61])).unwrap_err();
        assert_eq!(err, ShapeError::TooLarge { len: (1 << 61) + 2, limit: MAX_OUTPUT_LEN });
        let err = Instance::new(two(), two(), WeightMap::new(vec![0, u64::MAX])).unwrap_err();
        assert!(matches!(err, ShapeError::TooLarge { limit: MAX_OUTPUT_LEN, .. }));

        // The largest accepted weight still convolves, and only at the far end.
        let w = (MAX_OUTPUT_LEN - 2) as u64;
        let inst = Instance::new(two(), two(), WeightMap::new(vec![0, w])).unwrap();
        assert_eq!(inst.full_len(), MAX_OUTPUT_LEN);
        let mut engine = ConvolutionEngine::default();
        let tail = engine.multiplicities(&inst, MAX_OUTPUT_LEN - 3..MAX_OUTPUT_LEN).unwrap();
        assert_eq!(tail, vec![0, 1, 1]);
    }

    #[test]
    fn coefficient_count_checked() {
        let inst = Instance::new(bitvector_from_u8(&[1]), bitvector_from_u8(&[1]), WeightMap::new(vec![0])).unwrap();
        let mut engine = ConvolutionEngine::default();
        assert_eq!(
            engine.weighted_sums(&inst, &[1, 2], 0..1).unwrap_err(),
            ShapeError::CoefficientCount { got: 2, expected: 1 }
        );
    }
}
