//! Witness recovery for weighted boolean convolution.
//!
//! An extraction computes the true multiplicity of every output position once, then
//! runs isolation rounds. In a round each live item joins with probability `2^-level`
//! and carries a random label. Two weighted sums per position (of `idx + 1` and of the
//! labels) reveal the single unfound contributor when exactly one joined; witnesses
//! already found are subtracted first. Every candidate is checked against the instance
//! before it is accepted, so returned witnesses are valid whatever the labels were.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand_xoshiro::{Xoshiro256PlusPlus, rand_core::SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::convolution::{BitVector, ConvolutionEngine, Instance};
use crate::error::{ShapeError, WitnessError};
use crate::labels::Randomness;
use crate::peeling::{Order, PeelingRefiner, RoundReport};
use crate::rank_index::RankIndex;
use crate::traits::LabelSource;
use crate::util::ceil_log2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Witnesses wanted per position (`k`).
    pub witnesses: usize,
    /// Round budget; derived from `n` and `k` when unset.
    pub max_rounds: Option<u32>,
    /// Label width in bits; derived from `n` when unset.
    pub label_bits: Option<u32>,
    /// Weight-axis block length of the convolution kernel.
    pub block_len: Option<usize>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self { witnesses: 1, max_rounds: None, label_bits: None, block_len: None }
    }
}

impl ExtractorConfig {
    pub fn with_witnesses(witnesses: usize) -> Self {
        Self { witnesses, ..Self::default() }
    }

    /// Label sums over `n` items must stay below `2^62`.
    pub fn label_bits_for(&self, n: usize) -> u32 {
        let log_n = ceil_log2((n as u64).saturating_add(1));
        let cap = 62u32.saturating_sub(log_n).max(1);
        match self.label_bits {
            Some(bits) => bits.clamp(1, cap),
            None => 40u32.min(2 * log_n + 8).min(cap).max(8u32.min(cap)),
        }
    }

    /// A position never has more than `n` contributors, so `k` is clamped to `n` first.
    pub fn max_rounds_for(&self, n: usize) -> u32 {
        self.max_rounds.unwrap_or_else(|| {
            let levels = ceil_log2((n as u64).saturating_add(1)) as u64 + 1;
            let k = self.witnesses.min(n) as u64;
            8u64.saturating_mul(k.saturating_add(levels)).saturating_mul(levels + 1).min(u32::MAX as u64) as u32
        })
    }
}

/// Per-position witness lists, stored as CSR over the feasible positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WitnessTable {
    feasible: RankIndex,
    offsets: Vec<usize>,
    items: Vec<usize>,
    unresolved: BitVector,
}

impl WitnessTable {
    /// `lists[k]` holds the witnesses of position `k`; only feasible positions are read.
    pub fn from_lists(feasible: BitVector, lists: &[Vec<usize>], unresolved: BitVector) -> Result<Self, ShapeError> {
        if lists.len() != feasible.len() {
            return Err(ShapeError::LengthMismatch { name: "witness lists", got: lists.len(), expected: feasible.len() });
        }
        if unresolved.len() != feasible.len() {
            return Err(ShapeError::LengthMismatch {
                name: "unresolved positions",
                got: unresolved.len(),
                expected: feasible.len(),
            });
        }
        let mut offsets = Vec::with_capacity(feasible.count_ones() + 1);
        let mut items = Vec::new();
        offsets.push(0);
        for k in feasible.iter_ones() {
            items.extend_from_slice(&lists[k]);
            offsets.push(items.len());
        }
        Ok(Self { feasible: RankIndex::new(Arc::new(feasible)), offsets, items, unresolved })
    }

    /// Number of output positions.
    pub fn len(&self) -> usize {
        self.feasible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feasible.is_empty()
    }

    /// Some item contributes to position `k`.
    pub fn is_feasible(&self, k: usize) -> bool {
        k < self.len() && self.feasible.vector()[k]
    }

    pub fn feasible_count(&self) -> usize {
        self.feasible.count_ones()
    }

    /// Witnesses at `k` in the order they were found; empty for infeasible positions.
    pub fn witnesses(&self, k: usize) -> &[usize] {
        if !self.is_feasible(k) {
            return &[];
        }
        let r = self.feasible.rank1(k);
        &self.items[self.offsets[r]..self.offsets[r + 1]]
    }

    /// First witness at `k`, `None` is the "no witness" sentinel.
    pub fn min_witness(&self, k: usize) -> Option<usize> {
        self.witnesses(k).first().copied()
    }

    pub fn is_unresolved(&self, k: usize) -> bool {
        k < self.len() && self.unresolved[k]
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved.count_ones()
    }

    fn to_lists(&self) -> Vec<Vec<usize>> {
        (0..self.len()).map(|k| self.witnesses(k).to_vec()).collect()
    }

    pub fn serialize(&self, mut writer: &mut impl std::io::Write) -> Result<(), WitnessError> {
        let feasible = self.feasible.vector();
        bincode::serialize_into(&mut writer, &feasible.len())?;
        bincode::serialize_into(&mut writer, feasible.as_raw_slice())?;
        bincode::serialize_into(&mut writer, &self.offsets)?;
        bincode::serialize_into(&mut writer, &self.items)?;
        bincode::serialize_into(&mut writer, self.unresolved.as_raw_slice())?;
        Ok(())
    }

    pub fn load(mut reader: &mut impl std::io::Read) -> Result<Self, WitnessError> {
        let len: usize = bincode::deserialize_from(&mut reader)?;
        let feasible_words: Vec<u64> = bincode::deserialize_from(&mut reader)?;
        let offsets: Vec<usize> = bincode::deserialize_from(&mut reader)?;
        let items: Vec<usize> = bincode::deserialize_from(&mut reader)?;
        let unresolved_words: Vec<u64> = bincode::deserialize_from(&mut reader)?;

        let feasible = words_to_bits(feasible_words, len)?;
        let unresolved = words_to_bits(unresolved_words, len)?;
        if offsets.len() != feasible.count_ones() + 1 || offsets.first() != Some(&0) {
            return Err(WitnessError::Corrupt("offset count does not match feasible positions"));
        }
        if offsets.windows(2).any(|w| w[0] > w[1]) || offsets.last() != Some(&items.len()) {
            return Err(WitnessError::Corrupt("offsets are not a partition of the item list"));
        }
        if unresolved.iter_ones().any(|k| !feasible[k]) {
            return Err(WitnessError::Corrupt("unresolved position is not feasible"));
        }
        Ok(Self { feasible: RankIndex::new(Arc::new(feasible)), offsets, items, unresolved })
    }
}

fn words_to_bits(words: Vec<u64>, len: usize) -> Result<BitVector, WitnessError> {
    if words.len() != len.div_ceil(64) {
        return Err(WitnessError::Corrupt("bit vector length does not match its word count"));
    }
    let mut bits = BitVector::from_vec(words);
    bits.truncate(len);
    Ok(bits)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStatus {
    Resolved,
    /// The round budget ran out with `unresolved` positions short of their target.
    BudgetExhausted { unresolved: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub rounds: u32,
    pub collisions: u64,
    pub max_live_support: usize,
    pub feasibility_time: Duration,
    pub direct_blocks: u64,
    pub dense_blocks: u64,
    pub total_time: Duration,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub table: WitnessTable,
    pub status: ExtractionStatus,
    pub stats: ExtractionStats,
    witnesses: usize,
}

impl Extraction {
    pub fn is_resolved(&self) -> bool {
        self.status == ExtractionStatus::Resolved
    }

    /// Fill every unresolved position by scanning items in `order`. Returns how many
    /// positions were completed.
    pub fn complete_exhaustively(&mut self, inst: &Instance, order: &Order) -> Result<usize, ShapeError> {
        if order.len() != inst.n_items() {
            return Err(ShapeError::LengthMismatch { name: "order", got: order.len(), expected: inst.n_items() });
        }
        if inst.full_len() != self.table.len() {
            return Err(ShapeError::LengthMismatch {
                name: "witness table",
                got: self.table.len(),
                expected: inst.full_len(),
            });
        }
        let open: Vec<usize> = self.table.unresolved.iter_ones().collect();
        if open.is_empty() {
            return Ok(0);
        }
        let k_req = self.witnesses;
        let mut lists = self.table.to_lists();
        lists.par_iter_mut().enumerate().filter(|(k, _)| self.table.unresolved[*k]).for_each(|(k, list)| {
            for idx in order.iter() {
                if list.len() >= k_req {
                    break;
                }
                if inst.is_contributor(idx, k) && !list.contains(&idx) {
                    list.push(idx);
                }
            }
        });
        let feasible = BitVector::clone(self.table.feasible.vector());
        let unresolved = BitVector::repeat(false, feasible.len());
        self.table = WitnessTable::from_lists(feasible, &lists, unresolved)?;
        self.status = ExtractionStatus::Resolved;
        Ok(open.len())
    }
}

enum Residual {
    Silent,
    Hit(usize),
    Collision,
}

/// Strip the found witnesses that joined this round from the two sums at `k`, then check
/// whether what is left names exactly one new contributor.
fn inspect(
    inst: &Instance,
    k: usize,
    mut idx_sum: u64,
    mut label_sum: u64,
    labels: &[u64],
    found: &[usize],
) -> Residual {
    for &f in found {
        if labels[f] != 0 {
            idx_sum -= f as u64 + 1;
            label_sum -= labels[f];
        }
    }
    if idx_sum == 0 {
        return Residual::Silent;
    }
    let cand = (idx_sum - 1) as usize;
    if cand < labels.len()
        && labels[cand] != 0
        && labels[cand] == label_sum
        && inst.is_contributor(cand, k)
        && !found.contains(&cand)
    {
        Residual::Hit(cand)
    } else {
        Residual::Collision
    }
}

pub struct WitnessExtractor<'a, S: LabelSource> {
    inst: &'a Instance,
    order: Order,
    witnesses: usize,
    label_bits: u32,
    budget: u32,
    source: S,
    engine: ConvolutionEngine,
    positions: Option<BitVector>,
}

impl<'a, S: LabelSource> WitnessExtractor<'a, S> {
    pub fn new(inst: &'a Instance, order: &Order, config: ExtractorConfig, source: S) -> Result<Self, WitnessError> {
        if config.witnesses == 0 {
            return Err(ShapeError::ZeroMultiplicity.into());
        }
        if order.len() != inst.n_items() {
            return Err(ShapeError::LengthMismatch { name: "order", got: order.len(), expected: inst.n_items() }.into());
        }
        let n = inst.n_items();
        Ok(Self {
            inst,
            order: order.clone(),
            witnesses: config.witnesses,
            label_bits: config.label_bits_for(n),
            budget: config.max_rounds_for(n),
            source,
            engine: ConvolutionEngine::new(config.block_len),
            positions: None,
        })
    }

    /// Resolve only the positions set in `positions`; the others are reported infeasible.
    pub fn restrict_to(mut self, positions: BitVector) -> Result<Self, ShapeError> {
        if positions.len() != self.inst.full_len() {
            return Err(ShapeError::LengthMismatch {
                name: "positions",
                got: positions.len(),
                expected: self.inst.full_len(),
            });
        }
        self.positions = Some(positions);
        Ok(self)
    }

    pub fn run(mut self) -> Result<Extraction, WitnessError> {
        let start = Instant::now();
        let inst = self.inst;
        let full = inst.full_len();

        let mult = self.engine.multiplicities(inst, 0..full)?;
        let feasibility_time = start.elapsed();

        let targets: Vec<usize> = mult.iter().map(|&m| (m as usize).min(self.witnesses)).collect();
        let feasible: BitVector = mult
            .iter()
            .enumerate()
            .map(|(k, &m)| m > 0 && self.positions.as_ref().is_none_or(|p| p[k]))
            .collect();
        let max_remaining = feasible.iter_ones().map(|k| mult[k]).max().unwrap_or(0) as usize;
        let mut found: Vec<Vec<usize>> = vec![Vec::new(); full];

        let mut refiner =
            PeelingRefiner::new(inst, self.order.clone(), feasible.clone(), max_remaining, self.budget, &mut self.engine)?;
        info!(
            items = inst.n_items(),
            positions = refiner.pending_count(),
            witnesses = self.witnesses,
            budget = self.budget,
            label_bits = self.label_bits,
            "starting witness extraction"
        );

        let mut collisions = 0u64;
        let mut still_pending = refiner.pending_count();
        while still_pending > 0 && !refiner.exhausted() {
            let report = self.round(&refiner, &mult, &targets, &mut found)?;
            collisions += report.collisions;
            let advance = refiner.advance(report, inst, &mut self.engine)?;
            if !advance.resolved.is_empty() {
                debug!(resolved = advance.resolved.len(), still_pending = advance.still_pending, "positions resolved");
            }
            still_pending = advance.still_pending;
        }

        let unresolved_count = refiner.pending_count();
        let status = if unresolved_count == 0 {
            ExtractionStatus::Resolved
        } else {
            warn!(unresolved = unresolved_count, rounds = refiner.round(), "round budget exhausted");
            ExtractionStatus::BudgetExhausted { unresolved: unresolved_count }
        };
        let table = WitnessTable::from_lists(feasible, &found, refiner.pending().clone())?;

        let kernel = self.engine.stats();
        let stats = ExtractionStats {
            rounds: refiner.round(),
            collisions,
            max_live_support: refiner.max_live_support(),
            feasibility_time,
            direct_blocks: kernel.direct_blocks,
            dense_blocks: kernel.dense_blocks,
            total_time: start.elapsed(),
        };
        info!(rounds = stats.rounds, collisions, elapsed = ?stats.total_time, "witness extraction finished");
        Ok(Extraction { table, status, stats, witnesses: self.witnesses })
    }

    fn round(
        &mut self,
        refiner: &PeelingRefiner,
        mult: &[u64],
        targets: &[usize],
        found: &mut [Vec<usize>],
    ) -> Result<RoundReport, WitnessError> {
        let inst = self.inst;
        let n = inst.n_items();
        let level = refiner.level();
        let live: Vec<usize> = refiner.live_in_order().collect();

        let expected_joins = live.len().div_ceil(1usize << level.min(63)) + 8;
        self.source.prepare(live.len() * level as usize + expected_joins * self.label_bits as usize)?;

        let mut labels = vec![0u64; n];
        let mut idx_coeffs = vec![0u64; n];
        let mut joined = 0usize;
        for &idx in &live {
            if self.source.coin(level)? {
                labels[idx] = self.source.take_bits(self.label_bits)? + 1;
                idx_coeffs[idx] = idx as u64 + 1;
                joined += 1;
            }
        }

        let pending: Vec<usize> = refiner.pending().iter_ones().collect();
        let mut completed = Vec::new();
        let mut collisions = 0u64;
        if joined > 0 {
            let full = inst.full_len();
            let idx_sums = self.engine.weighted_sums(inst, &idx_coeffs, 0..full)?;
            let label_sums = self.engine.weighted_sums(inst, &labels, 0..full)?;
            let residuals: Vec<(usize, Residual)> = {
                let found: &[Vec<usize>] = found;
                pending
                    .par_iter()
                    .map(|&k| (k, inspect(inst, k, idx_sums[k], label_sums[k], &labels, &found[k])))
                    .collect()
            };
            for (k, p) in residuals {
                match p {
                    Residual::Hit(idx) => {
                        found[k].push(idx);
                        if found[k].len() >= targets[k] {
                            completed.push(k);
                        }
                    }
                    Residual::Collision => collisions += 1,
                    Residual::Silent => {}
                }
            }
        }

        let max_remaining = pending
            .iter()
            .filter(|&&k| found[k].len() < targets[k])
            .map(|&k| mult[k] as usize - found[k].len())
            .max()
            .unwrap_or(0);
        debug!(
            round = refiner.round(),
            level,
            live = live.len(),
            joined,
            completed = completed.len(),
            collisions,
            "isolation round"
        );
        Ok(RoundReport { completed, max_remaining, collisions })
    }
}

/// Run one extraction with a label source built from `randomness`.
pub fn extract(
    inst: &Instance,
    order: &Order,
    config: ExtractorConfig,
    randomness: Randomness,
) -> Result<Extraction, WitnessError> {
    let source = randomness.into_source()?;
    WitnessExtractor::new(inst, order, config, source)?.run()
}

/// For every position, the contributor that comes first in `order`.
///
/// Items are split into `ceil(sqrt n)` consecutive groups along `order`. One boolean
/// convolution per group finds, for each position, the first group that reaches it, and
/// a scan inside that group picks the item.
pub fn ordered_min_witness(
    inst: &Instance,
    order: &Order,
    engine: &mut ConvolutionEngine,
) -> Result<Vec<Option<usize>>, ShapeError> {
    let n = inst.n_items();
    if order.len() != n {
        return Err(ShapeError::LengthMismatch { name: "order", got: order.len(), expected: n });
    }
    let full = inst.full_len();
    let mut out = vec![None; full];
    if full == 0 {
        return Ok(out);
    }
    let group = ((n as f64).sqrt().ceil() as usize).max(1);
    let mut open = full;
    for chunk in order.as_slice().chunks(group) {
        if open == 0 {
            break;
        }
        let mut a = BitVector::repeat(false, n);
        for &idx in chunk {
            if inst.a()[idx] {
                a.set(idx, true);
            }
        }
        if a.not_any() {
            continue;
        }
        let sub = Instance::new(a, inst.b().clone(), inst.weights().clone())?;
        let reached = engine.convolve(&sub, 0..full)?;
        for k in reached.iter_ones() {
            if out[k].is_none() {
                out[k] = chunk.iter().copied().find(|&idx| inst.is_contributor(idx, k));
                if out[k].is_some() {
                    open -= 1;
                }
            }
        }
    }
    Ok(out)
}

/// One witness per position together with the work it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinWitnesses {
    pub witnesses: Vec<Option<usize>>,
    pub stats: ExtractionStats,
    /// Positions completed by scanning after a round budget ran out.
    pub scanned: usize,
}

/// For every position, the contributor that comes first in `order`, found by peeling
/// rank prefixes.
///
/// Ranks are cut into slices `[0, 1), [1, 2), [2, 4), [4, 8), ...`. One convolution per
/// slice tells which open positions the slice reaches. An extraction restricted to those
/// positions recovers all of their contributors inside the slice and the one of lowest
/// rank is kept. The result is exact for any order. When `order` is uniformly random a
/// position has few contributors in the first slice that reaches it, so the whole pass
/// costs a logarithmic number of convolutions and short extractions.
pub fn prefix_min_witness(
    inst: &Instance,
    order: &Order,
    config: ExtractorConfig,
    randomness: Randomness,
) -> Result<MinWitnesses, WitnessError> {
    let start = Instant::now();
    let n = inst.n_items();
    if order.len() != n {
        return Err(ShapeError::LengthMismatch { name: "order", got: order.len(), expected: n }.into());
    }
    let full = inst.full_len();
    let mut result = MinWitnesses { witnesses: vec![None; full], stats: ExtractionStats::default(), scanned: 0 };
    if full == 0 {
        return Ok(result);
    }

    let mut source = randomness.into_source()?;
    let mut engine = ConvolutionEngine::new(config.block_len);
    let mut open = engine.convolve(inst, 0..full)?;
    let mut open_count = open.count_ones();
    let mut lo = 0;
    while lo < n && open_count > 0 {
        let hi = (2 * lo).clamp(1, n);
        let mut a = BitVector::repeat(false, n);
        for &idx in &order.as_slice()[lo..hi] {
            if inst.a()[idx] {
                a.set(idx, true);
            }
        }
        lo = hi;
        if a.not_any() {
            continue;
        }

        let sub = Instance::new(a, inst.b().clone(), inst.weights().clone())?;
        let mult = engine.multiplicities(&sub, 0..full)?;
        let mut fresh = BitVector::repeat(false, full);
        let mut most = 0;
        for k in open.iter_ones() {
            if mult[k] > 0 {
                fresh.set(k, true);
                most = most.max(mult[k] as usize);
            }
        }
        if most == 0 {
            continue;
        }

        let slice_config = ExtractorConfig { witnesses: most, ..config };
        let mut ex = WitnessExtractor::new(&sub, order, slice_config, &mut source)?.restrict_to(fresh.clone())?.run()?;
        if !ex.is_resolved() {
            result.scanned += ex.complete_exhaustively(&sub, order)?;
        }
        for k in fresh.iter_ones() {
            result.witnesses[k] = ex.table.witnesses(k).iter().copied().min_by_key(|&idx| order.rank_of(idx));
            open.set(k, false);
            open_count -= 1;
        }

        let stats = &mut result.stats;
        stats.rounds += ex.stats.rounds;
        stats.collisions += ex.stats.collisions;
        stats.max_live_support = stats.max_live_support.max(ex.stats.max_live_support);
        stats.feasibility_time += ex.stats.feasibility_time;
        stats.direct_blocks += ex.stats.direct_blocks;
        stats.dense_blocks += ex.stats.dense_blocks;
        debug!(slice_end = hi, fresh = fresh.count_ones(), open = open_count, most, "prefix slice resolved");
    }

    let kernel = engine.stats();
    result.stats.feasibility_time += kernel.elapsed;
    result.stats.direct_blocks += kernel.direct_blocks;
    result.stats.dense_blocks += kernel.dense_blocks;
    result.stats.total_time = start.elapsed();
    info!(
        rounds = result.stats.rounds,
        scanned = result.scanned,
        elapsed = ?result.stats.total_time,
        "prefix minimum witnesses found"
    );
    Ok(result)
}

/// One contributor per position, drawn uniformly among its contributors.
///
/// The first contributor under a uniformly random order is a uniform draw, so this runs
/// [`prefix_min_witness`] under an order shuffled from the seed of `randomness`.
pub fn sample_witnesses(
    inst: &Instance,
    config: ExtractorConfig,
    randomness: Randomness,
) -> Result<MinWitnesses, WitnessError> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(randomness.seed());
    // Keep the shuffle stream apart from the label stream of the same seed.
    rng.jump();
    let order = Order::shuffled(inst.n_items(), &mut rng);
    prefix_min_witness(inst, &order, config, randomness)
}
