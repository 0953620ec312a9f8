//! Shrinking the live set between isolation rounds.
//!
//! The refiner owns the pending positions, the items that can still reach one of them,
//! and the inclusion level of the next round. Levels count down from `ceil(log2 r)`,
//! where `r` is the largest number of unfound contributors at a pending position, to 0.
//! One such sweep is a cycle. At every cycle boundary the level restarts from the new
//! maximum and items that reach no pending position leave the live set.

use rand_xoshiro::rand_core::RngCore;
use tracing::debug;

use crate::convolution::{BitVector, ConvolutionEngine, Instance};
use crate::error::ShapeError;
use crate::util::ceil_log2;

/// A permutation of item indices fixing the sequence in which items are visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    perm: Vec<usize>,
    rank: Vec<usize>,
}

impl Order {
    pub fn new(perm: Vec<usize>) -> Result<Self, ShapeError> {
        let len = perm.len();
        let mut rank = vec![usize::MAX; len];
        for (slot, &value) in perm.iter().enumerate() {
            if value >= len || rank[value] != usize::MAX {
                return Err(ShapeError::NotPermutation { len, slot, value });
            }
            rank[value] = slot;
        }
        Ok(Self { perm, rank })
    }

    pub fn identity(n: usize) -> Self {
        Self { perm: (0..n).collect(), rank: (0..n).collect() }
    }

    /// Fisher-Yates shuffle of `0..n`.
    pub fn shuffled(n: usize, rng: &mut impl RngCore) -> Self {
        let mut perm: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = (rng.next_u64() % (i as u64 + 1)) as usize;
            perm.swap(i, j);
        }
        let mut rank = vec![0; n];
        for (slot, &idx) in perm.iter().enumerate() {
            rank[idx] = slot;
        }
        Self { perm, rank }
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.perm
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.perm.iter().copied()
    }

    /// Slot of item `idx` in the permutation.
    #[inline]
    pub fn rank_of(&self, idx: usize) -> usize {
        self.rank[idx]
    }
}

/// What one isolation round achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Positions that reached their target count this round.
    pub completed: Vec<usize>,
    /// Largest number of unfound contributors over the positions still pending.
    pub max_remaining: usize,
    pub collisions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advance {
    pub resolved: Vec<usize>,
    pub still_pending: usize,
}

#[derive(Debug, Clone)]
pub struct PeelingRefiner {
    order: Order,
    pending: BitVector,
    pending_count: usize,
    live: BitVector,
    live_count: usize,
    max_live: usize,
    level: u32,
    round: u32,
    budget: u32,
}

impl PeelingRefiner {
    pub fn new(
        inst: &Instance,
        order: Order,
        pending: BitVector,
        max_remaining: usize,
        budget: u32,
        engine: &mut ConvolutionEngine,
    ) -> Result<Self, ShapeError> {
        if order.len() != inst.n_items() {
            return Err(ShapeError::LengthMismatch { name: "order", got: order.len(), expected: inst.n_items() });
        }
        if pending.len() != inst.full_len() {
            return Err(ShapeError::LengthMismatch {
                name: "pending positions",
                got: pending.len(),
                expected: inst.full_len(),
            });
        }
        let pending_count = pending.count_ones();
        let mut refiner = Self {
            order,
            pending,
            pending_count,
            live: BitVector::repeat(false, inst.n_items()),
            live_count: 0,
            max_live: 0,
            level: ceil_log2(max_remaining as u64),
            round: 0,
            budget,
        };
        refiner.refresh_live(inst, engine)?;
        Ok(refiner)
    }

    pub fn pending(&self) -> &BitVector {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    #[inline]
    pub fn is_live(&self, idx: usize) -> bool {
        self.live[idx]
    }

    /// Live items in `order` sequence.
    pub fn live_in_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.iter().filter(move |&idx| self.live[idx])
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Largest live set seen so far.
    pub fn max_live_support(&self) -> usize {
        self.max_live
    }

    /// Items join the next round with probability `2^-level`.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn exhausted(&self) -> bool {
        self.round >= self.budget
    }

    pub fn advance(
        &mut self,
        report: RoundReport,
        inst: &Instance,
        engine: &mut ConvolutionEngine,
    ) -> Result<Advance, ShapeError> {
        for &k in &report.completed {
            if self.pending[k] {
                self.pending.set(k, false);
                self.pending_count -= 1;
            }
        }
        self.round += 1;

        if self.level == 0 {
            self.level = ceil_log2(report.max_remaining as u64);
            if self.pending_count > 0 {
                self.refresh_live(inst, engine)?;
            }
            debug!(
                round = self.round,
                pending = self.pending_count,
                live = self.live_count,
                level = self.level,
                "peeling cycle complete"
            );
        } else {
            self.level -= 1;
        }

        Ok(Advance { resolved: report.completed, still_pending: self.pending_count })
    }

    /// Keep the items with `a[idx] = 1` that reach at least one pending position.
    fn refresh_live(&mut self, inst: &Instance, engine: &mut ConvolutionEngine) -> Result<(), ShapeError> {
        let hits = engine.correlate(&self.pending, inst.b())?;
        self.live.fill(false);
        let mut count = 0;
        for &idx in inst.active_items() {
            let w = inst.weights().get(idx);
            if w < hits.len() as u64 && hits[w as usize] > 0 {
                self.live.set(idx, true);
                count += 1;
            }
        }
        self.live_count = count;
        self.max_live = self.max_live.max(count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolution::WeightMap;
    use crate::util::bitvector_from_u8;

    fn small_instance() -> Instance {
        Instance::new(
            bitvector_from_u8(&[1, 1, 0, 1, 1]),
            bitvector_from_u8(&[1, 1, 0, 0, 0]),
            WeightMap::new(vec![0, 1, 2, 3, 4]),
        )
        .unwrap()
    }

    #[test]
    fn order_validation() {
        let order = Order::new(vec![2, 0, 1]).unwrap();
        assert_eq!(order.rank_of(2), 0);
        assert_eq!(order.rank_of(1), 2);
        assert_eq!(
            Order::new(vec![0, 0, 1]).unwrap_err(),
            ShapeError::NotPermutation { len: 3, slot: 1, value: 0 }
        );
        assert_eq!(
            Order::new(vec![0, 3, 1]).unwrap_err(),
            ShapeError::NotPermutation { len: 3, slot: 1, value: 3 }
        );
        assert!(Order::new(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn shuffled_order_is_a_permutation() {
        use rand_xoshiro::{Xoshiro256PlusPlus, rand_core::SeedableRng};
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(6);
        let order = Order::shuffled(200, &mut rng);
        assert_eq!(Order::new(order.as_slice().to_vec()).unwrap(), order);
        assert_ne!(order, Order::identity(200));
        assert!(Order::shuffled(0, &mut rng).is_empty());
    }

    #[test]
    fn live_set_follows_pending_positions() {
        let inst = small_instance();
        let mut engine = ConvolutionEngine::default();
        // Only position 0 is pending: reached by item 0 through b[0].
        let mut pending = BitVector::repeat(false, inst.full_len());
        pending.set(0, true);
        let refiner = PeelingRefiner::new(&inst, Order::identity(5), pending, 1, 10, &mut engine).unwrap();
        assert_eq!(refiner.live_count(), 1);
        assert!(refiner.is_live(0));
        assert!(!refiner.is_live(1));

        // Position 4 is reached by item 3 (b[1]) and item 4 (b[0]).
        let mut pending = BitVector::repeat(false, inst.full_len());
        pending.set(4, true);
        let refiner = PeelingRefiner::new(&inst, Order::new(vec![4, 3, 2, 1, 0]).unwrap(), pending, 2, 10, &mut engine)
            .unwrap();
        assert_eq!(refiner.live_in_order().collect::<Vec<_>>(), vec![4, 3]);
    }

    #[test]
    fn level_schedule_counts_down_then_restarts() {
        let inst = small_instance();
        let mut engine = ConvolutionEngine::default();
        let pending = BitVector::repeat(true, inst.full_len());
        let mut refiner = PeelingRefiner::new(&inst, Order::identity(5), pending, 5, 100, &mut engine).unwrap();
        let mut levels = Vec::new();
        for _ in 0..6 {
            levels.push(refiner.level());
            let report = RoundReport { completed: Vec::new(), max_remaining: 2, collisions: 0 };
            refiner.advance(report, &inst, &mut engine).unwrap();
        }
        assert_eq!(levels, vec![3, 2, 1, 0, 1, 0]);
        assert_eq!(refiner.round(), 6);
    }

    #[test]
    fn advance_drops_completed_positions() {
        let inst = small_instance();
        let mut engine = ConvolutionEngine::default();
        let multiplicity = engine.multiplicities(&inst, 0..inst.full_len()).unwrap();
        let pending: BitVector = multiplicity.iter().map(|&m| m > 0).collect();
        let total = pending.count_ones();
        let mut refiner = PeelingRefiner::new(&inst, Order::identity(5), pending, 2, 3, &mut engine).unwrap();
        assert_eq!(refiner.live_count(), 4);

        let report = RoundReport { completed: vec![0, 0], max_remaining: 2, collisions: 1 };
        let adv = refiner.advance(report, &inst, &mut engine).unwrap();
        assert_eq!(adv.resolved, vec![0, 0]);
        assert_eq!(adv.still_pending, total - 1);
        assert!(!refiner.pending()[0]);
        assert!(!refiner.exhausted());

        refiner.advance(RoundReport::default(), &inst, &mut engine).unwrap();
        refiner.advance(RoundReport::default(), &inst, &mut engine).unwrap();
        assert!(refiner.exhausted());
    }

    #[test]
    fn rejects_mismatched_order() {
        let inst = small_instance();
        let mut engine = ConvolutionEngine::default();
        let pending = BitVector::repeat(false, inst.full_len());
        let err = PeelingRefiner::new(&inst, Order::identity(4), pending, 1, 1, &mut engine).unwrap_err();
        assert_eq!(err, ShapeError::LengthMismatch { name: "order", got: 4, expected: 5 });
    }
}
