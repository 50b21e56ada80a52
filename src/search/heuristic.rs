use crate::ir::*;
use crate::pack::{OpRef, PackRef};
use crate::packer::BlockState;
use crate::search::enumerate::CandidateSet;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;

// Gather-constant folklore: rough per-operation charges the bottom-up
// solver plans with, independent of the target model it ultimately pays.
pub const C_SPLAT: f32 = 1.0;
pub const C_INSERT: f32 = 2.0;
pub const C_PERM: f32 = 0.5;
pub const C_SHUFFLE: f32 = 0.5;
pub const C_EXTRACT: f32 = 1.0;

/// How to produce one operand vector and what it is expected to cost.
/// An empty pack list means "build it with scalar inserts".
#[derive(Clone, Debug)]
pub struct Solution {
    pub cost: f32,
    pub packs: SmallVec<[PackRef; 4]>,
}

impl Solution {
    fn scalar(cost: f32) -> Self {
        Self {
            cost,
            packs: SmallVec::new(),
        }
    }

    fn with_pack(cost: f32, pack: PackRef) -> Self {
        Self {
            cost,
            packs: SmallVec::from_iter([pack]),
        }
    }

    fn update(&mut self, other: Solution) {
        if other.cost < self.cost {
            *self = other;
        }
    }
}

/// Memoized bottom-up estimate of the cost of producing operand vectors
/// and scalar values. The workhorse of the non-MCTS improver.
pub struct Heuristic<'s, 'a> {
    state: &'s BlockState<'a>,
    candidates: Option<&'s CandidateSet>,
    solutions: RefCell<FxHashMap<u32, Solution>>,
    scalar_costs: RefCell<FxHashMap<ValueId, f32>>,
    // Cycle guards: operand packs and values currently being solved.
    open_ops: RefCell<FxHashSet<u32>>,
    open_values: RefCell<FxHashSet<ValueId>>,
}

impl<'s, 'a> Heuristic<'s, 'a> {
    pub fn new(state: &'s BlockState<'a>, candidates: Option<&'s CandidateSet>) -> Self {
        Self {
            state,
            candidates,
            solutions: RefCell::new(FxHashMap::default()),
            scalar_costs: RefCell::new(FxHashMap::default()),
            open_ops: RefCell::new(FxHashSet::default()),
            open_values: RefCell::new(FxHashSet::default()),
        }
    }

    /// Minimum expected cost of materializing `op`, with the packs that
    /// achieve it.
    pub fn solve(&self, op: &OpRef) -> Solution {
        if let Some(sol) = self.solutions.borrow().get(&op.id()) {
            return sol.clone();
        }
        if !self.open_ops.borrow_mut().insert(op.id()) {
            // Solving this pack already depends on itself; this path is
            // a dead end, not a solution.
            return Solution::scalar(f32::INFINITY);
        }
        let sol = self.solve_uncached(op);
        self.open_ops.borrow_mut().remove(&op.id());
        self.solutions.borrow_mut().insert(op.id(), sol.clone());
        sol
    }

    fn solve_uncached(&self, op: &OpRef) -> Solution {
        let block = self.state.block;

        // Baseline: build the vector by inserting each distinct non-
        // constant value.
        let mut inserted: SmallVec<[ValueId; 8]> = SmallVec::new();
        let mut baseline = 0.0;
        for v in op.values() {
            if matches!(block.value(v).kind, ValueKind::Const(_)) {
                continue;
            }
            if !inserted.contains(&v) {
                inserted.push(v);
                baseline += self.value_cost(v) + C_INSERT;
            }
        }
        let mut sol = Solution::scalar(baseline);
        if baseline == 0.0 {
            return sol;
        }

        if let Some(v) = op.splat_of() {
            let broadcast = self.value_cost(v) + C_SPLAT;
            if broadcast < sol.cost {
                sol = Solution::scalar(broadcast);
            }
        }

        let deduped = self.state.vpctx.dedup(op);
        let extra = if deduped.id() != op.id() { C_SHUFFLE } else { 0.0 };
        let info = self.state.producer_info(&deduped);
        for vp in &info.producers {
            sol.update(Solution::with_pack(self.pack_cost(vp) + extra, Rc::clone(vp)));
        }

        if let Some(candidates) = self.candidates {
            let mut visited: FxHashSet<u32> = FxHashSet::default();
            for inst in info.elements.iter() {
                for vp in candidates.packs_for(inst) {
                    if !visited.insert(vp.id()) || !vp.is_load() {
                        continue;
                    }
                    if vp.produces_permutation_of(deduped.lanes()) {
                        sol.update(Solution::with_pack(
                            self.pack_cost(vp) + C_PERM + extra,
                            Rc::clone(vp),
                        ));
                    } else {
                        let mut intersection = info.elements.clone();
                        intersection.intersect_with(vp.elements());
                        if intersection.is_empty() {
                            continue;
                        }
                        // The smaller the covered share, the more the
                        // pack's cost is pro-rated up.
                        let discount =
                            info.elements.count() as f32 / intersection.count() as f32;
                        sol.update(Solution::with_pack(
                            self.pack_cost(vp) * discount + C_SHUFFLE + extra,
                            Rc::clone(vp),
                        ));
                    }
                }
            }
        }
        sol
    }

    /// Expected cost of a pack: its own vector op plus producing every
    /// operand vector it consumes.
    pub fn pack_cost(&self, vp: &PackRef) -> f32 {
        let mut cost = vp.producing_cost();
        for op in vp.operand_packs() {
            cost += self.solve(op).cost;
        }
        cost
    }

    /// Scalar cost of a value, recursing through its in-block operands.
    /// Constants and foreign values are free.
    pub fn value_cost(&self, v: ValueId) -> f32 {
        let block = self.state.block;
        if !block.is_inst(v) {
            return 0.0;
        }
        if let Some(&c) = self.scalar_costs.borrow().get(&v) {
            return c;
        }
        if !self.open_values.borrow_mut().insert(v) {
            // Back-edge cycle through a phi; the phi itself is free.
            return 0.0;
        }
        let mut cost = self.state.scalar_cost(v);
        for op in block.operands(v) {
            cost += self.value_cost(op);
        }
        self.open_values.borrow_mut().remove(&v);
        self.scalar_costs.borrow_mut().insert(v, cost);
        cost
    }
}
