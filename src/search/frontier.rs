use crate::bitset::BitSet;
use crate::ir::*;
use crate::pack::{OpRef, PackRef};
use crate::packer::BlockState;
use crate::target::{ElemOp, ShuffleKind};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// A partial packing decision state: which instructions are still
/// undecided, which of them already feed a scalar consumer, and which
/// operand vectors committed packs are still waiting for.
///
/// Frontiers are plain data; every query and transition takes the block
/// state explicitly. Transitions return the incremental cost of the step,
/// and the copy-on-write wrappers return a successor without touching the
/// source.
#[derive(Clone)]
pub struct Frontier {
    /// One past the highest program position still undecided.
    cursor: usize,
    free: BitSet,
    unresolved_scalars: BitSet,
    usable: BitSet,
    /// Sorted by intern id; deduplicated.
    unresolved_packs: Vec<OpRef>,
    /// Packs committed so far. Not part of equality: it is history, not
    /// what remains to be decided.
    committed: Vec<PackRef>,
}

impl Frontier {
    pub fn start(state: &BlockState) -> Self {
        let block = state.block;
        let free = state.live.clone();

        let mut unresolved_scalars = BitSet::new(block.num_values());
        for &inst in block.insts() {
            if free.test(inst) && block.is_live_out(inst) {
                unresolved_scalars.set(inst);
            }
        }

        let mut frontier = Self {
            cursor: block.insts().len(),
            free,
            unresolved_scalars,
            usable: BitSet::new(block.num_values()),
            unresolved_packs: Vec::new(),
            committed: Vec::new(),
        };
        for &inst in block.insts() {
            frontier.update_usable(state, inst);
        }
        frontier.advance_cursor(state);
        frontier
    }

    pub fn free(&self) -> &BitSet {
        &self.free
    }

    pub fn usable(&self) -> &BitSet {
        &self.usable
    }

    pub fn unresolved_scalars(&self) -> &BitSet {
        &self.unresolved_scalars
    }

    pub fn unresolved_packs(&self) -> &[OpRef] {
        &self.unresolved_packs
    }

    pub fn committed(&self) -> &[PackRef] {
        &self.committed
    }

    /// Whether a pack may be committed here: every element is still
    /// undecided and has no undecided user.
    pub fn is_committable(&self, pack: &PackRef) -> bool {
        pack.elements().is_subset_of(&self.free) && pack.elements().is_subset_of(&self.usable)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Nothing left that must be produced: every store is decided, no
    /// frozen consumer is waiting on a scalar, no committed pack is
    /// waiting on an operand vector. Undecided instructions that remain
    /// are dead weight nobody reads.
    pub fn is_terminal(&self, state: &BlockState) -> bool {
        self.unresolved_scalars.is_empty()
            && self.unresolved_packs.is_empty()
            && !self.free.any_common(&state.stores)
    }

    /// Usable instructions from the cursor downward.
    pub fn usable_insts<'s>(&'s self, state: &'s BlockState) -> impl Iterator<Item = ValueId> + 's {
        state.block.insts()[..self.cursor]
            .iter()
            .rev()
            .copied()
            .filter(move |&inst| self.usable.test(inst))
    }

    pub fn next_usable(&self, state: &BlockState) -> Option<ValueId> {
        self.usable_insts(state).next()
    }

    fn update_usable(&mut self, state: &BlockState, inst: ValueId) {
        if !self.free.test(inst) {
            return;
        }
        // Phis are always usable: their in-block uses arrive over the
        // back edge and do not order the backward walk.
        if state.phis.test(inst)
            || state.users[inst].iter().all(|&u| !self.free.test(u))
        {
            self.usable.set(inst);
        }
    }

    fn advance_cursor(&mut self, state: &BlockState) {
        while self.cursor > 0 && !self.free.test(state.block.insts()[self.cursor - 1]) {
            self.cursor -= 1;
        }
    }

    fn freeze(&mut self, inst: ValueId) {
        self.free.clear(inst);
        self.unresolved_scalars.clear(inst);
        self.usable.clear(inst);
    }

    /// Scalarize one usable instruction.
    pub fn advance_inplace_inst(&mut self, state: &BlockState, inst: ValueId) -> f32 {
        debug_assert!(self.free.test(inst), "instruction already decided");
        debug_assert!(self.usable.test(inst), "instruction has undecided users");
        let cm = state.cost;
        let mut cost = state.scalar_cost(inst);

        self.freeze(inst);
        for op in state.block.operands(inst) {
            if state.block.is_inst(op) && self.free.test(op) {
                // The operand now has a scalar consumer.
                self.unresolved_scalars.set(op);
                self.update_usable(state, op);
            }
        }
        self.advance_cursor(state);

        let packs = std::mem::take(&mut self.unresolved_packs);
        let mut remaining = Vec::with_capacity(packs.len());
        for op_pack in packs {
            if !op_pack.contains(inst) {
                remaining.push(op_pack);
                continue;
            }
            if op_pack.splat_of() == Some(inst) {
                cost += cm.shuffle_cost(ShuffleKind::Broadcast, op_pack.elem_ty(), op_pack.len());
                continue;
            }
            for (lane_idx, lane) in op_pack.lanes().iter().enumerate() {
                if *lane == Some(inst) {
                    cost += cm.elem_cost(ElemOp::Insert, op_pack.elem_ty(), op_pack.len(), lane_idx);
                }
            }
            if op_pack.has_lane_in(&self.free) {
                remaining.push(op_pack);
            }
        }
        self.unresolved_packs = remaining;
        cost
    }

    /// Commit a vector pack over still-free instructions.
    pub fn advance_inplace_pack(&mut self, state: &BlockState, pack: &PackRef) -> f32 {
        debug_assert!(
            pack.elements().is_subset_of(&self.free),
            "pack covers decided instructions"
        );
        let cm = state.cost;
        let mut cost = pack.producing_cost();

        // Elements a frozen scalar consumer reads get extracted.
        for e in pack.elements().iter() {
            if self.unresolved_scalars.test(e) {
                let lane = pack.lane_of(e).expect("element without a lane");
                cost += cm.elem_cost(ElemOp::Extract, pack.elem_ty(), pack.num_lanes(), lane);
            }
        }

        for &r in pack.replaced_insts() {
            self.freeze(r);
        }
        for &r in pack.replaced_insts() {
            for op in state.block.operands(r) {
                if state.block.is_inst(op) && self.free.test(op) {
                    self.update_usable(state, op);
                }
            }
        }
        self.advance_cursor(state);

        // Settle waiting operand packs this pack produces lanes of.
        let packs = std::mem::take(&mut self.unresolved_packs);
        let mut remaining = Vec::with_capacity(packs.len());
        for op_pack in packs {
            if op_pack.values().any(|v| pack.elements().test(v)) {
                cost += gather_cost(state, &op_pack, pack);
            }
            if op_pack.has_lane_in(&self.free) {
                remaining.push(op_pack);
            }
        }
        self.unresolved_packs = remaining;
        self.committed.push(Rc::clone(pack));

        for op_pack in pack.operand_packs() {
            cost += self.admit_operand_pack(state, op_pack);
        }
        cost
    }

    /// Replace a waiting operand pack by shuffled inputs, paying the
    /// shuffle up front.
    pub fn advance_inplace_shuffle(
        &mut self,
        state: &BlockState,
        op_pack: &OpRef,
        inputs: &[OpRef],
    ) -> f32 {
        let cm = state.cost;
        let pos = self
            .unresolved_packs
            .binary_search_by_key(&op_pack.id(), |p| p.id())
            .expect("shuffled pack is not unresolved");
        self.unresolved_packs.remove(pos);
        let mut cost = cm.shuffle_cost(ShuffleKind::Select, op_pack.elem_ty(), op_pack.len());
        for input in inputs {
            cost += self.admit_operand_pack(state, input);
        }
        cost
    }

    // Charge the immediately payable lanes of a fresh operand pack and
    // queue it if any lane is still undecided. Lanes already produced by
    // a committed pack pay that pack's gather cost; lanes frozen scalar
    // pay their insert (or one broadcast for a frozen splat); undecided
    // lanes are settled by later transitions.
    fn admit_operand_pack(&mut self, state: &BlockState, op_pack: &OpRef) -> f32 {
        let cm = state.cost;
        let mut cost = 0.0;

        for committed in &self.committed {
            if op_pack.values().any(|v| committed.elements().test(v)) {
                cost += gather_cost(state, op_pack, committed);
            }
        }

        // A frozen in-block splat broadcasts instead of inserting lane
        // by lane.
        if let Some(v) = op_pack.splat_of() {
            if state.block.is_inst(v)
                && !self.free.test(v)
                && !self.committed.iter().any(|c| c.elements().test(v))
            {
                return cost
                    + cm.shuffle_cost(ShuffleKind::Broadcast, op_pack.elem_ty(), op_pack.len());
            }
        }

        let mut has_free = false;
        for (lane_idx, lane) in op_pack.lanes().iter().enumerate() {
            let v = match lane {
                Some(v) => *v,
                None => continue,
            };
            match &state.block.value(v).kind {
                ValueKind::Const(_) => {}
                ValueKind::Arg => {
                    cost += cm.elem_cost(ElemOp::Insert, op_pack.elem_ty(), op_pack.len(), lane_idx);
                }
                _ => {
                    if self.free.test(v) {
                        has_free = true;
                    } else if !self.committed.iter().any(|c| c.elements().test(v)) {
                        cost +=
                            cm.elem_cost(ElemOp::Insert, op_pack.elem_ty(), op_pack.len(), lane_idx);
                    }
                }
            }
        }
        if has_free {
            if let Err(i) = self
                .unresolved_packs
                .binary_search_by_key(&op_pack.id(), |p| p.id())
            {
                self.unresolved_packs.insert(i, Rc::clone(op_pack));
            }
        }
        cost
    }

    pub fn advance_inst(&self, state: &BlockState, inst: ValueId) -> (Frontier, f32) {
        let mut next = self.clone();
        let cost = next.advance_inplace_inst(state, inst);
        (next, cost)
    }

    pub fn advance_pack(&self, state: &BlockState, pack: &PackRef) -> (Frontier, f32) {
        let mut next = self.clone();
        let cost = next.advance_inplace_pack(state, pack);
        (next, cost)
    }

    pub fn advance_shuffle(
        &self,
        state: &BlockState,
        op_pack: &OpRef,
        inputs: &[OpRef],
    ) -> (Frontier, f32) {
        let mut next = self.clone();
        let cost = next.advance_inplace_shuffle(state, op_pack, inputs);
        (next, cost)
    }
}

/// Cost of feeding a waiting operand vector from a freshly committed
/// pack: free on exact lane order, a single-source permute when only the
/// order differs, a fixed blend otherwise.
pub fn gather_cost(state: &BlockState, op_pack: &OpRef, pack: &PackRef) -> f32 {
    let cm = state.cost;
    if pack.produces_exactly(op_pack.lanes()) {
        0.0
    } else if pack.produces_permutation_of(op_pack.lanes()) {
        cm.shuffle_cost(ShuffleKind::PermuteSingleSrc, op_pack.elem_ty(), op_pack.len())
    } else {
        cm.shuffle_cost(ShuffleKind::Select, op_pack.elem_ty(), op_pack.len())
    }
}

// Equality and hashing deliberately ignore `usable` (derived from `free`)
// and `committed` (history): the DP solver memoizes on what remains to be
// decided.
impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cursor == other.cursor
            && self.free == other.free
            && self.unresolved_scalars == other.unresolved_scalars
            && self.unresolved_packs.len() == other.unresolved_packs.len()
            && self
                .unresolved_packs
                .iter()
                .zip(&other.unresolved_packs)
                .all(|(a, b)| a.id() == b.id())
    }
}

impl Eq for Frontier {}

impl Hash for Frontier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cursor.hash(state);
        self.free.hash(state);
        self.unresolved_scalars.hash(state);
        for op in &self.unresolved_packs {
            op.id().hash(state);
        }
    }
}
