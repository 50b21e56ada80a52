use crate::ir::*;
use crate::pack::{OpRef, PackRef};
use crate::packer::BlockState;
use crate::target::{ElemOp, ShuffleKind};
use rustc_hash::FxHashMap;
use std::rc::Rc;

const COST_EPS: f32 = 1e-3;

struct OperandEntry {
    op: OpRef,
    refs: usize,
    cost: f32,
}

/// A committed set of packs for one block, with incrementally maintained
/// cost. The cost follows the same extract/insert/gather rules the
/// frontier transitions charge, so a terminal frontier's cumulative cost
/// and the equivalent plan agree.
pub struct Plan {
    packs: Vec<PackRef>,
    producers: FxHashMap<ValueId, PackRef>,
    operands: FxHashMap<u32, OperandEntry>,
    extracts: FxHashMap<ValueId, f32>,
    cost: f32,
}

impl Clone for Plan {
    fn clone(&self) -> Self {
        Self {
            packs: self.packs.clone(),
            producers: self.producers.clone(),
            operands: self
                .operands
                .iter()
                .map(|(&id, e)| {
                    (
                        id,
                        OperandEntry {
                            op: Rc::clone(&e.op),
                            refs: e.refs,
                            cost: e.cost,
                        },
                    )
                })
                .collect(),
            extracts: self.extracts.clone(),
            cost: self.cost,
        }
    }
}

impl Plan {
    /// The empty plan: everything live runs scalar.
    pub fn new(state: &BlockState) -> Self {
        let cost = state
            .block
            .insts()
            .iter()
            .filter(|&&i| state.live.test(i))
            .map(|&i| state.scalar_cost(i))
            .sum();
        Self {
            packs: Vec::new(),
            producers: FxHashMap::default(),
            operands: FxHashMap::default(),
            extracts: FxHashMap::default(),
            cost,
        }
    }

    pub fn cost(&self) -> f32 {
        self.cost
    }

    pub fn packs(&self) -> &[PackRef] {
        &self.packs
    }

    pub fn producer(&self, v: ValueId) -> Option<&PackRef> {
        self.producers.get(&v)
    }

    pub fn operand_packs(&self) -> impl Iterator<Item = &OpRef> {
        self.operands.values().map(|e| &e.op)
    }

    pub fn is_packed(&self, v: ValueId) -> bool {
        self.producers.contains_key(&v)
    }

    /// Cost of materializing one operand vector under the current
    /// producer assignment. Mirrors the frontier's charging: one gather
    /// per distinct producing pack, one insert per scalar-produced lane,
    /// a broadcast for an unpacked in-block splat.
    fn materialize(&self, state: &BlockState, op: &OpRef) -> f32 {
        let cm = state.cost;
        let mut cost = 0.0;

        let mut seen_producers: Vec<u32> = Vec::new();
        let mut scalar_lanes: Vec<(usize, ValueId)> = Vec::new();
        let mut insert_lanes: Vec<usize> = Vec::new();

        for (lane_idx, lane) in op.lanes().iter().enumerate() {
            let v = match lane {
                Some(v) => *v,
                None => continue,
            };
            match &state.block.value(v).kind {
                ValueKind::Const(_) => {}
                ValueKind::Arg => insert_lanes.push(lane_idx),
                _ => {
                    if let Some(pack) = self.producers.get(&v) {
                        if !seen_producers.contains(&pack.id()) {
                            seen_producers.push(pack.id());
                            cost += crate::search::frontier::gather_cost(state, op, pack);
                        }
                    } else {
                        scalar_lanes.push((lane_idx, v));
                    }
                }
            }
        }

        for lane_idx in insert_lanes {
            cost += cm.elem_cost(ElemOp::Insert, op.elem_ty(), op.len(), lane_idx);
        }
        if !scalar_lanes.is_empty() {
            let splat = op
                .splat_of()
                .filter(|&v| state.block.is_inst(v) && !self.is_packed(v));
            if splat.is_some() {
                cost += cm.shuffle_cost(ShuffleKind::Broadcast, op.elem_ty(), op.len());
            } else {
                for (lane_idx, _) in scalar_lanes {
                    cost += cm.elem_cost(ElemOp::Insert, op.elem_ty(), op.len(), lane_idx);
                }
            }
        }
        cost
    }

    /// Extract charge for one packed element: paid once if any live
    /// scalar consumer (or an out-of-block user) reads it.
    fn extract_for(&self, state: &BlockState, pack: &PackRef, e: ValueId) -> f32 {
        let needed = state.block.is_live_out(e)
            || state.users[e]
                .iter()
                .any(|&u| state.live.test(u) && !self.is_packed(u));
        if !needed {
            return 0.0;
        }
        let lane = pack.lane_of(e).expect("element without a lane");
        state
            .cost
            .elem_cost(ElemOp::Extract, pack.elem_ty(), pack.num_lanes(), lane)
    }

    fn refresh_operands_touching(&mut self, state: &BlockState, pack: &PackRef) {
        let ids: Vec<u32> = self
            .operands
            .iter()
            .filter(|(_, e)| e.op.values().any(|v| pack.elements().test(v)))
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            let op = Rc::clone(&self.operands[&id].op);
            let fresh = self.materialize(state, &op);
            let entry = self.operands.get_mut(&id).unwrap();
            self.cost += fresh - entry.cost;
            entry.cost = fresh;
        }
    }

    fn refresh_extract(&mut self, state: &BlockState, v: ValueId) {
        let pack = match self.producers.get(&v) {
            Some(p) => Rc::clone(p),
            None => return,
        };
        let fresh = self.extract_for(state, &pack, v);
        let old = self.extracts.remove(&v).unwrap_or(0.0);
        self.cost += fresh - old;
        if fresh > 0.0 {
            self.extracts.insert(v, fresh);
        }
    }

    /// Commit a pack. Fails (returns false, plan unchanged) if any
    /// element already has a producer.
    pub fn add(&mut self, state: &BlockState, pack: &PackRef) -> bool {
        if pack.elements().iter().any(|e| self.producers.contains_key(&e)) {
            return false;
        }
        for e in pack.elements().iter() {
            self.cost -= state.scalar_cost(e);
            self.producers.insert(e, Rc::clone(pack));
        }
        self.cost += pack.producing_cost();
        self.packs.push(Rc::clone(pack));

        for op in pack.operand_packs() {
            match self.operands.get_mut(&op.id()) {
                Some(entry) => entry.refs += 1,
                None => {
                    let cost = self.materialize(state, op);
                    self.cost += cost;
                    self.operands.insert(
                        op.id(),
                        OperandEntry {
                            op: Rc::clone(op),
                            refs: 1,
                            cost,
                        },
                    );
                }
            }
        }

        // Other packs' waiting operands may now be produced by this one.
        self.refresh_operands_touching(state, pack);

        for e in pack.elements().iter() {
            let x = self.extract_for(state, pack, e);
            if x > 0.0 {
                self.extracts.insert(e, x);
                self.cost += x;
            }
        }
        // Elements of other packs may have lost their last scalar reader.
        for &r in pack.replaced_insts() {
            for opnd in state.block.operands(r) {
                if state.block.is_inst(opnd) && opnd != r {
                    self.refresh_extract(state, opnd);
                }
            }
        }
        debug_assert!(self.verify_cost(state), "plan cost drifted on add");
        true
    }

    /// Revert a committed pack.
    pub fn remove(&mut self, state: &BlockState, pack: &PackRef) {
        let pos = self
            .packs
            .iter()
            .position(|p| p.id() == pack.id())
            .expect("removing a pack that was never added");
        self.packs.swap_remove(pos);

        self.cost -= pack.producing_cost();
        for e in pack.elements().iter() {
            self.cost += state.scalar_cost(e);
            self.producers.remove(&e);
            if let Some(x) = self.extracts.remove(&e) {
                self.cost -= x;
            }
        }

        for op in pack.operand_packs() {
            let entry = self.operands.get_mut(&op.id()).expect("untracked operand");
            entry.refs -= 1;
            if entry.refs == 0 {
                self.cost -= entry.cost;
                self.operands.remove(&op.id());
            }
        }

        self.refresh_operands_touching(state, pack);
        for &r in pack.replaced_insts() {
            for opnd in state.block.operands(r) {
                if state.block.is_inst(opnd) && opnd != r {
                    self.refresh_extract(state, opnd);
                }
            }
        }
        debug_assert!(self.verify_cost(state), "plan cost drifted on remove");
    }

    /// Rebuild the cost from scratch and compare against the maintained
    /// one.
    pub fn verify_cost(&self, state: &BlockState) -> bool {
        let fresh = self.scratch_cost(state);
        (fresh - self.cost).abs() <= COST_EPS * self.cost.abs().max(1.0)
    }

    pub fn scratch_cost(&self, state: &BlockState) -> f32 {
        let mut total = 0.0;
        for &inst in state.block.insts() {
            if state.live.test(inst) && !self.is_packed(inst) {
                total += state.scalar_cost(inst);
            }
        }
        for pack in &self.packs {
            total += pack.producing_cost();
            for e in pack.elements().iter() {
                total += self.extract_for(state, pack, e);
            }
        }
        for entry in self.operands.values() {
            total += self.materialize(state, &entry.op);
        }
        total
    }
}
