use crate::analyze::DependenceAnalysis;
use crate::bitset::BitSet;
use crate::catalog::{InstBinding, LaneBinding, Match};
use crate::ir::*;
use crate::pack::operand::{Lane, OpRef, OperandPack};
use crate::pack::vpack::{PackKind, PackRef, VectorPack};
use crate::target::CostModel;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

// Interning key for packs: variant tag, lane layout, producer identity.
#[derive(PartialEq, Eq, Hash)]
struct PackKey {
    tag: u8,
    lanes: Vec<Lane>,
    producer: usize,
}

#[derive(Default)]
struct Interner {
    ops: FxHashMap<(Vec<Lane>, Type), OpRef>,
    packs: FxHashMap<PackKey, PackRef>,
}

/// Canonicalizing factory for packs and operand packs of one block.
/// Identical lane sequences share a single interned `Rc`; intern ids give
/// the sort order the frontier relies on. Single-threaded by contract
/// (hence the `RefCell`); the interned packs themselves are shared
/// read-only.
pub struct VectorPackContext<'a> {
    block: &'a Block,
    interner: RefCell<Interner>,
}

impl<'a> VectorPackContext<'a> {
    pub fn new(block: &'a Block) -> Self {
        Self {
            block,
            interner: RefCell::new(Interner::default()),
        }
    }

    pub fn block(&self) -> &'a Block {
        self.block
    }

    /// Width of every bitset in this block.
    pub fn num_values(&self) -> usize {
        self.block.num_values()
    }

    /// Intern an operand pack, inferring the element type from the first
    /// non-null lane.
    pub fn get_canonical_operand_pack(&self, lanes: Vec<Lane>) -> OpRef {
        let ty = lanes
            .iter()
            .flatten()
            .map(|&v| self.block.value(v).ty)
            .next()
            .expect("operand pack can't be all don't-care without a type");
        self.operand_pack_with_type(lanes, ty)
    }

    /// Intern an operand pack with an explicit element type (needed when
    /// every lane is don't-care).
    pub fn operand_pack_with_type(&self, lanes: Vec<Lane>, elem_ty: Type) -> OpRef {
        let mut interner = self.interner.borrow_mut();
        if let Some(op) = interner.ops.get(&(lanes.clone(), elem_ty)) {
            return Rc::clone(op);
        }
        let id = interner.ops.len() as u32;
        let op = Rc::new(OperandPack::new(id, lanes.clone(), elem_ty));
        interner.ops.insert((lanes, elem_ty), Rc::clone(&op));
        op
    }

    /// Drop don't-care lanes and repeated values, keeping first
    /// occurrences in order.
    pub fn dedup(&self, op: &OpRef) -> OpRef {
        let mut seen = Vec::new();
        let mut lanes = Vec::new();
        for lane in op.lanes() {
            if let Some(v) = lane {
                if !seen.contains(v) {
                    seen.push(*v);
                    lanes.push(Some(*v));
                }
            }
        }
        if lanes.len() == op.len() {
            return Rc::clone(op);
        }
        self.operand_pack_with_type(lanes, op.elem_ty())
    }

    pub fn even(&self, op: &OpRef) -> OpRef {
        let lanes: Vec<Lane> = op.lanes().iter().step_by(2).copied().collect();
        self.operand_pack_with_type(lanes, op.elem_ty())
    }

    pub fn odd(&self, op: &OpRef) -> OpRef {
        let lanes: Vec<Lane> = op.lanes().iter().skip(1).step_by(2).copied().collect();
        self.operand_pack_with_type(lanes, op.elem_ty())
    }

    fn intern_pack(
        &self,
        key: PackKey,
        build: impl FnOnce(u32) -> Option<VectorPack>,
    ) -> Option<PackRef> {
        if let Some(vp) = self.interner.borrow().packs.get(&key) {
            return Some(Rc::clone(vp));
        }
        let id = self.interner.borrow().packs.len() as u32;
        let vp = Rc::new(build(id)?);
        self.interner.borrow_mut().packs.insert(key, Rc::clone(&vp));
        Some(vp)
    }

    // Replaced instructions freeze from the bottom of the block upward.
    fn sort_replaced(&self, mut replaced: Vec<ValueId>) -> Vec<ValueId> {
        replaced.sort_unstable();
        replaced.dedup();
        replaced.sort_by_key(|&v| std::cmp::Reverse(self.block.position(v)));
        replaced
    }

    pub fn create_load_pack(
        &self,
        loads: &[Lane],
        elements: &BitSet,
        depended: &BitSet,
        cm: &dyn CostModel,
    ) -> Option<PackRef> {
        let key = PackKey {
            tag: 0,
            lanes: loads.to_vec(),
            producer: 0,
        };
        self.intern_pack(key, |id| {
            let first = loads.iter().flatten().next()?;
            let elem_ty = self.block.value(*first).ty;
            let cost = cm.mem_op_cost(MemKind::Load, elem_ty, loads.len());
            if !cost.is_finite() {
                return None;
            }
            let replaced = self.sort_replaced(loads.iter().flatten().copied().collect());
            Some(VectorPack::new(
                id,
                PackKind::Load(loads.to_vec()),
                elem_ty,
                elements.clone(),
                depended.clone(),
                cost,
                // The pointer stays scalar: loads need no packed operand.
                Vec::new(),
                loads.to_vec(),
                replaced,
            ))
        })
    }

    pub fn create_store_pack(
        &self,
        stores: &[Lane],
        elements: &BitSet,
        depended: &BitSet,
        cm: &dyn CostModel,
    ) -> Option<PackRef> {
        let key = PackKey {
            tag: 1,
            lanes: stores.to_vec(),
            producer: 0,
        };
        self.intern_pack(key, |id| {
            let first = stores.iter().flatten().next()?;
            let elem_ty = self.block.value(*first).ty;
            let cost = cm.mem_op_cost(MemKind::Store, elem_ty, stores.len());
            if !cost.is_finite() {
                return None;
            }
            // Only the stored values need packing first.
            let value_lanes: Vec<Lane> = stores
                .iter()
                .map(|lane| {
                    lane.map(|s| match &self.block.value(s).kind {
                        ValueKind::Store { value, .. } => *value,
                        _ => unreachable!("store pack over a non-store"),
                    })
                })
                .collect();
            let operand = self.operand_pack_with_type(value_lanes, elem_ty);
            let replaced = self.sort_replaced(stores.iter().flatten().copied().collect());
            Some(VectorPack::new(
                id,
                PackKind::Store(stores.to_vec()),
                elem_ty,
                elements.clone(),
                depended.clone(),
                cost,
                vec![operand],
                stores.to_vec(),
                replaced,
            ))
        })
    }

    pub fn create_phi_pack(
        &self,
        phis: &[ValueId],
        lda: &DependenceAnalysis,
        _cm: &dyn CostModel,
    ) -> Option<PackRef> {
        let lanes: Vec<Lane> = phis.iter().map(|&p| Some(p)).collect();
        let key = PackKey {
            tag: 2,
            lanes: lanes.clone(),
            producer: 0,
        };
        self.intern_pack(key, |id| {
            let elem_ty = self.block.value(phis[0]).ty;
            assert!(
                phis.iter().all(|&p| self.block.value(p).ty == elem_ty),
                "phi pack over mixed types"
            );
            let mut elements = BitSet::new(self.num_values());
            let mut depended = BitSet::new(self.num_values());
            for &p in phis {
                elements.set(p);
                depended.union_with(lda.depended(p));
            }
            // One operand pack per incoming edge.
            let mut operand_packs = Vec::with_capacity(self.block.num_edges());
            for edge in 0..self.block.num_edges() {
                let lanes: Vec<Lane> = phis
                    .iter()
                    .map(|&p| match &self.block.value(p).kind {
                        ValueKind::Phi { incomings } => Some(incomings[edge]),
                        _ => unreachable!("phi pack over a non-phi"),
                    })
                    .collect();
                operand_packs.push(self.operand_pack_with_type(lanes, elem_ty));
            }
            let replaced = self.sort_replaced(phis.to_vec());
            Some(VectorPack::new(
                id,
                PackKind::Phi(phis.to_vec()),
                elem_ty,
                elements,
                depended,
                // Vector phis are as free as scalar ones.
                0.0,
                operand_packs,
                lanes,
                replaced,
            ))
        })
    }

    pub fn create_general_pack(
        &self,
        binding: &Rc<dyn InstBinding>,
        matches: Vec<Option<Match>>,
        elements: &BitSet,
        depended: &BitSet,
        cm: &dyn CostModel,
    ) -> Option<PackRef> {
        assert_eq!(
            matches.len(),
            binding.num_lanes(),
            "one match slot per lane"
        );
        let ordered: Vec<Lane> = matches
            .iter()
            .map(|m| m.as_ref().map(|m| m.output))
            .collect();
        let key = PackKey {
            tag: 3,
            lanes: ordered.clone(),
            producer: Rc::as_ptr(binding) as *const () as usize,
        };
        self.intern_pack(key, |id| {
            let cost = binding.cost(cm);
            if !cost.is_finite() {
                return None;
            }
            let lb = LaneBinding::new(binding.as_ref());
            let mut operand_packs = Vec::with_capacity(lb.num_inputs());
            for input_idx in 0..lb.num_inputs() {
                let lanes = lb.apply(binding.as_ref(), input_idx, &matches);
                let fallback = binding.lane_ops()[0].op.elem_type();
                let op = if lanes.iter().all(|l| l.is_none()) {
                    self.operand_pack_with_type(lanes, fallback)
                } else {
                    self.get_canonical_operand_pack(lanes)
                };
                operand_packs.push(op);
            }
            let mut replaced = Vec::new();
            for m in matches.iter().flatten() {
                replaced.extend(m.intermediate_insts());
            }
            let replaced = self.sort_replaced(replaced);
            let elem_ty = binding.lane_ops()[0].op.elem_type();
            Some(VectorPack::new(
                id,
                PackKind::General {
                    binding: Rc::clone(binding),
                    matches,
                },
                elem_ty,
                elements.clone(),
                depended.clone(),
                cost,
                operand_packs,
                ordered,
                replaced,
            ))
        })
    }
}
