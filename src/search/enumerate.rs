use crate::bitset::BitSet;
use crate::config::{PackerConfig, LANE_COUNTS};
use crate::ir::*;
use crate::pack::{Lane, OpRef, PackRef};
use crate::packer::BlockState;
use log::debug;
use rustc_hash::FxHashSet;
use std::rc::Rc;

/// Seed packs discovered up front, indexed by the instructions they
/// cover. The heuristic consults the index when costing operand packs.
pub struct CandidateSet {
    pub packs: Vec<PackRef>,
    pub inst_to_packs: Vec<Vec<PackRef>>,
}

impl CandidateSet {
    pub fn packs_for(&self, inst: ValueId) -> &[PackRef] {
        &self.inst_to_packs[inst]
    }
}

/// Depth-first enumeration of independent chains of length `vl` in the
/// access DAG, starting from `access`.
pub fn seed_mem_packs(
    state: &BlockState,
    access: ValueId,
    kind: MemKind,
    vl: usize,
) -> Vec<PackRef> {
    let dag = match kind {
        MemKind::Load => &state.load_dag,
        MemKind::Store => &state.store_dag,
    };
    let mut seeds = Vec::new();

    let mut chain = vec![access];
    let mut elements = BitSet::new(state.vpctx.num_values());
    let mut depended = BitSet::new(state.vpctx.num_values());
    elements.set(access);
    depended.union_with(state.lda.depended(access));

    enumerate_chains(
        state, dag, kind, vl, &mut chain, &mut elements, &mut depended, &mut seeds,
    );
    seeds
}

#[allow(clippy::too_many_arguments)]
fn enumerate_chains(
    state: &BlockState,
    dag: &crate::analyze::AccessDag,
    kind: MemKind,
    vl: usize,
    chain: &mut Vec<ValueId>,
    elements: &mut BitSet,
    depended: &mut BitSet,
    seeds: &mut Vec<PackRef>,
) {
    if chain.len() == vl {
        let lanes: Vec<Lane> = chain.iter().map(|&a| Some(a)).collect();
        let pack = match kind {
            MemKind::Load => state.vpctx.create_load_pack(&lanes, elements, depended, state.cost),
            MemKind::Store => {
                state
                    .vpctx
                    .create_store_pack(&lanes, elements, depended, state.cost)
            }
        };
        if let Some(pack) = pack {
            seeds.push(pack);
        }
        return;
    }

    let last = *chain.last().unwrap();
    for &next in dag.successors(last) {
        if !state.lda.compatible(next, elements, depended) {
            continue;
        }
        chain.push(next);
        let saved_dep = depended.clone();
        elements.set(next);
        depended.union_with(state.lda.depended(next));
        enumerate_chains(state, dag, kind, vl, chain, elements, depended, seeds);
        chain.pop();
        elements.clear(next);
        *depended = saved_dep;
    }
}

fn live_mem_insts(state: &BlockState, kind: MemKind) -> Vec<ValueId> {
    state
        .block
        .insts()
        .iter()
        .copied()
        .filter(|&i| state.live.test(i))
        .filter(|&i| matches!(state.block.mem_access(i), Some((k, _)) if k == kind))
        .collect()
}

/// All load seed packs of every lane count, plus the per-instruction
/// index. This is the candidate set the heuristic discounts against.
pub fn enumerate_load_seeds(state: &BlockState, config: &PackerConfig) -> CandidateSet {
    let mut packs = Vec::new();
    'outer: for load in live_mem_insts(state, MemKind::Load) {
        for vl in LANE_COUNTS {
            if vl > config.max_num_lanes {
                break;
            }
            for pack in seed_mem_packs(state, load, MemKind::Load, vl) {
                if packs.len() >= config.enum_cap {
                    debug!(
                        "block {}: load seed enumeration capped at {}",
                        state.block.name, config.enum_cap
                    );
                    break 'outer;
                }
                packs.push(pack);
            }
        }
    }

    let mut inst_to_packs: Vec<Vec<PackRef>> = vec![Vec::new(); state.vpctx.num_values()];
    for pack in &packs {
        for e in pack.elements().iter() {
            inst_to_packs[e].push(Rc::clone(pack));
        }
    }
    CandidateSet {
        packs,
        inst_to_packs,
    }
}

/// Store chains of every lane count: the seeds the bottom-up improver
/// grows plans from.
pub fn store_seeds(state: &BlockState, config: &PackerConfig) -> Vec<PackRef> {
    let mut seeds = Vec::new();
    for store in live_mem_insts(state, MemKind::Store) {
        for vl in LANE_COUNTS {
            if vl > config.max_num_lanes {
                break;
            }
            seeds.extend(seed_mem_packs(state, store, MemKind::Store, vl));
            if seeds.len() >= config.enum_cap {
                debug!(
                    "block {}: store seed enumeration capped at {}",
                    state.block.name, config.enum_cap
                );
                return seeds;
            }
        }
    }
    seeds
}

/// Packs committable at a frontier: producers of its unresolved operand
/// vectors, or fresh store chains over usable stores when nothing is
/// waiting yet.
pub fn frontier_extensions(
    state: &BlockState,
    frontier: &crate::search::frontier::Frontier,
    config: &PackerConfig,
) -> Vec<PackRef> {
    let mut out: Vec<PackRef> = Vec::new();
    for op in frontier.unresolved_packs() {
        let info = state.producer_info(op);
        for vp in &info.producers {
            if frontier.is_committable(vp) && !out.iter().any(|p| p.id() == vp.id()) {
                out.push(Rc::clone(vp));
            }
            if out.len() >= config.enum_cap {
                return out;
            }
        }
    }
    if !out.is_empty() {
        return out;
    }
    for store in live_mem_insts(state, MemKind::Store) {
        if !frontier.usable().test(store) {
            continue;
        }
        for vl in LANE_COUNTS {
            if vl > config.max_num_lanes {
                break;
            }
            for vp in seed_mem_packs(state, store, MemKind::Store, vl) {
                if frontier.is_committable(&vp) && !out.iter().any(|p| p.id() == vp.id()) {
                    out.push(vp);
                }
                if out.len() >= config.enum_cap {
                    return out;
                }
            }
        }
    }
    out
}

/// Which packs can produce a given operand vector.
pub struct ProducerInfo {
    pub feasible: bool,
    pub elements: BitSet,
    pub producers: Vec<PackRef>,
}

impl ProducerInfo {
    fn infeasible(width: usize) -> Self {
        Self {
            feasible: false,
            elements: BitSet::new(width),
            producers: Vec::new(),
        }
    }
}

/// Search backward from an unresolved operand pack for packs producing
/// exactly its lanes: a reconstructed load chain, a phi pack, or one
/// general pack per cross-product of matches under each arity-matching
/// binding.
pub fn extensions_for_operand(state: &BlockState, op: &OpRef) -> ProducerInfo {
    let width = state.vpctx.num_values();
    let block = state.block;

    // Singleton vectors have no vector producer.
    if op.len() < 2 {
        return ProducerInfo::infeasible(width);
    }

    // Every lane must be an in-block instruction, and the lanes must be
    // mutually independent; otherwise nothing can produce this vector.
    let mut elements = BitSet::new(width);
    let mut depended = BitSet::new(width);
    for lane in op.lanes() {
        let v = match lane {
            Some(v) => *v,
            None => return ProducerInfo::infeasible(width),
        };
        if !block.is_inst(v) {
            return ProducerInfo::infeasible(width);
        }
        if !state.lda.compatible(v, &elements, &depended) {
            return ProducerInfo::infeasible(width);
        }
        elements.set(v);
        depended.union_with(state.lda.depended(v));
    }

    let mut producers = Vec::new();

    let all_loads = op.values().all(|v| matches!(block.value(v).kind, ValueKind::Load { .. }));
    if all_loads && !op.is_empty() {
        if let Some(pack) = reconstruct_load_chain(state, op, &depended) {
            producers.push(pack);
        }
        return ProducerInfo {
            feasible: true,
            elements,
            producers,
        };
    }

    let all_phis = op.values().all(|v| block.is_phi(v));
    if all_phis && !op.is_empty() {
        let phis: Vec<ValueId> = op.values().collect();
        let uniform = phis
            .iter()
            .all(|&p| block.value(p).ty == block.value(phis[0]).ty);
        if uniform {
            if let Some(pack) = state.vpctx.create_phi_pack(&phis, &state.lda, state.cost) {
                producers.push(pack);
            }
        }
        return ProducerInfo {
            feasible: true,
            elements,
            producers,
        };
    }

    for binding in &state.bindings {
        if binding.num_lanes() != op.len() {
            continue;
        }
        let mut lane_matches = Vec::with_capacity(op.len());
        let mut feasible = true;
        for (lane_id, lane_op) in binding.lane_ops().iter().enumerate() {
            let output = op.lanes()[lane_id].expect("checked above");
            let matches = state.matches.matches_for_output(lane_op.op, output);
            if matches.is_empty() {
                feasible = false;
                break;
            }
            lane_matches.push(matches);
        }
        if !feasible {
            continue;
        }
        // Cross product of the per-lane matches, bounded by the
        // enumeration cap.
        let total: usize = lane_matches.iter().map(|m| m.len()).product();
        if total > state.enum_cap {
            debug!(
                "block {}: {} match combinations for {}, keeping {}",
                state.block.name,
                total,
                binding.name(),
                state.enum_cap
            );
        }
        for mut encoded in 0..total.min(state.enum_cap) {
            let mut row = Vec::with_capacity(op.len());
            for matches in &lane_matches {
                row.push(Some(matches[encoded % matches.len()].clone()));
                encoded /= matches.len();
            }
            if let Some(pack) =
                state
                    .vpctx
                    .create_general_pack(binding, row, &elements, &depended, state.cost)
            {
                producers.push(pack);
            }
        }
    }

    ProducerInfo {
        feasible: true,
        elements,
        producers,
    }
}

// Try each load as the chain head and follow DAG successors restricted
// to the remaining set; succeeds when some ordering visits every load.
fn reconstruct_load_chain(state: &BlockState, op: &OpRef, depended: &BitSet) -> Option<PackRef> {
    let load_set: FxHashSet<ValueId> = op.values().collect();
    for head in op.values() {
        let mut remaining = load_set.clone();
        remaining.remove(&head);
        let mut chain = vec![head];
        let mut cur = head;
        while !remaining.is_empty() {
            let next = state
                .load_dag
                .successors(cur)
                .iter()
                .copied()
                .find(|n| remaining.contains(n));
            match next {
                Some(n) => {
                    remaining.remove(&n);
                    chain.push(n);
                    cur = n;
                }
                None => break,
            }
        }
        if chain.len() == load_set.len() {
            let lanes: Vec<Lane> = chain.iter().map(|&l| Some(l)).collect();
            let mut elements = BitSet::new(state.vpctx.num_values());
            for &l in &chain {
                elements.set(l);
            }
            return state
                .vpctx
                .create_load_pack(&lanes, &elements, depended, state.cost);
        }
    }
    None
}

/// Merge a sparse load pack with independent same-base load packs by
/// laying every load out by offset and padding gaps with don't-cares.
/// Accepted only on a strict utilization improvement; ties on
/// utilization fall to the merge with fewer total lanes.
pub fn coalesce_load_pack(
    state: &BlockState,
    pack: &PackRef,
    candidates: &[PackRef],
    max_num_lanes: usize,
) -> Option<PackRef> {
    let block = state.block;
    let base_of = |p: &PackRef| -> Option<u32> {
        p.ordered_values()
            .iter()
            .flatten()
            .map(|&v| block.mem_access(v).map(|(_, loc)| loc.base))
            .next()
            .flatten()
    };
    let base = base_of(pack)?;
    let utilization = |p: &PackRef| {
        p.ordered_values().iter().flatten().count() as f32 / p.num_lanes() as f32
    };

    let mut best: Option<PackRef> = None;
    for other in candidates {
        if !other.is_load() || other.id() == pack.id() {
            continue;
        }
        if base_of(other) != Some(base) {
            continue;
        }
        if other.elements().any_common(pack.elements())
            || other.depended().any_common(pack.elements())
            || pack.depended().any_common(other.elements())
        {
            continue;
        }

        let mut loads: Vec<(i64, ValueId)> = Vec::new();
        for &v in pack.ordered_values().iter().chain(other.ordered_values()) {
            if let Some(v) = v {
                let (_, loc) = block.mem_access(v).unwrap();
                loads.push((loc.offset, v));
            }
        }
        loads.sort_unstable();
        if loads.windows(2).any(|w| w[0].0 == w[1].0) {
            continue;
        }
        let span = (loads.last().unwrap().0 - loads[0].0 + 1) as usize;
        if span > max_num_lanes || span < loads.len() {
            continue;
        }

        let mut lanes: Vec<Lane> = vec![None; span];
        let mut elements = BitSet::new(state.vpctx.num_values());
        let mut depended = BitSet::new(state.vpctx.num_values());
        for &(offset, v) in &loads {
            lanes[(offset - loads[0].0) as usize] = Some(v);
            elements.set(v);
            depended.union_with(state.lda.depended(v));
        }
        let merged = match state
            .vpctx
            .create_load_pack(&lanes, &elements, &depended, state.cost)
        {
            Some(m) => m,
            None => continue,
        };

        if utilization(&merged) <= utilization(pack) {
            continue;
        }
        let better = match &best {
            None => true,
            Some(b) => {
                utilization(&merged) > utilization(b)
                    || (utilization(&merged) == utilization(b)
                        && merged.num_lanes() < b.num_lanes())
            }
        };
        if better {
            best = Some(merged);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InstTable;
    use crate::target::{MemLocOracle, UnitCostModel};
    use crate::Packer;

    fn fixture(offsets: &[i64]) -> (Function, InstTable) {
        let mut block = Block::new("b", 1);
        for &off in offsets {
            let l = block.add_load(Type::Float, MemLoc::new(0, off));
            block.mark_live_out(l);
        }
        let mut func = Function::new("f");
        func.add_block(block);
        (func, InstTable::new())
    }

    #[test]
    fn seed_dfs_finds_full_chains_only() {
        let (func, table) = fixture(&[0, 1, 2, 3]);
        let cm = UnitCostModel;
        let packer = Packer::new(
            &func,
            table.bindings(),
            &cm,
            &MemLocOracle,
            &MemLocOracle,
            PackerConfig::default(),
        );
        let state = packer.state(0);

        assert_eq!(seed_mem_packs(state, 0, MemKind::Load, 4).len(), 1);
        assert_eq!(seed_mem_packs(state, 1, MemKind::Load, 4).len(), 0);
        assert_eq!(seed_mem_packs(state, 1, MemKind::Load, 2).len(), 1);
    }

    #[test]
    fn extension_reconstructs_permuted_load_chain() {
        let (func, table) = fixture(&[0, 1, 2, 3]);
        let cm = UnitCostModel;
        let packer = Packer::new(
            &func,
            table.bindings(),
            &cm,
            &MemLocOracle,
            &MemLocOracle,
            PackerConfig::default(),
        );
        let state = packer.state(0);

        // Loads 0..4 requested in a shuffled order.
        let op = state
            .vpctx
            .get_canonical_operand_pack(vec![Some(2), Some(0), Some(3), Some(1)]);
        let info = extensions_for_operand(state, &op);
        assert!(info.feasible);
        assert_eq!(info.producers.len(), 1);
        let chain: Vec<_> = info.producers[0].ordered_values().to_vec();
        assert_eq!(chain, vec![Some(0), Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn coalescing_requires_strict_density_gain() {
        let (func, table) = fixture(&[0, 1, 2, 3]);
        let cm = UnitCostModel;
        let packer = Packer::new(
            &func,
            table.bindings(),
            &cm,
            &MemLocOracle,
            &MemLocOracle,
            PackerConfig::default(),
        );
        let state = packer.state(0);

        let make = |lanes: Vec<Lane>| {
            let mut elements = BitSet::new(state.vpctx.num_values());
            let mut depended = BitSet::new(state.vpctx.num_values());
            for v in lanes.iter().flatten() {
                elements.set(*v);
                depended.union_with(state.lda.depended(*v));
            }
            state
                .vpctx
                .create_load_pack(&lanes, &elements, &depended, state.cost)
                .unwrap()
        };
        // Two half-empty packs over the same base merge into one dense
        // four-lane chain.
        let sparse_lo = make(vec![Some(0), None, Some(2), None]);
        let sparse_hi = make(vec![Some(1), None, Some(3), None]);
        let dense = make(vec![Some(0), Some(1), Some(2), Some(3)]);

        let merged = coalesce_load_pack(
            state,
            &sparse_lo,
            &[sparse_hi.clone(), dense.clone()],
            8,
        )
        .expect("merge should fire");
        assert_eq!(merged.elements().count(), 4);
        assert_eq!(merged.num_lanes(), 4, "ties fall to fewer lanes");

        // Merging with an overlapping pack is rejected outright.
        assert!(coalesce_load_pack(state, &dense, &[sparse_lo], 8).is_none());
    }
}
