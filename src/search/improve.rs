use crate::bitset::BitSet;
use crate::config::PackerConfig;
use crate::pack::{Lane, OpRef, PackRef};
use crate::packer::BlockState;
use crate::search::enumerate::{coalesce_load_pack, enumerate_load_seeds, store_seeds, CandidateSet};
use crate::search::heuristic::Heuristic;
use crate::search::plan::Plan;
use log::debug;
use std::rc::Rc;

/// Worklist pass: ask the heuristic for each unresolved operand vector's
/// best solution and splice it into the plan when it covers strictly more
/// than whatever it displaces (or unconditionally with `override_packed`).
pub fn run_bottom_up_from_operand(
    op: &OpRef,
    plan: &mut Plan,
    state: &BlockState,
    heuristic: &Heuristic,
    override_packed: bool,
) {
    let mut worklist: Vec<OpRef> = vec![Rc::clone(op)];
    while let Some(op) = worklist.pop() {
        let sol = heuristic.solve(&op);
        if sol.packs.is_empty() {
            continue;
        }

        let mut elements = BitSet::new(state.vpctx.num_values());
        let mut old_packs: Vec<PackRef> = Vec::new();
        for vp in &sol.packs {
            elements.union_with(vp.elements());
            for v in vp.elements().iter() {
                if let Some(old) = plan.producer(v) {
                    if !old_packs.iter().any(|p| p.id() == old.id()) {
                        old_packs.push(Rc::clone(old));
                    }
                }
            }
        }

        if !override_packed {
            // Only displace existing packs when the new solution covers
            // a superset of what they cover.
            let n = elements.count();
            let mut covered = elements.clone();
            let mut feasible = true;
            for old in &old_packs {
                covered.union_with(old.elements());
                if covered.count() > n {
                    feasible = false;
                    break;
                }
            }
            if !feasible {
                continue;
            }
        }

        for old in &old_packs {
            plan.remove(state, old);
        }
        for vp in &sol.packs {
            if plan.add(state, vp) {
                worklist.extend(vp.operand_packs().iter().cloned());
            }
        }
    }
}

fn improve(
    plan: &mut Plan,
    base: &Plan,
    ops: &[OpRef],
    override_packed: bool,
    state: &BlockState,
    heuristic: &Heuristic,
) -> bool {
    let mut candidate = base.clone();
    for op in ops {
        run_bottom_up_from_operand(op, &mut candidate, state, heuristic, override_packed);
    }
    if candidate.cost() < plan.cost() {
        *plan = candidate;
        true
    } else {
        false
    }
}

// The improvement ladder tried from each staging point: the operand pack
// itself, its halves, and its quarters, first respecting existing packs
// and then overriding them.
fn improve_from_operand(
    plan: &mut Plan,
    base: &Plan,
    op: &OpRef,
    state: &BlockState,
    heuristic: &Heuristic,
) -> bool {
    let ctx = &state.vpctx;
    let odd = ctx.odd(op);
    let even = ctx.even(op);
    let oo = ctx.odd(&odd);
    let oe = ctx.even(&odd);
    let eo = ctx.odd(&even);
    let ee = ctx.even(&even);
    let halves = [Rc::clone(&even), Rc::clone(&odd)];
    let quarters = [oo, oe, eo, ee];
    let whole = [Rc::clone(op)];

    improve(plan, base, &whole, false, state, heuristic)
        || improve(plan, base, &whole, true, state, heuristic)
        || improve(plan, base, &halves, false, state, heuristic)
        || improve(plan, base, &halves, true, state, heuristic)
        || improve(plan, base, &quarters, false, state, heuristic)
        || improve(plan, base, &quarters, true, state, heuristic)
}

/// Iterate seed staging, operand re-solving, and pack concatenation to a
/// local optimum.
pub fn improve_plan(
    state: &BlockState,
    plan: &mut Plan,
    candidates: &CandidateSet,
    config: &PackerConfig,
) {
    let seeds = store_seeds(state, config);
    let heuristic = Heuristic::new(state, Some(candidates));

    loop {
        debug!("block {}: plan cost {}", state.block.name, plan.cost());
        let mut optimized = false;

        for seed in &seeds {
            let mut staged = plan.clone();
            let displaced: Vec<PackRef> = seed
                .elements()
                .iter()
                .filter_map(|v| staged.producer(v).cloned())
                .collect();
            for old in &displaced {
                if staged.packs().iter().any(|p| p.id() == old.id()) {
                    staged.remove(state, old);
                }
            }
            if !staged.add(state, seed) {
                continue;
            }
            let op = Rc::clone(&seed.operand_packs()[0]);
            if improve_from_operand(plan, &staged, &op, state, &heuristic) {
                optimized = true;
                break;
            }
        }
        if optimized {
            continue;
        }

        let ops: Vec<OpRef> = plan.operand_packs().cloned().collect();
        for op in ops {
            let staged = plan.clone();
            if improve_from_operand(plan, &staged, &op, state, &heuristic) {
                optimized = true;
                break;
            }
        }
        if optimized {
            continue;
        }

        // Concatenate pairs of committed packs into a wider staging
        // vector when they are mutually independent.
        let packs: Vec<PackRef> = plan.packs().to_vec();
        'concat: for vp in &packs {
            for vp2 in &packs {
                if vp.id() == vp2.id()
                    || vp2.depended().any_common(vp.elements())
                    || vp.depended().any_common(vp2.elements())
                {
                    continue;
                }
                let concat: Vec<Lane> = vp
                    .ordered_values()
                    .iter()
                    .chain(vp2.ordered_values())
                    .copied()
                    .collect();
                if concat.iter().all(|l| l.is_none()) {
                    continue;
                }
                let op = state.vpctx.get_canonical_operand_pack(concat);
                if !state.producer_info(&op).feasible {
                    continue;
                }
                let mut staged = plan.clone();
                staged.remove(state, vp);
                staged.remove(state, vp2);
                if improve(plan, &staged, &[Rc::clone(&op)], false, state, &heuristic)
                    || improve(plan, &staged, &[op], true, state, &heuristic)
                {
                    optimized = true;
                    break 'concat;
                }
            }
        }

        if !optimized {
            break;
        }
    }

    debug_assert!(plan.verify_cost(state), "improved plan cost drifted");
}

/// The production path: enumerate candidates, start from the scalar
/// plan, improve to a local optimum.
pub fn optimize_bottom_up(state: &BlockState, config: &PackerConfig) -> Plan {
    let mut candidates = enumerate_load_seeds(state, config);

    // Densify sparse load packs against each other before solving.
    let merged: Vec<PackRef> = candidates
        .packs
        .iter()
        .filter(|p| p.ordered_values().iter().any(|l| l.is_none()))
        .filter_map(|p| coalesce_load_pack(state, p, &candidates.packs, config.max_num_lanes))
        .collect();
    for pack in merged {
        for e in pack.elements().iter() {
            candidates.inst_to_packs[e].push(Rc::clone(&pack));
        }
        candidates.packs.push(pack);
    }

    let mut plan = Plan::new(state);
    improve_plan(state, &mut plan, &candidates, config);
    plan
}
