use crate::config::PackerConfig;
use crate::packer::BlockState;
use crate::search::enumerate::frontier_extensions;
use crate::search::frontier::Frontier;
use crate::search::mcts::PartialPack;
use rand::rngs::StdRng;
use rand::Rng;

/// Uniform random simulation to a terminal frontier; returns the summed
/// incremental cost. Finishes any in-flight partial pack first, then
/// alternates between committing a random extension pack and
/// scalarizing the next usable instruction.
pub fn rollout(
    state: &BlockState,
    frontier: &Frontier,
    partial: Option<&PartialPack>,
    config: &PackerConfig,
    rng: &mut StdRng,
) -> f32 {
    let mut frontier = frontier.clone();
    let mut partial = partial.cloned();
    let mut cost = 0.0;

    loop {
        if let Some(p) = partial.take() {
            let feasible: Vec<_> = p
                .candidates(state, &frontier)
                .into_iter()
                .filter(|&inst| p.fill(state, inst).feasible(state, &frontier))
                .collect();
            if feasible.is_empty() {
                // Dead-ended fill; fall back to the packless policy.
                continue;
            }
            // Prefer fills that stay compatible with a discovered
            // extension pack.
            let extensions = frontier_extensions(state, &frontier, config);
            let preferred: Vec<_> = feasible
                .iter()
                .copied()
                .filter(|&inst| extensions.iter().any(|vp| vp.elements().test(inst)))
                .collect();
            let pool = if preferred.is_empty() { &feasible } else { &preferred };
            let inst = pool[rng.gen_range(0..pool.len())];

            let filled = p.fill(state, inst);
            if filled.is_complete() {
                if let Some(pack) = filled.complete(state) {
                    cost += frontier.advance_inplace_pack(state, &pack);
                }
            } else {
                partial = Some(filled);
            }
            continue;
        }

        if frontier.is_terminal(state) {
            return cost;
        }

        let extensions = frontier_extensions(state, &frontier, config);
        if !extensions.is_empty() {
            let pack = &extensions[rng.gen_range(0..extensions.len())];
            cost += frontier.advance_inplace_pack(state, pack);
        } else {
            let inst = frontier
                .next_usable(state)
                .expect("non-terminal frontier with nothing usable");
            cost += frontier.advance_inplace_inst(state, inst);
        }
    }
}
