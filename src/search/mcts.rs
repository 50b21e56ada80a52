use crate::bitset::BitSet;
use crate::catalog::{InstBinding, Match};
use crate::config::{PackerConfig, LANE_COUNTS};
use crate::ir::*;
use crate::pack::{Lane, PackRef};
use crate::packer::{BlockState, DecisionRecord};
use crate::search::frontier::Frontier;
use crate::search::plan::Plan;
use crate::search::policy::{FrontierSnapshot, PackingPolicy, PolicyRequest};
use crate::search::rollout::rollout;
use log::debug;
use rand::rngs::StdRng;
use std::rc::Rc;

/// Receives every root decision the MCTS driver takes; the training-data
/// side channel.
pub trait SearchObserver {
    fn on_decision(&mut self, record: DecisionRecord);
}

/// What kind of pack a partial fill is building.
#[derive(Clone)]
pub enum PackTemplate {
    Load(usize),
    Store(usize),
    Phi(usize),
    General(Rc<dyn InstBinding>),
}

impl PackTemplate {
    fn num_lanes(&self) -> usize {
        match self {
            PackTemplate::Load(vl) | PackTemplate::Store(vl) | PackTemplate::Phi(vl) => *vl,
            PackTemplate::General(b) => b.num_lanes(),
        }
    }
}

/// An in-progress fill of one pack-to-be: lanes chosen so far plus the
/// accumulated element and dependence sets.
#[derive(Clone)]
pub struct PartialPack {
    template: PackTemplate,
    filled: Vec<ValueId>,
    elements: BitSet,
    depended: BitSet,
}

// Feasibility backtracking gives up after this many probes rather than
// exhausting a combinatorial fill space.
const FEASIBILITY_FUEL: u32 = 128;

impl PartialPack {
    pub fn new(template: PackTemplate, width: usize) -> Self {
        Self {
            template,
            filled: Vec::new(),
            elements: BitSet::new(width),
            depended: BitSet::new(width),
        }
    }

    pub fn lane_id(&self) -> usize {
        debug_assert_eq!(self.elements.count(), self.filled.len());
        self.filled.len()
    }

    pub fn num_lanes(&self) -> usize {
        self.template.num_lanes()
    }

    pub fn is_complete(&self) -> bool {
        self.lane_id() == self.num_lanes()
    }

    /// Usable instructions that can fill the next lane.
    pub fn candidates(&self, state: &BlockState, frontier: &Frontier) -> Vec<ValueId> {
        let mut out = Vec::new();
        match &self.template {
            PackTemplate::Load(_) | PackTemplate::Store(_) => {
                let (dag, want_kind) = match self.template {
                    PackTemplate::Load(_) => (&state.load_dag, MemKind::Load),
                    _ => (&state.store_dag, MemKind::Store),
                };
                if let Some(&last) = self.filled.last() {
                    for &next in dag.successors(last) {
                        if frontier.free().test(next)
                            && frontier.usable().test(next)
                            && state.lda.compatible(next, &self.elements, &self.depended)
                        {
                            out.push(next);
                        }
                    }
                } else {
                    for inst in frontier.usable_insts(state) {
                        if matches!(state.block.mem_access(inst), Some((k, _)) if k == want_kind) {
                            out.push(inst);
                        }
                    }
                }
            }
            PackTemplate::Phi(_) => {
                let want_ty = self.filled.first().map(|&p| state.block.value(p).ty);
                for inst in frontier.usable_insts(state) {
                    if !state.phis.test(inst) || self.elements.test(inst) {
                        continue;
                    }
                    if want_ty.map_or(true, |ty| state.block.value(inst).ty == ty) {
                        out.push(inst);
                    }
                }
            }
            PackTemplate::General(binding) => {
                let lane_op = &binding.lane_ops()[self.lane_id()];
                for inst in frontier.usable_insts(state) {
                    if state.matches.matches_for_output(lane_op.op, inst).is_empty() {
                        continue;
                    }
                    if state.lda.compatible(inst, &self.elements, &self.depended) {
                        out.push(inst);
                    }
                }
            }
        }
        out
    }

    pub fn fill(&self, state: &BlockState, inst: ValueId) -> PartialPack {
        let mut next = self.clone();
        next.filled.push(inst);
        next.elements.set(inst);
        next.depended.union_with(state.lda.depended(inst));
        next
    }

    /// Build the pack once every lane is filled.
    pub fn complete(&self, state: &BlockState) -> Option<PackRef> {
        debug_assert!(self.is_complete());
        let lanes: Vec<Lane> = self.filled.iter().map(|&v| Some(v)).collect();
        match &self.template {
            PackTemplate::Load(_) => {
                state
                    .vpctx
                    .create_load_pack(&lanes, &self.elements, &self.depended, state.cost)
            }
            PackTemplate::Store(_) => {
                state
                    .vpctx
                    .create_store_pack(&lanes, &self.elements, &self.depended, state.cost)
            }
            PackTemplate::Phi(_) => {
                state
                    .vpctx
                    .create_phi_pack(&self.filled, &state.lda, state.cost)
            }
            PackTemplate::General(binding) => {
                let matches: Vec<Option<Match>> = self
                    .filled
                    .iter()
                    .zip(binding.lane_ops())
                    .map(|(&v, lane_op)| {
                        state.matches.matches_for_output(lane_op.op, v).first().cloned()
                    })
                    .collect();
                if matches.iter().any(|m| m.is_none()) {
                    return None;
                }
                state.vpctx.create_general_pack(
                    binding,
                    matches,
                    &self.elements,
                    &self.depended,
                    state.cost,
                )
            }
        }
    }

    /// Whether some ordering of fills completes this pack from the given
    /// frontier. Decided by bounded backtracking.
    pub fn feasible(&self, state: &BlockState, frontier: &Frontier) -> bool {
        let mut fuel = FEASIBILITY_FUEL;
        self.feasible_rec(state, frontier, &mut fuel)
    }

    fn feasible_rec(&self, state: &BlockState, frontier: &Frontier, fuel: &mut u32) -> bool {
        if self.is_complete() {
            return true;
        }
        for inst in self.candidates(state, frontier) {
            if *fuel == 0 {
                return false;
            }
            *fuel -= 1;
            if self.fill(state, inst).feasible_rec(state, frontier, fuel) {
                return true;
            }
        }
        false
    }
}

/// One outgoing decision of a node.
pub enum Step {
    Scalarize(ValueId),
    BeginPack(PartialPack),
    Fill(ValueId),
}

pub struct Transition {
    pub step: Step,
    pub visits: u32,
    pub total_cost: f64,
    /// Incremental frontier cost; known once the child is materialized.
    pub cost: f32,
    child: Option<usize>,
}

impl Transition {
    fn new(step: Step) -> Self {
        Self {
            step,
            visits: 0,
            total_cost: 0.0,
            cost: 0.0,
            child: None,
        }
    }

    pub fn avg_cost(&self) -> f64 {
        if self.visits == 0 {
            0.0
        } else {
            self.total_cost / self.visits as f64
        }
    }
}

pub struct UctNode {
    pub frontier: Rc<Frontier>,
    pub partial: Option<PartialPack>,
    pub transitions: Option<Vec<Transition>>,
    pub visits: u32,
    pub total_cost: f64,
    prior: Option<Vec<f32>>,
}

impl UctNode {
    /// A fresh root over a frontier, with no partial pack in flight.
    pub fn new_root(frontier: Rc<Frontier>) -> Self {
        Self::new(frontier, None)
    }

    fn new(frontier: Rc<Frontier>, partial: Option<PartialPack>) -> Self {
        Self {
            frontier,
            partial,
            transitions: None,
            visits: 0,
            total_cost: 0.0,
            prior: None,
        }
    }

    pub fn is_expanded(&self) -> bool {
        self.transitions.is_some()
    }
}

/// Monte-Carlo tree search over frontiers: UCT selection with an
/// optional learned prior, partial-pack expansion, uniform random
/// rollouts.
pub struct UctSearch<'s, 'a> {
    state: &'s BlockState<'a>,
    config: &'s PackerConfig,
    policy: Option<&'s dyn PackingPolicy>,
}

impl<'s, 'a> UctSearch<'s, 'a> {
    pub fn new(
        state: &'s BlockState<'a>,
        config: &'s PackerConfig,
        policy: Option<&'s dyn PackingPolicy>,
    ) -> Self {
        Self {
            state,
            config,
            policy,
        }
    }

    /// Run up to `iters` simulations from `root`; returns how many ran.
    /// A root with exactly one child is a forced move and takes a single
    /// iteration.
    pub fn run(
        &self,
        nodes: &mut Vec<UctNode>,
        root: usize,
        iters: usize,
        rng: &mut StdRng,
    ) -> usize {
        if nodes[root].frontier.is_terminal(self.state) {
            return 0;
        }
        if !nodes[root].is_expanded() {
            self.expand(nodes, root);
        }
        let iters = if nodes[root].transitions.as_ref().unwrap().len() == 1 {
            1
        } else {
            iters
        };
        for _ in 0..iters {
            self.simulate(nodes, root, rng);
        }
        iters
    }

    fn simulate(&self, nodes: &mut Vec<UctNode>, root: usize, rng: &mut StdRng) {
        let mut path: Vec<(usize, usize)> = Vec::new();
        let mut id = root;

        // Selection: descend while the node has children.
        loop {
            if nodes[id].frontier.is_terminal(self.state) {
                break;
            }
            if !nodes[id].is_expanded() {
                if nodes[id].visits >= self.config.expand_after {
                    self.expand(nodes, id);
                } else {
                    break;
                }
            }
            let t_idx = match self.select_transition(nodes, id) {
                Some(t) => t,
                None => break,
            };
            let child = self.materialize(nodes, id, t_idx);
            path.push((id, t_idx));
            id = child;
        }

        // Evaluation.
        let leaf = &nodes[id];
        let mut cumulative = rollout(
            self.state,
            &leaf.frontier,
            leaf.partial.as_ref(),
            self.config,
            rng,
        ) as f64;

        // Backprop.
        nodes[id].visits += 1;
        nodes[id].total_cost += cumulative;
        for &(node_id, t_idx) in path.iter().rev() {
            let t = &mut nodes[node_id].transitions.as_mut().unwrap()[t_idx];
            cumulative += t.cost as f64;
            t.visits += 1;
            t.total_cost += cumulative;
            nodes[node_id].visits += 1;
            nodes[node_id].total_cost += cumulative;
        }
    }

    fn select_transition(&self, nodes: &mut Vec<UctNode>, id: usize) -> Option<usize> {
        let prior = self.fetch_prior(nodes, id);
        let node = &nodes[id];
        let transitions = node.transitions.as_ref().unwrap();
        if transitions.is_empty() {
            return None;
        }
        // Unvisited transitions go first, in enumeration order.
        if let Some(i) = transitions.iter().position(|t| t.visits == 0) {
            return Some(i);
        }
        let parent_visits = node.visits.max(1) as f64;
        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (i, t) in transitions.iter().enumerate() {
            let explore =
                self.config.c as f64 * (parent_visits.ln() / (t.visits as f64 + 1.0)).sqrt();
            let bias = prior
                .as_ref()
                .and_then(|w| w.get(i))
                .map(|&w| self.config.w as f64 * w as f64 / (t.visits as f64 + 1.0))
                .unwrap_or(0.0);
            let score = -t.avg_cost() + explore + bias;
            if score > best_score {
                best_score = score;
                best = i;
            }
        }
        Some(best)
    }

    fn fetch_prior(&self, nodes: &mut Vec<UctNode>, id: usize) -> Option<Vec<f32>> {
        let policy = self.policy?;
        if nodes[id].prior.is_none() {
            let weights = policy.predict(id as u64);
            nodes[id].prior = Some(weights);
        }
        let w = nodes[id].prior.as_ref().unwrap();
        if w.is_empty() {
            None
        } else {
            Some(w.clone())
        }
    }

    // Create the child node for a transition if it does not exist yet,
    // recording the transition's incremental cost.
    fn materialize(&self, nodes: &mut Vec<UctNode>, id: usize, t_idx: usize) -> usize {
        if let Some(child) = nodes[id].transitions.as_ref().unwrap()[t_idx].child {
            return child;
        }
        let state = self.state;
        let frontier = Rc::clone(&nodes[id].frontier);
        let partial = nodes[id].partial.clone();
        let (child_frontier, child_partial, cost) =
            match &nodes[id].transitions.as_ref().unwrap()[t_idx].step {
                Step::Scalarize(inst) => {
                    let (next, cost) = frontier.advance_inst(state, *inst);
                    (Rc::new(next), None, cost)
                }
                Step::BeginPack(partial) => (frontier, Some(partial.clone()), 0.0),
                Step::Fill(inst) => {
                    let filled = partial
                        .as_ref()
                        .expect("fill without a partial pack")
                        .fill(state, *inst);
                    if filled.is_complete() {
                        match filled.complete(state) {
                            Some(pack) => {
                                let (next, cost) = frontier.advance_pack(state, &pack);
                                (Rc::new(next), None, cost)
                            }
                            // Lane signatures stopped lining up; the
                            // child degenerates to the same frontier.
                            None => (frontier, None, 0.0),
                        }
                    } else {
                        (frontier, Some(filled), 0.0)
                    }
                }
            };
        let child_id = nodes.len();
        nodes.push(UctNode::new(child_frontier, child_partial));
        let t = &mut nodes[id].transitions.as_mut().unwrap()[t_idx];
        t.child = Some(child_id);
        t.cost = cost;
        child_id
    }

    fn expand(&self, nodes: &mut Vec<UctNode>, id: usize) {
        let state = self.state;
        let frontier = Rc::clone(&nodes[id].frontier);
        let mut transitions = Vec::new();

        match &nodes[id].partial {
            None => {
                for inst in frontier.usable_insts(state) {
                    transitions.push(Transition::new(Step::Scalarize(inst)));
                }
                let width = state.vpctx.num_values();
                for vl in LANE_COUNTS {
                    if vl > self.config.max_num_lanes {
                        break;
                    }
                    for template in [
                        PackTemplate::Load(vl),
                        PackTemplate::Store(vl),
                        PackTemplate::Phi(vl),
                    ] {
                        let partial = PartialPack::new(template, width);
                        if partial.feasible(state, &frontier) {
                            transitions.push(Transition::new(Step::BeginPack(partial)));
                        }
                    }
                }
                for binding in &state.bindings {
                    let partial = PartialPack::new(PackTemplate::General(Rc::clone(binding)), width);
                    if partial.feasible(state, &frontier) {
                        transitions.push(Transition::new(Step::BeginPack(partial)));
                    }
                }
            }
            Some(partial) => {
                for inst in partial.candidates(state, &frontier) {
                    if partial.fill(state, inst).feasible(state, &frontier) {
                        transitions.push(Transition::new(Step::Fill(inst)));
                    }
                }
                // A partial that can no longer be completed falls back
                // to its scalar alternatives.
                if transitions.is_empty() {
                    for inst in frontier.usable_insts(state) {
                        transitions.push(Transition::new(Step::Scalarize(inst)));
                    }
                }
            }
        }
        nodes[id].transitions = Some(transitions);

        if let Some(policy) = self.policy {
            let n = nodes[id].transitions.as_ref().unwrap().len();
            policy.predict_async(&PolicyRequest {
                token: id as u64,
                num_transitions: n,
                snapshot: FrontierSnapshot::of(&nodes[id].frontier),
            });
        }
    }

    /// Repeatedly search at the root, take the best-supported decision,
    /// and re-root until the frontier is terminal; returns the plan the
    /// committed packs form.
    pub fn drive(
        &self,
        frontier: Frontier,
        rng: &mut StdRng,
        mut observer: Option<&mut dyn SearchObserver>,
    ) -> Plan {
        let state = self.state;
        let mut nodes = vec![UctNode::new(Rc::new(frontier), None)];
        let mut root = 0;

        // Every decision either freezes an instruction or fills a lane,
        // so this bound is generous; it only guards degenerate cost
        // models that reject completed packs.
        let max_decisions = 4 * state.block.insts().len() + 16;
        for _ in 0..max_decisions {
            if nodes[root].partial.is_none() && nodes[root].frontier.is_terminal(state) {
                break;
            }
            let ran = self.run(&mut nodes, root, self.config.num_simulations, rng);
            if ran == 0 {
                break;
            }
            let transitions = nodes[root].transitions.as_ref().unwrap();
            if transitions.is_empty() {
                break;
            }
            let mut best = 0;
            for (i, t) in transitions.iter().enumerate() {
                let b = &transitions[best];
                if t.visits > b.visits
                    || (t.visits == b.visits && t.avg_cost() < b.avg_cost())
                {
                    best = i;
                }
            }

            if let Some(obs) = observer.as_deref_mut() {
                let t = &transitions[best];
                obs.on_decision(DecisionRecord {
                    block: state.block.name.clone(),
                    chosen: best,
                    num_transitions: transitions.len(),
                    rollout_cost: t.avg_cost() as f32,
                    free_count: nodes[root].frontier.free().count(),
                    unresolved_scalar_count: nodes[root].frontier.unresolved_scalars().count(),
                    unresolved_pack_count: nodes[root].frontier.unresolved_packs().len(),
                });
            }

            root = self.materialize(&mut nodes, root, best);
        }

        let final_frontier = Rc::clone(&nodes[root].frontier);
        debug!(
            "block {}: search settled with {} committed packs",
            state.block.name,
            final_frontier.committed().len()
        );
        let mut plan = Plan::new(state);
        for pack in final_frontier.committed() {
            let added = plan.add(state, pack);
            debug_assert!(added, "search committed overlapping packs");
        }
        plan
    }
}
