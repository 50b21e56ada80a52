use crate::analyze::{AccessDag, DependenceAnalysis, MatchManager};
use crate::bitset::BitSet;
use crate::catalog::{is_supported, InstBinding};
use crate::config::PackerConfig;
use crate::ir::*;
use crate::pack::{OpRef, VectorPackContext};
use crate::search::enumerate::{extensions_for_operand, ProducerInfo};
use crate::search::frontier::Frontier;
use crate::search::improve::optimize_bottom_up;
use crate::search::mcts::{SearchObserver, UctSearch};
use crate::search::plan::Plan;
use crate::search::policy::PackingPolicy;
use crate::target::{AdjacencyOracle, AliasOracle, CostModel};
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;

/// Everything the search needs about one block: analyses, the pack
/// context, and the catalog bindings that can fire here. Built once per
/// block at packer construction; all search state derives from it.
pub struct BlockState<'a> {
    pub block: &'a Block,
    /// In-block users per value (phi incomings count).
    pub users: Vec<SmallVec<[ValueId; 4]>>,
    /// Instructions reachable backward from stores and live-outs.
    /// Everything else is dead and stays out of the search.
    pub live: BitSet,
    pub stores: BitSet,
    pub phis: BitSet,
    pub lda: DependenceAnalysis,
    pub load_dag: AccessDag,
    pub store_dag: AccessDag,
    pub matches: MatchManager,
    pub vpctx: VectorPackContext<'a>,
    /// Bindings with at least one match per lane operation in this block.
    pub bindings: Vec<Rc<dyn InstBinding>>,
    pub cost: &'a dyn CostModel,
    /// Cap on packs enumerated per query, inherited from the config.
    pub enum_cap: usize,
    producer_cache: RefCell<FxHashMap<u32, Rc<ProducerInfo>>>,
}

impl<'a> BlockState<'a> {
    fn new(
        block: &'a Block,
        supported: &[Rc<dyn InstBinding>],
        cost: &'a dyn CostModel,
        alias: &dyn AliasOracle,
        adj: &dyn AdjacencyOracle,
        config: &PackerConfig,
    ) -> Self {
        let n = block.num_values();
        let users = block.compute_users();

        let mut stores = BitSet::new(n);
        let mut phis = BitSet::new(n);
        let mut loads = Vec::new();
        let mut store_insts = Vec::new();
        for &inst in block.insts() {
            match &block.value(inst).kind {
                ValueKind::Load { .. } => loads.push(inst),
                ValueKind::Store { .. } => {
                    stores.set(inst);
                    store_insts.push(inst);
                }
                ValueKind::Phi { .. } => phis.set(inst),
                _ => {}
            }
        }

        // Backward liveness from stores and live-outs.
        let mut live = BitSet::new(n);
        let mut worklist: Vec<ValueId> = Vec::new();
        for &inst in block.insts() {
            if stores.test(inst) || block.is_live_out(inst) {
                live.set(inst);
                worklist.push(inst);
            }
        }
        while let Some(inst) = worklist.pop() {
            for op in block.operands(inst) {
                if block.is_inst(op) && !live.test(op) {
                    live.set(op);
                    worklist.push(op);
                }
            }
        }

        let lda = DependenceAnalysis::new(block, alias, config.max_search_dist);
        let load_dag = AccessDag::build(block, &loads, adj);
        let store_dag = AccessDag::build(block, &store_insts, adj);
        let matches = MatchManager::new(supported, block);

        // A binding is worth carrying only if every lane can fire at all.
        let bindings: Vec<Rc<dyn InstBinding>> = supported
            .iter()
            .filter(|b| b.num_lanes() <= config.max_num_lanes)
            .filter(|b| {
                b.lane_ops()
                    .iter()
                    .all(|lane_op| !matches.matches_for(lane_op.op).is_empty())
            })
            .cloned()
            .collect();

        Self {
            block,
            users,
            live,
            stores,
            phis,
            lda,
            load_dag,
            store_dag,
            matches,
            vpctx: VectorPackContext::new(block),
            bindings,
            cost,
            enum_cap: config.enum_cap,
            producer_cache: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn scalar_cost(&self, inst: ValueId) -> f32 {
        self.cost.scalar_cost(self.block, inst)
    }

    /// Which packs can produce an operand pack, memoized by intern id.
    pub fn producer_info(&self, op: &OpRef) -> Rc<ProducerInfo> {
        if let Some(info) = self.producer_cache.borrow().get(&op.id()) {
            return Rc::clone(info);
        }
        let info = Rc::new(extensions_for_operand(self, op));
        self.producer_cache
            .borrow_mut()
            .insert(op.id(), Rc::clone(&info));
        info
    }
}

/// Training-data side channel: the MCTS driver reports every root
/// decision it takes. Serialization is the host's business.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub block: String,
    pub chosen: usize,
    pub num_transitions: usize,
    pub rollout_cost: f32,
    pub free_count: usize,
    pub unresolved_scalar_count: usize,
    pub unresolved_pack_count: usize,
}

/// The packer: per-function analyses plus the two block optimizers.
pub struct Packer<'a> {
    func: &'a Function,
    config: PackerConfig,
    states: Vec<BlockState<'a>>,
}

impl<'a> Packer<'a> {
    pub fn new(
        func: &'a Function,
        bindings: &[Rc<dyn InstBinding>],
        cost: &'a dyn CostModel,
        alias: &dyn AliasOracle,
        adj: &dyn AdjacencyOracle,
        config: PackerConfig,
    ) -> Self {
        let supported: Vec<Rc<dyn InstBinding>> = bindings
            .iter()
            .filter(|b| is_supported(b.as_ref(), func))
            .cloned()
            .collect();
        debug!(
            "packer: {}/{} bindings supported on {}",
            supported.len(),
            bindings.len(),
            func.name
        );
        let states = func
            .blocks()
            .iter()
            .map(|block| BlockState::new(block, &supported, cost, alias, adj, &config))
            .collect();
        Self {
            func,
            config,
            states,
        }
    }

    pub fn config(&self) -> &PackerConfig {
        &self.config
    }

    pub fn state(&self, block_idx: usize) -> &BlockState<'a> {
        &self.states[block_idx]
    }

    /// Primary entry: choose a pack set for one block.
    pub fn optimize(&self, block_idx: usize) -> Plan {
        self.optimize_with(block_idx, None, None)
    }

    /// As `optimize`, with an optional learned prior and an optional
    /// decision observer (only the MCTS path consults either). Policy
    /// results are keyed per search: cancel or replace the policy
    /// between blocks rather than sharing one warm instance.
    pub fn optimize_with(
        &self,
        block_idx: usize,
        policy: Option<&dyn PackingPolicy>,
        observer: Option<&mut dyn SearchObserver>,
    ) -> Plan {
        let state = &self.states[block_idx];
        if self.config.use_mcts {
            let mut rng = StdRng::seed_from_u64(self.config.seed);
            let search = UctSearch::new(state, &self.config, policy);
            let frontier = Frontier::start(state);
            search.drive(frontier, &mut rng, observer)
        } else {
            optimize_bottom_up(state, &self.config)
        }
    }

    /// Exhaustive memoized solve of one block. Exponential in the worst
    /// case; intended for small blocks and for cross-checking the other
    /// solvers.
    pub fn optimize_dp(&self, block_idx: usize) -> Plan {
        let state = &self.states[block_idx];
        let solver = crate::search::dp::DpSolver::new(state, &self.config);
        let frontier = Frontier::start(state);
        let solution = solver.solve(&frontier);
        let mut plan = Plan::new(state);
        for pack in &solution.packs {
            let added = plan.add(state, pack);
            debug_assert!(added, "dp solution committed overlapping packs");
        }
        plan
    }

    /// Run every block of the function through `optimize`.
    pub fn optimize_function(&self) -> Vec<Plan> {
        (0..self.func.blocks().len())
            .map(|i| {
                let plan = self.optimize(i);
                debug!(
                    "block {}: {} packs, cost {}",
                    self.func.block(i).name,
                    plan.packs().len(),
                    plan.cost()
                );
                plan
            })
            .collect()
    }
}
