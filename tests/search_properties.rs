use rand::rngs::StdRng;
use rand::SeedableRng;
use std::rc::Rc;
use superword::catalog::{InstTable, VectorBinding, Operation, InstBinding};
use superword::ir::*;
use superword::search::plan::Plan;
use superword::search::{Frontier, UctNode, UctSearch};
use superword::target::{MemLocOracle, UnitCostModel};
use superword::{Packer, PackerConfig};

fn saxpy_block() -> Function {
    let mut block = Block::new("body", 1);
    let mut xs = Vec::new();
    for i in 0..4 {
        let a = block.add_load(Type::Float, MemLoc::new(0, i));
        let b = block.add_load(Type::Float, MemLoc::new(1, i));
        xs.push(block.add_binary(Type::Float, BinOp::FAdd, a, b));
    }
    for (i, &x) in xs.iter().enumerate() {
        block.add_store(MemLoc::new(2, i as i64), x);
    }
    let mut func = Function::new("saxpy");
    func.add_block(block);
    func
}

/// Root visit counts add up to the simulation budget, and every visited
/// transition's count equals its child's.
#[test]
fn visit_counts_are_conserved() {
    let func = saxpy_block();
    let table = InstTable::new();
    let cm = UnitCostModel;
    let config = PackerConfig {
        use_mcts: true,
        ..PackerConfig::default()
    };
    let packer = Packer::new(
        &func,
        table.bindings(),
        &cm,
        &MemLocOracle,
        &MemLocOracle,
        config,
    );
    let state = packer.state(0);

    let search = UctSearch::new(state, packer.config(), None);
    let mut nodes = vec![UctNode::new_root(Rc::new(Frontier::start(state)))];
    let mut rng = StdRng::seed_from_u64(3);
    let budget = 200;
    let ran = search.run(&mut nodes, 0, budget, &mut rng);
    assert_eq!(ran, budget);
    assert_eq!(nodes[0].visits as usize, budget);

    let transition_sum: u32 = nodes[0]
        .transitions
        .as_ref()
        .unwrap()
        .iter()
        .map(|t| t.visits)
        .sum();
    assert_eq!(transition_sum as usize, budget);
}

/// Walking a frontier through a pack assignment reproduces, as the sum
/// of incremental costs, exactly the cost the finished plan reports.
#[test]
fn frontier_costs_match_plan_cost() {
    let func = saxpy_block();
    let table = InstTable::new();
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
    let plan = packer.optimize(0);
    assert_eq!(plan.packs().len(), 4);

    // Commit in backward order: stores, then the adds, then loads.
    let store = plan.packs().iter().find(|p| p.is_store()).unwrap();
    let general = plan
        .packs()
        .iter()
        .find(|p| !p.is_store() && !p.is_load())
        .unwrap();
    let loads: Vec<_> = plan.packs().iter().filter(|p| p.is_load()).collect();

    let mut frontier = Frontier::start(state);
    let mut total = 0.0;
    total += frontier.advance_inplace_pack(state, store);
    total += frontier.advance_inplace_pack(state, general);
    for load in loads {
        total += frontier.advance_inplace_pack(state, load);
    }
    assert!(frontier.is_terminal(state), "all work should be resolved");
    assert!(
        (total - plan.cost()).abs() < 1e-4,
        "frontier walk cost {} != plan cost {}",
        total,
        plan.cost()
    );
    assert!(
        (plan.scratch_cost(state) - plan.cost()).abs() < 1e-4,
        "scratch recomputation disagrees"
    );
}

/// Both solvers never do worse than leaving the block scalar.
#[test]
fn solvers_never_lose_to_scalar() {
    let func = saxpy_block();
    let table = InstTable::new();
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
    let scalar = Plan::new(state).cost();

    let improved = packer.optimize(0);
    assert!(improved.cost() <= scalar);

    let dp = packer.optimize_dp(0);
    assert!(dp.cost() <= scalar);
    assert!(
        dp.cost() <= improved.cost() + 1e-4,
        "dp ({}) explores a superset of the improver's plans ({})",
        dp.cost(),
        improved.cost()
    );
}

/// Replacing a waiting operand vector by shuffled inputs pays one
/// shuffle and swaps the unresolved entry.
#[test]
fn shuffle_transition_replaces_unresolved_pack() {
    let func = saxpy_block();
    let table = InstTable::new();
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
    let plan = packer.optimize(0);
    let store = plan.packs().iter().find(|p| p.is_store()).unwrap();

    let mut frontier = Frontier::start(state);
    frontier.advance_inplace_pack(state, store);
    assert_eq!(frontier.unresolved_packs().len(), 1);
    let waiting = frontier.unresolved_packs()[0].clone();

    let even = state.vpctx.even(&waiting);
    let odd = state.vpctx.odd(&waiting);
    let (next, cost) = frontier.advance_shuffle(state, &waiting, &[even.clone(), odd.clone()]);
    assert_eq!(cost, 1.0, "one blend under the unit model");
    let ids: Vec<u32> = next.unresolved_packs().iter().map(|p| p.id()).collect();
    assert!(ids.contains(&even.id()) && ids.contains(&odd.id()));
    assert!(!ids.contains(&waiting.id()));
}

/// A binding gated on a missing target feature never contributes packs.
#[test]
fn feature_gated_bindings_stay_out() {
    let func = saxpy_block();
    let cm = UnitCostModel;

    let gated: Vec<Rc<dyn InstBinding>> = vec![Rc::new(
        VectorBinding::create(Operation::new(BinOp::FAdd, 32), 128).require_feature("avx512"),
    ) as Rc<dyn InstBinding>];

    let packer = Packer::new(
        &func,
        &gated,
        &cm,
        &MemLocOracle,
        &MemLocOracle,
        PackerConfig::default(),
    );
    let plan = packer.optimize(0);
    assert!(
        plan.packs()
            .iter()
            .all(|p| p.is_load() || p.is_store() || p.is_phi()),
        "gated binding must not produce packs: {:?}",
        plan.packs()
    );

    let mut with_feature = saxpy_block();
    with_feature.add_feature("avx512");
    let packer = Packer::new(
        &with_feature,
        &gated,
        &cm,
        &MemLocOracle,
        &MemLocOracle,
        PackerConfig::default(),
    );
    let plan = packer.optimize(0);
    assert!(
        plan.packs().iter().any(|p| !p.is_load() && !p.is_store()),
        "feature present, binding should fire: {:?}",
        plan.packs()
    );
}
