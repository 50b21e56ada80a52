use superword::catalog::InstTable;
use superword::ir::*;
use superword::pack::PackKind;
use superword::target::{MemLocOracle, UnitCostModel};
use superword::{Packer, PackerConfig};

fn packer_over<'a>(
    func: &'a Function,
    table: &'a InstTable,
    cm: &'a UnitCostModel,
    config: PackerConfig,
) -> Packer<'a> {
    Packer::new(func, table.bindings(), cm, &MemLocOracle, &MemLocOracle, config)
}

// Under the unit model every live instruction except phis costs 1.
fn scalar_baseline(func: &Function, block_idx: usize) -> f32 {
    let block = func.block(block_idx);
    block
        .insts()
        .iter()
        .filter(|&&i| !block.is_phi(i))
        .count() as f32
}

/// One dead scalar add: nothing to vectorize, empty plan, zero cost.
#[test]
fn trivial_splat_add_stays_scalar() {
    let mut block = Block::new("b", 1);
    let a = block.add_arg(Type::Int(32));
    let _x = block.add_binary(Type::Int(32), BinOp::Add, a, a);
    let mut func = Function::new("trivial");
    func.add_block(block);

    let table = InstTable::new();
    let cm = UnitCostModel;
    let packer = packer_over(&func, &table, &cm, PackerConfig::default());
    let plan = packer.optimize(0);
    assert!(plan.packs().is_empty());
    assert_eq!(plan.cost(), 0.0);
}

fn four_consecutive_stores() -> Function {
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
    let mut func = Function::new("saxpy_ish");
    func.add_block(block);
    func
}

/// Four consecutive float stores of adds: two load packs, an fadd pack,
/// a store pack, and a cost strictly below the scalar sum.
#[test]
fn consecutive_stores_fully_vectorize() {
    let func = four_consecutive_stores();
    let table = InstTable::new();
    let cm = UnitCostModel;
    let packer = packer_over(&func, &table, &cm, PackerConfig::default());
    let plan = packer.optimize(0);

    let baseline = scalar_baseline(&func, 0);
    assert!(
        plan.cost() < baseline,
        "expected vector plan below {} scalar units, got {}",
        baseline,
        plan.cost()
    );
    let loads = plan.packs().iter().filter(|p| p.is_load()).count();
    let stores = plan.packs().iter().filter(|p| p.is_store()).count();
    let generals = plan
        .packs()
        .iter()
        .filter(|p| matches!(p.kind(), PackKind::General { .. }))
        .count();
    assert_eq!((loads, stores, generals), (2, 1, 1), "plan: {:?}", plan.packs());
    assert_eq!(plan.cost(), 4.0);
}

/// Loads at non-adjacent addresses: no load pack may form, and the plan
/// is never worse than scalar.
#[test]
fn gather_without_consecutive_addresses() {
    let mut block = Block::new("body", 1);
    let mut xs = Vec::new();
    for i in 0..4 {
        let l = block.add_load(Type::Float, MemLoc::new(0, 2 * i));
        let b = block.add_arg(Type::Float);
        xs.push(block.add_binary(Type::Float, BinOp::FAdd, l, b));
    }
    for (i, &x) in xs.iter().enumerate() {
        block.add_store(MemLoc::new(2, i as i64), x);
    }
    let mut func = Function::new("gather");
    func.add_block(block);

    let table = InstTable::new();
    let cm = UnitCostModel;
    let packer = packer_over(&func, &table, &cm, PackerConfig::default());
    let plan = packer.optimize(0);

    assert!(
        plan.packs().iter().all(|p| !p.is_load()),
        "non-adjacent loads must not pack: {:?}",
        plan.packs()
    );
    assert!(plan.cost() <= scalar_baseline(&func, 0));
}

/// An aliasing store between two adjacent loads (storing the first
/// load's value over the second load's slot) makes the chain dependent:
/// no load pack may be committed.
#[test]
fn dependence_breaks_load_chain() {
    let mut block = Block::new("body", 1);
    let l1 = block.add_load(Type::Float, MemLoc::new(0, 0));
    block.add_store(MemLoc::new(0, 1), l1);
    let l2 = block.add_load(Type::Float, MemLoc::new(0, 1));
    let sum = block.add_binary(Type::Float, BinOp::FAdd, l1, l2);
    block.add_store(MemLoc::new(1, 0), sum);
    let mut func = Function::new("clobber");
    func.add_block(block);

    let table = InstTable::new();
    let cm = UnitCostModel;
    let packer = packer_over(&func, &table, &cm, PackerConfig::default());
    let plan = packer.optimize(0);
    assert!(
        plan.packs().iter().all(|p| !p.is_load()),
        "dependent loads must stay scalar: {:?}",
        plan.packs()
    );
}

fn phi_loop_header() -> Function {
    // Self-loop header: four parallel phis squared on the latch edge,
    // results stored each iteration.
    let mut block = Block::new("header", 2);
    let mut phis = Vec::new();
    for _ in 0..4 {
        let init = block.add_arg(Type::Float);
        phis.push(block.add_phi(Type::Float, [init, init]));
    }
    let mut muls = Vec::new();
    for (i, &p) in phis.iter().enumerate() {
        let m = block.add_binary(Type::Float, BinOp::FMul, p, p);
        block.set_phi_incoming(p, 1, m);
        block.add_store(MemLoc::new(0, i as i64), m);
        muls.push(m);
    }
    let mut func = Function::new("squares");
    func.add_block(block);
    func
}

/// Phi pack plus an fmul pack on the latch edge, cheaper than scalar.
#[test]
fn phi_pack_with_latch_fmuls() {
    let func = phi_loop_header();
    let table = InstTable::new();
    let cm = UnitCostModel;
    let config = PackerConfig {
        use_mcts: true,
        num_simulations: 2000,
        ..PackerConfig::default()
    };
    let packer = packer_over(&func, &table, &cm, config);
    let plan = packer.optimize(0);

    let baseline = scalar_baseline(&func, 0);
    assert!(
        plan.cost() < baseline,
        "expected packed loop body below {} scalar units, got {}",
        baseline,
        plan.cost()
    );
    assert!(
        plan.packs().iter().any(|p| p.is_phi()),
        "expected a phi pack: {:?}",
        plan.packs()
    );
    assert!(
        plan.packs()
            .iter()
            .any(|p| matches!(p.kind(), PackKind::General { .. })),
        "expected an fmul pack: {:?}",
        plan.packs()
    );
}

/// A frontier whose expansion yields exactly one child is a forced move:
/// the search runs a single iteration no matter the budget.
#[test]
fn forced_move_short_circuits() {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use superword::search::{Frontier, UctNode, UctSearch};
    use std::rc::Rc;

    let mut block = Block::new("b", 1);
    let v = block.add_arg(Type::Float);
    block.add_store(MemLoc::new(0, 0), v);
    let mut func = Function::new("one_store");
    func.add_block(block);

    let table = InstTable::new();
    let cm = UnitCostModel;
    let config = PackerConfig {
        use_mcts: true,
        ..PackerConfig::default()
    };
    let packer = packer_over(&func, &table, &cm, config);
    let state = packer.state(0);

    let search = UctSearch::new(state, packer.config(), None);
    let mut nodes = vec![UctNode::new_root(Rc::new(Frontier::start(state)))];
    let mut rng = StdRng::seed_from_u64(7);
    let ran = search.run(&mut nodes, 0, 5000, &mut rng);
    assert_eq!(ran, 1, "forced moves take exactly one iteration");
    assert_eq!(
        nodes[0].transitions.as_ref().map(|t| t.len()),
        Some(1),
        "the lone store is the only child"
    );
}
