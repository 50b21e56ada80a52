use std::rc::Rc;
use superword::catalog::InstTable;
use superword::ir::*;
use superword::search::plan::Plan;
use superword::target::{AdjacencyOracle, MemLocOracle, UnitCostModel};
use superword::{Packer, PackerConfig};

fn stores_of_sums() -> Function {
    let mut block = Block::new("body", 1);
    let mut xs = Vec::new();
    for i in 0..8 {
        let a = block.add_load(Type::Float, MemLoc::new(0, i));
        let b = block.add_load(Type::Float, MemLoc::new(1, i));
        xs.push(block.add_binary(Type::Float, BinOp::FAdd, a, b));
    }
    for (i, &x) in xs.iter().enumerate() {
        block.add_store(MemLoc::new(2, i as i64), x);
    }
    let mut func = Function::new("wide");
    func.add_block(block);
    func
}

#[test]
fn pack_elements_mirror_lanes_and_stay_independent() {
    let func = stores_of_sums();
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
    let plan = packer.optimize(0);
    assert!(!plan.packs().is_empty(), "expected the block to vectorize");
    let state = packer.state(0);

    for pack in plan.packs() {
        let non_null = pack.ordered_values().iter().flatten().count();
        assert_eq!(pack.elements().count(), non_null);

        let values: Vec<ValueId> = pack.ordered_values().iter().flatten().copied().collect();
        for &u in &values {
            for &v in &values {
                if u != v {
                    assert!(
                        !state.lda.depended(u).test(v) && !state.lda.depended(v).test(u),
                        "lanes %{} and %{} of {:?} are ordered",
                        u,
                        v,
                        pack
                    );
                }
            }
        }
    }
}

#[test]
fn add_then_remove_restores_cost() {
    let func = stores_of_sums();
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
    let reference = packer.optimize(0);

    let mut plan = Plan::new(state);
    let before = plan.cost();
    for pack in reference.packs() {
        assert!(plan.add(state, pack));
        assert!(plan.verify_cost(state));
    }
    for pack in reference.packs() {
        plan.remove(state, pack);
        assert!(plan.verify_cost(state));
    }
    assert!(
        (plan.cost() - before).abs() < 1e-4,
        "cost must return to {} after removals, got {}",
        before,
        plan.cost()
    );
    assert!(plan.packs().is_empty());
}

#[test]
fn operand_pack_canonicalization_is_pointer_stable() {
    let func = stores_of_sums();
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
    let ctx = &packer.state(0).vpctx;
    let a = ctx.get_canonical_operand_pack(vec![Some(0), Some(2), None]);
    let b = ctx.get_canonical_operand_pack(vec![Some(0), Some(2), None]);
    assert!(Rc::ptr_eq(&a, &b));
}

#[test]
fn load_packs_are_chain_consecutive() {
    let func = stores_of_sums();
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
    let plan = packer.optimize(0);
    let block = func.block(0);

    for pack in plan.packs().iter().filter(|p| p.is_load()) {
        for pair in pack.ordered_values().windows(2) {
            if let [Some(a), Some(b)] = pair {
                assert!(
                    MemLocOracle.is_consecutive(block, *a, *b),
                    "lanes %{} -> %{} of {:?} are not adjacent",
                    a,
                    b,
                    pack
                );
            }
        }
    }
}
