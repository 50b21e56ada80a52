use superword::catalog::InstTable;
use superword::ir::*;
use superword::search::policy::{PolicyModel, PolicyRequest, ThreadedPolicy};
use superword::search::SearchObserver;
use superword::target::{MemLocOracle, UnitCostModel};
use superword::{DecisionRecord, Packer, PackerConfig, PackingPolicy};

struct UniformPrior;

impl PolicyModel for UniformPrior {
    fn max_num_lanes(&self) -> usize {
        8
    }

    fn batch_forward(&self, batch: &[PolicyRequest]) -> Vec<Vec<f32>> {
        batch
            .iter()
            .map(|req| vec![1.0 / req.num_transitions.max(1) as f32; req.num_transitions])
            .collect()
    }
}

#[derive(Default)]
struct Recorder {
    records: Vec<DecisionRecord>,
}

impl SearchObserver for Recorder {
    fn on_decision(&mut self, record: DecisionRecord) {
        self.records.push(record);
    }
}

fn store_block() -> Function {
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
    let mut func = Function::new("guided");
    func.add_block(block);
    func
}

/// The MCTS path runs under a live worker-pool policy and reports every
/// root decision to the observer; the result still beats scalar.
#[test]
fn guided_search_with_observer() {
    let func = store_block();
    let table = InstTable::new();
    let cm = UnitCostModel;
    let config = PackerConfig {
        use_mcts: true,
        num_simulations: 300,
        batch_size: 4,
        num_threads: 2,
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

    let policy = ThreadedPolicy::new(UniformPrior, 2, 4, 32);
    let mut recorder = Recorder::default();
    let plan = packer.optimize_with(0, Some(&policy), Some(&mut recorder));

    assert!(
        plan.cost() < 12.0,
        "guided search should still vectorize, got {}",
        plan.cost()
    );
    assert!(
        !recorder.records.is_empty(),
        "every root decision must be observed"
    );
    for record in &recorder.records {
        assert!(record.chosen < record.num_transitions);
        assert_eq!(record.block, "body");
    }
}

/// Search runs fine after the policy is cancelled: empty weights mean
/// "no prior".
#[test]
fn cancelled_policy_degrades_to_uniform() {
    let func = store_block();
    let table = InstTable::new();
    let cm = UnitCostModel;
    let config = PackerConfig {
        use_mcts: true,
        num_simulations: 200,
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

    let policy = ThreadedPolicy::new(UniformPrior, 1, 8, 16);
    policy.cancel();
    let plan = packer.optimize_with(0, Some(&policy), None);
    assert!(plan.cost() <= 12.0);
}
