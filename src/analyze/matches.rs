use crate::catalog::{InstBinding, Match, Operation};
use crate::ir::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::rc::Rc;

/// Per-block cache of every pattern match of every catalog operation.
/// Matches are kept sorted by output id so lookups by output are a
/// binary-search range.
pub struct MatchManager {
    matches: FxHashMap<Operation, Vec<Match>>,
}

impl MatchManager {
    pub fn new(bindings: &[Rc<dyn InstBinding>], block: &Block) -> Self {
        let mut ops: FxHashSet<Operation> = FxHashSet::default();
        for binding in bindings {
            for lane_op in binding.lane_ops() {
                ops.insert(lane_op.op);
            }
        }

        let mut matches: FxHashMap<Operation, Vec<Match>> = FxHashMap::default();
        for op in ops {
            let mut found = Vec::new();
            for v in block.values() {
                if let Some(m) = op.match_value(block, v.id) {
                    found.push(m);
                }
            }
            found.sort_by_key(|m| m.output);
            // The same (operation, output) pair is recorded at most once
            // per recognized shape.
            found.dedup();
            matches.insert(op, found);
        }
        Self { matches }
    }

    pub fn matches_for(&self, op: Operation) -> &[Match] {
        self.matches.get(&op).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn matches_for_output(&self, op: Operation, output: ValueId) -> &[Match] {
        let all = self.matches_for(op);
        let lo = all.partition_point(|m| m.output < output);
        let hi = all.partition_point(|m| m.output <= output);
        &all[lo..hi]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InstTable;

    #[test]
    fn finds_and_indexes_matches() {
        let mut block = Block::new("b", 1);
        let a = block.add_arg(Type::Float);
        let b = block.add_arg(Type::Float);
        let x = block.add_binary(Type::Float, BinOp::FAdd, a, b);
        let y = block.add_binary(Type::Float, BinOp::FAdd, b, a);
        let _z = block.add_binary(Type::Float, BinOp::FMul, x, y);

        let table = InstTable::new();
        let mm = MatchManager::new(table.bindings(), &block);

        let fadd = Operation::new(BinOp::FAdd, 32);
        assert_eq!(mm.matches_for(fadd).len(), 2);
        let for_y = mm.matches_for_output(fadd, y);
        assert_eq!(for_y.len(), 1);
        assert_eq!(for_y[0].inputs.as_slice(), &[b, a]);
        assert!(mm.matches_for_output(fadd, a).is_empty());

        let fmul = Operation::new(BinOp::FMul, 32);
        assert_eq!(mm.matches_for(fmul).len(), 1);
    }
}
