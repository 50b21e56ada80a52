use crate::bitset::BitSet;
use crate::ir::*;
use crate::target::{AliasOracle, AliasResult};
use smallvec::SmallVec;

/// Block-local dependence: for each instruction, the transitively closed
/// set of earlier instructions it must execute after, and the derived set
/// of instructions it can be co-scheduled with.
pub struct DependenceAnalysis {
    depended: Vec<BitSet>,
    independent: Vec<BitSet>,
}

impl DependenceAnalysis {
    pub fn new(
        block: &Block,
        alias: &dyn AliasOracle,
        max_search_dist: usize,
    ) -> Self {
        let n = block.num_values();
        let mut depended = vec![BitSet::new(n); n];

        // Memory accesses seen so far, in program order.
        let mut accesses: SmallVec<[ValueId; 16]> = SmallVec::new();
        // Everything further back than max_search_dist. Transitively
        // closed by construction: any dependence of an instruction in
        // here sits at an even earlier position.
        let mut far = BitSet::new(n);

        for (pos, &inst) in block.insts().iter().enumerate() {
            let mut dep = BitSet::new(n);

            for op in block.operands(inst) {
                if !block.is_inst(op) {
                    continue;
                }
                // Back-edge references (phi incomings defined below) do
                // not order execution within the block.
                if block.position(op).unwrap() >= pos {
                    continue;
                }
                dep.set(op);
                dep.union_with(&depended[op]);
            }

            if let Some((kind, _)) = block.mem_access(inst) {
                for &prior in &accesses {
                    let (prior_kind, _) = block.mem_access(prior).unwrap();
                    // Two reads never conflict.
                    if kind == MemKind::Load && prior_kind == MemKind::Load {
                        continue;
                    }
                    if alias.alias(block, inst, prior) != AliasResult::NoAlias {
                        dep.set(prior);
                        dep.union_with(&depended[prior]);
                    }
                }
                accesses.push(inst);
            }

            if pos > max_search_dist {
                far.set(block.insts()[pos - max_search_dist - 1]);
                dep.union_with(&far);
            }

            depended[inst] = dep;
        }

        // Reverse index: who transitively depends on each instruction.
        let mut dependents = vec![BitSet::new(n); n];
        for &inst in block.insts() {
            for d in depended[inst].iter() {
                dependents[d].set(inst);
            }
        }

        let mut all_insts = BitSet::new(n);
        for &inst in block.insts() {
            all_insts.set(inst);
        }

        let mut independent = vec![BitSet::new(n); n];
        for &inst in block.insts() {
            let mut ind = all_insts.clone();
            ind.subtract(&depended[inst]);
            ind.subtract(&dependents[inst]);
            ind.clear(inst);
            independent[inst] = ind;
        }

        Self {
            depended,
            independent,
        }
    }

    pub fn depended(&self, inst: ValueId) -> &BitSet {
        &self.depended[inst]
    }

    pub fn independent(&self, inst: ValueId) -> &BitSet {
        &self.independent[inst]
    }

    /// Whether two instructions may land in the same pack.
    pub fn is_independent_pair(&self, a: ValueId, b: ValueId) -> bool {
        a != b && !self.depended[a].test(b) && !self.depended[b].test(a)
    }

    /// Whether `inst` can join a pack already covering `elements` with
    /// accumulated dependences `depended`.
    pub fn compatible(&self, inst: ValueId, elements: &BitSet, depended: &BitSet) -> bool {
        !elements.test(inst)
            && !depended.test(inst)
            && !self.depended[inst].any_common(elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::MemLocOracle;

    #[test]
    fn transitive_closure_through_operands() {
        let mut block = Block::new("b", 1);
        let a = block.add_arg(Type::Int(32));
        let x = block.add_binary(Type::Int(32), BinOp::Add, a, a);
        let y = block.add_binary(Type::Int(32), BinOp::Add, x, a);
        let z = block.add_binary(Type::Int(32), BinOp::Add, y, a);

        let lda = DependenceAnalysis::new(&block, &MemLocOracle, 1000);
        assert!(lda.depended(z).test(y));
        assert!(lda.depended(z).test(x), "closure must include x through y");
        assert!(!lda.depended(x).test(y));
        assert!(!lda.is_independent_pair(x, z));
    }

    #[test]
    fn aliasing_store_orders_later_load() {
        let mut block = Block::new("b", 1);
        let v = block.add_arg(Type::Float);
        let l0 = block.add_load(Type::Float, MemLoc::new(0, 0));
        let st = block.add_store(MemLoc::new(0, 1), v);
        let l1 = block.add_load(Type::Float, MemLoc::new(0, 1));
        let l2 = block.add_load(Type::Float, MemLoc::new(0, 2));

        let lda = DependenceAnalysis::new(&block, &MemLocOracle, 1000);
        assert!(lda.depended(l1).test(st), "load after aliasing store");
        assert!(!lda.depended(l2).test(st), "no-alias load stays free");
        assert!(!lda.depended(l1).test(l0), "reads never conflict");
        assert!(lda.is_independent_pair(l0, l2));
        assert!(!lda.is_independent_pair(st, l1));
    }

    #[test]
    fn search_distance_cuts_far_pairs() {
        let mut block = Block::new("b", 1);
        let a = block.add_arg(Type::Int(32));
        let mut insts = Vec::new();
        for _ in 0..8 {
            insts.push(block.add_binary(Type::Int(32), BinOp::Add, a, a));
        }
        let lda = DependenceAnalysis::new(&block, &MemLocOracle, 3);
        assert!(lda.is_independent_pair(insts[0], insts[3]));
        assert!(!lda.is_independent_pair(insts[0], insts[7]));
        assert!(lda.depended(insts[7]).test(insts[2]));
    }
}
