use crate::ir::*;
use crate::target::AdjacencyOracle;
use rustc_hash::FxHashMap;

/// Directed graph over same-kind memory accesses: edge A -> B iff B reads
/// or writes the element immediately after A. Built once per block with a
/// quadratic scan; a node may have several successors (distinct accesses
/// of the same slot).
pub struct AccessDag {
    next: FxHashMap<ValueId, Vec<ValueId>>,
}

impl AccessDag {
    pub fn build(block: &Block, accesses: &[ValueId], adj: &dyn AdjacencyOracle) -> Self {
        let mut next: FxHashMap<ValueId, Vec<ValueId>> = FxHashMap::default();
        for &a in accesses {
            for &b in accesses {
                if a == b {
                    continue;
                }
                if block.value(a).ty != block.value(b).ty {
                    continue;
                }
                if adj.is_consecutive(block, a, b) {
                    let succs = next.entry(a).or_default();
                    if !succs.contains(&b) {
                        succs.push(b);
                    }
                }
            }
        }
        Self { next }
    }

    pub fn successors(&self, a: ValueId) -> &[ValueId] {
        self.next.get(&a).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::MemLocOracle;

    #[test]
    fn chains_follow_offsets() {
        let mut block = Block::new("b", 1);
        let l0 = block.add_load(Type::Float, MemLoc::new(0, 0));
        let l1 = block.add_load(Type::Float, MemLoc::new(0, 1));
        let l1b = block.add_load(Type::Float, MemLoc::new(0, 1));
        let l3 = block.add_load(Type::Float, MemLoc::new(0, 3));
        let other = block.add_load(Type::Double, MemLoc::new(0, 1));

        let dag = AccessDag::build(&block, &[l0, l1, l1b, l3, other], &MemLocOracle);
        let mut succs = dag.successors(l0).to_vec();
        succs.sort_unstable();
        assert_eq!(succs, vec![l1, l1b], "both duplicates are successors");
        assert!(dag.successors(l1).is_empty(), "gap breaks the chain");
        assert!(dag.successors(l3).is_empty());
        assert!(dag.successors(other).is_empty(), "type mismatch");
    }
}
