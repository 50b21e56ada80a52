use crate::ir::*;

/// Sentinel for "the target cannot cost this". Packs whose cost is not
/// finite are rejected at canonicalization time.
pub const UNKNOWN_COST: f32 = f32::INFINITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasResult {
    NoAlias,
    MayAlias,
    MustAlias,
}

/// Per-block aliasing oracle over memory instructions.
pub trait AliasOracle {
    fn alias(&self, block: &Block, a: ValueId, b: ValueId) -> AliasResult;
}

/// Adjacency oracle: whether access `b` starts exactly one element after
/// access `a`. Stands in for scalar-evolution reasoning.
pub trait AdjacencyOracle {
    fn is_consecutive(&self, block: &Block, a: ValueId, b: ValueId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleKind {
    Broadcast,
    PermuteSingleSrc,
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemOp {
    Extract,
    Insert,
}

/// Target cost interface. Deterministic and pure; the packer never calls
/// it concurrently from more than one thread per block.
pub trait CostModel {
    fn arith_cost(&self, op: BinOp, ty: Type, lanes: usize) -> f32;
    fn mem_op_cost(&self, kind: MemKind, ty: Type, lanes: usize) -> f32;
    fn shuffle_cost(&self, kind: ShuffleKind, ty: Type, lanes: usize) -> f32;
    /// Cost of moving one scalar into or out of a vector lane.
    fn elem_cost(&self, op: ElemOp, ty: Type, lanes: usize, lane: usize) -> f32;

    /// Cost of running one instruction scalar. Phis are free: they become
    /// register assignments on the incoming edges either way.
    fn scalar_cost(&self, block: &Block, inst: ValueId) -> f32 {
        match &block.value(inst).kind {
            ValueKind::Binary { op, .. } => self.arith_cost(*op, block.value(inst).ty, 1),
            ValueKind::Load { .. } => self.mem_op_cost(MemKind::Load, block.value(inst).ty, 1),
            ValueKind::Store { .. } => self.mem_op_cost(MemKind::Store, block.value(inst).ty, 1),
            ValueKind::Phi { .. } => 0.0,
            _ => 0.0,
        }
    }
}

/// Resolves aliasing and adjacency from the abstract `MemLoc` addresses:
/// equal bases compare by offset, distinct bases never alias.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemLocOracle;

impl AliasOracle for MemLocOracle {
    fn alias(&self, block: &Block, a: ValueId, b: ValueId) -> AliasResult {
        let (la, lb) = match (block.mem_access(a), block.mem_access(b)) {
            (Some((_, la)), Some((_, lb))) => (la, lb),
            _ => return AliasResult::NoAlias,
        };
        if la.base != lb.base {
            return AliasResult::NoAlias;
        }
        if la.offset == lb.offset {
            // Widths are one element in this model, so equal offsets on
            // the same base are the same slot.
            if block.value(a).ty == block.value(b).ty {
                AliasResult::MustAlias
            } else {
                AliasResult::MayAlias
            }
        } else {
            AliasResult::NoAlias
        }
    }
}

impl AdjacencyOracle for MemLocOracle {
    fn is_consecutive(&self, block: &Block, a: ValueId, b: ValueId) -> bool {
        let (la, lb) = match (block.mem_access(a), block.mem_access(b)) {
            (Some((_, la)), Some((_, lb))) => (la, lb),
            _ => return false,
        };
        la.base == lb.base
            && lb.offset == la.offset + 1
            && block.value(a).ty == block.value(b).ty
    }
}

/// Flat cost model: every operation costs one unit at any width, element
/// moves cost one unit. Packing k lanes saves k-1 units before gather
/// overhead, which makes the unit model a sharp test oracle.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnitCostModel;

impl CostModel for UnitCostModel {
    fn arith_cost(&self, _op: BinOp, _ty: Type, _lanes: usize) -> f32 {
        1.0
    }

    fn mem_op_cost(&self, _kind: MemKind, _ty: Type, _lanes: usize) -> f32 {
        1.0
    }

    fn shuffle_cost(&self, _kind: ShuffleKind, _ty: Type, _lanes: usize) -> f32 {
        1.0
    }

    fn elem_cost(&self, _op: ElemOp, _ty: Type, _lanes: usize, _lane: usize) -> f32 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memloc_oracle_adjacency_and_alias() {
        let mut block = Block::new("b", 1);
        let l0 = block.add_load(Type::Float, MemLoc::new(0, 0));
        let l1 = block.add_load(Type::Float, MemLoc::new(0, 1));
        let l_far = block.add_load(Type::Float, MemLoc::new(0, 5));
        let other = block.add_load(Type::Float, MemLoc::new(1, 1));
        let v = block.add_arg(Type::Float);
        let st = block.add_store(MemLoc::new(0, 1), v);

        let o = MemLocOracle;
        assert!(o.is_consecutive(&block, l0, l1));
        assert!(!o.is_consecutive(&block, l1, l0));
        assert!(!o.is_consecutive(&block, l0, l_far));
        assert!(!o.is_consecutive(&block, l0, other));

        assert_eq!(o.alias(&block, l1, st), AliasResult::MustAlias);
        assert_eq!(o.alias(&block, l0, st), AliasResult::NoAlias);
        assert_eq!(o.alias(&block, other, st), AliasResult::NoAlias);
    }
}
