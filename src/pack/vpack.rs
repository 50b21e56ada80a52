use crate::bitset::BitSet;
use crate::catalog::{InstBinding, Match};
use crate::ir::*;
use crate::pack::operand::{Lane, OpRef};
use std::fmt;
use std::rc::Rc;

/// What a pack is made of. A tagged variant, not a class hierarchy: each
/// variant carries only the fields it needs.
pub enum PackKind {
    /// Chain-consecutive loads; null entries are don't-care lanes.
    Load(Vec<Lane>),
    /// Chain-consecutive stores.
    Store(Vec<Lane>),
    /// Isomorphic phis of a common type.
    Phi(Vec<ValueId>),
    /// A catalog instruction with one match per lane.
    General {
        binding: Rc<dyn InstBinding>,
        matches: Vec<Option<Match>>,
    },
}

/// A group of scalar instructions fused into one SIMD instruction.
/// Immutable after creation; construction happens only through the pack
/// context, which also computes the cost.
pub struct VectorPack {
    id: u32,
    kind: PackKind,
    elem_ty: Type,
    elements: BitSet,
    depended: BitSet,
    producing_cost: f32,
    operand_packs: Vec<OpRef>,
    ordered_values: Vec<Lane>,
    /// Instructions this pack replaces, highest program position first.
    replaced: Vec<ValueId>,
}

pub type PackRef = Rc<VectorPack>;

impl VectorPack {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        kind: PackKind,
        elem_ty: Type,
        elements: BitSet,
        depended: BitSet,
        producing_cost: f32,
        operand_packs: Vec<OpRef>,
        ordered_values: Vec<Lane>,
        replaced: Vec<ValueId>,
    ) -> Self {
        debug_assert_eq!(
            elements.count(),
            ordered_values.iter().flatten().count(),
            "element set must mirror the non-null lanes"
        );
        Self {
            id,
            kind,
            elem_ty,
            elements,
            depended,
            producing_cost,
            operand_packs,
            ordered_values,
            replaced,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> &PackKind {
        &self.kind
    }

    pub fn is_load(&self) -> bool {
        matches!(self.kind, PackKind::Load(_))
    }

    pub fn is_store(&self) -> bool {
        matches!(self.kind, PackKind::Store(_))
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, PackKind::Phi(_))
    }

    pub fn elem_ty(&self) -> Type {
        self.elem_ty
    }

    /// Scalar ids this pack covers.
    pub fn elements(&self) -> &BitSet {
        &self.elements
    }

    /// Union of the elements' transitive dependences.
    pub fn depended(&self) -> &BitSet {
        &self.depended
    }

    pub fn producing_cost(&self) -> f32 {
        self.producing_cost
    }

    pub fn operand_packs(&self) -> &[OpRef] {
        &self.operand_packs
    }

    /// Lane-ordered output values; null lanes are don't-care.
    pub fn ordered_values(&self) -> &[Lane] {
        &self.ordered_values
    }

    pub fn replaced_insts(&self) -> &[ValueId] {
        &self.replaced
    }

    pub fn num_lanes(&self) -> usize {
        self.ordered_values.len()
    }

    /// Lane index of an element value.
    pub fn lane_of(&self, v: ValueId) -> Option<usize> {
        self.ordered_values.iter().position(|l| *l == Some(v))
    }

    /// Whether this pack's output vector is exactly `lanes`.
    pub fn produces_exactly(&self, lanes: &[Lane]) -> bool {
        self.ordered_values == lanes
    }

    /// Same value set as `lanes` (ignoring nulls), different order: a
    /// single-source permutation away.
    pub fn produces_permutation_of(&self, lanes: &[Lane]) -> bool {
        let mut mine: Vec<ValueId> = self.ordered_values.iter().flatten().copied().collect();
        let mut theirs: Vec<ValueId> = lanes.iter().flatten().copied().collect();
        if mine.len() != theirs.len() {
            return false;
        }
        mine.sort_unstable();
        theirs.sort_unstable();
        mine == theirs
    }
}

impl PartialEq for VectorPack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for VectorPack {}

impl fmt::Debug for VectorPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match &self.kind {
            PackKind::Load(_) => "load",
            PackKind::Store(_) => "store",
            PackKind::Phi(_) => "phi",
            PackKind::General { binding, .. } => binding.name(),
        };
        write!(f, "pack<{}>(", tag)?;
        for (i, lane) in self.ordered_values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match lane {
                Some(v) => write!(f, "%{}", v)?,
                None => write!(f, "_")?,
            }
        }
        write!(f, ")")
    }
}
