use crate::ir::*;
use crate::target::CostModel;
use smallvec::SmallVec;
use std::rc::Rc;

/// A scalar operation pattern: opcode at a fixed bit width. This is what
/// the match manager scans blocks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation {
    pub op: BinOp,
    pub bitwidth: u32,
}

impl Operation {
    pub fn new(op: BinOp, bitwidth: u32) -> Self {
        Self { op, bitwidth }
    }

    /// Scalar element type this operation produces.
    pub fn elem_type(&self) -> Type {
        if self.op.is_float_op() {
            match self.bitwidth {
                32 => Type::Float,
                _ => Type::Double,
            }
        } else {
            Type::Int(self.bitwidth)
        }
    }

    /// Try to match a value against this pattern. The live-ins of the
    /// matched expression become the match inputs.
    pub fn match_value(&self, block: &Block, v: ValueId) -> Option<Match> {
        match &block.value(v).kind {
            ValueKind::Binary { op, lhs, rhs }
                if *op == self.op && block.value(v).ty.bit_width() == self.bitwidth =>
            {
                Some(Match {
                    inputs: SmallVec::from_slice(&[*lhs, *rhs]),
                    output: v,
                })
            }
            _ => None,
        }
    }
}

/// A successful pattern match: the expression rooted at `output` with the
/// given live-in values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub inputs: SmallVec<[ValueId; 2]>,
    pub output: ValueId,
}

impl Match {
    /// Instructions consumed when this match is folded into a vector
    /// lane. Single-level patterns replace only their root.
    pub fn intermediate_insts(&self) -> SmallVec<[ValueId; 4]> {
        SmallVec::from_slice(&[self.output])
    }
}

/// Slice of a producer input feeding one lane operand:
/// bits [lo, hi) of vector input `input_idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlice {
    pub input_idx: usize,
    pub lo: u32,
    pub hi: u32,
}

impl InputSlice {
    pub fn size(&self) -> u32 {
        self.hi - self.lo
    }
}

/// One lane of a vector instruction: the operation it performs and where
/// each of the operation's inputs comes from.
#[derive(Debug, Clone)]
pub struct BoundOperation {
    pub op: Operation,
    pub slices: SmallVec<[InputSlice; 2]>,
}

#[derive(Debug, Clone)]
pub struct InstSignature {
    pub input_widths: SmallVec<[u32; 2]>,
    pub output_width: u32,
}

/// A vector instruction the target can execute. The catalog is opaque to
/// the search: only the lane signature, the feature gate, and the cost
/// matter.
pub trait InstBinding {
    fn name(&self) -> &str;
    fn required_features(&self) -> &[String];
    fn signature(&self) -> &InstSignature;
    fn lane_ops(&self) -> &[BoundOperation];
    fn cost(&self, cm: &dyn CostModel) -> f32;

    fn num_lanes(&self) -> usize {
        self.lane_ops().len()
    }
}

/// Derived view of a binding: for each producer input slot, which lanes
/// contribute which match input at which slice offset. Used to turn a
/// row of matches into operand packs.
pub struct LaneBinding {
    // (slice, lane_id, input index within the lane's match)
    per_input: Vec<Vec<(InputSlice, usize, usize)>>,
}

impl LaneBinding {
    pub fn new(binding: &dyn InstBinding) -> Self {
        let num_inputs = binding.signature().input_widths.len();
        let mut per_input: Vec<Vec<(InputSlice, usize, usize)>> = vec![Vec::new(); num_inputs];
        for (lane_id, lane_op) in binding.lane_ops().iter().enumerate() {
            for (match_input_idx, slice) in lane_op.slices.iter().enumerate() {
                per_input[slice.input_idx].push((*slice, lane_id, match_input_idx));
            }
        }
        for contribs in &mut per_input {
            contribs.sort_by_key(|(slice, _, _)| slice.lo);
        }
        Self { per_input }
    }

    pub fn num_inputs(&self) -> usize {
        self.per_input.len()
    }

    /// Lay out producer input `input_idx` as a lane vector, given the
    /// match chosen for each lane. Missing lanes stay don't-care.
    pub fn apply(
        &self,
        binding: &dyn InstBinding,
        input_idx: usize,
        matches: &[Option<Match>],
    ) -> Vec<Option<ValueId>> {
        let contribs = &self.per_input[input_idx];
        let input_width = binding.signature().input_widths[input_idx];
        let elem_size = contribs
            .iter()
            .map(|(slice, _, _)| slice.size())
            .next()
            .unwrap_or(input_width);
        let num_elems = (input_width / elem_size) as usize;
        let mut out = vec![None; num_elems];
        for (slice, lane_id, match_input_idx) in contribs {
            if let Some(m) = &matches[*lane_id] {
                out[(slice.lo / elem_size) as usize] = Some(m.inputs[*match_input_idx]);
            }
        }
        out
    }
}

/// The IR-vector binding: `lanes` copies of a binary operation packed
/// into one vector register of `vector_width` bits.
#[derive(Debug, Clone)]
pub struct VectorBinding {
    op: Operation,
    name: String,
    features: Vec<String>,
    sig: InstSignature,
    lane_ops: Vec<BoundOperation>,
}

impl VectorBinding {
    pub fn create(op: Operation, vector_width: u32) -> Self {
        let elem_width = op.bitwidth;
        assert_eq!(vector_width % elem_width, 0, "partial lane in binding");
        let num_lanes = vector_width / elem_width;
        let mut lane_ops = Vec::with_capacity(num_lanes as usize);
        for i in 0..num_lanes {
            let lo = i * elem_width;
            let hi = lo + elem_width;
            lane_ops.push(BoundOperation {
                op,
                slices: SmallVec::from_slice(&[
                    InputSlice { input_idx: 0, lo, hi },
                    InputSlice { input_idx: 1, lo, hi },
                ]),
            });
        }
        Self {
            op,
            name: format!("{}.v{}i{}", op.op.name(), num_lanes, elem_width),
            features: Vec::new(),
            sig: InstSignature {
                input_widths: SmallVec::from_slice(&[vector_width, vector_width]),
                output_width: vector_width,
            },
            lane_ops,
        }
    }

    pub fn operation(&self) -> Operation {
        self.op
    }

    /// Gate this binding behind a target feature.
    pub fn require_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }
}

impl InstBinding for VectorBinding {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_features(&self) -> &[String] {
        &self.features
    }

    fn signature(&self) -> &InstSignature {
        &self.sig
    }

    fn lane_ops(&self) -> &[BoundOperation] {
        &self.lane_ops
    }

    fn cost(&self, cm: &dyn CostModel) -> f32 {
        cm.arith_cost(self.op.op, self.op.elem_type(), self.num_lanes())
    }
}

/// Enumerates every IR-vector binding once; the table is built by the
/// host and passed into the packer explicitly.
pub struct InstTable {
    bindings: Vec<Rc<dyn InstBinding>>,
}

const SCALAR_BITWIDTHS: [u32; 4] = [8, 16, 32, 64];
const VECTOR_BITWIDTHS: [u32; 3] = [64, 128, 256];

impl InstTable {
    pub fn new() -> Self {
        let mut bindings: Vec<Rc<dyn InstBinding>> = Vec::new();
        for op in BinOp::ALL {
            for sb in SCALAR_BITWIDTHS {
                if op.is_float_op() && sb != 32 && sb != 64 {
                    continue;
                }
                for vb in VECTOR_BITWIDTHS {
                    // Skip singleton packs.
                    if vb / sb <= 1 {
                        continue;
                    }
                    bindings.push(Rc::new(VectorBinding::create(Operation::new(op, sb), vb)));
                }
            }
        }
        Self { bindings }
    }

    pub fn bindings(&self) -> &[Rc<dyn InstBinding>] {
        &self.bindings
    }
}

impl Default for InstTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A binding is legal on a function only when its feature gate is met.
pub fn is_supported(binding: &dyn InstBinding, func: &Function) -> bool {
    binding
        .required_features()
        .iter()
        .all(|f| func.features.contains(f))
}
