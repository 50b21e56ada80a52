use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::fmt;

pub type ValueId = usize;
/// Index of an incoming control-flow edge of the block (phis select by it).
pub type EdgeId = usize;

/// Scalar element type. Every type has a fixed bit width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Int(u32),
    Float,
    Double,
}

impl Type {
    pub fn bit_width(self) -> u32 {
        match self {
            Type::Int(bits) => bits,
            Type::Float => 32,
            Type::Double => 64,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Type::Float | Type::Double)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    FAdd,
    Sub,
    FSub,
    Mul,
    FMul,
    UDiv,
    SDiv,
    FDiv,
    URem,
    SRem,
    FRem,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
}

impl BinOp {
    pub const ALL: [BinOp; 18] = [
        BinOp::Add,
        BinOp::FAdd,
        BinOp::Sub,
        BinOp::FSub,
        BinOp::Mul,
        BinOp::FMul,
        BinOp::UDiv,
        BinOp::SDiv,
        BinOp::FDiv,
        BinOp::URem,
        BinOp::SRem,
        BinOp::FRem,
        BinOp::Shl,
        BinOp::LShr,
        BinOp::AShr,
        BinOp::And,
        BinOp::Or,
        BinOp::Xor,
    ];

    pub fn is_float_op(self) -> bool {
        matches!(
            self,
            BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv | BinOp::FRem
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::FAdd => "fadd",
            BinOp::Sub => "sub",
            BinOp::FSub => "fsub",
            BinOp::Mul => "mul",
            BinOp::FMul => "fmul",
            BinOp::UDiv => "udiv",
            BinOp::SDiv => "sdiv",
            BinOp::FDiv => "fdiv",
            BinOp::URem => "urem",
            BinOp::SRem => "srem",
            BinOp::FRem => "frem",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::AShr => "ashr",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
}

/// Abstract memory address: a numbered base object plus an element offset.
/// The default oracles decide aliasing and adjacency from it; offsets are
/// in units of the accessed element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemLoc {
    pub base: u32,
    pub offset: i64,
}

impl MemLoc {
    pub fn new(base: u32, offset: i64) -> Self {
        Self { base, offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    Load,
    Store,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    // Typed literal. Constants never cost anything.
    Const(Constant),
    // Defined outside the block: a function argument or an instruction
    // of another block. Opaque to the pack search.
    Arg,
    Binary {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    Load {
        loc: MemLoc,
    },
    Store {
        loc: MemLoc,
        value: ValueId,
    },
    // One incoming value per edge of the block, indexed by EdgeId.
    Phi {
        incomings: SmallVec<[ValueId; 2]>,
    },
}

impl ValueKind {
    pub fn is_inst(&self) -> bool {
        !matches!(self, ValueKind::Const(_) | ValueKind::Arg)
    }
}

#[derive(Debug, Clone)]
pub struct Value {
    pub id: ValueId,
    pub ty: Type,
    pub kind: ValueKind,
}

/// A straight-line basic block: the unit the packer optimizes.
///
/// Values live in one dense vector, ids are indices into it (the same
/// layout the dependence bitsets are built over). Instructions carry an
/// additional program-order position.
#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    values: Vec<Value>,
    insts: Vec<ValueId>,
    // position in `insts`, usize::MAX for non-instructions
    positions: Vec<usize>,
    num_edges: usize,
    live_outs: FxHashSet<ValueId>,
}

const NOT_AN_INST: usize = usize::MAX;

impl Block {
    pub fn new(name: impl Into<String>, num_edges: usize) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            insts: Vec::new(),
            positions: Vec::new(),
            num_edges,
            live_outs: FxHashSet::default(),
        }
    }

    fn add_value(&mut self, ty: Type, kind: ValueKind) -> ValueId {
        let id = self.values.len();
        let is_inst = kind.is_inst();
        self.values.push(Value { id, ty, kind });
        if is_inst {
            self.positions.push(self.insts.len());
            self.insts.push(id);
        } else {
            self.positions.push(NOT_AN_INST);
        }
        id
    }

    pub fn add_const(&mut self, ty: Type, c: Constant) -> ValueId {
        self.add_value(ty, ValueKind::Const(c))
    }

    pub fn add_arg(&mut self, ty: Type) -> ValueId {
        self.add_value(ty, ValueKind::Arg)
    }

    pub fn add_binary(&mut self, ty: Type, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.add_value(ty, ValueKind::Binary { op, lhs, rhs })
    }

    pub fn add_load(&mut self, ty: Type, loc: MemLoc) -> ValueId {
        self.add_value(ty, ValueKind::Load { loc })
    }

    pub fn add_store(&mut self, loc: MemLoc, value: ValueId) -> ValueId {
        let ty = self.values[value].ty;
        self.add_value(ty, ValueKind::Store { loc, value })
    }

    pub fn add_phi(&mut self, ty: Type, incomings: impl IntoIterator<Item = ValueId>) -> ValueId {
        let incomings: SmallVec<[ValueId; 2]> = incomings.into_iter().collect();
        self.add_value(ty, ValueKind::Phi { incomings })
    }

    /// Patch one incoming of a phi. Needed when building loops: the
    /// back-edge value is defined after the phi.
    pub fn set_phi_incoming(&mut self, phi: ValueId, edge: EdgeId, value: ValueId) {
        match &mut self.values[phi].kind {
            ValueKind::Phi { incomings } => incomings[edge] = value,
            _ => panic!("set_phi_incoming on non-phi %{}", phi),
        }
    }

    /// Mark a value as used outside the block.
    pub fn mark_live_out(&mut self, v: ValueId) {
        self.live_outs.insert(v);
    }

    pub fn is_live_out(&self, v: ValueId) -> bool {
        self.live_outs.contains(&v)
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id]
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Instruction ids in program order.
    pub fn insts(&self) -> &[ValueId] {
        &self.insts
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    pub fn is_inst(&self, id: ValueId) -> bool {
        self.positions[id] != NOT_AN_INST
    }

    /// Program-order position of an instruction.
    pub fn position(&self, id: ValueId) -> Option<usize> {
        match self.positions[id] {
            NOT_AN_INST => None,
            p => Some(p),
        }
    }

    /// Value operands of an instruction (phis include every incoming).
    pub fn operands(&self, id: ValueId) -> SmallVec<[ValueId; 2]> {
        match &self.values[id].kind {
            ValueKind::Binary { lhs, rhs, .. } => SmallVec::from_slice(&[*lhs, *rhs]),
            ValueKind::Store { value, .. } => SmallVec::from_slice(&[*value]),
            ValueKind::Phi { incomings } => incomings.clone(),
            _ => SmallVec::new(),
        }
    }

    pub fn mem_access(&self, id: ValueId) -> Option<(MemKind, MemLoc)> {
        match &self.values[id].kind {
            ValueKind::Load { loc } => Some((MemKind::Load, *loc)),
            ValueKind::Store { loc, .. } => Some((MemKind::Store, *loc)),
            _ => None,
        }
    }

    pub fn is_phi(&self, id: ValueId) -> bool {
        matches!(self.values[id].kind, ValueKind::Phi { .. })
    }

    pub fn is_store(&self, id: ValueId) -> bool {
        matches!(self.values[id].kind, ValueKind::Store { .. })
    }

    /// In-block users of every value, indexed by id. Built once per block
    /// by the packer; phi incomings count as uses.
    pub fn compute_users(&self) -> Vec<SmallVec<[ValueId; 4]>> {
        let mut users: Vec<SmallVec<[ValueId; 4]>> = vec![SmallVec::new(); self.values.len()];
        for &inst in &self.insts {
            for op in self.operands(inst) {
                users[op].push(inst);
            }
        }
        users
    }
}

/// A function: named blocks plus the target features the enclosing
/// function was compiled with (bindings are gated on them).
#[derive(Debug, Clone, Default)]
pub struct Function {
    pub name: String,
    pub features: FxHashSet<String>,
    blocks: Vec<Block>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: FxHashSet::default(),
            blocks: Vec::new(),
        }
    }

    pub fn add_feature(&mut self, feature: impl Into<String>) {
        self.features.insert(feature.into());
    }

    pub fn add_block(&mut self, block: Block) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, idx: usize) -> &Block {
        &self.blocks[idx]
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block {} ({} edges):", self.name, self.num_edges)?;
        for &id in &self.insts {
            let v = &self.values[id];
            match &v.kind {
                ValueKind::Binary { op, lhs, rhs } => {
                    writeln!(f, "  %{} = {} %{}, %{}", id, op.name(), lhs, rhs)?
                }
                ValueKind::Load { loc } => {
                    writeln!(f, "  %{} = load {}[{}]", id, loc.base, loc.offset)?
                }
                ValueKind::Store { loc, value } => {
                    writeln!(f, "  store {}[{}], %{}", loc.base, loc.offset, value)?
                }
                ValueKind::Phi { incomings } => {
                    write!(f, "  %{} = phi", id)?;
                    for (edge, inc) in incomings.iter().enumerate() {
                        write!(f, " [{}: %{}]", edge, inc)?;
                    }
                    writeln!(f)?
                }
                _ => unreachable!("non-instruction in program order"),
            }
        }
        Ok(())
    }
}
