use crate::ir::*;
use std::fmt;

#[derive(Debug)]
pub enum VerifyError {
    BadOperand {
        inst: ValueId,
        operand: ValueId,
    },
    UseBeforeDef {
        inst: ValueId,
        operand: ValueId,
    },
    PhiArity {
        phi: ValueId,
        expected: usize,
        got: usize,
    },
    PhiNotLeading {
        phi: ValueId,
    },
    StoreHasUsers {
        store: ValueId,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::BadOperand { inst, operand } => {
                write!(f, "Instruction {} has invalid operand {}", inst, operand)
            }
            VerifyError::UseBeforeDef { inst, operand } => {
                write!(f, "Instruction {} uses {} before its definition", inst, operand)
            }
            VerifyError::PhiArity { phi, expected, got } => write!(
                f,
                "Phi {} has wrong incoming count. Expected {}, got {}",
                phi, expected, got
            ),
            VerifyError::PhiNotLeading { phi } => {
                write!(f, "Phi {} appears after a non-phi instruction", phi)
            }
            VerifyError::StoreHasUsers { store } => {
                write!(f, "Store {} is used as an operand", store)
            }
        }
    }
}

impl std::error::Error for VerifyError {}

/// Structural checks on a block before packing. Phis must lead the block
/// and agree with the edge count; non-phi operands must be defined and
/// precede their users in program order.
pub fn verify(block: &Block) -> Result<(), VerifyError> {
    let mut seen_non_phi = false;
    for &inst in block.insts() {
        let is_phi = block.is_phi(inst);
        if is_phi && seen_non_phi {
            return Err(VerifyError::PhiNotLeading { phi: inst });
        }
        if !is_phi {
            seen_non_phi = true;
        }

        if let ValueKind::Phi { incomings } = &block.value(inst).kind {
            if incomings.len() != block.num_edges() {
                return Err(VerifyError::PhiArity {
                    phi: inst,
                    expected: block.num_edges(),
                    got: incomings.len(),
                });
            }
        }

        for op in block.operands(inst) {
            if op >= block.num_values() {
                return Err(VerifyError::BadOperand { inst, operand: op });
            }
            if block.is_store(op) {
                return Err(VerifyError::StoreHasUsers { store: op });
            }
            // Phis may reference later instructions (back-edge values).
            if !is_phi {
                if let (Some(op_pos), Some(inst_pos)) = (block.position(op), block.position(inst)) {
                    if op_pos >= inst_pos {
                        return Err(VerifyError::UseBeforeDef { inst, operand: op });
                    }
                }
            }
        }
    }
    Ok(())
}
