pub mod context;
pub mod operand;
pub mod vpack;

pub use context::VectorPackContext;
pub use operand::{Lane, OpRef, OperandPack};
pub use vpack::{PackKind, PackRef, VectorPack};
