pub mod def;
pub mod verify;

pub use def::*;
pub use verify::{verify, VerifyError};
