pub mod dp;
pub mod enumerate;
pub mod frontier;
pub mod heuristic;
pub mod improve;
pub mod mcts;
pub mod plan;
pub mod policy;
pub mod rollout;

pub use dp::{DpSolution, DpSolver};
pub use frontier::Frontier;
pub use heuristic::{Heuristic, Solution};
pub use mcts::{PartialPack, SearchObserver, UctNode, UctSearch};
pub use plan::Plan;
pub use policy::{PackingPolicy, PolicyModel, PolicyRequest, ThreadedPolicy};
