pub mod consec;
pub mod deps;
pub mod matches;

pub use consec::AccessDag;
pub use deps::DependenceAnalysis;
pub use matches::MatchManager;
