//! Superword-level vectorizer search engine.
//!
//! Given a straight-line basic block, a target cost model, and a catalog
//! of vector instruction bindings, the packer finds a covering set of
//! SIMD packs (groups of isomorphic scalar instructions fused into one
//! vector instruction) minimizing estimated cost. Two solvers are
//! provided: a bottom-up heuristic improver (the default) and a
//! Monte-Carlo tree search over packing frontiers, optionally guided by
//! a learned policy evaluated on a worker pool.

pub mod analyze;
pub mod bitset;
pub mod catalog;
pub mod config;
pub mod ir;
pub mod pack;
pub mod packer;
pub mod search;
pub mod target;

pub use config::PackerConfig;
pub use packer::{BlockState, DecisionRecord, Packer};
pub use search::{Frontier, PackingPolicy, Plan, ThreadedPolicy};
