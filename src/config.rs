/// Tuning knobs for the packer. Every field can be overridden by the
/// host; the defaults are the values the solvers were tuned with.
#[derive(Debug, Clone)]
pub struct PackerConfig {
    /// Upper bound on pack lane count.
    pub max_num_lanes: usize,
    /// MCTS iterations per root decision.
    pub num_simulations: usize,
    /// UCT exploration constant.
    pub c: f32,
    /// Prior weight multiplier for the policy term.
    pub w: f32,
    /// Visits before a leaf is expanded.
    pub expand_after: u32,
    /// Max program-order separation between co-packable instructions.
    pub max_search_dist: usize,
    /// Max packs enumerated per block.
    pub enum_cap: usize,
    /// MCTS instead of the bottom-up improver.
    pub use_mcts: bool,
    /// Policy evaluation batch size.
    pub batch_size: usize,
    /// Policy worker threads.
    pub num_threads: usize,
    /// Backpressure cap on queued policy evaluations.
    pub max_inflight: usize,
    /// Rollout RNG seed.
    pub seed: u64,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            max_num_lanes: 8,
            num_simulations: 5000,
            c: 0.25,
            w: 100.0,
            expand_after: 2,
            max_search_dist: 50,
            enum_cap: 1000,
            use_mcts: false,
            batch_size: 128,
            num_threads: 1,
            max_inflight: 32,
            seed: 42,
        }
    }
}

/// Lane counts the enumerators try, ascending so short chains come out
/// before long ones.
pub const LANE_COUNTS: [usize; 5] = [2, 4, 8, 16, 32];
