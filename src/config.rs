//! A global store of knobs that bound the analysis engine.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different analysis executions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the crate via the
/// global [`CONFIG`](static@CONFIG).
pub struct AnalysisConfig {
    /// Maximum number of full passes a single action group may make over the alive-op list before
    /// the analysis of the function is abandoned as non-terminating.
    pub max_action_passes: usize,
    /// Maximum number of times any single rule may fire within one action group application. Acts
    /// as a backstop against ping-ponging rule pairs.
    pub max_rule_applications: usize,
    /// How many single-definition links the jump-table early-fail check walks backward from an
    /// indirect branch before giving up on finding a clobber.
    pub jumptable_backtrack_ops: usize,
    /// Upper bound on the number of destination addresses a recovered jump table may carry.
    pub jumptable_max_entries: usize,
    /// Default number of heritage passes a space waits before dead cells in it may be reclaimed.
    pub deadcode_delay: usize,
    /// How many times heritage may defer a cell whose storage intersects an unresolved load/store
    /// guard before reporting the cell as not-yet-heritaged.
    pub heritage_defer_limit: usize,
    /// Cap on iterations of the data-type propagation loop.
    pub type_propagation_passes: usize,
    /// Whether partial-function clones built for jump-table recovery keep the original sequence
    /// numbers of the ops they copy. Keeping them makes recovery logs line up with the parent
    /// function; fresh numbering makes the clone self-consistent under further editing.
    pub jumptable_clone_keeps_seqnums: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_action_passes: 20,
            max_rule_applications: 10_000,
            jumptable_backtrack_ops: 8,
            jumptable_max_entries: 1024,
            deadcode_delay: 2,
            heritage_defer_limit: 3,
            type_propagation_passes: 100,
            jumptable_clone_keeps_seqnums: true,
        }
    }
}

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::default();
}
