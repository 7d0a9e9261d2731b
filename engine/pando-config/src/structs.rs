//! Configuration struct definitions.
//!
//! All config structs with serde deserialization support and default values.

use crate::defaults;
use serde::Deserialize;

// ============================================================================
// Serde default functions (required for #[serde(default = "...")])
// ============================================================================

fn d_log_level() -> String {
    defaults::LOG_LEVEL.into()
}
fn d_game() -> String {
    defaults::GAME.into()
}
fn d_num_simulations() -> u32 {
    defaults::NUM_SIMULATIONS
}
fn d_c_puct() -> f32 {
    defaults::C_PUCT
}
fn d_virtual_loss() -> f32 {
    defaults::VIRTUAL_LOSS
}
fn d_temperature() -> f32 {
    defaults::TEMPERATURE
}
fn d_max_nodes() -> u32 {
    defaults::MAX_NODES
}
fn d_max_depth() -> u32 {
    defaults::MAX_DEPTH
}
fn d_history_size() -> usize {
    defaults::HISTORY_SIZE
}
fn d_batch_size() -> usize {
    defaults::BATCH_SIZE
}
fn d_queue_scale() -> f32 {
    defaults::QUEUE_SCALE
}
fn d_fast_drain() -> bool {
    defaults::FAST_DRAIN
}
fn d_reuse_tree() -> bool {
    defaults::REUSE_TREE
}
fn d_memory_threshold() -> f32 {
    defaults::MEMORY_THRESHOLD
}
fn d_num_search_threads() -> usize {
    defaults::NUM_SEARCH_THREADS
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Root configuration structure matching config.toml
#[derive(Debug, Deserialize, Default, Clone)]
pub struct CentralConfig {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub search: SearchSection,
}

/// Common configuration shared by all components
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CommonConfig {
    #[serde(default = "d_log_level")]
    pub log_level: String,
    #[serde(default = "d_game")]
    pub game: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::LOG_LEVEL.into(),
            game: defaults::GAME.into(),
        }
    }
}

/// Search configuration section.
///
/// Field semantics match `pando_mcts::SearchConfig`; this struct is only
/// the serde surface. Range validation happens when the section is turned
/// into a runtime `SearchConfig`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchSection {
    /// Per-move simulation target.
    #[serde(default = "d_num_simulations")]
    pub num_simulations: u32,
    /// PUCT exploration constant.
    #[serde(default = "d_c_puct")]
    pub c_puct: f32,
    /// Magnitude of virtual loss applied per in-flight descent.
    #[serde(default = "d_virtual_loss")]
    pub virtual_loss: f32,
    /// Move-selection temperature.
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    /// Node pool capacity.
    #[serde(default = "d_max_nodes")]
    pub max_nodes: u32,
    /// Hard descent depth cap.
    #[serde(default = "d_max_depth")]
    pub max_depth: u32,
    /// Length of the context window supplied to the evaluator.
    #[serde(default = "d_history_size")]
    pub history_size: usize,
    /// Target inference batch size.
    #[serde(default = "d_batch_size")]
    pub batch_size: usize,
    /// Scale factor on per-worker pending-batch capacity.
    #[serde(default = "d_queue_scale")]
    pub queue_scale: f32,
    /// Revert in-flight batches on search stop instead of evaluating them.
    #[serde(default = "d_fast_drain")]
    pub fast_drain: bool,
    /// Keep the played subtree across moves.
    #[serde(default = "d_reuse_tree")]
    pub reuse_tree: bool,
    /// Fraction of max_nodes above which expansion aborts.
    #[serde(default = "d_memory_threshold")]
    pub memory_threshold: f32,
    /// Number of search worker threads.
    #[serde(default = "d_num_search_threads")]
    pub num_search_threads: usize,
    /// Root-pruning retention bound; absent disables pruning.
    #[serde(default)]
    pub keep_k: Option<u32>,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            num_simulations: defaults::NUM_SIMULATIONS,
            c_puct: defaults::C_PUCT,
            virtual_loss: defaults::VIRTUAL_LOSS,
            temperature: defaults::TEMPERATURE,
            max_nodes: defaults::MAX_NODES,
            max_depth: defaults::MAX_DEPTH,
            history_size: defaults::HISTORY_SIZE,
            batch_size: defaults::BATCH_SIZE,
            queue_scale: defaults::QUEUE_SCALE,
            fast_drain: defaults::FAST_DRAIN,
            reuse_tree: defaults::REUSE_TREE,
            memory_threshold: defaults::MEMORY_THRESHOLD,
            num_search_threads: defaults::NUM_SEARCH_THREADS,
            keep_k: None,
        }
    }
}
