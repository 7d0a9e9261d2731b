//! Default configuration values.
//!
//! Single source of truth for all default configuration values used across
//! the workspace.

// Common defaults
pub const LOG_LEVEL: &str = "info";
pub const GAME: &str = "tictactoe";

// Search defaults
pub const NUM_SIMULATIONS: u32 = 800;
pub const C_PUCT: f32 = 1.25;
pub const VIRTUAL_LOSS: f32 = 1.0;
pub const TEMPERATURE: f32 = 1.0;
pub const MAX_NODES: u32 = 65_536;
pub const MAX_DEPTH: u32 = 256;
pub const HISTORY_SIZE: usize = 8;
pub const BATCH_SIZE: usize = 32;
pub const QUEUE_SCALE: f32 = 1.0;
pub const FAST_DRAIN: bool = true;
pub const REUSE_TREE: bool = true;
pub const MEMORY_THRESHOLD: f32 = 0.9;
pub const NUM_SEARCH_THREADS: usize = 4;
