//! Search configuration parameters.

use pando_config::CentralConfig;
use thiserror::Error;

/// Errors raised by configuration validation.
///
/// Every variant is fatal at setup; the searcher refuses to start with a
/// config outside the accepted ranges.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("value out of range for '{field}': {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },
}

/// Configuration for one parallel searcher.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Number of simulations to run per search.
    pub num_simulations: u32,

    /// Exploration constant for the PUCT formula.
    /// Higher values encourage exploration, lower values favor exploitation.
    pub c_puct: f32,

    /// Magnitude of virtual loss applied to every edge of an in-flight
    /// descent. Discourages concurrent workers from piling onto one path.
    pub virtual_loss: f32,

    /// Temperature for move selection after search.
    /// 1.0 = sample proportional to visit counts
    /// 0.0 = always pick most-visited (argmax)
    pub temperature: f32,

    /// Node pool capacity.
    pub max_nodes: u32,

    /// Hard descent depth cap; exceeding it aborts the descent.
    pub max_depth: u32,

    /// Length of the context window supplied to the evaluator.
    pub history_size: usize,

    /// Target inference batch size. Workers collect leaves until their
    /// share of this is reached, then rendezvous for a batched forward.
    pub batch_size: usize,

    /// Scale factor on per-worker pending-batch capacity.
    pub queue_scale: f32,

    /// On search stop, revert in-flight leaves instead of evaluating them.
    pub fast_drain: bool,

    /// Keep the played subtree across moves (reroot); false restarts the
    /// tree on every move.
    pub reuse_tree: bool,

    /// Fraction of `max_nodes` above which expansion refuses to allocate.
    pub memory_threshold: f32,

    /// Number of search worker threads sharing the tree.
    pub num_search_threads: usize,

    /// When set, `prune_root` keeps only the top-k root subtrees.
    pub keep_k: Option<u32>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_simulations: 800,
            c_puct: 1.25,
            virtual_loss: 1.0,
            temperature: 1.0,
            max_nodes: 65_536,
            max_depth: 256,
            history_size: 8,
            batch_size: 32,
            queue_scale: 1.0,
            fast_drain: true,
            reuse_tree: true,
            memory_threshold: 0.9,
            num_search_threads: 4,
            keep_k: None,
        }
    }
}

impl SearchConfig {
    /// Create a fast config for testing.
    pub fn for_testing() -> Self {
        Self {
            num_simulations: 64,
            max_nodes: 4096,
            max_depth: 64,
            batch_size: 8,
            num_search_threads: 2,
            ..Self::default()
        }
    }

    /// Build a validated runtime config from the loaded central config.
    pub fn from_central(central: &CentralConfig) -> Result<Self, ConfigError> {
        let s = &central.search;
        let config = Self {
            num_simulations: s.num_simulations,
            c_puct: s.c_puct,
            virtual_loss: s.virtual_loss,
            temperature: s.temperature,
            max_nodes: s.max_nodes,
            max_depth: s.max_depth,
            history_size: s.history_size,
            batch_size: s.batch_size,
            queue_scale: s.queue_scale,
            fast_drain: s.fast_drain,
            reuse_tree: s.reuse_tree,
            memory_threshold: s.memory_threshold,
            num_search_threads: s.num_search_threads,
            keep_k: s.keep_k,
        };
        config.validate()?;
        Ok(config)
    }

    /// Range-check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(
            ok: bool,
            field: &'static str,
            value: f64,
            expected: &'static str,
        ) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange {
                    field,
                    value,
                    expected,
                })
            }
        }

        check(
            self.num_simulations >= 1,
            "num_simulations",
            self.num_simulations as f64,
            ">= 1",
        )?;
        check(
            (0.0..=100.0).contains(&self.c_puct),
            "c_puct",
            self.c_puct as f64,
            "0.0..=100.0",
        )?;
        check(
            (0.0..=100.0).contains(&self.virtual_loss),
            "virtual_loss",
            self.virtual_loss as f64,
            "0.0..=100.0",
        )?;
        check(
            (0.0..=100.0).contains(&self.temperature),
            "temperature",
            self.temperature as f64,
            "0.0..=100.0",
        )?;
        check(
            self.max_nodes >= 2,
            "max_nodes",
            self.max_nodes as f64,
            ">= 2",
        )?;
        check(
            self.max_depth >= 1,
            "max_depth",
            self.max_depth as f64,
            ">= 1",
        )?;
        check(
            self.history_size >= 1,
            "history_size",
            self.history_size as f64,
            ">= 1",
        )?;
        check(
            self.batch_size >= 1,
            "batch_size",
            self.batch_size as f64,
            ">= 1",
        )?;
        check(
            (1.0..=100.0).contains(&self.queue_scale),
            "queue_scale",
            self.queue_scale as f64,
            "1.0..=100.0",
        )?;
        check(
            (0.1..=1.0).contains(&self.memory_threshold),
            "memory_threshold",
            self.memory_threshold as f64,
            "0.1..=1.0",
        )?;
        check(
            self.num_search_threads >= 1,
            "num_search_threads",
            self.num_search_threads as f64,
            ">= 1",
        )?;
        if let Some(k) = self.keep_k {
            check(k >= 1, "keep_k", k as f64, ">= 1")?;
        }
        Ok(())
    }

    /// Per-worker pending-leaf capacity: each worker carries its share of
    /// the unified batch, scaled by `queue_scale`.
    pub fn pending_capacity(&self) -> usize {
        let share =
            (self.batch_size as f32 * self.queue_scale / self.num_search_threads as f32).ceil();
        (share as usize).max(1)
    }

    /// Builder pattern: set number of simulations.
    pub fn with_simulations(mut self, n: u32) -> Self {
        self.num_simulations = n;
        self
    }

    /// Builder pattern: set c_puct exploration constant.
    pub fn with_c_puct(mut self, c: f32) -> Self {
        self.c_puct = c;
        self
    }

    /// Builder pattern: set temperature.
    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    /// Builder pattern: set worker thread count.
    pub fn with_threads(mut self, n: usize) -> Self {
        self.num_search_threads = n;
        self
    }

    /// Builder pattern: set node pool capacity.
    pub fn with_max_nodes(mut self, n: u32) -> Self {
        self.max_nodes = n;
        self
    }

    /// Builder pattern: set target inference batch size.
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }
}
