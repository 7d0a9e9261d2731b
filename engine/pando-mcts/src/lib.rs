//! Parallel Monte-Carlo Tree Search with batched inference.
//!
//! This crate is a game-agnostic searcher for two-player perfect-information
//! games: many OS worker threads run PUCT simulations against one shared
//! tree, collecting leaves into a unified batch that a single evaluator
//! call scores per rendezvous round.
//!
//! # Overview
//!
//! Each simulation round moves through four phases:
//!
//! 1. **Selection**: a worker walks from the root picking the edge with the
//!    best `Q + U` score, applying virtual loss so concurrent workers
//!    spread across the tree
//! 2. **Expansion**: the first worker to reach an unexpanded leaf wins a
//!    CAS lock, publishes children with uniform priors, and queues the
//!    leaf for inference
//! 3. **Inference**: workers with pending leaves meet at an adaptive
//!    barrier; the last arriver batches every pending history window
//!    through the evaluator and scatters the results
//! 4. **Backpropagation**: each worker reverts its virtual loss and
//!    commits the evaluated (or terminal) values along its recorded paths
//!
//! Between moves the tree is rerooted along the played action, keeping the
//! played subtree and recycling everything else through the node pool.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pando_mcts::{ParallelSearch, SearchConfig, UniformEvaluator};
//! use games_tictactoe::TicTacToe;
//! use std::sync::Arc;
//!
//! let engine = Arc::new(TicTacToe::new());
//! let evaluator = Arc::new(UniformEvaluator::new(9, 2));
//! let mut search = ParallelSearch::new(engine.clone(), evaluator,
//!                                      SearchConfig::default())?;
//!
//! search.start_search(engine.initial_state(0))?;
//! search.run_search()?;
//! let action = search.best_action()?;
//! search.reroot_by_played_action(&action)?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ParallelSearch                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ SearchTree  │  │  NodePool   │  │ InferenceCoordinator│  │
//! │  │ (SoA+atomic)│  │ (striped)   │  │ (adaptive barrier)  │  │
//! │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘  │
//! │         │                │                    │             │
//! │         ▼                ▼                    ▼             │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │   worker threads: select → expand → batch → commit    │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod evaluator;
pub mod node;
pub mod pool;
pub mod search;
pub mod tree;
pub mod worker;

// Re-export main types
pub use config::{ConfigError, SearchConfig};
pub use coordinator::InferenceCoordinator;
pub use evaluator::{EvalOutput, Evaluator, EvaluatorError, UniformEvaluator};
pub use node::{AtomicF32, NodeFlags, NodeId, NO_CHILD};
pub use pool::{LocalCache, NodePool};
pub use search::{ParallelSearch, SearchError, SearchReport};
pub use tree::{EdgeStats, ExpandOutcome, PathStep, RerootOutcome, SearchTree};
pub use worker::{PendingLeaf, SimOutcome, WorkerContext};
