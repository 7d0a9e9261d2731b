//! Per-worker simulator: tree descent, expansion, and batch collection.
//!
//! Each worker owns its descent path, its pending-leaf batch, a local
//! free-node cache, and scratch buffers that live for the whole worker
//! lifetime so the hot loop allocates nothing.

use pando_core::{Engine, HistoryEntry};

use crate::node::{NodeFlags, NodeId};
use crate::pool::LocalCache;
use crate::tree::{ExpandOutcome, PathStep, SearchTree};

/// How many yield rounds a loser of the expansion race waits for the
/// winner before abandoning the descent.
const EXPANSION_SPIN_LIMIT: usize = 64;

/// Outcome of one simulation attempt, steering the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOutcome {
    /// Keep simulating: the descent finished (committed, queued, or
    /// aborted) and the batch has room.
    Continue,
    /// The pending batch reached capacity; rendezvous for inference.
    BatchFull,
    /// No simulation budget remains (or there is no root).
    NoWork,
}

/// A leaf waiting for evaluator output: the copied path, the context
/// window, and the leaf node whose edges will receive the priors.
#[derive(Debug)]
pub struct PendingLeaf<E: Engine> {
    pub path: Vec<PathStep>,
    pub history: Vec<HistoryEntry<E::IdxState>>,
    pub leaf: NodeId,
}

/// Worker-owned state for the simulation phase.
pub struct WorkerContext<E: Engine> {
    pub id: usize,
    pub cache: LocalCache,
    pub pending: Vec<PendingLeaf<E>>,
    pending_capacity: usize,
    path: Vec<PathStep>,
    scratch_actions: Vec<E::Action>,
    scratch_values: Vec<f32>,
    scratch_children: Vec<NodeId>,
}

impl<E: Engine> WorkerContext<E> {
    pub fn new(id: usize, pending_capacity: usize, max_depth: usize) -> Self {
        Self {
            id,
            cache: LocalCache::new(id),
            pending: Vec::with_capacity(pending_capacity),
            pending_capacity,
            path: Vec::with_capacity(max_depth),
            scratch_actions: Vec::new(),
            scratch_values: Vec::new(),
            scratch_children: Vec::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Run one simulation against the shared tree.
    ///
    /// Walks from the root applying PUCT under virtual loss until it hits
    /// a terminal (commit immediately), an unexpanded leaf (expand, queue
    /// for inference), or a dead end (revert and retry).
    pub fn run_simulation(&mut self, tree: &SearchTree<E>) -> SimOutcome {
        let root = tree.root_id();
        if root.is_none() || !tree.reserve_simulation() {
            return SimOutcome::NoWork;
        }

        self.path.clear();
        let mut current = root;
        let max_depth = tree.config().max_depth as usize;

        for _depth in 0..=max_depth {
            let flags = tree.flags(current);

            if flags.contains(NodeFlags::TERMINAL) {
                tree.terminal_values(current, &mut self.scratch_values);
                tree.commit_path(&self.path, &self.scratch_values);
                tree.finish_simulation();
                return SimOutcome::Continue;
            }

            if !flags.contains(NodeFlags::EXPANDED) {
                return self.expand_leaf(tree, current);
            }

            if tree.child_count(current) == 0 {
                // Expanded with nothing selectable (pinned dead end).
                return self.abort_descent(tree);
            }

            let Some((k, child)) = tree.select_child(current) else {
                return self.abort_descent(tree);
            };
            let player = tree.node_player(current);
            tree.apply_virtual_loss(current, k, player);
            self.path.push(PathStep {
                node: current.0,
                k,
                player,
            });
            current = child;
        }

        // Depth cap hit
        self.abort_descent(tree)
    }

    /// The descent stopped at an unexpanded node: race for the expansion
    /// lock, expand or wait out the winner, then queue or commit.
    fn expand_leaf(&mut self, tree: &SearchTree<E>, leaf: NodeId) -> SimOutcome {
        if tree.try_lock_expansion(leaf) {
            let outcome = tree.expand_node(
                leaf,
                &mut self.cache,
                &mut self.scratch_actions,
                &mut self.scratch_values,
                &mut self.scratch_children,
            );
            match outcome {
                ExpandOutcome::Terminal => {
                    tree.commit_path(&self.path, &self.scratch_values);
                    tree.finish_simulation();
                    return SimOutcome::Continue;
                }
                ExpandOutcome::Pinned => {
                    return self.abort_descent(tree);
                }
                ExpandOutcome::Expanded => {}
            }
        } else {
            // Lost the race: wait briefly for the winner to publish.
            let mut expanded = false;
            for _ in 0..EXPANSION_SPIN_LIMIT {
                std::thread::yield_now();
                if tree.flags(leaf).contains(NodeFlags::EXPANDED) {
                    expanded = true;
                    break;
                }
            }
            if !expanded {
                return self.abort_descent(tree);
            }
            // The winner may have discovered a terminal or a pinned dead
            // end; re-inspect before queueing.
            let flags = tree.flags(leaf);
            if flags.contains(NodeFlags::TERMINAL) {
                tree.terminal_values(leaf, &mut self.scratch_values);
                tree.commit_path(&self.path, &self.scratch_values);
                tree.finish_simulation();
                return SimOutcome::Continue;
            }
            if flags.contains(NodeFlags::PINNED) {
                return self.abort_descent(tree);
            }
        }

        // Non-terminal leaf expanded (by us or the race winner): hand it
        // to the inference batch. The path copy happens here, before any
        // other worker can observe this pending entry.
        let mut history = Vec::with_capacity(tree.config().history_size);
        tree.build_history(&self.path, &mut history);
        self.pending.push(PendingLeaf {
            path: self.path.clone(),
            history,
            leaf,
        });

        if self.pending.len() >= self.pending_capacity {
            SimOutcome::BatchFull
        } else {
            SimOutcome::Continue
        }
    }

    fn abort_descent(&mut self, tree: &SearchTree<E>) -> SimOutcome {
        tree.cleanup_path(&self.path);
        self.path.clear();
        tree.release_reservation();
        SimOutcome::Continue
    }

    /// Revert every pending leaf without evaluating it (fast drain).
    pub fn revert_pending(&mut self, tree: &SearchTree<E>) {
        for leaf in self.pending.drain(..) {
            tree.cleanup_path(&leaf.path);
            tree.release_reservation();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use games_tictactoe::TicTacToe;
    use std::sync::Arc;

    fn tree_with_root(config: SearchConfig) -> SearchTree<TicTacToe> {
        let tree = SearchTree::new(Arc::new(TicTacToe::new()), config).unwrap();
        let engine = Arc::clone(tree.engine());
        tree.start_search(engine.initial_state(0)).unwrap();
        tree
    }

    #[test]
    fn test_simulation_queues_leaf() {
        let tree = tree_with_root(SearchConfig::for_testing().with_max_nodes(1024));
        tree.begin_search(16);

        let mut ctx: WorkerContext<TicTacToe> = WorkerContext::new(0, 4, 64);
        let outcome = ctx.run_simulation(&tree);

        assert_eq!(outcome, SimOutcome::Continue);
        assert_eq!(ctx.pending.len(), 1);
        let leaf = &ctx.pending[0];
        assert_eq!(leaf.path.len(), 1);
        assert_eq!(leaf.history.len(), tree.config().history_size);
        assert!(tree.flags(leaf.leaf).contains(NodeFlags::EXPANDED));

        // Virtual loss is parked on the root edge until results arrive
        let visited: u32 = tree.root_child_stats().iter().map(|e| e.visits).sum();
        assert_eq!(visited, 1);
        tree.end_search();
    }

    #[test]
    fn test_batch_full_at_capacity() {
        let tree = tree_with_root(SearchConfig::for_testing().with_max_nodes(1024));
        tree.begin_search(64);

        let mut ctx: WorkerContext<TicTacToe> = WorkerContext::new(0, 2, 64);
        assert_eq!(ctx.run_simulation(&tree), SimOutcome::Continue);
        assert_eq!(ctx.run_simulation(&tree), SimOutcome::BatchFull);
        assert_eq!(ctx.pending.len(), 2);
        tree.end_search();
    }

    #[test]
    fn test_no_work_when_target_reached() {
        let tree = tree_with_root(SearchConfig::for_testing().with_max_nodes(1024));
        tree.begin_search(1);

        let mut ctx: WorkerContext<TicTacToe> = WorkerContext::new(0, 4, 64);
        assert_eq!(ctx.run_simulation(&tree), SimOutcome::Continue);
        // Budget of one simulation is reserved by the pending leaf
        assert_eq!(ctx.run_simulation(&tree), SimOutcome::NoWork);
        tree.end_search();
    }

    #[test]
    fn test_revert_pending_restores_edges() {
        let tree = tree_with_root(SearchConfig::for_testing().with_max_nodes(1024));
        tree.begin_search(16);

        let mut ctx: WorkerContext<TicTacToe> = WorkerContext::new(0, 4, 64);
        ctx.run_simulation(&tree);
        ctx.run_simulation(&tree);
        assert_eq!(ctx.pending.len(), 2);

        ctx.revert_pending(&tree);
        assert!(ctx.pending.is_empty());
        for edge in tree.root_child_stats() {
            assert_eq!(edge.visits, 0);
            assert!(edge.w.iter().all(|&w| w == 0.0));
        }
        // Released reservations can be claimed again
        assert!(tree.reserve_simulation());
        tree.end_search();
    }

    #[test]
    fn test_terminal_commits_without_inference() {
        // Drive the game to one move before a win, so the winning child
        // is terminal at depth 1.
        let engine = Arc::new(TicTacToe::new());
        let mut state = engine.initial_state(0);
        for pos in [0u8, 3, 1, 4] {
            engine.apply_action(&games_tictactoe::Place(pos), &mut state);
        }

        let tree =
            SearchTree::new(engine, SearchConfig::for_testing().with_max_nodes(1024)).unwrap();
        tree.start_search(state).unwrap();
        tree.begin_search(64);

        let mut ctx: WorkerContext<TicTacToe> = WorkerContext::new(0, 8, 64);
        // Run until some descent reaches the terminal winning move and
        // commits directly (no pending entry for it).
        for _ in 0..64 {
            if ctx.run_simulation(&tree) == SimOutcome::NoWork {
                break;
            }
            if tree.simulation_count() > 0 {
                break;
            }
        }
        assert!(
            tree.simulation_count() > 0,
            "a terminal descent should commit directly"
        );
        tree.end_search();
    }
}
