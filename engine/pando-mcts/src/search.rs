//! Parallel search lifecycle: worker threads, search execution, reroot.
//!
//! `ParallelSearch` owns the shared tree, the inference coordinator, and
//! `num_search_threads` OS worker threads. The controller thread (the one
//! holding the `ParallelSearch`) drives searches and between-search
//! transitions; workers run simulations whenever `search_active` is set
//! and park otherwise. The coarse cancellation protocol is exactly
//! `search_active = false` + batch drain + `wait_for_idle`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use pando_core::Engine;

use crate::config::{ConfigError, SearchConfig};
use crate::coordinator::InferenceCoordinator;
use crate::evaluator::Evaluator;
use crate::tree::{RerootOutcome, SearchTree};
use crate::worker::{SimOutcome, WorkerContext};

/// Poll interval of the controller loops.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Consecutive no-progress polls before a search is declared stalled
/// (pool exhausted, evaluator dead, ...). Generous enough that a slow but
/// live evaluator never trips it.
const STALL_LIMIT: u32 = 5_000;

/// Default deadline for `wait_for_idle` after a search ends.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an idle worker parks before re-checking for work.
const IDLE_PARK: Duration = Duration::from_micros(500);

/// Errors surfaced by the search lifecycle.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Search is active: {0} requires an idle searcher")]
    SearchActive(&'static str),

    #[error("Node pool exhausted")]
    PoolExhausted,

    #[error("No legal moves available")]
    NoLegalMoves,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Search failed to go idle within {0} ms")]
    IdleTimeout(u64),

    #[error("Engine contract violation detected during search")]
    EngineContract,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Summary of one completed search.
#[derive(Debug, Clone)]
pub struct SearchReport {
    /// Simulations committed by this search.
    pub simulations: u32,
    /// Inference rounds driven while the searcher has been alive.
    pub batches: u64,
    /// Nodes currently allocated out of the pool.
    pub nodes_in_use: u32,
}

/// One parallel searcher: shared tree + worker pool + coordinator.
pub struct ParallelSearch<E: Engine, V: Evaluator<E::IdxState> + 'static> {
    tree: Arc<SearchTree<E>>,
    coordinator: Arc<InferenceCoordinator<E>>,
    evaluator: Arc<V>,
    stop: Arc<AtomicBool>,
    busy_workers: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
    rng: ChaCha20Rng,
}

impl<E: Engine, V: Evaluator<E::IdxState> + 'static> ParallelSearch<E, V> {
    /// Build a searcher and spawn its worker threads (parked until the
    /// first search starts).
    pub fn new(engine: Arc<E>, evaluator: Arc<V>, config: SearchConfig) -> Result<Self, SearchError> {
        Self::new_seeded(engine, evaluator, config, 0x5EED_0F_7EA5)
    }

    /// `new` with an explicit move-sampling seed, for reproducible play.
    pub fn new_seeded(
        engine: Arc<E>,
        evaluator: Arc<V>,
        config: SearchConfig,
        seed: u64,
    ) -> Result<Self, SearchError> {
        config.validate()?;
        let num_workers = config.num_search_threads;
        let tree = Arc::new(SearchTree::new(engine, config)?);
        let coordinator = Arc::new(InferenceCoordinator::new(num_workers));
        let stop = Arc::new(AtomicBool::new(false));
        let busy_workers = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let tree = Arc::clone(&tree);
            let coordinator = Arc::clone(&coordinator);
            let evaluator = Arc::clone(&evaluator);
            let stop = Arc::clone(&stop);
            let busy = Arc::clone(&busy_workers);
            let handle = std::thread::Builder::new()
                .name(format!("pando-worker-{id}"))
                .spawn(move || worker_loop(id, tree, coordinator, evaluator, stop, busy))
                .map_err(|e| SearchError::InvalidState(format!("spawn worker: {e}")))?;
            workers.push(handle);
        }

        Ok(Self {
            tree,
            coordinator,
            evaluator,
            stop,
            busy_workers,
            workers,
            rng: ChaCha20Rng::seed_from_u64(seed),
        })
    }

    pub fn tree(&self) -> &SearchTree<E> {
        &self.tree
    }

    /// Reset the tree to `root_state` and seed the root priors with one
    /// synchronous evaluator call. Evaluator failure here is recoverable:
    /// the root keeps its uniform priors.
    pub fn start_search(&self, root_state: E::State) -> Result<(), SearchError> {
        self.tree.start_search(root_state)?;
        self.prior_root();
        Ok(())
    }

    /// Run one search of the configured number of simulations.
    pub fn run_search(&self) -> Result<SearchReport, SearchError> {
        self.run_search_with(self.tree.config().num_simulations)
    }

    /// Run one search with an explicit simulation target.
    ///
    /// Blocks until the target is reached (or the search stalls), then
    /// drains the workers and waits for idle. On return the tree is
    /// quiescent: no virtual loss is outstanding anywhere.
    pub fn run_search_with(&self, simulations: u32) -> Result<SearchReport, SearchError> {
        if self.tree.search_active() {
            return Err(SearchError::SearchActive("run_search"));
        }
        if self.tree.root_id().is_none() {
            return Err(SearchError::InvalidState(
                "run_search before start_search".into(),
            ));
        }

        let start_count = self.tree.simulation_count();
        self.tree.begin_search(simulations);
        let target = self.tree.target_simulations();
        debug!(simulations = target, "search started");

        let mut last = start_count;
        let mut stalled_polls = 0u32;
        loop {
            let count = self.tree.simulation_count();
            if count >= target {
                break;
            }
            if count == last {
                stalled_polls += 1;
                if stalled_polls >= STALL_LIMIT {
                    warn!(
                        reached = count,
                        wanted = target,
                        "search stalled; stopping early"
                    );
                    break;
                }
            } else {
                stalled_polls = 0;
                last = count;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        self.tree.end_search();
        self.wait_for_idle(IDLE_TIMEOUT)?;

        if self.tree.contract_violated() {
            return Err(SearchError::EngineContract);
        }

        let report = SearchReport {
            simulations: self.tree.simulation_count() - start_count,
            batches: self.coordinator.batch_id(),
            nodes_in_use: self.tree.nodes_in_use(),
        };
        info!(
            simulations = report.simulations,
            nodes = report.nodes_in_use,
            "search finished"
        );
        Ok(report)
    }

    /// Block until every worker is parked and the barrier is empty.
    ///
    /// On deadline the barrier is force-released (counters reset, stranded
    /// batches reverted) and the failure is surfaced to the caller, which
    /// may retry the move or abandon it.
    pub fn wait_for_idle(&self, timeout: Duration) -> Result<(), SearchError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.busy_workers.load(Ordering::Acquire) == 0 && self.coordinator.is_idle() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.coordinator.force_release(&self.tree);
                return Err(SearchError::IdleTimeout(timeout.as_millis() as u64));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Advance the root along the action that was actually played.
    /// Restarted roots get fresh evaluator priors; promoted roots keep the
    /// priors they learned during the previous search.
    pub fn reroot_by_played_action(&self, action: &E::Action) -> Result<RerootOutcome, SearchError> {
        let outcome = self.tree.reroot_by_played_action(action)?;
        if outcome == RerootOutcome::Restarted {
            self.prior_root();
        }
        Ok(outcome)
    }

    /// Apply the configured `keep_k` root pruning, if any. Returns the
    /// number of subtrees returned to the pool.
    pub fn prune_root(&self) -> Result<usize, SearchError> {
        match self.tree.config().keep_k {
            Some(k) => self.tree.prune_root(k),
            None => Ok(0),
        }
    }

    /// Pick the move to play using the configured temperature.
    pub fn best_action(&mut self) -> Result<E::Action, SearchError> {
        let temperature = self.tree.config().temperature;
        self.tree.best_action_from_root(temperature, &mut self.rng)
    }

    /// Pick the move to play with an explicit temperature.
    pub fn best_action_with(&mut self, temperature: f32) -> Result<E::Action, SearchError> {
        self.tree.best_action_from_root(temperature, &mut self.rng)
    }

    /// Seed the root's edge priors from the evaluator (single-state
    /// batch). Failures leave the uniform priors in place.
    fn prior_root(&self) {
        let root = self.tree.root_id();
        if root.is_none() || self.tree.child_count(root) == 0 {
            return;
        }
        let mut history = Vec::new();
        self.tree.build_history(&[], &mut history);

        let mut out = Vec::new();
        match self.evaluator.forward_batch(&[history], &mut out) {
            Ok(()) if out.len() == 1 => {
                self.tree.apply_policy(root, &out[0].policy);
            }
            Ok(()) => warn!("root evaluation returned wrong batch size"),
            Err(e) => warn!(error = %e, "root evaluation failed; keeping uniform priors"),
        }
    }
}

impl<E: Engine, V: Evaluator<E::IdxState> + 'static> Drop for ParallelSearch<E, V> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.tree.end_search();
        if !self.coordinator.is_idle() {
            self.coordinator.force_release(&self.tree);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Body of one search worker thread.
fn worker_loop<E: Engine, V: Evaluator<E::IdxState>>(
    id: usize,
    tree: Arc<SearchTree<E>>,
    coordinator: Arc<InferenceCoordinator<E>>,
    evaluator: Arc<V>,
    stop: Arc<AtomicBool>,
    busy: Arc<AtomicUsize>,
) {
    let config = tree.config().clone();
    let mut ctx: WorkerContext<E> =
        WorkerContext::new(id, config.pending_capacity(), config.max_depth as usize);
    let mut is_busy = false;

    let mut set_busy = |ctx_busy: &mut bool, to: bool| {
        if *ctx_busy != to {
            if to {
                busy.fetch_add(1, Ordering::AcqRel);
            } else {
                busy.fetch_sub(1, Ordering::AcqRel);
            }
            *ctx_busy = to;
        }
    };

    while !stop.load(Ordering::Acquire) {
        // Raise the busy flag before looking at search_active: once the
        // controller observes zero busy workers after clearing the flag,
        // no new descent can start.
        set_busy(&mut is_busy, true);

        if !tree.search_active() {
            // Drain whatever the dying search left behind, hand cached
            // free nodes back for accounting, then sleep.
            if ctx.has_pending() {
                drain_pending(&tree, &coordinator, &*evaluator, &mut ctx, config.fast_drain);
            }
            tree.flush_worker_cache(&mut ctx.cache);
            set_busy(&mut is_busy, false);
            std::thread::park_timeout(IDLE_PARK);
            continue;
        }

        match ctx.run_simulation(&tree) {
            SimOutcome::BatchFull => {
                coordinator.barrier_round(&tree, &*evaluator, &mut ctx);
            }
            SimOutcome::NoWork => {
                if ctx.has_pending() {
                    // The remaining budget is parked in these leaves;
                    // flush them so the target can be reached.
                    coordinator.barrier_round(&tree, &*evaluator, &mut ctx);
                } else {
                    // Out of budget with nothing in flight: surrender the
                    // cached free nodes so pool accounting is exact once
                    // the controller sees us idle.
                    tree.flush_worker_cache(&mut ctx.cache);
                    set_busy(&mut is_busy, false);
                    std::thread::yield_now();
                }
            }
            SimOutcome::Continue => {}
        }
    }

    if ctx.has_pending() {
        ctx.revert_pending(&tree);
    }
    tree.flush_worker_cache(&mut ctx.cache);
    set_busy(&mut is_busy, false);
}

/// End-of-search drain: either revert the pending leaves (fast drain) or
/// push them through one last inference round.
fn drain_pending<E: Engine, V: Evaluator<E::IdxState>>(
    tree: &SearchTree<E>,
    coordinator: &InferenceCoordinator<E>,
    evaluator: &V,
    ctx: &mut WorkerContext<E>,
    fast_drain: bool,
) {
    if fast_drain {
        ctx.revert_pending(tree);
    } else {
        coordinator.barrier_round(tree, evaluator, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::UniformEvaluator;
    use games_tictactoe::TicTacToe;

    fn searcher(
        config: SearchConfig,
    ) -> ParallelSearch<TicTacToe, UniformEvaluator> {
        let engine = Arc::new(TicTacToe::new());
        let evaluator = Arc::new(UniformEvaluator::new(
            <TicTacToe as Engine>::ACTION_SPACE,
            <TicTacToe as Engine>::NUM_PLAYERS,
        ));
        ParallelSearch::new_seeded(engine, evaluator, config, 7).unwrap()
    }

    #[test]
    fn test_run_search_reaches_target() {
        let search = searcher(SearchConfig::for_testing());
        let engine = Arc::clone(search.tree().engine());
        search.start_search(engine.initial_state(0)).unwrap();

        let report = search.run_search_with(64).unwrap();
        assert_eq!(report.simulations, 64);

        // Visit conservation: root edge visits sum to the target.
        let total: u32 = search
            .tree()
            .root_child_stats()
            .iter()
            .map(|e| e.visits)
            .sum();
        assert_eq!(total, 64);
    }

    #[test]
    fn test_virtual_loss_neutrality_after_idle() {
        let search = searcher(SearchConfig::for_testing());
        let engine = Arc::clone(search.tree().engine());
        search.start_search(engine.initial_state(0)).unwrap();
        search.run_search_with(128).unwrap();

        // The uniform evaluator emits zero values and tictactoe terminal
        // values sum to zero across players, so after the drain every
        // edge's player-sum of W must be (numerically) zero.
        for edge in search.tree().root_child_stats() {
            let sum: f32 = edge.w.iter().sum();
            assert!(
                sum.abs() < 1e-3,
                "virtual loss residue on edge {:?}: {}",
                edge.k,
                sum
            );
        }
    }

    #[test]
    fn test_run_search_without_root_fails() {
        let search = searcher(SearchConfig::for_testing());
        assert!(matches!(
            search.run_search_with(8),
            Err(SearchError::InvalidState(_))
        ));
    }

    #[test]
    fn test_sequential_searches_accumulate() {
        let search = searcher(SearchConfig::for_testing());
        let engine = Arc::clone(search.tree().engine());
        search.start_search(engine.initial_state(0)).unwrap();

        search.run_search_with(32).unwrap();
        search.run_search_with(32).unwrap();

        let total: u32 = search
            .tree()
            .root_child_stats()
            .iter()
            .map(|e| e.visits)
            .sum();
        assert_eq!(total, 64);
    }

    #[test]
    fn test_reroot_then_search() {
        let mut search = searcher(SearchConfig::for_testing());
        let engine = Arc::clone(search.tree().engine());
        search.start_search(engine.initial_state(0)).unwrap();
        search.run_search_with(64).unwrap();

        let action = search.best_action_with(0.0).unwrap();
        search.reroot_by_played_action(&action).unwrap();
        assert_eq!(search.tree().history_len(), 1);

        let report = search.run_search_with(64).unwrap();
        assert_eq!(report.simulations, 64);
    }

    #[test]
    fn test_self_play_game_completes() {
        let mut search = searcher(SearchConfig::for_testing().with_simulations(48));
        let engine = Arc::clone(search.tree().engine());
        let mut state = engine.initial_state(0);
        search.start_search(state.clone()).unwrap();

        let mut values = Vec::new();
        let mut moves = 0;
        while !engine.is_terminal(&state, &mut values) {
            search.run_search().unwrap();
            let action = search.best_action_with(0.0).unwrap();
            engine.apply_action(&action, &mut state);
            search.reroot_by_played_action(&action).unwrap();
            moves += 1;
            assert!(moves <= 9, "tictactoe must end within 9 moves");
        }
        assert_eq!(values.len(), 2);
    }
}
