//! End-to-end scenarios for the parallel searcher.
//!
//! These tests run real multi-threaded searches against small synthetic
//! games with hand-picked evaluator outputs, checking the global
//! accounting properties: visit conservation, virtual-loss neutrality,
//! reroot conservation, and liveness under degraded components.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use pando_core::{Engine, HistoryEntry};
use pando_mcts::{
    EvalOutput, Evaluator, EvaluatorError, ParallelSearch, RerootOutcome, SearchConfig,
};

/// Install a test subscriber once; `RUST_LOG=trace` surfaces the barrier
/// and round diagnostics when a scenario misbehaves.
static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

fn init_logs() {
    Lazy::force(&TRACING);
}

// ---------------------------------------------------------------------------
// Synthetic games
// ---------------------------------------------------------------------------

/// Three actions everywhere, never terminal, players alternating. The
/// state code encodes the action path, so every node has a distinct state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct DeepState {
    code: u64,
    depth: u32,
}

#[derive(Debug, Default)]
struct DeepGame;

impl Engine for DeepGame {
    type State = DeepState;
    type Action = u8;
    type IdxState = u64;

    const NUM_PLAYERS: usize = 2;
    const MAX_VALID_ACTIONS: usize = 3;
    const ACTION_SPACE: usize = 3;
    const NUM_ELEMENTS: usize = 1;
    const NUM_META: usize = 1;

    fn initial_state(&self, _player: usize) -> DeepState {
        DeepState::default()
    }

    fn current_player(&self, state: &DeepState) -> usize {
        (state.depth % 2) as usize
    }

    fn valid_actions(&self, _state: &DeepState, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&[0, 1, 2]);
    }

    fn apply_action(&self, action: &u8, state: &mut DeepState) {
        state.code = state
            .code
            .wrapping_mul(4)
            .wrapping_add(*action as u64 + 1);
        state.depth += 1;
    }

    fn is_terminal(&self, _state: &DeepState, values: &mut Vec<f32>) -> bool {
        values.clear();
        false
    }

    fn obs_to_idx(&self, state: &DeepState) -> u64 {
        state.code
    }

    fn action_to_idx(&self, action: &u8) -> u32 {
        *action as u32
    }

    fn idx_to_action(&self, idx: u32) -> u8 {
        idx as u8
    }
}

/// One legal action; playing it ends the game with values [1, -1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ForcedState {
    moves: u32,
}

#[derive(Debug, Default)]
struct ForcedWin;

impl Engine for ForcedWin {
    type State = ForcedState;
    type Action = u8;
    type IdxState = u32;

    const NUM_PLAYERS: usize = 2;
    const MAX_VALID_ACTIONS: usize = 1;
    const ACTION_SPACE: usize = 1;
    const NUM_ELEMENTS: usize = 1;
    const NUM_META: usize = 0;

    fn initial_state(&self, _player: usize) -> ForcedState {
        ForcedState::default()
    }

    fn current_player(&self, state: &ForcedState) -> usize {
        (state.moves % 2) as usize
    }

    fn valid_actions(&self, state: &ForcedState, out: &mut Vec<u8>) {
        out.clear();
        if state.moves == 0 {
            out.push(0);
        }
    }

    fn apply_action(&self, _action: &u8, state: &mut ForcedState) {
        state.moves += 1;
    }

    fn is_terminal(&self, state: &ForcedState, values: &mut Vec<f32>) -> bool {
        values.clear();
        if state.moves >= 1 {
            values.extend_from_slice(&[1.0, -1.0]);
            true
        } else {
            false
        }
    }

    fn obs_to_idx(&self, state: &ForcedState) -> u32 {
        state.moves
    }

    fn action_to_idx(&self, action: &u8) -> u32 {
        *action as u32
    }

    fn idx_to_action(&self, idx: u32) -> u8 {
        idx as u8
    }
}

/// DeepGame wrapper counting `valid_actions` calls per state code, to
/// observe that no state is ever expanded twice.
#[derive(Debug, Default)]
struct CountingGame {
    inner: DeepGame,
    expansions: Mutex<HashMap<u64, u32>>,
}

impl Engine for CountingGame {
    type State = DeepState;
    type Action = u8;
    type IdxState = u64;

    const NUM_PLAYERS: usize = 2;
    const MAX_VALID_ACTIONS: usize = 3;
    const ACTION_SPACE: usize = 3;
    const NUM_ELEMENTS: usize = 1;
    const NUM_META: usize = 1;

    fn initial_state(&self, player: usize) -> DeepState {
        self.inner.initial_state(player)
    }

    fn current_player(&self, state: &DeepState) -> usize {
        self.inner.current_player(state)
    }

    fn valid_actions(&self, state: &DeepState, out: &mut Vec<u8>) {
        *self
            .expansions
            .lock()
            .unwrap()
            .entry(state.code)
            .or_insert(0) += 1;
        self.inner.valid_actions(state, out);
    }

    fn apply_action(&self, action: &u8, state: &mut DeepState) {
        self.inner.apply_action(action, state);
    }

    fn is_terminal(&self, state: &DeepState, values: &mut Vec<f32>) -> bool {
        self.inner.is_terminal(state, values)
    }

    fn obs_to_idx(&self, state: &DeepState) -> u64 {
        self.inner.obs_to_idx(state)
    }

    fn action_to_idx(&self, action: &u8) -> u32 {
        self.inner.action_to_idx(action)
    }

    fn idx_to_action(&self, idx: u32) -> u8 {
        self.inner.idx_to_action(idx)
    }
}

// ---------------------------------------------------------------------------
// Test evaluators
// ---------------------------------------------------------------------------

/// Returns the same policy and values for every leaf, counting calls.
#[derive(Debug)]
struct FixedEvaluator {
    policy: Vec<f32>,
    values: Vec<f32>,
    calls: AtomicU32,
}

impl FixedEvaluator {
    fn new(policy: Vec<f32>, values: Vec<f32>) -> Self {
        Self {
            policy,
            values,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::Acquire)
    }

    fn reset_calls(&self) {
        self.calls.store(0, Ordering::Release);
    }
}

impl<S> Evaluator<S> for FixedEvaluator {
    fn forward_batch(
        &self,
        histories: &[Vec<HistoryEntry<S>>],
        out: &mut Vec<EvalOutput>,
    ) -> Result<(), EvaluatorError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        out.clear();
        for _ in histories {
            out.push(EvalOutput {
                policy: self.policy.clone(),
                values: self.values.clone(),
            });
        }
        Ok(())
    }
}

/// Fails every call.
#[derive(Debug, Default)]
struct FailingEvaluator;

impl<S> Evaluator<S> for FailingEvaluator {
    fn forward_batch(
        &self,
        _histories: &[Vec<HistoryEntry<S>>],
        _out: &mut Vec<EvalOutput>,
    ) -> Result<(), EvaluatorError> {
        Err(EvaluatorError::ModelError("offline".into()))
    }
}

fn deep_config() -> SearchConfig {
    let mut config = SearchConfig::for_testing();
    config.c_puct = 1.0;
    config.virtual_loss = 1.0;
    config.max_depth = 24;
    config.max_nodes = 8192;
    config.num_search_threads = 2;
    config.batch_size = 8;
    config
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Two workers race on a three-action game; all accounting must balance.
#[test]
fn two_worker_race_conserves_visits_and_values() {
    init_logs();
    let engine = Arc::new(DeepGame);
    let evaluator = Arc::new(FixedEvaluator::new(
        vec![0.5, 0.3, 0.2],
        vec![0.1, -0.1],
    ));
    let search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), deep_config()).unwrap();

    search.start_search(engine.initial_state(0)).unwrap();
    let report = search.run_search_with(200).unwrap();
    assert_eq!(report.simulations, 200);

    let stats = search.tree().root_child_stats();
    assert_eq!(stats.len(), 3);

    // Visit conservation: every committed simulation crossed exactly one
    // root edge.
    let total_visits: u32 = stats.iter().map(|e| e.visits).sum();
    assert_eq!(total_visits, 200);

    // Root priors came from the evaluator, so the 0.5-prior edge must
    // dominate under equal Q.
    let best = stats.iter().max_by_key(|e| e.visits).unwrap();
    assert_eq!(best.action_idx, 0);
    assert!((best.prior - 0.5).abs() < 1e-5);

    // Every leaf returned values [0.1, -0.1]; with virtual loss fully
    // reverted the white W across root edges sums to 200 * 0.1.
    let w_white: f32 = stats.iter().map(|e| e.w[0]).sum();
    assert!(
        (w_white - 20.0).abs() < 1e-3,
        "white W sum {} != 20.0",
        w_white
    );
    let w_black: f32 = stats.iter().map(|e| e.w[1]).sum();
    assert!((w_black + 20.0).abs() < 1e-3);
}

/// A forced terminal line is searched without any evaluator traffic.
#[test]
fn forced_terminal_skips_inference() {
    init_logs();
    let engine = Arc::new(ForcedWin);
    let evaluator = Arc::new(FixedEvaluator::new(vec![1.0], vec![0.0, 0.0]));
    let mut config = SearchConfig::for_testing();
    config.num_search_threads = 2;
    let search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), config).unwrap();

    search.start_search(engine.initial_state(0)).unwrap();
    evaluator.reset_calls(); // root prior seeding is allowed to evaluate

    let report = search.run_search_with(64).unwrap();
    assert_eq!(report.simulations, 64);
    assert_eq!(evaluator.calls(), 0, "terminal descents must not evaluate");

    let stats = search.tree().root_child_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].visits, 64);
    assert!((stats[0].w[0] - 64.0).abs() < 1e-3);
    assert!((stats[0].w[1] + 64.0).abs() < 1e-3);
}

/// Reroot with reuse keeps exactly the played subtree; everything else
/// returns to the pool.
#[test]
fn reroot_with_reuse_conserves_nodes() {
    init_logs();
    let engine = Arc::new(DeepGame);
    let evaluator = Arc::new(FixedEvaluator::new(
        vec![0.5, 0.3, 0.2],
        vec![0.1, -0.1],
    ));
    let mut search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), deep_config()).unwrap();

    search.start_search(engine.initial_state(0)).unwrap();
    search.run_search_with(200).unwrap();

    let stats = search.tree().root_child_stats();
    let top = stats.iter().max_by_key(|e| e.visits).unwrap().clone();
    let played = engine.idx_to_action(top.action_idx);
    assert_eq!(search.best_action_with(0.0).unwrap(), played);

    let max_nodes = search.tree().config().max_nodes as usize;
    let outcome = search.reroot_by_played_action(&played).unwrap();
    assert_eq!(outcome, RerootOutcome::Promoted);
    assert_eq!(search.tree().root_id(), top.child);
    assert_eq!(search.tree().history_len(), 1);

    let reachable = search.tree().reachable_count();
    assert_eq!(
        search.tree().free_nodes() + reachable,
        max_nodes,
        "pool accounting must balance after reroot"
    );
    assert_eq!(search.tree().nodes_in_use() as usize, reachable);

    // The promoted subtree stays searchable.
    let report = search.run_search_with(100).unwrap();
    assert_eq!(report.simulations, 100);
}

/// A pool too small for the tree must degrade, not hang or panic.
#[test]
fn pool_exhaustion_is_survivable() {
    init_logs();
    let engine = Arc::new(DeepGame);
    let evaluator = Arc::new(FixedEvaluator::new(
        vec![0.4, 0.3, 0.3],
        vec![0.0, 0.0],
    ));
    let mut config = deep_config();
    config.max_nodes = 32;
    config.memory_threshold = 1.0;
    let search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), config).unwrap();

    search.start_search(engine.initial_state(0)).unwrap();
    let report = search.run_search_with(512).unwrap();

    assert!(report.simulations <= 512);
    assert!(search.tree().nodes_in_use() <= 32);
    // The searcher is still healthy for lifecycle operations.
    search.wait_for_idle(std::time::Duration::from_secs(1)).unwrap();
}

/// More workers than work: the adaptive barrier must not wait for workers
/// that never announce.
#[test]
fn idle_workers_do_not_deadlock_the_barrier() {
    init_logs();
    let engine = Arc::new(ForcedWin);
    let evaluator = Arc::new(FixedEvaluator::new(vec![1.0], vec![0.0, 0.0]));
    let mut config = SearchConfig::for_testing();
    config.num_search_threads = 4;
    config.batch_size = 4;
    let search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), config).unwrap();

    // A single forced line gives most workers nothing to batch.
    search.start_search(engine.initial_state(0)).unwrap();
    let report = search.run_search_with(16).unwrap();
    assert_eq!(report.simulations, 16);
}

/// Evaluator failure: no simulation is counted, no virtual loss leaks,
/// and the search still terminates cleanly.
#[test]
fn evaluator_failure_is_recoverable() {
    init_logs();
    let engine = Arc::new(DeepGame);
    let evaluator = Arc::new(FailingEvaluator);
    let mut config = deep_config();
    config.num_search_threads = 2;
    let search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), config).unwrap();

    search.start_search(engine.initial_state(0)).unwrap();
    let report = search.run_search_with(32).unwrap();

    assert_eq!(report.simulations, 0);
    assert_eq!(search.tree().simulation_count(), 0);
    for edge in search.tree().root_child_stats() {
        assert_eq!(edge.visits, 0, "reverted descents must leave no visits");
        assert!(edge.w.iter().all(|&w| w == 0.0), "virtual loss residue");
    }
}

/// No node is ever expanded by two workers.
#[test]
fn expansion_runs_at_most_once_per_state() {
    init_logs();
    let engine = Arc::new(CountingGame::default());
    let evaluator = Arc::new(FixedEvaluator::new(
        vec![0.34, 0.33, 0.33],
        vec![0.0, 0.0],
    ));
    let mut config = deep_config();
    config.num_search_threads = 4;
    let search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), config).unwrap();

    search.start_search(engine.initial_state(0)).unwrap();
    search.run_search_with(300).unwrap();

    let counts = engine.expansions.lock().unwrap();
    for (code, count) in counts.iter() {
        assert_eq!(
            *count, 1,
            "state {:x} expanded {} times; expansion must be a singleton",
            code, count
        );
    }
}

/// Once published, a child index stays put for the whole search.
#[test]
fn child_indices_are_stable_across_searches() {
    let engine = Arc::new(DeepGame);
    let evaluator = Arc::new(FixedEvaluator::new(
        vec![0.5, 0.3, 0.2],
        vec![0.0, 0.0],
    ));
    let search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), deep_config()).unwrap();

    search.start_search(engine.initial_state(0)).unwrap();
    search.run_search_with(50).unwrap();
    let before: Vec<_> = search
        .tree()
        .root_child_stats()
        .iter()
        .map(|e| (e.k, e.child))
        .collect();

    search.run_search_with(50).unwrap();
    let after: Vec<_> = search
        .tree()
        .root_child_stats()
        .iter()
        .map(|e| (e.k, e.child))
        .collect();

    assert_eq!(before, after);
}

/// keep_k pruning retains the top subtrees and frees the rest.
#[test]
fn root_pruning_respects_keep_k() {
    let engine = Arc::new(DeepGame);
    let evaluator = Arc::new(FixedEvaluator::new(
        vec![0.5, 0.3, 0.2],
        vec![0.0, 0.0],
    ));
    let mut config = deep_config();
    config.keep_k = Some(1);
    let search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), config).unwrap();

    search.start_search(engine.initial_state(0)).unwrap();
    search.run_search_with(100).unwrap();

    let before = search.tree().root_child_stats();
    let top = before.iter().max_by_key(|e| e.visits).unwrap().clone();
    assert!(before.len() > 1);

    let pruned = search.prune_root().unwrap();
    assert_eq!(pruned, before.len() - 1);

    let after = search.tree().root_child_stats();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].child, top.child);
    assert_eq!(
        search.tree().free_nodes() + search.tree().reachable_count(),
        search.tree().config().max_nodes as usize
    );
}

/// The history window follows the played line and caps at history_size.
#[test]
fn history_grows_one_entry_per_reroot() {
    let engine = Arc::new(DeepGame);
    let evaluator = Arc::new(FixedEvaluator::new(
        vec![0.4, 0.3, 0.3],
        vec![0.0, 0.0],
    ));
    let mut config = deep_config();
    config.history_size = 4;
    config.reuse_tree = false;
    let search =
        ParallelSearch::new(Arc::clone(&engine), Arc::clone(&evaluator), config).unwrap();

    search.start_search(engine.initial_state(0)).unwrap();
    for played in 0..6u32 {
        search.reroot_by_played_action(&((played % 3) as u8)).unwrap();
        let expected = ((played + 1) as usize).min(4);
        assert_eq!(search.tree().history_len(), expected);
    }
}
