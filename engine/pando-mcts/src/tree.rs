//! Shared search tree with structure-of-arrays node storage.
//!
//! All node state lives in flat arrays indexed by node id; edges live in
//! parallel arrays indexed by slot. The slot region of node `n` is the
//! fixed window `[n * max_children, (n + 1) * max_children)`, so the edge
//! base is a pure function of the node index. Workers mutate everything
//! through atomics; the only locks are the per-node state cells, the node
//! pool stripes, and the root-history buffer.
//!
//! Publication protocol: a child's state and per-node fields are written
//! before its index is stored into `child_node_idx` (release), and
//! `EXPANDED` is stored (release) only after every slot of the window is
//! initialised. Readers load flags and child indices with acquire, so an
//! edge is never observed half-built.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use rand::distributions::{Distribution, WeightedIndex};
use rand_chacha::ChaCha20Rng;
use tracing::{error, warn};

use pando_core::{Engine, HistoryEntry};

use crate::config::{ConfigError, SearchConfig};
use crate::node::{AtomicF32, NodeFlags, NodeId, NO_CHILD};
use crate::pool::{LocalCache, NodePool};
use crate::search::SearchError;

/// One traversed edge of a descent: the node, the edge ordinal within its
/// window, and the player who was to move at the node. The player is
/// recorded so virtual loss can be reverted with the exact signs it was
/// applied with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    pub node: u32,
    pub k: u16,
    pub player: u8,
}

/// Result of one expansion attempt (caller must hold the expansion lock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandOutcome {
    /// Engine reported a terminal state; terminal values are in the
    /// caller's values scratch.
    Terminal,
    /// Children published with uniform priors.
    Expanded,
    /// Pool exhausted (or memory threshold hit); node is a dead end.
    Pinned,
}

/// Outcome of a reroot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerootOutcome {
    /// The played child existed; its subtree is the new tree.
    Promoted,
    /// The tree was rebuilt from the successor state.
    Restarted,
}

/// Per-edge statistics snapshot, for inspection and tests.
#[derive(Debug, Clone)]
pub struct EdgeStats {
    pub k: usize,
    pub action_idx: u32,
    pub child: NodeId,
    pub visits: u32,
    pub prior: f32,
    /// Cumulative value per player.
    pub w: Vec<f32>,
}

/// The shared tree. One instance per searcher, shared by all workers.
pub struct SearchTree<E: Engine> {
    engine: Arc<E>,
    config: SearchConfig,
    max_children: usize,
    num_players: usize,

    // Node arrays (len = max_nodes)
    flags: Box<[AtomicU8]>,
    parent: Box<[AtomicU32]>,
    child_count: Box<[AtomicU16]>,
    node_player: Box<[AtomicU8]>,
    states: Box<[Mutex<E::State>]>,

    // Edge arrays (len = max_nodes * max_children, W times num_players)
    edge_child: Box<[AtomicU32]>,
    edge_n: Box<[AtomicU32]>,
    edge_w: Box<[AtomicF32]>,
    edge_prior: Box<[AtomicF32]>,
    edge_action_idx: Box<[AtomicU32]>,

    pool: NodePool,
    ctrl: Mutex<LocalCache>,
    nodes_in_use: AtomicU32,

    root: AtomicU32,

    finished_simulations: AtomicU32,
    reserved_simulations: AtomicU32,
    target_simulations: AtomicU32,
    search_active: AtomicBool,
    contract_violated: AtomicBool,

    root_history: Mutex<Vec<HistoryEntry<E::IdxState>>>,
    history_snapshot: Mutex<Arc<Vec<HistoryEntry<E::IdxState>>>>,
}

impl<E: Engine> SearchTree<E> {
    pub fn new(engine: Arc<E>, config: SearchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        assert!(
            E::MAX_VALID_ACTIONS > 0 && E::MAX_VALID_ACTIONS <= u16::MAX as usize,
            "engine MAX_VALID_ACTIONS out of range"
        );
        assert!(E::NUM_PLAYERS > 0 && E::NUM_PLAYERS <= u8::MAX as usize);

        let max_nodes = config.max_nodes as usize;
        let max_children = E::MAX_VALID_ACTIONS;
        let slots = max_nodes * max_children;
        let num_players = E::NUM_PLAYERS;

        let tree = Self {
            engine,
            max_children,
            num_players,
            flags: (0..max_nodes).map(|_| AtomicU8::new(0)).collect(),
            parent: (0..max_nodes).map(|_| AtomicU32::new(NO_CHILD)).collect(),
            child_count: (0..max_nodes).map(|_| AtomicU16::new(0)).collect(),
            node_player: (0..max_nodes).map(|_| AtomicU8::new(0)).collect(),
            states: (0..max_nodes)
                .map(|_| Mutex::new(E::State::default()))
                .collect(),
            edge_child: (0..slots).map(|_| AtomicU32::new(NO_CHILD)).collect(),
            edge_n: (0..slots).map(|_| AtomicU32::new(0)).collect(),
            edge_w: (0..slots * num_players)
                .map(|_| AtomicF32::new(0.0))
                .collect(),
            edge_prior: (0..slots).map(|_| AtomicF32::new(0.0)).collect(),
            edge_action_idx: (0..slots).map(|_| AtomicU32::new(0)).collect(),
            pool: NodePool::new(config.max_nodes),
            ctrl: Mutex::new(LocalCache::new(usize::MAX)),
            nodes_in_use: AtomicU32::new(0),
            root: AtomicU32::new(NO_CHILD),
            finished_simulations: AtomicU32::new(0),
            reserved_simulations: AtomicU32::new(0),
            target_simulations: AtomicU32::new(0),
            search_active: AtomicBool::new(false),
            contract_violated: AtomicBool::new(false),
            root_history: Mutex::new(Vec::new()),
            history_snapshot: Mutex::new(Arc::new(Vec::new())),
            config,
        };
        Ok(tree)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn num_players(&self) -> usize {
        self.num_players
    }

    pub fn root_id(&self) -> NodeId {
        NodeId(self.root.load(Ordering::Acquire))
    }

    #[inline]
    pub fn flags(&self, n: NodeId) -> NodeFlags {
        NodeFlags::from_bits(self.flags[n.index()].load(Ordering::Acquire))
    }

    #[inline]
    pub fn child_count(&self, n: NodeId) -> usize {
        self.child_count[n.index()].load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn node_player(&self, n: NodeId) -> u8 {
        self.node_player[n.index()].load(Ordering::Relaxed)
    }

    /// Back-reference to the parent node; `NONE` for the root. Updated
    /// only at expansion time and during reroot.
    #[inline]
    pub fn parent(&self, n: NodeId) -> NodeId {
        NodeId(self.parent[n.index()].load(Ordering::Relaxed))
    }

    #[inline]
    fn edge_base(&self, n: NodeId) -> usize {
        n.index() * self.max_children
    }

    #[inline]
    fn slot(&self, n: NodeId, k: u16) -> usize {
        self.edge_base(n) + k as usize
    }

    pub fn clone_state(&self, n: NodeId) -> E::State {
        self.states[n.index()].lock().unwrap().clone()
    }

    pub fn nodes_in_use(&self) -> u32 {
        self.nodes_in_use.load(Ordering::Relaxed)
    }

    /// Free indices observable between searches: stripe lists plus the
    /// controller cache. Worker caches are flushed at every search end.
    pub fn free_nodes(&self) -> usize {
        self.pool.free_count() + self.ctrl.lock().unwrap().len()
    }

    /// Count of nodes reachable from the root. Only meaningful outside an
    /// active search.
    pub fn reachable_count(&self) -> usize {
        let root = self.root_id();
        if root.is_none() {
            return 0;
        }
        let mut stack = vec![root.0];
        let mut count = 0usize;
        while let Some(idx) = stack.pop() {
            count += 1;
            let n = NodeId(idx);
            let children = self.child_count(n);
            let base = self.edge_base(n);
            for k in 0..children {
                let c = self.edge_child[base + k].load(Ordering::Acquire);
                if c != NO_CHILD {
                    stack.push(c);
                }
            }
        }
        count
    }

    pub fn memory_full(&self) -> bool {
        let threshold =
            (self.config.max_nodes as f32 * self.config.memory_threshold) as u32;
        self.nodes_in_use.load(Ordering::Relaxed) >= threshold
    }

    pub(crate) fn record_contract_violation(&self) {
        self.contract_violated.store(true, Ordering::Release);
    }

    pub fn contract_violated(&self) -> bool {
        self.contract_violated.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Simulation accounting
    // ------------------------------------------------------------------

    pub(crate) fn begin_search(&self, simulations: u32) {
        let finished = self.finished_simulations.load(Ordering::Relaxed);
        self.target_simulations
            .store(finished.saturating_add(simulations), Ordering::Relaxed);
        self.reserved_simulations.store(finished, Ordering::Relaxed);
        self.search_active.store(true, Ordering::SeqCst);
    }

    pub(crate) fn end_search(&self) {
        self.search_active.store(false, Ordering::SeqCst);
    }

    pub fn search_active(&self) -> bool {
        self.search_active.load(Ordering::SeqCst)
    }

    pub fn simulation_count(&self) -> u32 {
        self.finished_simulations.load(Ordering::Acquire)
    }

    pub(crate) fn target_simulations(&self) -> u32 {
        self.target_simulations.load(Ordering::Relaxed)
    }

    /// Claim one simulation against the target. Aborted descents must
    /// release their claim so another attempt can run in its place.
    pub(crate) fn reserve_simulation(&self) -> bool {
        let target = self.target_simulations.load(Ordering::Relaxed);
        let mut current = self.reserved_simulations.load(Ordering::Relaxed);
        loop {
            if current >= target {
                return false;
            }
            match self.reserved_simulations.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn release_reservation(&self) {
        self.reserved_simulations.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn finish_simulation(&self) {
        self.finished_simulations.fetch_add(1, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Node allocation
    // ------------------------------------------------------------------

    fn alloc_node(&self, cache: &mut LocalCache) -> Option<NodeId> {
        let idx = self.pool.alloc(cache)?;
        self.nodes_in_use.fetch_add(1, Ordering::Relaxed);
        Some(NodeId(idx))
    }

    fn unalloc_node(&self, cache: &mut LocalCache, n: NodeId) {
        self.nodes_in_use.fetch_sub(1, Ordering::Relaxed);
        self.pool.free(cache, n.0);
    }

    /// Reset a node and hand its index back to the pool (global path).
    fn release_node(&self, n: NodeId) {
        let i = n.index();
        self.flags[i].store(0, Ordering::Relaxed);
        self.child_count[i].store(0, Ordering::Relaxed);
        self.parent[i].store(NO_CHILD, Ordering::Relaxed);
        self.nodes_in_use.fetch_sub(1, Ordering::Relaxed);
        self.pool.free_global(n.0);
    }

    pub(crate) fn flush_worker_cache(&self, cache: &mut LocalCache) {
        self.pool.flush_local(cache);
    }

    // ------------------------------------------------------------------
    // Selection & virtual loss
    // ------------------------------------------------------------------

    /// PUCT selection over the live edges of `n`. Returns the edge ordinal
    /// and child id, or `None` when no edge is selectable.
    pub fn select_child(&self, n: NodeId) -> Option<(u16, NodeId)> {
        let count = self.child_count(n);
        if count == 0 {
            return None;
        }
        let base = self.edge_base(n);
        let player = self.node_player(n) as usize;
        let num_players = self.num_players;

        let mut sum_n = 0u32;
        for k in 0..count {
            sum_n += self.edge_n[base + k].load(Ordering::Relaxed);
        }
        let sqrt_sum = (sum_n.max(1) as f32).sqrt();

        let mut best: Option<(u16, NodeId)> = None;
        let mut best_score = f32::NEG_INFINITY;
        for k in 0..count {
            let s = base + k;
            let child = self.edge_child[s].load(Ordering::Acquire);
            if child == NO_CHILD {
                continue;
            }
            let visits = self.edge_n[s].load(Ordering::Relaxed);
            let q = if visits > 0 {
                self.edge_w[s * num_players + player].load(Ordering::Relaxed) / visits as f32
            } else {
                0.0
            };
            let mut prior = self.edge_prior[s].load(Ordering::Relaxed);
            if prior.is_nan() {
                prior = 0.0;
            }
            let u = self.config.c_puct * prior * sqrt_sum / (1.0 + visits as f32);
            let score = q + u;
            if score > best_score {
                best_score = score;
                best = Some((k as u16, NodeId(child)));
            }
        }
        best
    }

    /// Apply virtual loss to the edge `(n, k)` on behalf of `player` (the
    /// player to move at `n`): the in-flight descent looks like a loss for
    /// that player and a win for the others, keeping the player-sum of W
    /// unchanged.
    pub fn apply_virtual_loss(&self, n: NodeId, k: u16, player: u8) {
        let s = self.slot(n, k);
        let vl = self.config.virtual_loss;
        self.edge_n[s].fetch_add(1, Ordering::Relaxed);
        for p in 0..self.num_players {
            let delta = if p == player as usize { -vl } else { vl };
            self.edge_w[s * self.num_players + p].fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Abort a partial descent: undo the visit increment and the virtual
    /// loss on every recorded edge, with the exact inverse signs.
    pub fn cleanup_path(&self, path: &[PathStep]) {
        let vl = self.config.virtual_loss;
        for step in path {
            let s = self.slot(NodeId(step.node), step.k);
            self.edge_n[s].fetch_sub(1, Ordering::Relaxed);
            for p in 0..self.num_players {
                let delta = if p == step.player as usize { vl } else { -vl };
                self.edge_w[s * self.num_players + p].fetch_add(delta, Ordering::Relaxed);
            }
        }
    }

    /// Commit a finished simulation: revert the virtual loss and add the
    /// per-player values along the recorded path. `N` was already bumped
    /// when the virtual loss was applied and is left untouched.
    pub fn commit_path(&self, path: &[PathStep], values: &[f32]) {
        debug_assert_eq!(values.len(), self.num_players);
        let vl = self.config.virtual_loss;
        for step in path.iter().rev() {
            let s = self.slot(NodeId(step.node), step.k);
            for (p, &value) in values.iter().enumerate() {
                let revert = if p == step.player as usize { vl } else { -vl };
                self.edge_w[s * self.num_players + p]
                    .fetch_add(value + revert, Ordering::Relaxed);
            }
        }
    }

    /// Terminal values of a node flagged `TERMINAL`.
    pub fn terminal_values(&self, n: NodeId, values: &mut Vec<f32>) {
        let state = self.clone_state(n);
        if !self.engine.is_terminal(&state, values) {
            warn!(node = n.0, "terminal-flagged node rejected by engine");
            values.clear();
            values.resize(self.num_players, 0.0);
        }
    }

    // ------------------------------------------------------------------
    // Expansion
    // ------------------------------------------------------------------

    /// Try to take the expansion lock: CAS the flag byte from empty to
    /// `EXPANDING`. Exactly one caller wins per node lifetime.
    pub fn try_lock_expansion(&self, n: NodeId) -> bool {
        self.flags[n.index()]
            .compare_exchange(
                NodeFlags::EMPTY.bits(),
                NodeFlags::EXPANDING.bits(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Expand `n`. The caller must have won `try_lock_expansion`.
    ///
    /// On `Terminal` the engine's terminal values are left in `values`.
    /// Children are created with uniform priors; the coordinator replaces
    /// them once the evaluator has seen the leaf.
    pub fn expand_node(
        &self,
        n: NodeId,
        cache: &mut LocalCache,
        actions: &mut Vec<E::Action>,
        values: &mut Vec<f32>,
        children: &mut Vec<NodeId>,
    ) -> ExpandOutcome {
        debug_assert!(self.flags(n).contains(NodeFlags::EXPANDING));

        let state = self.clone_state(n);
        if self.engine.is_terminal(&state, values) {
            if values.len() != self.num_players {
                error!(
                    node = n.0,
                    got = values.len(),
                    "engine terminal values have wrong arity"
                );
                self.record_contract_violation();
                values.resize(self.num_players, 0.0);
            }
            self.store_flags(n, NodeFlags::EXPANDED | NodeFlags::TERMINAL);
            return ExpandOutcome::Terminal;
        }

        self.engine.valid_actions(&state, actions);
        if actions.is_empty() {
            // Non-terminal state without moves contradicts the contract;
            // close the node off with neutral values.
            error!(
                node = n.0,
                state = ?state,
                "no valid actions for a non-terminal state"
            );
            self.record_contract_violation();
            values.clear();
            values.resize(self.num_players, 0.0);
            self.store_flags(n, NodeFlags::EXPANDED | NodeFlags::TERMINAL);
            return ExpandOutcome::Terminal;
        }
        if actions.len() > self.max_children {
            error!(
                node = n.0,
                got = actions.len(),
                max = self.max_children,
                "engine returned more actions than MAX_VALID_ACTIONS"
            );
            self.record_contract_violation();
            actions.truncate(self.max_children);
        }

        if self.memory_full() {
            self.store_flags(n, NodeFlags::EXPANDED | NodeFlags::PINNED);
            return ExpandOutcome::Pinned;
        }

        // Acquire every child up front so a mid-expansion shortfall leaves
        // no half-written slots behind.
        children.clear();
        for _ in 0..actions.len() {
            match self.alloc_node(cache) {
                Some(child) => children.push(child),
                None => {
                    for &c in children.iter() {
                        self.unalloc_node(cache, c);
                    }
                    children.clear();
                    self.store_flags(n, NodeFlags::EXPANDED | NodeFlags::PINNED);
                    return ExpandOutcome::Pinned;
                }
            }
        }

        let base = self.edge_base(n);
        let uniform = 1.0 / actions.len() as f32;
        for (k, action) in actions.iter().enumerate() {
            let child = children[k];
            let ci = child.index();

            let mut child_state = state.clone();
            self.engine.apply_action(action, &mut child_state);
            let player = self.engine.current_player(&child_state) as u8;

            *self.states[ci].lock().unwrap() = child_state;
            self.node_player[ci].store(player, Ordering::Relaxed);
            self.parent[ci].store(n.0, Ordering::Relaxed);
            self.child_count[ci].store(0, Ordering::Relaxed);
            self.flags[ci].store(0, Ordering::Relaxed);

            let s = base + k;
            self.edge_n[s].store(0, Ordering::Relaxed);
            for p in 0..self.num_players {
                self.edge_w[s * self.num_players + p].store(0.0, Ordering::Relaxed);
            }
            self.edge_prior[s].store(uniform, Ordering::Relaxed);
            self.edge_action_idx[s]
                .store(self.engine.action_to_idx(action), Ordering::Relaxed);
            // Publication point: the child becomes selectable here.
            self.edge_child[s].store(child.0, Ordering::Release);
        }

        self.child_count[n.index()].store(actions.len() as u16, Ordering::Release);
        self.store_flags(n, NodeFlags::EXPANDED);
        ExpandOutcome::Expanded
    }

    #[inline]
    fn store_flags(&self, n: NodeId, flags: NodeFlags) {
        self.flags[n.index()].store(flags.bits(), Ordering::Release);
    }

    /// Overwrite the priors of `n`'s edges from a raw policy over the flat
    /// action space: gather by action index, normalise to sum 1, fall back
    /// to uniform when the gathered mass vanishes.
    pub fn apply_policy(&self, n: NodeId, policy: &[f32]) {
        let count = self.child_count(n);
        if count == 0 {
            return;
        }
        let base = self.edge_base(n);

        let mut gathered = Vec::with_capacity(count);
        let mut sum = 0.0f32;
        for k in 0..count {
            let idx = self.edge_action_idx[base + k].load(Ordering::Relaxed) as usize;
            let mut p = policy.get(idx).copied().unwrap_or(0.0);
            if p.is_nan() {
                p = 0.0;
            }
            gathered.push(p);
            sum += p;
        }

        if sum > 1e-9 {
            let norm = 1.0 / sum;
            for (k, p) in gathered.iter().enumerate() {
                self.edge_prior[base + k].store(p * norm, Ordering::Relaxed);
            }
        } else {
            let uniform = 1.0 / count as f32;
            for k in 0..count {
                self.edge_prior[base + k].store(uniform, Ordering::Relaxed);
            }
        }
    }

    // ------------------------------------------------------------------
    // History window
    // ------------------------------------------------------------------

    /// Snapshot the root history so the barrier sees a stable read-only
    /// view for the whole search.
    pub fn cache_root_history(&self) {
        let snapshot = Arc::new(self.root_history.lock().unwrap().clone());
        *self.history_snapshot.lock().unwrap() = snapshot;
    }

    pub fn history_snapshot(&self) -> Arc<Vec<HistoryEntry<E::IdxState>>> {
        Arc::clone(&self.history_snapshot.lock().unwrap())
    }

    pub fn history_len(&self) -> usize {
        self.root_history.lock().unwrap().len()
    }

    /// Build the evaluator context window for a leaf reached via `path`:
    /// the cached pre-root entries followed by one entry per traversed
    /// edge, front-padded (or front-truncated) to exactly `history_size`.
    pub fn build_history(
        &self,
        path: &[PathStep],
        out: &mut Vec<HistoryEntry<E::IdxState>>,
    ) {
        out.clear();
        let snapshot = self.history_snapshot();
        let needed = self.config.history_size;
        let total = snapshot.len() + path.len();

        if total < needed {
            for _ in 0..(needed - total) {
                out.push(HistoryEntry::pad());
            }
        }
        let skip = total.saturating_sub(needed);

        let mut position = 0usize;
        for entry in snapshot.iter() {
            if out.len() == needed {
                break;
            }
            if position >= skip {
                out.push(entry.clone());
            }
            position += 1;
        }
        for step in path {
            if out.len() == needed {
                break;
            }
            if position >= skip {
                let s = self.slot(NodeId(step.node), step.k);
                out.push(HistoryEntry {
                    state: E::IdxState::default(),
                    action: self.edge_action_idx[s].load(Ordering::Relaxed),
                });
            }
            position += 1;
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle: start, reroot, prune
    // ------------------------------------------------------------------

    /// Build a fresh tree around `root_state`, dropping any previous tree
    /// and history. The root is expanded eagerly (with uniform priors) so
    /// workers do not all collide on it in the first round.
    pub fn start_search(&self, root_state: E::State) -> Result<NodeId, SearchError> {
        if self.search_active() {
            return Err(SearchError::SearchActive("start_search"));
        }
        let old_root = self.root_id();
        if old_root.is_some() {
            self.root.store(NO_CHILD, Ordering::Release);
            self.free_subtree(old_root);
        }
        self.root_history.lock().unwrap().clear();
        self.init_root(root_state)
    }

    fn init_root(&self, root_state: E::State) -> Result<NodeId, SearchError> {
        let mut ctrl = self.ctrl.lock().unwrap();
        let root = self
            .alloc_node(&mut ctrl)
            .ok_or(SearchError::PoolExhausted)?;
        let ri = root.index();

        let player = self.engine.current_player(&root_state) as u8;
        *self.states[ri].lock().unwrap() = root_state;
        self.node_player[ri].store(player, Ordering::Relaxed);
        self.parent[ri].store(NO_CHILD, Ordering::Relaxed);
        self.child_count[ri].store(0, Ordering::Relaxed);
        self.flags[ri].store(0, Ordering::Relaxed);

        self.finished_simulations.store(0, Ordering::Relaxed);
        self.reserved_simulations.store(0, Ordering::Relaxed);
        self.target_simulations.store(0, Ordering::Relaxed);

        if self.try_lock_expansion(root) {
            let mut actions = Vec::new();
            let mut values = Vec::new();
            let mut children = Vec::new();
            self.expand_node(root, &mut ctrl, &mut actions, &mut values, &mut children);
        }
        drop(ctrl);

        self.root.store(root.0, Ordering::Release);
        self.cache_root_history();
        Ok(root)
    }

    /// Advance the root along the played action, retaining the played
    /// subtree when possible. Must only be called between searches.
    pub fn reroot_by_played_action(
        &self,
        action: &E::Action,
    ) -> Result<RerootOutcome, SearchError> {
        if self.search_active() {
            return Err(SearchError::SearchActive("reroot_by_played_action"));
        }
        let root = self.root_id();
        if root.is_none() {
            return Err(SearchError::InvalidState(
                "reroot without an active root".into(),
            ));
        }

        let old_state = self.clone_state(root);
        let action_idx = self.engine.action_to_idx(action);

        // The history entry is appended whether or not the subtree is
        // reused, truncating from the front to the window length.
        {
            let mut hist = self.root_history.lock().unwrap();
            hist.push(HistoryEntry {
                state: self.engine.obs_to_idx(&old_state),
                action: action_idx,
            });
            let excess = hist.len().saturating_sub(self.config.history_size);
            if excess > 0 {
                hist.drain(..excess);
            }
        }

        let mut next = NO_CHILD;
        if self.config.reuse_tree && self.flags(root).contains(NodeFlags::EXPANDED) {
            let base = self.edge_base(root);
            for k in 0..self.child_count(root) {
                let s = base + k;
                let child = self.edge_child[s].load(Ordering::Acquire);
                if child != NO_CHILD
                    && self.edge_action_idx[s].load(Ordering::Relaxed) == action_idx
                {
                    next = child;
                    break;
                }
            }
        }

        if next != NO_CHILD {
            // Promote the played child: free every sibling subtree, then
            // the old root node itself.
            let base = self.edge_base(root);
            for k in 0..self.child_count(root) {
                let s = base + k;
                let child = self.edge_child[s].load(Ordering::Acquire);
                self.edge_child[s].store(NO_CHILD, Ordering::Relaxed);
                if child != NO_CHILD && child != next {
                    self.free_subtree(NodeId(child));
                }
            }
            self.child_count[root.index()].store(0, Ordering::Relaxed);
            self.release_node(root);

            self.parent[next as usize].store(NO_CHILD, Ordering::Relaxed);
            self.root.store(next, Ordering::Release);
            self.finished_simulations.store(0, Ordering::Relaxed);
            self.reserved_simulations.store(0, Ordering::Relaxed);
            self.target_simulations.store(0, Ordering::Relaxed);
            self.cache_root_history();

            if self.memory_full() {
                // The retained subtree alone crosses the memory threshold;
                // restart from its state instead of searching into a full
                // pool.
                let state = self.clone_state(NodeId(next));
                self.root.store(NO_CHILD, Ordering::Release);
                self.free_subtree(NodeId(next));
                self.init_root(state)?;
                return Ok(RerootOutcome::Restarted);
            }
            return Ok(RerootOutcome::Promoted);
        }

        // No reusable child: apply the action to the old root state and
        // rebuild, keeping the (already updated) history.
        let mut new_state = old_state;
        self.engine.apply_action(action, &mut new_state);
        self.root.store(NO_CHILD, Ordering::Release);
        self.free_subtree(root);
        self.init_root(new_state)?;
        Ok(RerootOutcome::Restarted)
    }

    /// Free every root-child subtree except the `keep` most visited.
    /// Returns the number of subtrees pruned.
    pub fn prune_root(&self, keep: u32) -> Result<usize, SearchError> {
        if self.search_active() {
            return Err(SearchError::SearchActive("prune_root"));
        }
        let root = self.root_id();
        if root.is_none() {
            return Err(SearchError::InvalidState("prune without a root".into()));
        }
        let count = self.child_count(root);
        if count <= keep as usize {
            return Ok(0);
        }
        let base = self.edge_base(root);

        let mut ranked: Vec<(usize, u32)> = (0..count)
            .filter(|&k| self.edge_child[base + k].load(Ordering::Acquire) != NO_CHILD)
            .map(|k| (k, self.edge_n[base + k].load(Ordering::Relaxed)))
            .collect();
        // Stable sort keeps first-found ordering among equal visit counts.
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let mut pruned = 0usize;
        for &(k, _) in ranked.iter().skip(keep as usize) {
            let s = base + k;
            let child = self.edge_child[s].load(Ordering::Acquire);
            self.edge_child[s].store(NO_CHILD, Ordering::Relaxed);
            if child != NO_CHILD {
                self.free_subtree(NodeId(child));
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// Iterative DFS free of a whole subtree. Every visited edge is
    /// sentinelled before its child is pushed, so a partially freed
    /// subtree never exposes a dangling child index.
    pub fn free_subtree(&self, start: NodeId) {
        debug_assert!(!self.search_active());
        let mut stack = vec![start.0];
        while let Some(idx) = stack.pop() {
            let n = NodeId(idx);
            let count = self.child_count(n);
            let base = self.edge_base(n);
            for k in 0..count {
                let s = base + k;
                let child = self.edge_child[s].load(Ordering::Acquire);
                self.edge_child[s].store(NO_CHILD, Ordering::Relaxed);
                if child != NO_CHILD {
                    stack.push(child);
                }
            }
            self.release_node(n);
        }
    }

    // ------------------------------------------------------------------
    // Move selection
    // ------------------------------------------------------------------

    /// Pick the move to play from the root.
    ///
    /// At near-zero temperature: argmax by visit count with first-found
    /// tie-break, falling back to the highest prior when nothing has been
    /// visited. Otherwise: sample proportional to `N^(1/temperature)`,
    /// falling back to argmax when the weights vanish.
    pub fn best_action_from_root(
        &self,
        temperature: f32,
        rng: &mut ChaCha20Rng,
    ) -> Result<E::Action, SearchError> {
        if self.search_active() {
            return Err(SearchError::SearchActive("best_action_from_root"));
        }
        let root = self.root_id();
        if root.is_none() {
            return Err(SearchError::InvalidState(
                "best action without a root".into(),
            ));
        }
        let count = self.child_count(root);
        if count == 0 {
            return Err(SearchError::NoLegalMoves);
        }
        let base = self.edge_base(root);

        if temperature < 1e-3 {
            return Ok(self.greedy_action(root));
        }

        let inv_temp = 1.0f64 / temperature as f64;
        let temp_is_one = (temperature - 1.0).abs() < 1e-3;
        let mut weights = Vec::with_capacity(count);
        let mut sum = 0.0f64;
        for k in 0..count {
            let s = base + k;
            let visits = self.edge_n[s].load(Ordering::Relaxed);
            let w = if visits == 0 || self.edge_child[s].load(Ordering::Acquire) == NO_CHILD
            {
                0.0
            } else if temp_is_one {
                visits as f64
            } else {
                (visits as f64).powf(inv_temp)
            };
            weights.push(w);
            sum += w;
        }
        if sum < 1e-9 {
            return Ok(self.greedy_action(root));
        }

        let dist = WeightedIndex::new(&weights)
            .map_err(|e| SearchError::InvalidState(format!("sampling weights: {e}")))?;
        let k = dist.sample(rng);
        let idx = self.edge_action_idx[base + k].load(Ordering::Relaxed);
        Ok(self.engine.idx_to_action(idx))
    }

    fn greedy_action(&self, root: NodeId) -> E::Action {
        let count = self.child_count(root);
        let base = self.edge_base(root);

        let mut best_k = 0usize;
        let mut best_n = 0u32;
        let mut seen_live = false;
        for k in 0..count {
            let s = base + k;
            if self.edge_child[s].load(Ordering::Acquire) == NO_CHILD {
                continue;
            }
            let visits = self.edge_n[s].load(Ordering::Relaxed);
            if !seen_live || visits > best_n {
                best_k = k;
                best_n = visits;
            }
            seen_live = true;
        }

        if best_n == 0 {
            // Nothing visited: take the highest prior instead.
            let mut best_p = f32::NEG_INFINITY;
            for k in 0..count {
                let s = base + k;
                if self.edge_child[s].load(Ordering::Acquire) == NO_CHILD {
                    continue;
                }
                let p = self.edge_prior[s].load(Ordering::Relaxed);
                if p > best_p {
                    best_p = p;
                    best_k = k;
                }
            }
        }

        let idx = self.edge_action_idx[base + best_k].load(Ordering::Relaxed);
        self.engine.idx_to_action(idx)
    }

    /// Snapshot of every live root edge, for inspection and tests.
    pub fn root_child_stats(&self) -> Vec<EdgeStats> {
        let root = self.root_id();
        if root.is_none() {
            return Vec::new();
        }
        let base = self.edge_base(root);
        (0..self.child_count(root))
            .filter_map(|k| {
                let s = base + k;
                let child = self.edge_child[s].load(Ordering::Acquire);
                if child == NO_CHILD {
                    return None;
                }
                Some(EdgeStats {
                    k,
                    action_idx: self.edge_action_idx[s].load(Ordering::Relaxed),
                    child: NodeId(child),
                    visits: self.edge_n[s].load(Ordering::Relaxed),
                    prior: self.edge_prior[s].load(Ordering::Relaxed),
                    w: (0..self.num_players)
                        .map(|p| {
                            self.edge_w[s * self.num_players + p].load(Ordering::Relaxed)
                        })
                        .collect(),
                })
            })
            .collect()
    }
}
