//! Typed Engine trait providing the game-rules contract for the searcher
//!
//! Games implement this trait with their concrete state and action types.
//! The trait keeps compile-time type safety; the search core is generic over
//! it and never inspects the concrete types beyond the listed operations.

use std::fmt::Debug;

/// Sentinel action index used to pad history windows shorter than the
/// configured context length.
pub const PAD_ACTION: u32 = u32::MAX;

/// One element of the evaluator context window: the index encoding of a
/// state and the flat index of the action played from it.
///
/// Entries contributed by the in-tree descent carry a padded (default)
/// state and a real action index; entries before the search root carry
/// both. The window itself is front-padded with `HistoryEntry::pad()` when
/// fewer than `history_size` entries exist.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry<S> {
    pub state: S,
    pub action: u32,
}

impl<S: Default> HistoryEntry<S> {
    /// An all-padding entry.
    pub fn pad() -> Self {
        Self {
            state: S::default(),
            action: PAD_ACTION,
        }
    }

    /// An entry with a real state and a padded action slot.
    pub fn from_state(state: S) -> Self {
        Self {
            state,
            action: PAD_ACTION,
        }
    }
}

/// Main trait for game-rules implementations
///
/// The searcher shares one engine instance across all of its worker
/// threads, so implementations must be stateless or internally
/// synchronized (`Send + Sync`). All game state lives in `State` values
/// owned by the caller.
///
/// # Type Parameters
///
/// * `State` - Full game state; cloned when the tree stores a node, so it
///   should be cheap to copy
/// * `Action` - Move label; small and `Copy`
/// * `IdxState` - Index encoding of a state for evaluator input
pub trait Engine: Send + Sync + 'static {
    /// Game state type - cloned into tree nodes. `Debug` so contract
    /// violations can log the offending state.
    type State: Clone + Default + Debug + Send + Sync + 'static;

    /// Action type - compared during reroot, so `PartialEq`
    type Action: Copy + PartialEq + Debug + Send + Sync + 'static;

    /// Index encoding of a state (evaluator input format)
    type IdxState: Clone + Default + Send + Sync + 'static;

    /// Number of players in the game.
    const NUM_PLAYERS: usize;

    /// Upper bound on the number of valid actions in any reachable state.
    /// Sizes the per-node edge window in the search tree.
    const MAX_VALID_ACTIONS: usize;

    /// Size of the flat policy head the evaluator produces.
    const ACTION_SPACE: usize;

    /// Number of board elements in the index encoding.
    const NUM_ELEMENTS: usize;

    /// Number of meta facts (side to move, move clocks, ...) in the index
    /// encoding.
    const NUM_META: usize;

    /// Initial state of a fresh game, from the perspective of `player`.
    fn initial_state(&self, player: usize) -> Self::State;

    /// Player to move in `state`, in `0..NUM_PLAYERS`.
    fn current_player(&self, state: &Self::State) -> usize;

    /// Collect the valid actions of `state` into `out` (cleared first).
    /// At most `MAX_VALID_ACTIONS` entries; empty means the state is
    /// terminal or stuck.
    fn valid_actions(&self, state: &Self::State, out: &mut Vec<Self::Action>);

    /// Apply `action` to `state` in place.
    fn apply_action(&self, action: &Self::Action, state: &mut Self::State);

    /// Whether `state` is terminal. On `true`, `values` is filled with one
    /// outcome value per player (cleared and resized by the callee).
    fn is_terminal(&self, state: &Self::State, values: &mut Vec<f32>) -> bool;

    /// Index encoding of `state` for evaluator input.
    fn obs_to_idx(&self, state: &Self::State) -> Self::IdxState;

    /// Flat policy index of `action`, in `0..ACTION_SPACE`.
    fn action_to_idx(&self, action: &Self::Action) -> u32;

    /// Inverse of `action_to_idx`. Only called with indices previously
    /// produced by `action_to_idx` on the same game.
    fn idx_to_action(&self, idx: u32) -> Self::Action;
}
