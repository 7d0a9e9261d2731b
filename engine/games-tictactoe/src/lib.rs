//! TicTacToe game implementation for the pando searcher
//!
//! This crate provides a complete reference implementation of the
//! `pando_core::Engine` trait, small enough to read in one sitting and
//! used throughout the search-core tests.
//!
//! # Usage
//!
//! ```rust
//! use games_tictactoe::{Place, TicTacToe};
//! use pando_core::Engine;
//!
//! let game = TicTacToe::new();
//! let mut state = game.initial_state(0);
//! game.apply_action(&Place(4), &mut state);
//! assert_eq!(game.current_player(&state), 1); // O to move
//! ```

use pando_core::Engine;

/// TicTacToe game state
///
/// Represents the complete state of a game including the board, current
/// player, and winner information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    /// Board representation: 0=empty, 1=X, 2=O
    board: [u8; 9],
    /// Current player: 1=X, 2=O
    current_player: u8,
    /// Winner: 0=none/ongoing, 1=X, 2=O, 3=draw
    winner: u8,
}

impl State {
    /// Create a new initial game state
    pub fn new() -> Self {
        Self {
            board: [0; 9],
            current_player: 1, // X goes first
            winner: 0,
        }
    }

    /// Check if the game is over
    pub fn is_done(&self) -> bool {
        self.winner != 0
    }

    /// Winner code: 0=ongoing, 1=X, 2=O, 3=draw
    pub fn winner(&self) -> u8 {
        self.winner
    }

    /// Get legal moves (empty positions)
    pub fn legal_moves(&self) -> Vec<u8> {
        if self.is_done() {
            return Vec::new();
        }

        (0..9u8)
            .filter(|&pos| self.board[pos as usize] == 0)
            .collect()
    }

    /// Make a move in place. Invalid moves leave the state unchanged.
    pub fn make_move(&mut self, position: u8) {
        if self.is_done() || position >= 9 || self.board[position as usize] != 0 {
            return;
        }

        self.board[position as usize] = self.current_player;
        self.winner = Self::check_winner(&self.board);

        // Switch player if game not over
        if self.winner == 0 {
            self.current_player = if self.current_player == 1 { 2 } else { 1 };
        }
    }

    /// Check for winner on the board
    fn check_winner(board: &[u8; 9]) -> u8 {
        // Winning positions (rows, columns, diagonals)
        const LINES: [[usize; 3]; 8] = [
            [0, 1, 2],
            [3, 4, 5],
            [6, 7, 8], // rows
            [0, 3, 6],
            [1, 4, 7],
            [2, 5, 8], // columns
            [0, 4, 8],
            [2, 4, 6], // diagonals
        ];

        for line in &LINES {
            let [a, b, c] = *line;
            if board[a] != 0 && board[a] == board[b] && board[b] == board[c] {
                return board[a];
            }
        }

        // Board full with no winner
        if board.iter().all(|&cell| cell != 0) {
            return 3;
        }

        0
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// TicTacToe action: place a piece at position 0-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Place(pub u8);

/// Index encoding of a state for evaluator input: one fact per cell
/// (0=empty, 1=X, 2=O) plus side-to-move and winner meta facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxState {
    pub cells: [u8; 9],
    pub to_move: u8,
    pub winner: u8,
}

impl Default for IdxState {
    fn default() -> Self {
        Self {
            cells: [0; 9],
            to_move: 0,
            winner: 0,
        }
    }
}

/// TicTacToe rules engine
#[derive(Debug, Default)]
pub struct TicTacToe;

impl TicTacToe {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for TicTacToe {
    type State = State;
    type Action = Place;
    type IdxState = IdxState;

    const NUM_PLAYERS: usize = 2;
    const MAX_VALID_ACTIONS: usize = 9;
    const ACTION_SPACE: usize = 9;
    const NUM_ELEMENTS: usize = 9;
    const NUM_META: usize = 2;

    fn initial_state(&self, _player: usize) -> State {
        State::new()
    }

    fn current_player(&self, state: &State) -> usize {
        (state.current_player - 1) as usize
    }

    fn valid_actions(&self, state: &State, out: &mut Vec<Place>) {
        out.clear();
        out.extend(state.legal_moves().into_iter().map(Place));
    }

    fn apply_action(&self, action: &Place, state: &mut State) {
        state.make_move(action.0);
    }

    fn is_terminal(&self, state: &State, values: &mut Vec<f32>) -> bool {
        values.clear();
        match state.winner {
            0 => false,
            1 => {
                values.extend_from_slice(&[1.0, -1.0]);
                true
            }
            2 => {
                values.extend_from_slice(&[-1.0, 1.0]);
                true
            }
            _ => {
                values.extend_from_slice(&[0.0, 0.0]);
                true
            }
        }
    }

    fn obs_to_idx(&self, state: &State) -> IdxState {
        IdxState {
            cells: state.board,
            to_move: state.current_player,
            winner: state.winner,
        }
    }

    fn action_to_idx(&self, action: &Place) -> u32 {
        action.0 as u32
    }

    fn idx_to_action(&self, idx: u32) -> Place {
        debug_assert!(idx < 9);
        Place(idx as u8)
    }
}
