//! Core traits and types for the pando game engine
//!
//! This crate provides the contract between game-rules implementations and
//! the search core:
//! - `Engine`: typed trait exposing move generation, state transitions,
//!   terminal detection and the index encodings consumed by an evaluator
//! - `HistoryEntry`: one `(state, action)` element of the context window
//!   supplied to the evaluator
//!
//! The search core never sees concrete board types; it is generic over
//! `Engine` and calls only the methods listed here. Composition of a game,
//! an evaluator and a searcher happens at the call site — there is no
//! process-wide registry. The contract is infallible by design: an engine
//! that cannot satisfy it signals the violation through its return values
//! (empty action lists, `false` from `is_terminal`), which the searcher
//! treats as a contract fault.

pub mod engine;

pub use engine::{Engine, HistoryEntry, PAD_ACTION};
