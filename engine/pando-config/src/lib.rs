//! Centralized configuration loading from config.toml.
//!
//! This crate provides the configuration structs and loading logic shared
//! by everything that embeds the searcher.
//!
//! # Configuration Priority
//!
//! Settings are loaded with the following priority (highest to lowest):
//! 1. Environment variables (`PANDO_<SECTION>_<KEY>`)
//! 2. config.toml file
//! 3. Built-in defaults
//!
//! # Environment Variable Override Pattern
//!
//! ```text
//! PANDO_<SECTION>_<KEY>=value
//!
//! Examples:
//!     PANDO_COMMON_LOG_LEVEL=debug
//!     PANDO_SEARCH_NUM_SIMULATIONS=1600
//!     PANDO_SEARCH_C_PUCT=2.0
//!     PANDO_SEARCH_NUM_SEARCH_THREADS=8
//! ```
//!
//! A malformed or out-of-range configuration is a fatal setup error: the
//! loader returns `ConfigError` instead of silently falling back to
//! defaults.

mod defaults;
mod loader;
mod structs;

pub use defaults::*;
pub use loader::{apply_env_overrides, load_config, load_from_path, ConfigError, CONFIG_SEARCH_PATHS};
pub use structs::*;
