//! Configuration loading logic.
//!
//! Handles loading config from files and applying environment variable
//! overrides. Unlike lenient loaders, every failure here is fatal: a config
//! file that exists but does not parse is a setup bug, not something to
//! paper over with defaults.

use crate::CentralConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while locating or parsing the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("PANDO_CONFIG points to {0} which does not exist")]
    MissingExplicitPath(PathBuf),

    #[error("Invalid override {key}={value}: expected {expected}")]
    InvalidOverride {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Standard locations to search for config.toml
pub const CONFIG_SEARCH_PATHS: &[&str] = &[
    "config.toml",      // Current directory
    "../config.toml",   // Parent directory (when running from a subdirectory)
    "/app/config.toml", // Container
];

/// Load the central configuration from config.toml.
///
/// Searches for config.toml in the following order:
/// 1. Path specified by the PANDO_CONFIG environment variable
/// 2. Current directory (config.toml)
/// 3. Parent directory (../config.toml)
/// 4. Container path (/app/config.toml)
///
/// After loading, environment variable overrides are applied. A missing
/// file is fine (defaults apply); an unreadable or unparsable one is not.
pub fn load_config() -> Result<CentralConfig, ConfigError> {
    if let Ok(path) = std::env::var("PANDO_CONFIG") {
        let path = PathBuf::from(&path);
        if !path.exists() {
            return Err(ConfigError::MissingExplicitPath(path));
        }
        info!("Loading config from PANDO_CONFIG: {}", path.display());
        return load_from_path(&path);
    }

    for path_str in CONFIG_SEARCH_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading config from {}", path.display());
            return load_from_path(&path);
        }
    }

    debug!("No config.toml found, using built-in defaults");
    apply_env_overrides(CentralConfig::default())
}

/// Load configuration from a specific path.
pub fn load_from_path(path: &Path) -> Result<CentralConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env_overrides(config)
}

/// Macro to reduce env override boilerplate
macro_rules! env_override {
    // String field
    ($config:expr, $section:ident . $field:ident, $key:expr) => {
        if let Ok(v) = std::env::var($key) {
            $config.$section.$field = v;
        }
    };
    // Parseable field (u32, f32, bool, etc.)
    ($config:expr, $section:ident . $field:ident, $key:expr, parse) => {
        if let Ok(v) = std::env::var($key) {
            $config.$section.$field =
                v.parse().map_err(|_| ConfigError::InvalidOverride {
                    key: $key,
                    value: v,
                    expected: stringify!($field),
                })?;
        }
    };
    // Optional parseable field (Option<u32>, ...)
    ($config:expr, $section:ident . $field:ident, $key:expr, optional_parse) => {
        if let Ok(v) = std::env::var($key) {
            $config.$section.$field =
                Some(v.parse().map_err(|_| ConfigError::InvalidOverride {
                    key: $key,
                    value: v,
                    expected: stringify!($field),
                })?);
        }
    };
}

/// Apply environment variable overrides to a configuration.
///
/// Environment variables follow the pattern: PANDO_<SECTION>_<KEY>
pub fn apply_env_overrides(mut config: CentralConfig) -> Result<CentralConfig, ConfigError> {
    // Common
    env_override!(config, common.log_level, "PANDO_COMMON_LOG_LEVEL");
    env_override!(config, common.game, "PANDO_COMMON_GAME");

    // Search
    env_override!(
        config,
        search.num_simulations,
        "PANDO_SEARCH_NUM_SIMULATIONS",
        parse
    );
    env_override!(config, search.c_puct, "PANDO_SEARCH_C_PUCT", parse);
    env_override!(
        config,
        search.virtual_loss,
        "PANDO_SEARCH_VIRTUAL_LOSS",
        parse
    );
    env_override!(
        config,
        search.temperature,
        "PANDO_SEARCH_TEMPERATURE",
        parse
    );
    env_override!(config, search.max_nodes, "PANDO_SEARCH_MAX_NODES", parse);
    env_override!(config, search.max_depth, "PANDO_SEARCH_MAX_DEPTH", parse);
    env_override!(
        config,
        search.history_size,
        "PANDO_SEARCH_HISTORY_SIZE",
        parse
    );
    env_override!(config, search.batch_size, "PANDO_SEARCH_BATCH_SIZE", parse);
    env_override!(
        config,
        search.queue_scale,
        "PANDO_SEARCH_QUEUE_SCALE",
        parse
    );
    env_override!(config, search.fast_drain, "PANDO_SEARCH_FAST_DRAIN", parse);
    env_override!(config, search.reuse_tree, "PANDO_SEARCH_REUSE_TREE", parse);
    env_override!(
        config,
        search.memory_threshold,
        "PANDO_SEARCH_MEMORY_THRESHOLD",
        parse
    );
    env_override!(
        config,
        search.num_search_threads,
        "PANDO_SEARCH_NUM_SEARCH_THREADS",
        parse
    );
    env_override!(config, search.keep_k, "PANDO_SEARCH_KEEP_K", optional_parse);

    Ok(config)
}
