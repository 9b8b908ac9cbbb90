//! Database configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Hard ceiling for the write buffer. Oversized buffers stall the
/// system when the flush finally happens and can exceed the largest
/// batch the backing store accepts.
pub const MAX_BUFFER_SIZE: usize = 256 * 1024 * 1024;

/// Default memory allowance of the write buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Default memory allowance of the clean trie node cache.
pub const DEFAULT_TRIE_CLEAN_SIZE: usize = 16 * 1024 * 1024;

/// Default memory allowance of the clean flat state cache.
pub const DEFAULT_STATE_CLEAN_SIZE: usize = 16 * 1024 * 1024;

/// Default number of diff layers kept in memory above the disk layer.
pub const DEFAULT_MAX_DIFF_LAYERS: usize = 128;

/// Default number of recent transitions to keep state history for.
pub const DEFAULT_STATE_HISTORY: u64 = 90_000;

/// Settings for the layered state database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of recent transitions to maintain state history for;
    /// zero keeps the entire chain of histories.
    #[serde(default = "default_state_history")]
    pub state_history: u64,

    /// Maximum byte allowance for caching clean trie nodes; zero
    /// disables the cache.
    #[serde(default = "default_trie_clean_size")]
    pub trie_clean_size: usize,

    /// Maximum byte allowance for caching clean flat state; zero
    /// disables the cache.
    #[serde(default = "default_state_clean_size")]
    pub state_clean_size: usize,

    /// Maximum byte allowance for the write buffer.
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,

    /// Maximum diff layers kept in memory before flattening.
    #[serde(default = "default_max_diff_layers")]
    pub max_diff_layers: usize,

    /// Whether the database rejects all mutations.
    #[serde(default)]
    pub read_only: bool,

    /// Directory for the state history table; `None` disables history
    /// and thereby rollback.
    #[serde(default)]
    pub history_directory: Option<PathBuf>,

    /// Directory for the shutdown journal file; `None` persists the
    /// journal inside the key-value store instead.
    #[serde(default)]
    pub journal_directory: Option<PathBuf>,

    /// Block on every scheduled flush until it completes.
    #[serde(default)]
    pub no_async_flush: bool,
}

fn default_state_history() -> u64 {
    DEFAULT_STATE_HISTORY
}

fn default_trie_clean_size() -> usize {
    DEFAULT_TRIE_CLEAN_SIZE
}

fn default_state_clean_size() -> usize {
    DEFAULT_STATE_CLEAN_SIZE
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_max_diff_layers() -> usize {
    DEFAULT_MAX_DIFF_LAYERS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_history: DEFAULT_STATE_HISTORY,
            trie_clean_size: DEFAULT_TRIE_CLEAN_SIZE,
            state_clean_size: DEFAULT_STATE_CLEAN_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            max_diff_layers: DEFAULT_MAX_DIFF_LAYERS,
            read_only: false,
            history_directory: None,
            journal_directory: None,
            no_async_flush: false,
        }
    }
}

impl Config {
    /// Clamp unworkable values.
    pub fn sanitize(mut self) -> Self {
        if self.write_buffer_size > MAX_BUFFER_SIZE {
            warn!(
                provided = self.write_buffer_size,
                updated = MAX_BUFFER_SIZE,
                "Sanitizing invalid write buffer size"
            );
            self.write_buffer_size = MAX_BUFFER_SIZE;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps_buffer() {
        let config = Config {
            write_buffer_size: MAX_BUFFER_SIZE * 2,
            ..Config::default()
        };
        assert_eq!(config.sanitize().write_buffer_size, MAX_BUFFER_SIZE);
    }

    #[test]
    fn test_defaults_survive_empty_deserialization() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_diff_layers, DEFAULT_MAX_DIFF_LAYERS);
        assert_eq!(config.state_history, DEFAULT_STATE_HISTORY);
        assert!(!config.read_only);
        assert_eq!(config.history_directory, None);
    }
}
