//! Configuration file parser for ~/.config/feedrelay/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`,
//! which has no sources. Unknown keys are accepted, though we log a warning
//! when the file contains potential typos.
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::feed::{RetryPolicy, DEFAULT_CURSOR_CAPACITY};
use crate::session::{Destinations, SourceRegistry};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Feed URL per source name. An empty URL disables the source.
    pub sources: SourceRegistry,

    /// Delivery routing per source, passed through untouched.
    pub destinations: Destinations,

    /// Feeds fetched simultaneously within one cycle.
    pub max_concurrent_fetches: usize,

    /// Identifiers remembered per source for deduplication.
    pub cursor_capacity: usize,

    /// Retry policy for 5xx responses. Disabled unless `max_retries` is set.
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: SourceRegistry::new(),
            destinations: Destinations::new(),
            max_concurrent_fetches: 10,
            cursor_capacity: DEFAULT_CURSOR_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content)
    }

    /// Parses configuration from TOML text. Blank text yields the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse as a raw table first to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "sources",
                "destinations",
                "max_concurrent_fetches",
                "cursor_capacity",
                "retry",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            sources = config.sources.len(),
            retries = config.retry.max_retries,
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
