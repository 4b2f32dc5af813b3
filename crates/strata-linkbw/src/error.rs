//! Error types for configuration, statistics persistence, modem activity
//! requests and scenario loading.
//!
//! None of these are fatal to the estimator: store and activity failures
//! degrade to the next fallback tier (sample → long-term average → static
//! baseline).

use thiserror::Error;

/// Configuration could not be loaded or resolved.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed static bandwidth entry {0:?} (expected \"RAT:rx,tx\")")]
    StaticEntry(String),
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
}

/// The file-backed statistics store failed to load or persist.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stats store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stats store encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported stats file version {0}")]
    UnsupportedVersion(u32),
}

/// A modem activity request produced no report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    /// The host reported a failure reading modem stats.
    #[error("modem activity unavailable: {0}")]
    Unavailable(String),
    /// The watchdog gave up waiting for the host.
    #[error("modem activity request timed out")]
    TimedOut,
}

/// A replay scenario could not be loaded.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("invalid scenario TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("scenario config: {0}")]
    Config(#[from] ConfigError),
}
