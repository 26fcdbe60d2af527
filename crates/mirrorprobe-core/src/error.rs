//! Error types shared across mirrorprobe crates.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by configuration, scheduling, and statistics helpers.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("cannot describe an empty sample set")]
    EmptySamples,

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors a probe reports for a tick it considers unrecoverable.
///
/// Mirror-specific hiccups are folded into the payload instead; only
/// conditions that make the whole tick meaningless end up here.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeError {
    #[error("change feed is empty, nothing to compare")]
    EmptyFeed,

    #[error("http error: {0}")]
    Http(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("version error: {0}")]
    Version(String),

    #[error("publish command error: {0}")]
    Command(String),

    #[error("statistics error: {0}")]
    Stats(String),
}

impl From<CoreError> for ProbeError {
    fn from(e: CoreError) -> Self {
        ProbeError::Stats(e.to_string())
    }
}

/// Error returned by a cache backend's `set`.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("cache write failed: {0}")]
pub struct CacheError(pub String);
