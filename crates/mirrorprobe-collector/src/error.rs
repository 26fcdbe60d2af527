//! Collector error types.

use thiserror::Error;

pub type CollectorResult<T> = Result<T, CollectorError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollectorError {
    #[error("cannot schedule '{name}': {reason}")]
    Schedule { name: String, reason: String },

    #[error("feed refresh failed: {0}")]
    Feed(String),
}
