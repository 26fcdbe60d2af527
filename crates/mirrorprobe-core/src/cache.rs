//! Result cache contract.

use crate::error::CacheError;
use crate::probe::BoxFuture;
use crate::types::ResultEnvelope;

/// Key-value sink for completed envelopes.
///
/// Backends must tolerate concurrent writes; two writes to the same key
/// race and the last one wins.
pub trait Cache: Send + Sync {
    /// Persist `value` under `key` (`registry/probe/start`).
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a ResultEnvelope,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Read access to stored envelopes.
pub trait History: Send + Sync {
    /// Envelopes of `probe` against `registry`, ascending by start time.
    fn history(&self, registry: &str, probe: &str) -> Result<Vec<ResultEnvelope>, CacheError>;
}
