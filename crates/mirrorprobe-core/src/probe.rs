//! The probe contract shared by every health check.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::config::NpmAuth;
use crate::error::{CoreResult, ProbeError};
use crate::feed::{Feed, FeedHandle};
use crate::schedule::ScheduleSpec;
use crate::stats::{self, Describe};
use crate::types::{Endpoint, Endpoints, ResultEnvelope, ResultPayload};

/// Boxed future returned by probe and collaborator methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of a single probe execution.
pub type ProbeOutcome = Result<ResultPayload, ProbeError>;

/// A named, independently scheduled health check.
///
/// The collector only depends on this trait. `execute` runs once per
/// scheduled tick per target endpoint and resolves exactly once.
pub trait Probe: Send + Sync {
    /// Unique probe name.
    fn name(&self) -> &str;

    /// When the probe fires.
    fn schedule(&self) -> &ScheduleSpec;

    /// Names of the endpoints the probe runs against, in order.
    fn targets(&self) -> &[String];

    /// Run one measurement against `endpoint`.
    fn execute<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, ProbeOutcome>;

    /// Reduce a chronological history of this probe's envelopes for one
    /// endpoint into the latest classification. `None` when the history
    /// holds nothing this probe produced.
    fn summarize(&self, history: &[ResultEnvelope]) -> Option<Value>;
}

/// Builds a probe once the collector's shared state exists.
pub type ProbeFactory = Box<dyn FnOnce(&ProbeContext) -> Arc<dyn Probe> + Send>;

/// Read-only collector state handed to probes at construction.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    feed: FeedHandle,
    endpoints: Endpoints,
    npm_auth: Option<NpmAuth>,
}

impl ProbeContext {
    pub fn new(feed: FeedHandle, endpoints: Endpoints, npm_auth: Option<NpmAuth>) -> Self {
        Self {
            feed,
            endpoints,
            npm_auth,
        }
    }

    /// Current change-feed snapshot.
    pub fn feed(&self) -> Feed {
        self.feed.snapshot()
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn npm_auth(&self) -> Option<&NpmAuth> {
        self.npm_auth.as_ref()
    }

    /// Descriptive statistics over `samples`.
    pub fn calculate(&self, samples: &[f64]) -> CoreResult<Describe> {
        stats::describe(samples)
    }
}
