//! Core domain types: endpoints, result envelopes, and registry documents.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stats::Describe;

/// Default per-request timeout when an endpoint does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Network location of a registry or mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub name: String,
    pub protocol: String,
    pub host: String,
    pub pathname: String,
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Endpoint {
    /// Build an endpoint from a base URL such as `https://registry.npmjs.org/`.
    pub fn from_href(name: &str, href: &str) -> Self {
        let (protocol, rest) = match href.split_once("//") {
            Some((scheme, rest)) => (scheme.to_string(), rest),
            None => ("https:".to_string(), href),
        };
        let (host, pathname) = match rest.find('/') {
            Some(idx) => (rest[..idx].to_string(), rest[idx..].to_string()),
            None => (rest.to_string(), "/".to_string()),
        };
        let href = format!("{protocol}//{host}{pathname}");
        Self {
            name: name.to_string(),
            protocol,
            host,
            pathname,
            href,
            timeout_ms: None,
        }
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Timeout for a single request against this endpoint.
    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// URL of `path` relative to this endpoint's base. Never mutates `self`.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.href.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Read-only mapping of mirror name to endpoint, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    inner: Arc<BTreeMap<String, Arc<Endpoint>>>,
}

impl Endpoints {
    /// Build the registry, stamping each endpoint with its map key.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let inner = endpoints
            .into_iter()
            .map(|e| (e.name.clone(), Arc::new(e)))
            .collect();
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Default public registries.
    pub fn defaults() -> Self {
        Self::new([
            Endpoint::from_href("npmjs", "https://registry.npmjs.org/"),
            Endpoint::from_href("yarnpkg", "https://registry.yarnpkg.com/"),
            Endpoint::from_href("npmmirror", "https://registry.npmmirror.com/"),
        ])
    }

    pub fn get(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.inner.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.inner.values()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Result of a replication-lag tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaReport {
    /// Modules whose mirror copy lags the feed.
    pub modules: Vec<String>,
    /// Lag statistics in milliseconds over every module in the feed.
    pub lag: Describe,
}

/// Result of a publish tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub published: bool,
    /// Round-trip time in milliseconds.
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload produced by a probe execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum ResultPayload {
    Ping(Describe),
    Delta(DeltaReport),
    Publish(PublishReport),
}

impl TryFrom<ResultPayload> for Describe {
    type Error = ResultPayload;

    fn try_from(payload: ResultPayload) -> Result<Self, Self::Error> {
        match payload {
            ResultPayload::Ping(d) => Ok(d),
            other => Err(other),
        }
    }
}

impl TryFrom<ResultPayload> for DeltaReport {
    type Error = ResultPayload;

    fn try_from(payload: ResultPayload) -> Result<Self, Self::Error> {
        match payload {
            ResultPayload::Delta(d) => Ok(d),
            other => Err(other),
        }
    }
}

impl TryFrom<ResultPayload> for PublishReport {
    type Error = ResultPayload;

    fn try_from(payload: ResultPayload) -> Result<Self, Self::Error> {
        match payload {
            ResultPayload::Publish(p) => Ok(p),
            other => Err(other),
        }
    }
}

/// Normalized record of one completed probe execution.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope<P = ResultPayload> {
    pub probe: String,
    pub registry: String,
    pub payload: P,
    pub start: i64,
    pub end: i64,
    pub duration_ms: i64,
}

impl<P> ResultEnvelope<P> {
    /// Build an envelope. A clock that stepped backwards is clamped so
    /// that `end >= start` and `duration_ms == end - start`.
    pub fn new(probe: &str, registry: &str, payload: P, start: i64, end: i64) -> Self {
        let end = end.max(start);
        Self {
            probe: probe.to_string(),
            registry: registry.to_string(),
            payload,
            start,
            end,
            duration_ms: end - start,
        }
    }

    /// Cache key: `registry/probe/start`.
    pub fn cache_key(&self) -> String {
        format!("{}/{}/{}", self.registry, self.probe, self.start)
    }

    /// Replace the payload, keeping the timing fields.
    pub fn with_payload<T>(&self, payload: T) -> ResultEnvelope<T> {
        ResultEnvelope {
            probe: self.probe.clone(),
            registry: self.registry.clone(),
            payload,
            start: self.start,
            end: self.end,
            duration_ms: self.duration_ms,
        }
    }
}

impl ResultEnvelope<ResultPayload> {
    /// Typed view of this envelope if the payload has the requested shape.
    pub fn narrow<T>(&self) -> Option<ResultEnvelope<T>>
    where
        T: TryFrom<ResultPayload>,
    {
        T::try_from(self.payload.clone())
            .ok()
            .map(|payload| self.with_payload(payload))
    }
}

/// Narrow a raw history to the envelopes carrying payload `T`.
pub fn narrow_history<T>(history: &[ResultEnvelope]) -> Vec<ResultEnvelope<T>>
where
    T: TryFrom<ResultPayload>,
{
    history.iter().filter_map(|env| env.narrow()).collect()
}

/// A package document as served by a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<BTreeMap<String, Value>>,
    #[serde(rename = "dist-tags")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_tags: Option<BTreeMap<String, Value>>,
}

impl ModuleDocument {
    /// `time.modified` in epoch milliseconds.
    pub fn modified_at(&self) -> Option<i64> {
        self.time_field("modified").and_then(parse_timestamp)
    }

    /// `time.created` in epoch milliseconds.
    pub fn created_at(&self) -> Option<i64> {
        self.time_field("created").and_then(parse_timestamp)
    }

    /// `time.unpublished` in epoch milliseconds.
    ///
    /// Registries store either a timestamp string or an object carrying a
    /// `time` field.
    pub fn unpublished_at(&self) -> Option<i64> {
        match self.time.as_ref()?.get("unpublished")? {
            Value::String(s) => parse_timestamp(s),
            Value::Object(map) => map.get("time")?.as_str().and_then(parse_timestamp),
            _ => None,
        }
    }

    /// `dist-tags.latest`.
    pub fn latest(&self) -> Option<&str> {
        self.dist_tags.as_ref()?.get("latest")?.as_str()
    }

    fn time_field(&self, key: &str) -> Option<&str> {
        self.time.as_ref()?.get(key)?.as_str()
    }
}

/// One entry of the canonical registry's recent-changes log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub id: String,
    #[serde(default)]
    pub doc: ModuleDocument,
}

/// Parse an RFC 3339 timestamp into epoch milliseconds.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
