//! mirrorprobe-core — shared types for registry and mirror health probing.
//!
//! Everything the collector, probes, and storage agree on lives here:
//!
//! - [`Endpoint`] / [`Endpoints`]: read-only registry locations
//! - [`ResultEnvelope`] / [`ResultPayload`]: one record per probe execution
//! - [`Probe`] / [`ProbeContext`]: the contract every health check implements
//! - [`stats`]: descriptive statistics and moving averages
//! - [`aggregate`]: the generic group/transform pipeline over envelope history
//! - [`ScheduleSpec`]: calendar patterns for when probes fire
//! - [`Cache`]: optional sink for completed envelopes
//! - [`MirrorprobeConfig`]: `mirrorprobe.toml` parsing

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod probe;
pub mod schedule;
pub mod stats;
pub mod types;

pub use aggregate::{Bucket, aggregate, flatten, group_by_day, group_by_tick};
pub use cache::{Cache, History};
pub use config::{MirrorprobeConfig, NpmAuth};
pub use error::{CacheError, CoreError, CoreResult, ProbeError};
pub use feed::{Feed, FeedHandle, FeedPublisher, feed_channel};
pub use probe::{BoxFuture, Probe, ProbeContext, ProbeFactory, ProbeOutcome};
pub use schedule::{Field, ScheduleSpec};
pub use stats::{Describe, describe, moving_average};
pub use types::*;
