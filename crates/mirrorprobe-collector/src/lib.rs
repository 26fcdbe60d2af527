//! mirrorprobe-collector — runs probes on their schedules and publishes
//! the results.
//!
//! # Architecture
//!
//! ```text
//! Collector
//!   ├── run() → refresh_feed() now and every feed interval
//!   │     └── first success: build probes from their factories, register()
//!   ├── register() → one Scheduler job per (probe, target)
//!   │     └── tick: wrap() → Probe::execute() → Completion::complete()
//!   │           ├── Event::Ran to subscribe() and subscribe_probe()
//!   │           └── Cache::set(registry/probe/start)
//!   └── shutdown() → cancel jobs, close the event bus
//! ```

pub mod collector;
pub mod error;
pub mod events;
pub mod feed;
pub mod scheduler;

pub use collector::{Collector, CollectorOptions, Completion, DEFAULT_FEED_INTERVAL, Phase};
pub use error::{CollectorError, CollectorResult};
pub use events::{Event, EventBus};
pub use feed::{FeedSource, HttpFeedSource};
pub use scheduler::{Job, JobHandle, Scheduler, TokioScheduler};
