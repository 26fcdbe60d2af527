//! mirrorprobe-store — persistence for probe result envelopes.
//!
//! Two [`Cache`](mirrorprobe_core::Cache) backends:
//!
//! - [`ResultStore`]: redb-backed, on disk or in memory, with history reads
//!   by `registry/probe` prefix
//! - [`MemoryCache`]: a plain map, handy for tests and dry runs
//!
//! Envelopes are JSON-serialized into redb's `&[u8]` value column under
//! `registry/probe/start` keys, so a prefix scan returns one probe's history
//! against one registry.

pub mod error;
pub mod memory;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryCache;
pub use store::ResultStore;
