//! mirrorprobe-probes — the concrete health checks.
//!
//! - [`PingProbe`]: five sequential round trips per tick, classified as
//!   up, slow or down against a moving average
//! - [`DeltaProbe`]: replication lag of each mirror behind the change feed
//! - [`PublishProbe`]: time to publish a test package through a
//!   [`PublishCommand`]

pub mod command;
pub mod delta;
pub mod http;
pub mod ping;
pub mod publish;

pub use command::{NpmCli, PublishCommand, PublishConfig};
pub use delta::{DeltaProbe, DeltaStatus, LagBand, LagClass, ModuleLag, Predicate};
pub use ping::{PingProbe, PingStatus, SlowRule};
pub use publish::{PublishDay, PublishProbe, Tally};
