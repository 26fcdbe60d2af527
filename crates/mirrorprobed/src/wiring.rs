//! Turns a loaded config into collector inputs.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use mirrorprobe_collector::Event;
use mirrorprobe_core::{MirrorprobeConfig, ProbeFactory};
use mirrorprobe_probes::{DeltaProbe, PingProbe, PublishProbe, SlowRule, delta, ping, publish};
use mirrorprobe_store::ResultStore;

use crate::history::RecentHistory;

/// Probe factories for every configured `[probes.*]` section. With no
/// sections at all, ping and delta run on their default schedules.
pub fn probe_factories(config: &MirrorprobeConfig) -> Vec<(&'static str, ProbeFactory)> {
    let probes = &config.probes;
    if probes.ping.is_none() && probes.delta.is_none() && probes.publish.is_none() {
        let rule = SlowRule::default();
        return vec![
            (ping::NAME, PingProbe::factory(None, None, rule)),
            (delta::NAME, DeltaProbe::factory(None, None)),
        ];
    }

    let mut factories = Vec::new();
    if let Some(section) = &probes.ping {
        let rule = section
            .slow_rule
            .as_deref()
            .and_then(SlowRule::from_name)
            .unwrap_or_default();
        let schedule = Some(section.schedule.clone());
        let factory = PingProbe::factory(schedule, section.targets.clone(), rule);
        factories.push((ping::NAME, factory));
    }
    if let Some(section) = &probes.delta {
        let schedule = Some(section.schedule.clone());
        let factory = DeltaProbe::factory(schedule, section.targets.clone());
        factories.push((delta::NAME, factory));
    }
    if let Some(section) = &probes.publish {
        let factory = PublishProbe::factory(
            Some(section.schedule.clone()),
            config.collector.canonical.clone(),
            section.package_dir.clone(),
            None,
        );
        factories.push((publish::NAME, factory));
    }
    factories
}

/// Load stored envelopes of `probes` for every configured registry.
pub fn seed_history(
    store: &ResultStore,
    config: &MirrorprobeConfig,
    probes: &[&str],
    history: &RecentHistory,
) {
    for registry in config.endpoints().names() {
        for probe in probes {
            match store.history(&registry, probe) {
                Ok(envelopes) => history.extend(envelopes),
                Err(e) => warn!(%registry, %probe, error = %e, "failed to load stored history"),
            }
        }
    }
    info!(envelopes = history.len(), "history seeded from store");
}

/// Record completed ticks until the collector closes its event bus.
pub async fn pump_events(mut events: broadcast::Receiver<Event>, history: Arc<RecentHistory>) {
    loop {
        match events.recv().await {
            Ok(Event::Ran(envelope)) => history.record(envelope),
            Ok(Event::Error { message }) => warn!(%message, "collector error"),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event pump lagging, results dropped")
            }
            Err(RecvError::Closed) => break,
        }
    }
}
