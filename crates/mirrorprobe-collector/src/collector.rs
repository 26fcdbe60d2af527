//! Collector — binds probes to the scheduler and turns completed ticks
//! into result envelopes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use mirrorprobe_core::{
    BoxFuture, Bucket, Cache, CoreResult, Describe, Endpoint, Endpoints, Feed, FeedPublisher,
    NpmAuth, Probe, ProbeContext, ProbeFactory, ProbeOutcome, ResultEnvelope, feed_channel, now_ms,
};

use crate::error::{CollectorError, CollectorResult};
use crate::events::{Event, EventBus};
use crate::feed::FeedSource;
use crate::scheduler::{Job, JobHandle, Scheduler};

/// How often the change feed is refreshed when not configured otherwise.
pub const DEFAULT_FEED_INTERVAL: Duration = Duration::from_millis(180_000);

/// Startup progress. Probes are only registered after the first
/// successful feed fetch, so a delta tick never sees an empty feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    FeedLoaded,
    ProbesRegistered,
}

pub struct CollectorOptions {
    /// Built once the feed has loaded.
    pub probes: Vec<ProbeFactory>,
    pub cache: Option<Arc<dyn Cache>>,
    pub npm_auth: Option<NpmAuth>,
    /// Log completed ticks at debug instead of info.
    pub silent: bool,
    pub feed_interval: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            probes: Vec::new(),
            cache: None,
            npm_auth: None,
            silent: false,
            feed_interval: DEFAULT_FEED_INTERVAL,
        }
    }
}

/// Everything a running job needs after the tick fires.
struct Dispatch {
    events: EventBus,
    cache: Option<Arc<dyn Cache>>,
    silent: bool,
}

impl Dispatch {
    fn wrap(self: &Arc<Self>, probe: &str, registry: &str) -> Completion {
        Completion {
            dispatch: self.clone(),
            probe: probe.to_string(),
            registry: registry.to_string(),
            start: now_ms(),
        }
    }

    async fn tick(self: Arc<Self>, probe: Arc<dyn Probe>, endpoint: Arc<Endpoint>) {
        let completion = self.wrap(probe.name(), &endpoint.name);
        let outcome = probe.execute(&endpoint).await;
        completion.complete(outcome).await;
    }
}

/// Pending result of one tick. The start time is fixed when the
/// completion is created; the end time when it is completed.
pub struct Completion {
    dispatch: Arc<Dispatch>,
    probe: String,
    registry: String,
    start: i64,
}

impl Completion {
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Build, emit, and persist the envelope. Returns the envelope that was
    /// handed to the cache, or `None` when the probe failed.
    pub async fn complete(self, outcome: ProbeOutcome) -> Option<ResultEnvelope> {
        let end = now_ms();
        let dispatch = &self.dispatch;
        let payload = match outcome {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    probe = %self.probe,
                    registry = %self.registry,
                    error = %e,
                    "probe tick failed"
                );
                dispatch.events.emit(Event::ProbeError {
                    probe: self.probe,
                    registry: self.registry,
                    message: e.to_string(),
                });
                return None;
            }
        };

        let envelope = ResultEnvelope::new(&self.probe, &self.registry, payload, self.start, end);
        if dispatch.silent {
            debug!(
                probe = %envelope.probe,
                registry = %envelope.registry,
                duration_ms = envelope.duration_ms,
                "probe ran"
            );
        } else {
            info!(
                probe = %envelope.probe,
                registry = %envelope.registry,
                duration_ms = envelope.duration_ms,
                "probe ran"
            );
        }
        dispatch.events.emit(Event::Ran(envelope.clone()));

        if let Some(cache) = &dispatch.cache {
            let key = envelope.cache_key();
            if let Err(e) = cache.set(&key, &envelope).await {
                warn!(%key, error = %e, "cache write failed");
                dispatch.events.emit(Event::Error {
                    message: format!("{key}: {e}"),
                });
            }
        }
        Some(envelope)
    }
}

/// Owns the probe set, the change feed, and the event bus.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

struct Inner {
    endpoints: Endpoints,
    context: ProbeContext,
    feed: FeedPublisher,
    source: Arc<dyn FeedSource>,
    scheduler: Arc<dyn Scheduler>,
    dispatch: Arc<Dispatch>,
    feed_interval: Duration,
    pending: Mutex<Vec<ProbeFactory>>,
    probes: RwLock<Vec<Arc<dyn Probe>>>,
    jobs: Mutex<Vec<JobHandle>>,
    phase: Mutex<Phase>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Collector {
    pub fn new(
        endpoints: Endpoints,
        source: Arc<dyn FeedSource>,
        scheduler: Arc<dyn Scheduler>,
        options: CollectorOptions,
    ) -> Self {
        let (feed, handle) = feed_channel();
        let context = ProbeContext::new(handle, endpoints.clone(), options.npm_auth);
        let dispatch = Arc::new(Dispatch {
            events: EventBus::new(),
            cache: options.cache,
            silent: options.silent,
        });
        Self {
            inner: Arc::new(Inner {
                endpoints,
                context,
                feed,
                source,
                scheduler,
                dispatch,
                feed_interval: options.feed_interval,
                pending: Mutex::new(options.probes),
                probes: RwLock::new(Vec::new()),
                jobs: Mutex::new(Vec::new()),
                phase: Mutex::new(Phase::Uninitialized),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.inner.phase)
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.inner.endpoints
    }

    /// The read-only view handed to probe factories.
    pub fn context(&self) -> &ProbeContext {
        &self.inner.context
    }

    /// Current change-feed snapshot.
    pub fn feed(&self) -> Feed {
        self.inner.context.feed()
    }

    /// Registered probes in registration order.
    pub fn probes(&self) -> Vec<Arc<dyn Probe>> {
        self.inner
            .probes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn probe(&self, name: &str) -> Option<Arc<dyn Probe>> {
        self.probes().into_iter().find(|p| p.name() == name)
    }

    pub fn jobs(&self) -> Vec<JobHandle> {
        lock(&self.inner.jobs).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.dispatch.events.subscribe()
    }

    pub fn subscribe_probe(&self, probe: &str) -> broadcast::Receiver<Event> {
        self.inner.dispatch.events.subscribe_probe(probe)
    }

    /// Schedule `probe` against each of its targets.
    ///
    /// A probe with an empty name or an invalid schedule is ignored and
    /// yields no handles. Unknown targets are skipped.
    pub fn register(&self, probe: Arc<dyn Probe>) -> Vec<JobHandle> {
        if probe.name().is_empty() || !probe.schedule().is_valid() {
            warn!(probe = %probe.name(), schedule = %probe.schedule(), "ignoring invalid probe");
            return Vec::new();
        }

        let events = &self.inner.dispatch.events;
        events.add_scope(probe.name());

        let mut handles = Vec::new();
        for target in probe.targets() {
            let Some(endpoint) = self.inner.endpoints.get(target) else {
                warn!(probe = %probe.name(), registry = %target, "unknown target, skipping");
                continue;
            };

            let job: Job = {
                let dispatch = self.inner.dispatch.clone();
                let probe = probe.clone();
                let endpoint = endpoint.clone();
                Arc::new(move || -> BoxFuture<'static, ()> {
                    Box::pin(dispatch.clone().tick(probe.clone(), endpoint.clone()))
                })
            };

            let name = format!("{}/{}", probe.name(), endpoint.name);
            match self.inner.scheduler.schedule(&name, probe.schedule(), job) {
                Ok(handle) => {
                    debug!(job = %name, schedule = %probe.schedule(), "probe scheduled");
                    events.emit(Event::Scheduled {
                        probe: probe.name().to_string(),
                        registry: endpoint.name.clone(),
                        at: now_ms(),
                    });
                    handles.push(handle);
                }
                Err(e) => {
                    warn!(job = %name, error = %e, "failed to schedule probe");
                    events.emit(e.into());
                }
            }
        }

        self.inner
            .probes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(probe);
        lock(&self.inner.jobs).extend(handles.iter().cloned());
        handles
    }

    /// Start timing a tick of `probe` against `registry`.
    pub fn wrap(&self, probe: &str, registry: &str) -> Completion {
        self.inner.dispatch.wrap(probe, registry)
    }

    /// Replace the feed snapshot from the source.
    ///
    /// On failure the previous snapshot stays in place and an
    /// [`Event::Error`] is emitted. The first success registers the
    /// configured probes.
    pub async fn refresh_feed(&self) -> CollectorResult<usize> {
        let entries = match self.inner.source.fetch().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "feed refresh failed, keeping previous snapshot");
                self.inner.dispatch.events.emit(e.clone().into());
                return Err(e);
            }
        };

        let count = entries.len();
        self.inner.feed.replace(entries);
        debug!(entries = count, "feed refreshed");

        {
            let mut phase = lock(&self.inner.phase);
            if *phase == Phase::Uninitialized {
                *phase = Phase::FeedLoaded;
                info!(entries = count, "feed loaded");
            }
        }
        self.register_pending();
        Ok(count)
    }

    fn register_pending(&self) {
        let factories = {
            let mut phase = lock(&self.inner.phase);
            if *phase != Phase::FeedLoaded {
                return;
            }
            *phase = Phase::ProbesRegistered;
            std::mem::take(&mut *lock(&self.inner.pending))
        };

        let mut scheduled = 0;
        for factory in factories {
            let probe = factory(&self.inner.context);
            scheduled += self.register(probe).len();
        }
        info!(probes = self.probes().len(), jobs = scheduled, "probes registered");
    }

    /// Refresh the feed now and then every feed interval until `shutdown`
    /// flips, then cancel every job and close the event bus.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.inner.feed_interval.as_millis() as u64,
            "collector started"
        );
        let mut interval = tokio::time::interval(self.inner.feed_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh_feed().await {
                        debug!(error = %e, "feed refresh will retry next interval");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("collector shutting down");
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Cancel every job and close the event bus.
    pub fn shutdown(&self) {
        self.inner.scheduler.cancel_all();
        lock(&self.inner.jobs).clear();
        self.inner.dispatch.events.close();
        info!("collector stopped");
    }

    pub fn calculate(&self, samples: &[f64]) -> CoreResult<Describe> {
        self.inner.context.calculate(samples)
    }

    /// The aggregation pipeline bound to a probe's `group`, `transform`
    /// and `zero`.
    pub fn aggregate<P, V, G, T>(
        &self,
        group: G,
        transform: T,
        zero: V,
    ) -> impl Fn(&[ResultEnvelope<P>]) -> Vec<Bucket<V>>
    where
        V: Clone,
        G: Fn(i64) -> i64,
        T: Fn(&V, &ResultEnvelope<P>, usize, &[ResultEnvelope<P>]) -> V,
    {
        mirrorprobe_core::aggregate(group, transform, zero)
    }
}

impl From<CollectorError> for Event {
    fn from(e: CollectorError) -> Self {
        Event::Error {
            message: e.to_string(),
        }
    }
}
