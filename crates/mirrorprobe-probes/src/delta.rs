//! Delta probe: replication lag between the canonical feed and a mirror.
//!
//! Each tick walks the collector's current change-feed snapshot, fetches
//! every module from the target mirror, and compares the two documents.
//! A module whose documents disagree lags by the distance between their
//! `modified` times, or, when the mirror has no copy at all, by the time
//! since the module was created (or unpublished).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use mirrorprobe_core::{
    BoxFuture, Bucket, DeltaReport, Endpoint, ModuleDocument, Probe, ProbeContext, ProbeError,
    ProbeFactory, ProbeOutcome, ResultEnvelope, ResultPayload, ScheduleSpec, aggregate, flatten,
    group_by_day, narrow_history, now_ms,
};

use crate::http;

pub const NAME: &str = "delta";

const HOUR_MS: i64 = 3_600_000;

/// A document field compared between the feed and the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// Exact name equality.
    Name,
    /// Same `modified` timestamp and the same set of `time` keys.
    Time,
    /// Same set of published versions.
    Versions,
    /// Same `latest` dist-tag.
    DistTags,
}

impl Predicate {
    pub const ALL: [Predicate; 4] = [
        Predicate::Name,
        Predicate::Time,
        Predicate::Versions,
        Predicate::DistTags,
    ];

    /// Field name in the registry document.
    pub fn key(&self) -> &'static str {
        match self {
            Predicate::Name => "name",
            Predicate::Time => "time",
            Predicate::Versions => "versions",
            Predicate::DistTags => "dist-tags",
        }
    }

    /// Whether `origin` and `variation` agree on this field. A field
    /// missing on either side never agrees.
    pub fn equal(&self, origin: &ModuleDocument, variation: &ModuleDocument) -> bool {
        match self {
            Predicate::Name => agree(origin.name.as_ref(), variation.name.as_ref()),
            Predicate::Time => match (&origin.time, &variation.time) {
                (Some(a), Some(b)) => a.get("modified") == b.get("modified") && same_keys(a, b),
                _ => false,
            },
            Predicate::Versions => match (&origin.versions, &variation.versions) {
                (Some(a), Some(b)) => same_keys(a, b),
                _ => false,
            },
            Predicate::DistTags => agree(origin.latest(), variation.latest()),
        }
    }
}

fn agree<T: PartialEq>(a: Option<T>, b: Option<T>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

fn same_keys(a: &BTreeMap<String, Value>, b: &BTreeMap<String, Value>) -> bool {
    a.len() == b.len() && a.keys().all(|k| b.contains_key(k))
}

/// Lag of a single module against one mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLag {
    pub module: String,
    /// Milliseconds.
    pub lag: i64,
}

/// Fields on which `origin` and `variation` disagree.
pub fn mismatches(
    predicates: &[Predicate],
    origin: &ModuleDocument,
    variation: &ModuleDocument,
) -> Vec<&'static str> {
    predicates
        .iter()
        .filter(|p| !p.equal(origin, variation))
        .map(Predicate::key)
        .collect()
}

/// Absolute lag in milliseconds.
///
/// Equal documents have no lag. When both documents exist the lag is the
/// distance between their `modified` times; a mirror without a `modified`
/// time lags since the origin's. A missing mirror copy lags since the
/// module was unpublished, or failing that, created. Timestamps the origin
/// does not carry contribute no lag.
pub fn lag(
    equal: bool,
    origin: &ModuleDocument,
    variation: Option<&ModuleDocument>,
    now: i64,
) -> i64 {
    if equal {
        return 0;
    }
    match variation {
        Some(variation) => match (origin.modified_at(), variation.modified_at()) {
            (Some(main), Some(mirror)) => (mirror - main).abs(),
            (Some(main), None) => (now - main).abs(),
            _ => 0,
        },
        None => origin
            .unpublished_at()
            .or_else(|| origin.created_at())
            .map(|base| (now - base).abs())
            .unwrap_or(0),
    }
}

/// Compare the feed's document for `module` with the mirror's copy.
pub fn diff(
    predicates: &[Predicate],
    module: &str,
    origin: &ModuleDocument,
    variation: Option<&ModuleDocument>,
    now: i64,
) -> ModuleLag {
    let equal = variation.is_some_and(|v| mismatches(predicates, origin, v).is_empty());
    ModuleLag {
        module: module.to_string(),
        lag: lag(equal, origin, variation, now),
    }
}

/// A latency interval class. `upto_ms` is the inclusive upper bound;
/// `None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagBand {
    pub label: String,
    pub upto_ms: Option<i64>,
}

impl LagBand {
    pub fn new(label: &str, upto_ms: Option<i64>) -> Self {
        Self {
            label: label.to_string(),
            upto_ms,
        }
    }

    /// `none`, `hour`, `day`, `week`, `week+`.
    pub fn defaults() -> Vec<LagBand> {
        vec![
            LagBand::new("none", Some(0)),
            LagBand::new("hour", Some(HOUR_MS)),
            LagBand::new("day", Some(24 * HOUR_MS)),
            LagBand::new("week", Some(7 * 24 * HOUR_MS)),
            LagBand::new("week+", None),
        ]
    }
}

/// Index of the first band containing `lag_ms`.
pub fn classify(bands: &[LagBand], lag_ms: f64) -> usize {
    bands
        .iter()
        .position(|band| band.upto_ms.is_none_or(|upto| lag_ms <= upto as f64))
        .unwrap_or_else(|| bands.len().saturating_sub(1))
}

/// Per-day accumulator for one band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagClass {
    pub class: String,
    pub count: u64,
    pub modules: BTreeSet<String>,
}

/// Latest replication status of a mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaStatus {
    /// Start of the day the status covers.
    pub day: i64,
    /// Count-weighted band index normalized to `0.0..=1.0`.
    pub score: f64,
    /// Mean lag of every tick that day, summed, in hours.
    pub lag_hours: f64,
}

pub struct DeltaProbe {
    name: String,
    schedule: ScheduleSpec,
    targets: Vec<String>,
    predicates: Vec<Predicate>,
    bands: Vec<LagBand>,
    clock: fn() -> i64,
    client: Client,
    context: ProbeContext,
}

impl DeltaProbe {
    /// Diff the feed against every configured endpoint every ten minutes.
    pub fn new(context: &ProbeContext) -> Self {
        Self {
            name: NAME.to_string(),
            schedule: ScheduleSpec::minutes(0, 59, 10),
            targets: context.endpoints().names(),
            predicates: Predicate::ALL.to_vec(),
            bands: LagBand::defaults(),
            clock: now_ms,
            client: http::client(),
            context: context.clone(),
        }
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    /// Drop the `dist-tags` predicate.
    pub fn without_dist_tags(mut self) -> Self {
        self.predicates.retain(|p| *p != Predicate::DistTags);
        self
    }

    pub fn with_bands(mut self, bands: Vec<LagBand>) -> Self {
        if !bands.is_empty() {
            self.bands = bands;
        }
        self
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn factory(schedule: Option<ScheduleSpec>, targets: Option<Vec<String>>) -> ProbeFactory {
        Box::new(move |ctx: &ProbeContext| {
            let mut probe = DeltaProbe::new(ctx);
            if let Some(schedule) = schedule {
                probe = probe.with_schedule(schedule);
            }
            if let Some(targets) = targets {
                probe = probe.with_targets(targets);
            }
            Arc::new(probe) as Arc<dyn Probe>
        })
    }

    pub fn group(timestamp: i64) -> i64 {
        group_by_day(timestamp)
    }

    /// One zero-count class per band.
    pub fn zero(bands: &[LagBand]) -> Vec<LagClass> {
        bands
            .iter()
            .map(|band| LagClass {
                class: band.label.clone(),
                count: 0,
                modules: BTreeSet::new(),
            })
            .collect()
    }

    /// Count the tick in the band of its mean lag and union its lagging
    /// modules into that band.
    pub fn transform(
        bands: &[LagBand],
        bucket: &[LagClass],
        current: &ResultEnvelope<DeltaReport>,
    ) -> Vec<LagClass> {
        let mut next = bucket.to_vec();
        let index = classify(bands, current.payload.lag.mean);
        if let Some(class) = next.get_mut(index) {
            class.count += 1;
            class.modules.extend(current.payload.modules.clone());
        }
        next
    }

    /// Status of the most recent day in a flattened aggregation.
    pub fn latest(
        aggregated: &[Bucket<LagClass>],
        raw: &[ResultEnvelope<DeltaReport>],
    ) -> Option<DeltaStatus> {
        let day = aggregated.last()?.key;
        let classes: Vec<&LagClass> = aggregated
            .iter()
            .filter(|b| b.key == day)
            .map(|b| &b.values)
            .collect();

        let total: u64 = classes.iter().map(|c| c.count).sum();
        let span = classes.len().saturating_sub(1).max(1) as f64;
        let score = if total == 0 {
            0.0
        } else {
            let weighted: f64 = classes
                .iter()
                .enumerate()
                .map(|(i, c)| i as f64 * c.count as f64)
                .sum();
            weighted / (total as f64 * span)
        };

        let lag_ms: f64 = raw
            .iter()
            .filter(|e| Self::group(e.start) == day)
            .map(|e| e.payload.lag.mean)
            .sum();

        Some(DeltaStatus {
            day,
            score,
            lag_hours: lag_ms / HOUR_MS as f64,
        })
    }

    /// Aggregate a typed history into flattened per-day band counts.
    pub fn aggregate(&self, raw: &[ResultEnvelope<DeltaReport>]) -> Vec<Bucket<LagClass>> {
        let bands = &self.bands;
        let pipeline = aggregate(
            Self::group,
            |bucket: &Vec<LagClass>, current: &ResultEnvelope<DeltaReport>, _, _| {
                Self::transform(bands, bucket, current)
            },
            Self::zero(bands),
        );
        flatten(pipeline(raw))
    }
}

impl Probe for DeltaProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self) -> &ScheduleSpec {
        &self.schedule
    }

    fn targets(&self) -> &[String] {
        &self.targets
    }

    fn execute<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, ProbeOutcome> {
        Box::pin(async move {
            let feed = self.context.feed();
            if feed.is_empty() {
                return Err(ProbeError::EmptyFeed);
            }

            let lags = join_all(feed.iter().map(|entry| async move {
                let url = endpoint.url_for(&entry.id);
                let variation = http::fetch_document(&self.client, &url, endpoint.timeout()).await;
                diff(
                    &self.predicates,
                    &entry.id,
                    &entry.doc,
                    variation.as_ref(),
                    (self.clock)(),
                )
            }))
            .await;

            let samples: Vec<f64> = lags.iter().map(|l| l.lag as f64).collect();
            let modules: Vec<String> = lags
                .into_iter()
                .filter(|l| l.lag > 0)
                .map(|l| l.module)
                .collect();
            let lag = self.context.calculate(&samples)?;

            debug!(
                registry = %endpoint.name,
                lagging = modules.len(),
                mean_ms = lag.mean,
                "delta complete"
            );
            Ok(ResultPayload::Delta(DeltaReport { modules, lag }))
        })
    }

    fn summarize(&self, history: &[ResultEnvelope]) -> Option<Value> {
        let raw = narrow_history::<DeltaReport>(history);
        let status = Self::latest(&self.aggregate(&raw), &raw)?;
        serde_json::to_value(status).ok()
    }
}
