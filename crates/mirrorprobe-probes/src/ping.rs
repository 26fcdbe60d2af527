//! Ping probe: round-trip latency against each registry.
//!
//! Every tick issues five sequential requests. A failed or timed-out
//! attempt reads as `0`, which no real round trip can produce, so a run of
//! zeros downstream means the endpoint was down.

use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::debug;

use mirrorprobe_core::{
    BoxFuture, Bucket, Describe, Endpoint, Probe, ProbeContext, ProbeFactory, ProbeOutcome,
    ResultEnvelope, ResultPayload, ScheduleSpec, aggregate, group_by_tick, moving_average,
    narrow_history,
};

use crate::http;

pub const NAME: &str = "ping";

/// Requests per tick.
pub const ATTEMPTS: usize = 5;

/// Ticks in the moving average, the current one included.
pub const WINDOW: usize = 5;

/// How a reading is judged slow against its moving average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlowRule {
    /// Raw mean above `factor` times the moving mean.
    Ratio(f64),
    /// Raw mean above the moving mean plus `factor` moving deviations.
    Deviations(f64),
}

impl Default for SlowRule {
    fn default() -> Self {
        SlowRule::Ratio(1.5)
    }
}

impl SlowRule {
    /// Parse the config spelling: `ratio` or `deviations`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ratio" => Some(SlowRule::Ratio(1.5)),
            "deviations" => Some(SlowRule::Deviations(2.0)),
            _ => None,
        }
    }

    fn is_slow(&self, raw: f64, moving: &Describe) -> bool {
        match self {
            SlowRule::Ratio(factor) => raw > moving.mean * factor,
            SlowRule::Deviations(factor) => {
                let stdev = if moving.stdev.is_nan() { 0.0 } else { moving.stdev };
                raw > moving.mean + factor * stdev
            }
        }
    }
}

/// Latest classification of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PingStatus {
    Down,
    Slow,
    /// Healthy, carrying the raw mean latency in milliseconds.
    Up(f64),
}

impl Serialize for PingStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PingStatus::Down => serializer.serialize_str("down"),
            PingStatus::Slow => serializer.serialize_str("slow"),
            PingStatus::Up(mean) => serializer.serialize_f64(*mean),
        }
    }
}

pub struct PingProbe {
    name: String,
    schedule: ScheduleSpec,
    targets: Vec<String>,
    slow_rule: SlowRule,
    client: Client,
    context: ProbeContext,
}

impl PingProbe {
    /// Ping every configured endpoint twice a minute.
    pub fn new(context: &ProbeContext) -> Self {
        Self {
            name: NAME.to_string(),
            schedule: ScheduleSpec::seconds([0, 30]),
            targets: context.endpoints().names(),
            slow_rule: SlowRule::default(),
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

    pub fn with_slow_rule(mut self, rule: SlowRule) -> Self {
        self.slow_rule = rule;
        self
    }

    /// Factory for the collector; `None` fields keep the defaults.
    pub fn factory(
        schedule: Option<ScheduleSpec>,
        targets: Option<Vec<String>>,
        rule: SlowRule,
    ) -> ProbeFactory {
        Box::new(move |ctx: &ProbeContext| {
            let mut probe = PingProbe::new(ctx).with_slow_rule(rule);
            if let Some(schedule) = schedule {
                probe = probe.with_schedule(schedule);
            }
            if let Some(targets) = targets {
                probe = probe.with_targets(targets);
            }
            Arc::new(probe) as Arc<dyn Probe>
        })
    }

    /// One timed request. Returns milliseconds, or `0` on any failure.
    pub async fn ping(&self, endpoint: &Endpoint) -> f64 {
        let started = Instant::now();
        let request = self.client.get(&endpoint.href).send();
        match tokio::time::timeout(endpoint.timeout(), request).await {
            Ok(Ok(response)) if response.status().is_success() => {
                started.elapsed().as_secs_f64() * 1000.0
            }
            Ok(Ok(response)) => {
                debug!(status = %response.status(), href = %endpoint.href, "ping non-2xx");
                0.0
            }
            Ok(Err(e)) => {
                debug!(error = %e, href = %endpoint.href, "ping failed");
                0.0
            }
            Err(_) => {
                debug!(href = %endpoint.href, "ping timed out");
                0.0
            }
        }
    }

    /// Every tick is its own bucket.
    pub fn group(timestamp: i64) -> i64 {
        group_by_tick(timestamp)
    }

    /// Trailing moving average of every field over the last [`WINDOW`]
    /// ticks. Indexes before the start of history clamp to the first tick.
    pub fn transform(
        _bucket: &Describe,
        current: &ResultEnvelope<Describe>,
        index: usize,
        history: &[ResultEnvelope<Describe>],
    ) -> Describe {
        let prior = |i: usize| history.get(i).map(|e| e.payload).unwrap_or(current.payload);
        let field = |pick: fn(&Describe) -> f64| {
            moving_average(pick(&current.payload), index, WINDOW, |i| pick(&prior(i)))
        };
        Describe {
            mean: field(|d| d.mean),
            minimum: field(|d| d.minimum),
            maximum: field(|d| d.maximum),
            stdev: field(|d| d.stdev),
        }
    }

    /// Classify the most recent tick.
    ///
    /// Down when the moving mean of the last bucket is zero. Slow is judged
    /// against the moving average of the bucket before the last one, so the
    /// current reading never dilutes its own baseline. A lone bucket is its
    /// own baseline.
    pub fn latest(
        aggregated: &[Bucket<Describe>],
        raw: &[ResultEnvelope<Describe>],
        rule: SlowRule,
    ) -> Option<PingStatus> {
        let (last, earlier) = aggregated.split_last()?;
        if last.values.mean == 0.0 {
            return Some(PingStatus::Down);
        }
        let baseline = &earlier.last().unwrap_or(last).values;
        let current = raw.last()?.payload.mean;
        if rule.is_slow(current, baseline) {
            return Some(PingStatus::Slow);
        }
        Some(PingStatus::Up(current))
    }
}

impl Probe for PingProbe {
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
            let mut readings = Vec::with_capacity(ATTEMPTS);
            for _ in 0..ATTEMPTS {
                readings.push(self.ping(endpoint).await);
            }
            let stats = self.context.calculate(&readings)?;
            debug!(registry = %endpoint.name, mean = stats.mean, "ping complete");
            Ok(ResultPayload::Ping(stats))
        })
    }

    fn summarize(&self, history: &[ResultEnvelope]) -> Option<Value> {
        let raw = narrow_history::<Describe>(history);
        let pipeline = aggregate(Self::group, Self::transform, Describe::ZERO);
        let status = Self::latest(&pipeline(&raw), &raw, self.slow_rule)?;
        serde_json::to_value(status).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorprobe_core::{Endpoints, feed_channel};
    use std::time::Duration;

    fn context(endpoints: Endpoints) -> ProbeContext {
        let (_publisher, handle) = feed_channel();
        ProbeContext::new(handle, endpoints, None)
    }

    fn stats(mean: f64) -> Describe {
        Describe {
            mean,
            minimum: mean,
            maximum: mean,
            stdev: 0.0,
        }
    }

    fn env(start: i64, mean: f64) -> ResultEnvelope<Describe> {
        ResultEnvelope::new(NAME, "npmjs", stats(mean), start, start + 10)
    }

    fn raw_envelope(start: i64, mean: f64) -> ResultEnvelope {
        ResultEnvelope::new(
            NAME,
            "npmjs",
            ResultPayload::Ping(stats(mean)),
            start,
            start + 1,
        )
    }

    #[test]
    fn exposes_name_schedule_and_targets() {
        let probe = PingProbe::new(&context(Endpoints::defaults()));
        assert_eq!(probe.name(), "ping");
        assert_eq!(probe.schedule(), &ScheduleSpec::seconds([0, 30]));
        assert_eq!(probe.targets().len(), 3);
    }

    #[test]
    fn group_is_identity() {
        assert_eq!(PingProbe::group(1_700_000_000_123), 1_700_000_000_123);
    }

    #[test]
    fn transform_averages_last_five() {
        let history: Vec<_> = [10.0, 20.0, 30.0, 40.0, 50.0]
            .iter()
            .enumerate()
            .map(|(i, m)| env(i as i64, *m))
            .collect();
        let out = PingProbe::transform(&Describe::ZERO, &env(99, 1.0), 0, &history);
        assert!((out.mean - 8.2).abs() < 1e-9);
    }

    #[test]
    fn transform_takes_missing_values() {
        let history = vec![env(0, 0.0)];
        let out = PingProbe::transform(&Describe::ZERO, &env(1, 1.0), 0, &history);
        assert!((out.mean - 0.2).abs() < 1e-9);
    }

    #[test]
    fn transform_averages_every_field() {
        let current = ResultEnvelope::new(
            NAME,
            "npmjs",
            Describe {
                mean: 1.0,
                minimum: 0.5,
                maximum: 2.0,
                stdev: 0.25,
            },
            0,
            1,
        );
        let history = vec![current.clone()];
        let out = PingProbe::transform(&Describe::ZERO, &current, 0, &history);
        assert_eq!(out, current.payload);
    }

    #[test]
    fn latest_down_when_moving_mean_is_zero() {
        let aggregated = vec![Bucket {
            key: 1,
            values: stats(0.0),
        }];
        let raw = vec![env(1, 200.0)];
        assert_eq!(
            PingProbe::latest(&aggregated, &raw, SlowRule::default()),
            Some(PingStatus::Down)
        );
    }

    #[test]
    fn latest_slow_above_ratio() {
        let aggregated = vec![Bucket {
            key: 1,
            values: Describe {
                mean: 50.0,
                minimum: 0.0,
                maximum: 100.0,
                stdev: 0.0,
            },
        }];
        let raw = vec![env(1, 200.0)];
        assert_eq!(
            PingProbe::latest(&aggregated, &raw, SlowRule::default()),
            Some(PingStatus::Slow)
        );
    }

    #[test]
    fn latest_returns_raw_mean_otherwise() {
        let aggregated = vec![Bucket {
            key: 1,
            values: stats(100.0),
        }];
        let raw = vec![env(1, 120.0)];
        assert_eq!(
            PingProbe::latest(&aggregated, &raw, SlowRule::default()),
            Some(PingStatus::Up(120.0))
        );
    }

    #[test]
    fn deviation_rule_uses_moving_stdev() {
        let aggregated = vec![Bucket {
            key: 1,
            values: Describe {
                mean: 100.0,
                minimum: 90.0,
                maximum: 110.0,
                stdev: 10.0,
            },
        }];
        let rule = SlowRule::Deviations(2.0);
        assert_eq!(
            PingProbe::latest(&aggregated, &[env(1, 125.0)], rule),
            Some(PingStatus::Slow)
        );
        assert_eq!(
            PingProbe::latest(&aggregated, &[env(1, 115.0)], rule),
            Some(PingStatus::Up(115.0))
        );
    }

    #[test]
    fn status_serializes_like_the_status_page_expects() {
        assert_eq!(serde_json::to_value(PingStatus::Down).unwrap(), "down");
        assert_eq!(serde_json::to_value(PingStatus::Slow).unwrap(), "slow");
        assert_eq!(serde_json::to_value(PingStatus::Up(12.5)).unwrap(), 12.5);
    }

    #[test]
    fn summarize_runs_the_pipeline() {
        let probe = PingProbe::new(&context(Endpoints::defaults()));
        let history: Vec<ResultEnvelope> = [100.0, 110.0, 90.0, 400.0]
            .iter()
            .enumerate()
            .map(|(i, m)| raw_envelope(i as i64, *m))
            .collect();
        // Moving mean before the last tick: (90 + 110 + 100 + 100 + 100) / 5 = 100.
        assert_eq!(probe.summarize(&history), Some(Value::from("slow")));
        assert_eq!(probe.summarize(&[]), None);
    }

    #[test]
    fn slowdown_is_judged_against_the_previous_window() {
        let probe = PingProbe::new(&context(Endpoints::defaults()));
        let history: Vec<ResultEnvelope> = [100.0, 100.0, 100.0, 100.0, 100.0, 160.0]
            .iter()
            .enumerate()
            .map(|(i, m)| raw_envelope(i as i64, *m))
            .collect();
        // The last window averages to 112 and would hide the jump; the one
        // before it is a flat 100.
        assert_eq!(probe.summarize(&history), Some(Value::from("slow")));

        let steady: Vec<ResultEnvelope> = [100.0, 100.0, 100.0, 100.0, 100.0, 140.0]
            .iter()
            .enumerate()
            .map(|(i, m)| raw_envelope(i as i64, *m))
            .collect();
        assert_eq!(probe.summarize(&steady), Some(Value::from(140.0)));
    }

    #[test]
    fn latest_skips_the_current_bucket_for_the_baseline() {
        let aggregated = vec![
            Bucket {
                key: 1,
                values: stats(100.0),
            },
            Bucket {
                key: 2,
                values: stats(112.0),
            },
        ];
        let raw = vec![env(1, 100.0), env(2, 160.0)];
        assert_eq!(
            PingProbe::latest(&aggregated, &raw, SlowRule::default()),
            Some(PingStatus::Slow)
        );

        let rule = SlowRule::Deviations(2.0);
        assert_eq!(
            PingProbe::latest(&aggregated, &raw, rule),
            Some(PingStatus::Slow)
        );
    }

    #[test]
    fn down_still_reads_the_last_bucket() {
        let aggregated = vec![
            Bucket {
                key: 1,
                values: stats(100.0),
            },
            Bucket {
                key: 2,
                values: stats(0.0),
            },
        ];
        let raw = vec![env(1, 100.0), env(2, 0.0)];
        assert_eq!(
            PingProbe::latest(&aggregated, &raw, SlowRule::default()),
            Some(PingStatus::Down)
        );
    }

    #[tokio::test]
    async fn ping_closed_port_reads_zero() {
        let endpoint = Endpoint::from_href("closed", "http://127.0.0.1:1/")
            .with_timeout(Duration::from_millis(200));
        let probe = PingProbe::new(&context(Endpoints::new([endpoint.clone()])));
        assert_eq!(probe.ping(&endpoint).await, 0.0);
    }

    #[tokio::test]
    async fn ping_timeout_reads_zero() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer.
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let endpoint = Endpoint::from_href("silent", &format!("http://{addr}/"))
            .with_timeout(Duration::from_millis(150));
        let probe = PingProbe::new(&context(Endpoints::new([endpoint.clone()])));

        let started = Instant::now();
        assert_eq!(probe.ping(&endpoint).await, 0.0);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn execute_reports_statistics_of_five_pings() {
        let app = axum::Router::new().route(
            "/",
            axum::routing::get(|| async {
                tokio::time::sleep(Duration::from_millis(2)).await;
                "{}"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let endpoint = Endpoint::from_href("local", &format!("http://{addr}/"));
        let probe = PingProbe::new(&context(Endpoints::new([endpoint.clone()])));
        let payload = probe.execute(&endpoint).await.unwrap();

        let ResultPayload::Ping(stats) = payload else {
            panic!("expected ping payload");
        };
        assert!(stats.minimum > 0.0);
        assert!(stats.minimum <= stats.mean && stats.mean <= stats.maximum);
        assert!(stats.stdev >= 0.0);
    }
}
