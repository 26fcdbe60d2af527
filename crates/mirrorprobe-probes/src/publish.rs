//! Publish probe: end-to-end time to publish a throwaway package.
//!
//! The test package's version follows `year.dayOfYear.patch`, with the
//! patch bumped for every publish within the same day.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::Client;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use mirrorprobe_core::{
    BoxFuture, Bucket, Endpoint, ModuleDocument, Probe, ProbeContext, ProbeError, ProbeFactory,
    ProbeOutcome, PublishReport, ResultEnvelope, ResultPayload, ScheduleSpec, aggregate,
    group_by_day, narrow_history,
};

use crate::command::{NpmCli, PublishCommand, PublishConfig};
use crate::http;

pub const NAME: &str = "publish";

const MANIFEST: &str = "package.json";

/// Next version for a publish on `today`.
pub fn next_version(latest: Option<&Version>, today: NaiveDate) -> Version {
    let major = today.year().max(0) as u64;
    let minor = u64::from(today.ordinal());
    let patch = match latest {
        Some(v) if v.major == major && v.minor == minor => v.patch + 1,
        _ => 0,
    };
    Version::new(major, minor, patch)
}

/// `--_auth=` argument for the publish command.
pub fn auth_arg(username: &str, password: &str) -> String {
    format!("--_auth={}", STANDARD.encode(format!("{username}:{password}")))
}

/// Running per-day count of one outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub count: u64,
    /// Ticks seen that day, of either outcome.
    pub ticks: u64,
    pub percentage: f64,
}

impl Tally {
    fn record(&self, hit: bool) -> Tally {
        let count = self.count + u64::from(hit);
        let ticks = self.ticks + 1;
        Tally {
            count,
            ticks,
            percentage: count as f64 / ticks as f64 * 100.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishDay {
    pub success: Tally,
    pub failure: Tally,
}

pub struct PublishProbe {
    name: String,
    schedule: ScheduleSpec,
    targets: Vec<String>,
    package_dir: PathBuf,
    command: Arc<dyn PublishCommand>,
    today: fn() -> NaiveDate,
    client: Client,
    context: ProbeContext,
}

fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

impl PublishProbe {
    /// Publish `package_dir` to `canonical` every six minutes with `npm`.
    pub fn new(context: &ProbeContext, canonical: &str, package_dir: &Path) -> Self {
        Self {
            name: NAME.to_string(),
            schedule: ScheduleSpec::minutes(0, 59, 6),
            targets: vec![canonical.to_string()],
            package_dir: package_dir.to_path_buf(),
            command: Arc::new(NpmCli::default()),
            today: utc_today,
            client: http::client(),
            context: context.clone(),
        }
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_command(mut self, command: Arc<dyn PublishCommand>) -> Self {
        self.command = command;
        self
    }

    pub fn with_today(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn factory(
        schedule: Option<ScheduleSpec>,
        canonical: String,
        package_dir: PathBuf,
        command: Option<Arc<dyn PublishCommand>>,
    ) -> ProbeFactory {
        Box::new(move |ctx: &ProbeContext| {
            let mut probe = PublishProbe::new(ctx, &canonical, &package_dir);
            if let Some(schedule) = schedule {
                probe = probe.with_schedule(schedule);
            }
            if let Some(command) = command {
                probe = probe.with_command(command);
            }
            Arc::new(probe) as Arc<dyn Probe>
        })
    }

    fn manifest_path(&self) -> PathBuf {
        self.package_dir.join(MANIFEST)
    }

    async fn read_manifest(&self) -> Result<serde_json::Map<String, Value>, ProbeError> {
        let path = self.manifest_path();
        let shown = path.display();
        let invalid = |reason: String| ProbeError::Manifest(format!("{shown}: {reason}"));
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| invalid(e.to_string()))?;
        match serde_json::from_str(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(invalid("not an object".to_string())),
            Err(e) => Err(invalid(e.to_string())),
        }
    }

    async fn write_manifest(
        &self,
        manifest: &serde_json::Map<String, Value>,
    ) -> Result<(), ProbeError> {
        let path = self.manifest_path();
        let content = serde_json::to_string_pretty(manifest)
            .map_err(|e| ProbeError::Manifest(e.to_string()))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ProbeError::Manifest(format!("{}: {e}", path.display())))
    }

    /// Latest published version of `name` on `endpoint`. A package that was
    /// never published has none.
    async fn live_version(
        &self,
        endpoint: &Endpoint,
        name: &str,
    ) -> Result<Option<Version>, ProbeError> {
        let (url, timeout) = (endpoint.url_for(name), endpoint.timeout());
        let Some(body) = http::fetch_json(&self.client, &url, timeout).await? else {
            debug!(package = %name, "package not published yet");
            return Ok(None);
        };
        let doc: ModuleDocument = serde_json::from_value(body)
            .map_err(|e| ProbeError::Http(e.to_string()))?;
        let Some(latest) = doc.latest() else {
            return Ok(None);
        };
        Version::parse(latest)
            .map(Some)
            .map_err(|e| ProbeError::Version(format!("{latest}: {e}")))
    }

    fn publish_args(&self) -> Vec<String> {
        let mut args = vec![self.package_dir.display().to_string()];
        if let Some(auth) = self.context.npm_auth() {
            args.push(auth_arg(&auth.username, &auth.password));
        }
        args
    }

    pub fn group(timestamp: i64) -> i64 {
        group_by_day(timestamp)
    }

    pub fn transform(bucket: &PublishDay, current: &ResultEnvelope<PublishReport>) -> PublishDay {
        let published = current.payload.published;
        PublishDay {
            success: bucket.success.record(published),
            failure: bucket.failure.record(!published),
        }
    }

    pub fn latest(aggregated: &[Bucket<PublishDay>]) -> Option<&Bucket<PublishDay>> {
        aggregated.last()
    }

    pub fn aggregate(raw: &[ResultEnvelope<PublishReport>]) -> Vec<Bucket<PublishDay>> {
        let pipeline = aggregate(
            Self::group,
            |bucket: &PublishDay, current: &ResultEnvelope<PublishReport>, _, _| {
                Self::transform(bucket, current)
            },
            PublishDay::default(),
        );
        pipeline(raw)
    }
}

impl Probe for PublishProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self) -> &ScheduleSpec {
        &self.schedule
    }

    fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Load, bump, publish. Failures before the publish command runs are
    /// errors; a failed publish is a normal report with `error` set.
    fn execute<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, ProbeOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            let config = PublishConfig::new(&endpoint.href);
            self.command.load(&config).await?;

            let mut manifest = self.read_manifest().await?;
            let name = manifest
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ProbeError::Manifest("package name missing".to_string()))?;

            let latest = self.live_version(endpoint, &name).await?;
            let version = next_version(latest.as_ref(), (self.today)());
            manifest.insert("version".to_string(), Value::String(version.to_string()));
            self.write_manifest(&manifest).await?;

            let outcome = self.command.publish(&self.publish_args()).await;
            let time = started.elapsed().as_millis() as i64;
            match &outcome {
                Ok(()) => debug!(package = %name, %version, time, "published"),
                Err(e) => warn!(package = %name, %version, error = %e, "publish failed"),
            }
            Ok(ResultPayload::Publish(PublishReport {
                published: outcome.is_ok(),
                time,
                error: outcome.err().map(|e| e.to_string()),
            }))
        })
    }

    fn summarize(&self, history: &[ResultEnvelope]) -> Option<Value> {
        let raw = narrow_history::<PublishReport>(history);
        let aggregated = Self::aggregate(&raw);
        let latest = Self::latest(&aggregated)?;
        serde_json::to_value(latest).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorprobe_core::{Endpoints, FeedHandle, NpmAuth};
    use std::sync::Mutex;

    /// Records publish args and fails on demand.
    #[derive(Default)]
    struct Recorder {
        fail: bool,
        args: Mutex<Vec<String>>,
    }

    impl PublishCommand for Recorder {
        fn load<'a>(&'a self, _: &'a PublishConfig) -> BoxFuture<'a, Result<(), ProbeError>> {
            Box::pin(async { Ok(()) })
        }

        fn publish<'a>(&'a self, args: &'a [String]) -> BoxFuture<'a, Result<(), ProbeError>> {
            Box::pin(async move {
                *self.args.lock().unwrap() = args.to_vec();
                if self.fail {
                    Err(ProbeError::Command("E403 forbidden".to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn jan_ninth() -> NaiveDate {
        day(2024, 1, 9)
    }

    fn report(start: i64, published: bool) -> ResultEnvelope<PublishReport> {
        ResultEnvelope::new(
            NAME,
            "npmjs",
            PublishReport {
                published,
                time: 100,
                error: None,
            },
            start,
            start + 100,
        )
    }

    #[test]
    fn version_bumps_patch_within_a_day() {
        let latest = Version::new(2024, 9, 3);
        assert_eq!(
            next_version(Some(&latest), jan_ninth()),
            Version::new(2024, 9, 4)
        );
    }

    #[test]
    fn version_resets_patch_on_a_new_day() {
        let latest = Version::new(2024, 8, 7);
        assert_eq!(
            next_version(Some(&latest), jan_ninth()),
            Version::new(2024, 9, 0)
        );
        // Same ordinal, different year.
        let last_year = Version::new(2023, 9, 7);
        assert_eq!(
            next_version(Some(&last_year), jan_ninth()),
            Version::new(2024, 9, 0)
        );
        assert_eq!(
            next_version(None, day(2024, 12, 31)),
            Version::new(2024, 366, 0)
        );
    }

    #[test]
    fn auth_is_base64_user_colon_pass() {
        assert_eq!(auth_arg("user", "pass"), "--_auth=dXNlcjpwYXNz");
    }

    #[test]
    fn transform_tracks_daily_percentages() {
        let raw = vec![
            report(10, true),
            report(20, false),
            report(30, true),
            report(86_400_010, true),
        ];
        let aggregated = PublishProbe::aggregate(&raw);
        assert_eq!(aggregated.len(), 2);

        let first = &aggregated[0].values;
        assert_eq!(first.success.count, 2);
        assert_eq!(first.success.ticks, 3);
        assert_eq!(first.failure.count, 1);
        assert!((first.failure.percentage - 100.0 / 3.0).abs() < 1e-9);

        let last = PublishProbe::latest(&aggregated).unwrap();
        assert_eq!(last.key, 86_400_000);
        assert_eq!(last.values.success.percentage, 100.0);
        assert_eq!(last.values.failure.percentage, 0.0);
    }

    async fn registry(latest: &'static str) -> Endpoint {
        let app = axum::Router::new().route(
            "/mirrorprobe-publish-test",
            axum::routing::get(move || async move {
                let doc = serde_json::json!({
                    "name": "mirrorprobe-publish-test",
                    "dist-tags": { "latest": latest },
                });
                doc.to_string()
            }),
        );
        serve(app).await
    }

    async fn serve(app: axum::Router) -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Endpoint::from_href("npmjs", &format!("http://{addr}/"))
    }

    fn package_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST),
            r#"{"name": "mirrorprobe-publish-test", "version": "0.0.0"}"#,
        )
        .unwrap();
        dir
    }

    fn manifest_version(dir: &tempfile::TempDir) -> String {
        let content = std::fs::read_to_string(dir.path().join(MANIFEST)).unwrap();
        let manifest: Value = serde_json::from_str(&content).unwrap();
        manifest["version"].as_str().unwrap().to_string()
    }

    fn context(auth: Option<NpmAuth>) -> ProbeContext {
        ProbeContext::new(FeedHandle::fixed(vec![]), Endpoints::defaults(), auth)
    }

    #[tokio::test]
    async fn execute_bumps_manifest_and_publishes() {
        let endpoint = registry("2024.9.1").await;
        let dir = package_dir();
        let recorder = Arc::new(Recorder::default());
        let auth = NpmAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let probe = PublishProbe::new(&context(Some(auth)), "npmjs", dir.path())
            .with_command(recorder.clone())
            .with_today(jan_ninth);

        let payload = probe.execute(&endpoint).await.unwrap();
        let ResultPayload::Publish(report) = payload else {
            panic!("expected publish payload");
        };
        assert!(report.published);
        assert!(report.error.is_none());
        assert!(report.time >= 0);

        assert_eq!(manifest_version(&dir), "2024.9.2");

        let args = recorder.args.lock().unwrap().clone();
        assert_eq!(args[0], dir.path().display().to_string());
        assert_eq!(args[1], "--_auth=dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn failed_publish_is_still_a_result() {
        let endpoint = registry("2024.8.5").await;
        let dir = package_dir();
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let probe = PublishProbe::new(&context(None), "npmjs", dir.path())
            .with_command(recorder.clone())
            .with_today(jan_ninth);

        let payload = probe.execute(&endpoint).await.unwrap();
        let ResultPayload::Publish(report) = payload else {
            panic!("expected publish payload");
        };
        assert!(!report.published);
        assert_eq!(
            report.error.as_deref(),
            Some("publish command error: E403 forbidden")
        );
        // No credentials, no auth argument.
        assert_eq!(recorder.args.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_publish_starts_the_day_at_patch_zero() {
        // An empty registry answers 404 for every package.
        let endpoint = serve(axum::Router::new()).await;
        let dir = package_dir();
        let recorder = Arc::new(Recorder::default());
        let probe = PublishProbe::new(&context(None), "npmjs", dir.path())
            .with_command(recorder.clone())
            .with_today(jan_ninth);

        let payload = probe.execute(&endpoint).await.unwrap();
        let ResultPayload::Publish(report) = payload else {
            panic!("expected publish payload");
        };
        assert!(report.published);
        assert_eq!(manifest_version(&dir), "2024.9.0");
    }

    #[tokio::test]
    async fn missing_manifest_is_an_error() {
        let endpoint = registry("2024.9.1").await;
        let dir = tempfile::tempdir().unwrap();
        let probe = PublishProbe::new(&context(None), "npmjs", dir.path())
            .with_command(Arc::new(Recorder::default()));
        let err = probe.execute(&endpoint).await.unwrap_err();
        assert!(matches!(err, ProbeError::Manifest(_)));
    }

    #[test]
    fn targets_only_the_canonical_registry() {
        let probe = PublishProbe::new(&context(None), "npmjs", Path::new("/tmp/pkg"));
        assert_eq!(probe.targets(), ["npmjs".to_string()]);
        assert_eq!(probe.schedule(), &ScheduleSpec::minutes(0, 59, 6));
    }
}
