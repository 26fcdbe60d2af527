//! REST API handlers.
//!
//! Probes and their targets come from the collector; results come from
//! the history backend.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use mirrorprobe_collector::Phase;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct ProbeInfo {
    pub name: String,
    pub schedule: String,
    pub targets: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ProbeStatus {
    pub registry: String,
    pub probe: String,
    /// Start of the most recent result.
    pub last_run: Option<i64>,
    pub summary: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub phase: Phase,
    pub feed_entries: usize,
    pub probes: Vec<ProbeStatus>,
}

/// GET /api/v1/probes
pub async fn list_probes(State(state): State<ApiState>) -> impl IntoResponse {
    let probes: Vec<ProbeInfo> = state
        .collector
        .probes()
        .iter()
        .map(|p| ProbeInfo {
            name: p.name().to_string(),
            schedule: p.schedule().to_string(),
            targets: p.targets().to_vec(),
        })
        .collect();
    ApiResponse::ok(probes)
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let mut probes = Vec::new();
    for probe in state.collector.probes() {
        for registry in probe.targets() {
            let history = match state.history.history(registry, probe.name()) {
                Ok(history) => history,
                Err(e) => {
                    warn!(
                        %registry,
                        probe = %probe.name(),
                        error = %e,
                        "history read failed"
                    );
                    return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                        .into_response();
                }
            };
            probes.push(ProbeStatus {
                registry: registry.clone(),
                probe: probe.name().to_string(),
                last_run: history.last().map(|e| e.start),
                summary: probe.summarize(&history),
            });
        }
    }

    ApiResponse::ok(StatusReport {
        phase: state.collector.phase(),
        feed_entries: state.collector.feed().len(),
        probes,
    })
    .into_response()
}

/// GET /api/v1/history/{registry}/{probe}
pub async fn history(
    State(state): State<ApiState>,
    Path((registry, probe)): Path<(String, String)>,
) -> impl IntoResponse {
    if state.collector.probe(&probe).is_none() {
        return error_response("probe not found", StatusCode::NOT_FOUND).into_response();
    }
    if state.collector.endpoints().get(&registry).is_none() {
        return error_response("registry not found", StatusCode::NOT_FOUND).into_response();
    }
    match state.history.history(&registry, &probe) {
        Ok(envelopes) => ApiResponse::ok(envelopes).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use mirrorprobe_collector::{
        Collector, CollectorOptions, CollectorResult, FeedSource, Job, JobHandle, Scheduler,
    };
    use mirrorprobe_core::{
        BoxFuture, CacheError, Describe, Endpoint, Endpoints, FeedEntry, History, Probe,
        ProbeOutcome, ResultEnvelope, ResultPayload, ScheduleSpec,
    };

    struct EmptyFeed;

    impl FeedSource for EmptyFeed {
        fn fetch(&self) -> BoxFuture<'_, CollectorResult<Vec<FeedEntry>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    /// Accepts jobs and never fires them.
    struct IdleScheduler;

    impl Scheduler for IdleScheduler {
        fn schedule(&self, name: &str, _: &ScheduleSpec, _: Job) -> CollectorResult<JobHandle> {
            Ok(JobHandle {
                id: 0,
                name: name.to_string(),
            })
        }

        fn cancel(&self, _: &JobHandle) -> bool {
            false
        }

        fn cancel_all(&self) {}
    }

    /// Summarizes to the number of envelopes seen.
    struct CountingProbe {
        schedule: ScheduleSpec,
        targets: Vec<String>,
    }

    impl Probe for CountingProbe {
        fn name(&self) -> &str {
            "ping"
        }

        fn schedule(&self) -> &ScheduleSpec {
            &self.schedule
        }

        fn targets(&self) -> &[String] {
            &self.targets
        }

        fn execute<'a>(&'a self, _: &'a Endpoint) -> BoxFuture<'a, ProbeOutcome> {
            Box::pin(async { Ok(ResultPayload::Ping(Describe::ZERO)) })
        }

        fn summarize(&self, history: &[ResultEnvelope]) -> Option<Value> {
            (!history.is_empty()).then(|| Value::from(history.len()))
        }
    }

    #[derive(Default)]
    struct FixedHistory {
        envelopes: Mutex<Vec<ResultEnvelope>>,
        broken: bool,
    }

    impl History for FixedHistory {
        fn history(&self, registry: &str, probe: &str) -> Result<Vec<ResultEnvelope>, CacheError> {
            if self.broken {
                return Err(CacheError("store offline".to_string()));
            }
            Ok(self
                .envelopes
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.registry == registry && e.probe == probe)
                .cloned()
                .collect())
        }
    }

    fn test_state(history: FixedHistory) -> ApiState {
        let endpoints = Endpoints::new([
            Endpoint::from_href("npmjs", "https://registry.npmjs.org/"),
            Endpoint::from_href("mirror", "http://127.0.0.1:4873/"),
        ]);
        let collector = Collector::new(
            endpoints,
            Arc::new(EmptyFeed),
            Arc::new(IdleScheduler),
            CollectorOptions::default(),
        );
        collector.register(Arc::new(CountingProbe {
            schedule: ScheduleSpec::seconds([0, 30]),
            targets: vec!["npmjs".to_string(), "mirror".to_string()],
        }));
        ApiState {
            collector,
            history: Arc::new(history),
        }
    }

    fn ping(registry: &str, start: i64) -> ResultEnvelope {
        let payload = ResultPayload::Ping(Describe::ZERO);
        ResultEnvelope::new("ping", registry, payload, start, start + 10)
    }

    fn path(registry: &str, probe: &str) -> Path<(String, String)> {
        Path((registry.to_string(), probe.to_string()))
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn list_probes_shows_schedule_and_targets() {
        let state = test_state(FixedHistory::default());
        let resp = list_probes(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["data"][0]["name"], "ping");
        assert_eq!(body["data"][0]["schedule"], "0,30 *");
        assert_eq!(body["data"][0]["targets"][1], "mirror");
    }

    #[tokio::test]
    async fn status_summarizes_each_target() {
        let history = FixedHistory::default();
        history
            .envelopes
            .lock()
            .unwrap()
            .extend([ping("npmjs", 100), ping("npmjs", 200)]);
        let state = test_state(history);

        let resp = status(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["phase"], "uninitialized");
        let probes = body["data"]["probes"].as_array().unwrap();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[0]["registry"], "npmjs");
        assert_eq!(probes[0]["summary"], 2);
        assert_eq!(probes[0]["last_run"], 200);
        assert!(probes[1]["summary"].is_null());
    }

    #[tokio::test]
    async fn status_reports_history_failure() {
        let state = test_state(FixedHistory {
            broken: true,
            ..Default::default()
        });
        let resp = status(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn history_unknown_probe_or_registry() {
        let state = test_state(FixedHistory::default());
        let resp = history(State(state.clone()), path("npmjs", "nope"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = history(State(state), path("nowhere", "ping"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn router_serves_history() {
        let history = FixedHistory::default();
        history.envelopes.lock().unwrap().push(ping("mirror", 5));
        let state = test_state(history);
        let app = crate::build_router(state.collector, state.history);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/history/mirror/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"][0]["start"], 5);
        assert_eq!(body["data"][0]["payload"]["kind"], "ping");
    }
}
