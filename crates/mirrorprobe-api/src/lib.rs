//! mirrorprobe-api — read-only status API.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/probes` | Registered probes with schedule and targets |
//! | GET | `/api/v1/status` | Latest summary per registry and probe |
//! | GET | `/api/v1/history/{registry}/{probe}` | Raw result envelopes |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use mirrorprobe_collector::Collector;
use mirrorprobe_core::History;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub collector: Collector,
    pub history: Arc<dyn History>,
}

/// Build the API router.
pub fn build_router(collector: Collector, history: Arc<dyn History>) -> Router {
    let state = ApiState { collector, history };

    let api_routes = Router::new()
        .route("/probes", get(handlers::list_probes))
        .route("/status", get(handlers::status))
        .route("/history/{registry}/{probe}", get(handlers::history))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
