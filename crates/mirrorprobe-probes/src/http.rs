//! HTTP helpers shared by the probes.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use mirrorprobe_core::{ModuleDocument, ProbeError};

const USER_AGENT: &str = concat!("mirrorprobe/", env!("CARGO_PKG_VERSION"));

/// Body fragment a CouchDB-style registry returns for a missing document.
const NOT_FOUND_MARKER: &str = r#""error":"not_found""#;

/// Build the client every probe shares.
pub fn client() -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

/// Fetch a module document, treating every failure as "absent".
///
/// Transport errors, non-2xx responses, registry error bodies and
/// malformed JSON all yield `None` so the caller can count a mismatch
/// instead of aborting the tick.
pub async fn fetch_document(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Option<ModuleDocument> {
    let response = match client.get(url).timeout(timeout).send().await {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, %url, "document fetch failed");
            return None;
        }
    };
    if !response.status().is_success() {
        debug!(status = %response.status(), %url, "document fetch non-2xx");
        return None;
    }
    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => {
            debug!(error = %e, %url, "document body read failed");
            return None;
        }
    };
    if body.contains(NOT_FOUND_MARKER) {
        return None;
    }
    match serde_json::from_str(&body) {
        Ok(doc) => Some(doc),
        Err(e) => {
            debug!(error = %e, %url, "document is not valid json");
            None
        }
    }
}

/// Fetch JSON from `url`, surfacing failures as probe errors.
///
/// A 404 or a registry `not_found` body is `Ok(None)`: the document does
/// not exist yet.
pub async fn fetch_json(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Result<Option<Value>, ProbeError> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ProbeError::Http(format!("{url}: {e}")))?;
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        debug!(%url, "document not found");
        return Ok(None);
    }
    if !status.is_success() {
        return Err(ProbeError::Http(format!("{url}: status {status}")));
    }
    let body = response
        .text()
        .await
        .map_err(|e| ProbeError::Http(format!("{url}: {e}")))?;
    if body.contains(NOT_FOUND_MARKER) {
        return Ok(None);
    }
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| ProbeError::Http(format!("{url}: {e}")))
}
