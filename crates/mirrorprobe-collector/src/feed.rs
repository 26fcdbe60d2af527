//! Change-feed sources.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use mirrorprobe_core::{BoxFuture, DEFAULT_TIMEOUT, FeedEntry};

use crate::error::{CollectorError, CollectorResult};

/// Fetches a snapshot of the canonical registry's recent changes.
pub trait FeedSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, CollectorResult<Vec<FeedEntry>>>;
}

#[derive(Debug, Deserialize)]
struct ChangesPage {
    results: Vec<FeedEntry>,
}

/// A CouchDB `_changes` endpoint queried with `include_docs=true`.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    url: String,
    timeout: Duration,
    client: Client,
}

impl HttpFeedSource {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            timeout: DEFAULT_TIMEOUT,
            client: Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_page(&self) -> CollectorResult<Vec<FeedEntry>> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| CollectorError::Feed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let reason = format!("{}: status {status}", self.url);
            return Err(CollectorError::Feed(reason));
        }
        let page: ChangesPage = response
            .json()
            .await
            .map_err(|e| CollectorError::Feed(format!("{}: {e}", self.url)))?;
        debug!(url = %self.url, entries = page.results.len(), "feed fetched");
        Ok(page.results)
    }
}

impl FeedSource for HttpFeedSource {
    fn fetch(&self) -> BoxFuture<'_, CollectorResult<Vec<FeedEntry>>> {
        Box::pin(self.fetch_page())
    }
}
