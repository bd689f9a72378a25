//! Source adapter contract and the HTTP implementation.
//!
//! An adapter lists the chapters one upstream site currently offers for a
//! series source. Errors split into transient (worth retrying) and permanent
//! (the source row's failure counter moves); the distinction drives both the
//! job retry policy and the broken-source transition.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::ratelimit::FixedWindowLimiter;
use crate::types::SeriesSource;

/// One chapter as listed by an upstream source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteChapter {
    pub source_chapter_id: String,
    pub chapter_number: f64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("permanent upstream failure: {0}")]
    Permanent(String),

    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("fetch aborted")]
    Aborted,
}

impl AdapterError {
    /// Permanent failures are the only non-retryable class.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AdapterError::Permanent(_))
    }

    /// Classify an upstream HTTP status. 5xx and 429 come back; other 4xx
    /// will not improve on retry.
    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            AdapterError::RateLimited { retry_after: None }
        } else if status.is_server_error() {
            AdapterError::Transient(format!("upstream returned {status}"))
        } else {
            AdapterError::Permanent(format!("upstream returned {status}"))
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    async fn list_chapters(
        &self,
        source: &SeriesSource,
        cancel: CancellationToken,
    ) -> Result<Vec<RemoteChapter>, AdapterError>;
}

/// Wire shape returned by the upstream chapter listing endpoints.
#[derive(Debug, Deserialize)]
struct WireChapter {
    id: String,
    number: f64,
    url: String,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

/// JSON-over-HTTP adapter honouring a per-source request budget.
pub struct HttpSourceAdapter {
    name: String,
    base_url: String,
    client: reqwest::Client,
    budget: Arc<FixedWindowLimiter>,
    requests_per_second: u32,
    fetch_timeout: Duration,
}

impl fmt::Debug for HttpSourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSourceAdapter")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("requests_per_second", &self.requests_per_second)
            .finish_non_exhaustive()
    }
}

impl HttpSourceAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        budget: Arc<FixedWindowLimiter>,
        requests_per_second: u32,
        fetch_timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| AdapterError::Permanent(format!("http client build failed: {e}")))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            client,
            budget,
            requests_per_second,
            fetch_timeout,
        })
    }
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn list_chapters(
        &self,
        source: &SeriesSource,
        cancel: CancellationToken,
    ) -> Result<Vec<RemoteChapter>, AdapterError> {
        let budget_key = format!("source:{}", self.name);
        let decision = self
            .budget
            .check(&budget_key, self.requests_per_second, Duration::from_secs(1))
            .await;
        if !decision.allowed {
            return Err(AdapterError::RateLimited {
                retry_after: Some(decision.reset_after()),
            });
        }

        let url = format!(
            "{}/series/{}/chapters",
            self.base_url.trim_end_matches('/'),
            source.external_id
        );
        debug!(source = %self.name, %url, "listing upstream chapters");

        let request = self.client.get(&url).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AdapterError::Aborted),
            result = tokio::time::timeout(self.fetch_timeout, request) => match result {
                Err(_) => return Err(AdapterError::Transient("upstream fetch timed out".into())),
                Ok(Err(err)) if err.is_timeout() => {
                    return Err(AdapterError::Transient("upstream fetch timed out".into()));
                }
                Ok(Err(err)) => return Err(AdapterError::Transient(err.to_string())),
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(status));
        }

        let chapters: Vec<WireChapter> = response
            .json()
            .await
            .map_err(|e| AdapterError::Permanent(format!("malformed chapter listing: {e}")))?;
        Ok(chapters
            .into_iter()
            .map(|chapter| RemoteChapter {
                source_chapter_id: chapter.id,
                chapter_number: chapter.number,
                url: chapter.url,
                detected_at: chapter.published_at,
            })
            .collect())
    }
}

/// Lookup table from `series_sources.source_name` to its adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters
            .insert(adapter.source_name().to_string(), adapter);
    }

    pub fn get(&self, source_name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_splits_retryable() {
        assert!(AdapterError::from_status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(AdapterError::from_status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!AdapterError::from_status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!AdapterError::from_status(StatusCode::GONE).is_retryable());
    }
}
