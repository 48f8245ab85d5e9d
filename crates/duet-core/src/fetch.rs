//! HTTP byte-range fetching with retry, backoff and a growing timeout
//!
//! [`RangeFetcher`] is the seam the controllers fetch through.
//! [`HttpRangeFetcher`] is the production implementation; [`MemoryFetcher`]
//! serves resources held in memory for tests and simulations.

use crate::{config::RetryConfig, types::InclusiveRange, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};
use url::Url;

/// Source of byte ranges of a remote resource
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Fetch `range` of the resource at `url`, retrying as the implementation sees fit
    async fn fetch_range(&self, url: &Url, range: InclusiveRange) -> Result<Bytes>;
}

/// `RangeFetcher` over `reqwest`
#[derive(Debug, Clone)]
pub struct HttpRangeFetcher {
    client: Client,
    config: RetryConfig,
}

impl HttpRangeFetcher {
    pub fn new(config: RetryConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("duet/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: RetryConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// One request with no retry
    async fn attempt(&self, url: &Url, range: InclusiveRange, timeout: Duration) -> Result<Bytes> {
        let timed_out = || Error::Timeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let response = self
            .client
            .get(url.clone())
            .header(header::RANGE, range.to_http_range())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { timed_out() } else { Error::Network(e) })?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => {}
            StatusCode::FORBIDDEN => {
                return Err(Error::Forbidden { url: url.to_string() });
            }
            other => {
                return Err(Error::HttpStatus {
                    url: url.to_string(),
                    status: other.as_u16(),
                });
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| if e.is_timeout() { timed_out() } else { Error::Network(e) })?;

        if status == StatusCode::OK {
            // Server ignored the Range header and sent the whole resource
            return Ok(slice_full_body(body, range));
        }
        Ok(body)
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    #[instrument(skip(self), fields(url = %url, range = %range))]
    async fn fetch_range(&self, url: &Url, range: InclusiveRange) -> Result<Bytes> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut timeout = self.config.request_timeout;

        for attempt in 1..=max_attempts {
            match self.attempt(url, range, timeout).await {
                Ok(body) => {
                    debug!(attempt, bytes = body.len(), "Range fetched");
                    return Ok(body);
                }
                Err(e) if !e.is_recoverable() => {
                    error!(attempt, error = %e, "Range fetch failed, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    if matches!(e, Error::Timeout { .. }) {
                        timeout = timeout.saturating_mul(2);
                    }
                    if attempt == max_attempts {
                        warn!(attempt, error = %e, "Last range fetch attempt failed");
                        break;
                    }
                    let backoff = self.config.backoff_for(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Range fetch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        error!(attempts = max_attempts, "Range fetch retries exhausted");
        Err(Error::RetriesExhausted {
            url: url.to_string(),
            attempts: max_attempts,
        })
    }
}

fn slice_full_body(body: Bytes, range: InclusiveRange) -> Bytes {
    let len = body.len() as u64;
    let start = range.start.min(len);
    let end = if range.is_open_ended() {
        len
    } else {
        range.end.saturating_add(1).min(len)
    };
    body.slice(start as usize..end.max(start) as usize)
}

/// Serves ranges of in-memory resources and records every request
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    resources: HashMap<Url, Bytes>,
    failures: Mutex<HashMap<Url, Vec<u16>>>,
    requests: Mutex<Vec<(Url, InclusiveRange)>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, url: Url, data: impl Into<Bytes>) -> Self {
        self.resources.insert(url, data.into());
        self
    }

    /// Answer the next requests for `url` with these statuses, in order
    pub async fn fail_next(&self, url: &Url, statuses: &[u16]) {
        self.failures
            .lock()
            .await
            .entry(url.clone())
            .or_default()
            .extend_from_slice(statuses);
    }

    /// Every request served so far, oldest first
    pub async fn requests(&self) -> Vec<(Url, InclusiveRange)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl RangeFetcher for MemoryFetcher {
    async fn fetch_range(&self, url: &Url, range: InclusiveRange) -> Result<Bytes> {
        self.requests.lock().await.push((url.clone(), range));

        let injected = {
            let mut failures = self.failures.lock().await;
            failures
                .get_mut(url)
                .filter(|pending| !pending.is_empty())
                .map(|pending| pending.remove(0))
        };
        match injected {
            Some(403) => return Err(Error::Forbidden { url: url.to_string() }),
            Some(status) => {
                return Err(Error::HttpStatus {
                    url: url.to_string(),
                    status,
                })
            }
            None => {}
        }

        let body = self.resources.get(url).ok_or_else(|| Error::HttpStatus {
            url: url.to_string(),
            status: 404,
        })?;
        if range.start >= body.len() as u64 {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: 416,
            });
        }
        Ok(slice_full_body(body.clone(), range))
    }
}
