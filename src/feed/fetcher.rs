use crate::config::Config;
use crate::session::{Session, SourceFailure, SourceRegistry};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use super::RawSnapshot;

/// Browser-identifying User-Agent sent with every feed request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Errors that can occur while retrieving one feed.
///
/// None of these escape a batch fetch; they are recorded against the
/// source that produced them.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a status other than 200
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the per-request timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Bounded retries with exponential backoff on selected status codes.
///
/// The default policy never retries. [`RetryPolicy::standard`] retries
/// 500, 502, 503 and 504 up to three times.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. 0 disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each following retry.
    pub backoff_ms: u64,
    /// Status codes that trigger a retry.
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 100,
            retry_statuses: vec![500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            ..Self::default()
        }
    }

    fn should_retry(&self, status: StatusCode, attempt: u32) -> bool {
        attempt < self.max_retries && self.retry_statuses.contains(&status.as_u16())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Tunables for a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Feeds fetched simultaneously within one batch (minimum 1).
    pub max_concurrent: usize,
    /// Budget for one request, covering connect, headers and body.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            timeout: REQUEST_TIMEOUT,
            retry: RetryPolicy::none(),
        }
    }
}

/// Retrieves raw feed payloads for every source of a session.
///
/// Holds no per-cycle state, so one fetcher can serve any number of
/// sessions concurrently.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    options: FetchOptions,
}

enum Attempt {
    Body(Vec<u8>),
    Status(StatusCode),
}

impl Fetcher {
    pub fn new(options: FetchOptions) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, options))
    }

    /// Builds a fetcher around an existing client (shared pools, proxies, ...).
    pub fn with_client(client: reqwest::Client, options: FetchOptions) -> Self {
        Self { client, options }
    }

    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        Self::new(FetchOptions {
            max_concurrent: config.max_concurrent_fetches,
            timeout: REQUEST_TIMEOUT,
            retry: config.retry.clone(),
        })
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Fetches every enabled source and replaces the session's raw snapshot.
    ///
    /// Uses `sources` when given, otherwise the session's registry. Sources
    /// mapped to an empty URL are skipped.
    ///
    /// # Returns
    ///
    /// `None` when the effective mapping is empty; the previous snapshot is
    /// left in place. Otherwise the new snapshot, holding only the sources
    /// that answered 200.
    ///
    /// # Behavior
    ///
    /// - Fetches up to `max_concurrent` feeds simultaneously
    /// - A failure is recorded in the session's failures and never affects
    ///   another source
    /// - The snapshot is swapped in only after every request has resolved
    pub async fn fetch<'s>(
        &self,
        session: &'s mut Session,
        sources: Option<&SourceRegistry>,
    ) -> Option<&'s RawSnapshot> {
        let registry = sources.unwrap_or(session.sources());
        if registry.is_empty() {
            tracing::debug!("No sources configured, nothing to fetch");
            return None;
        }

        let mut targets = Vec::with_capacity(registry.len());
        for (name, url) in registry {
            if url.is_empty() {
                tracing::debug!(source = %name, "Source disabled, skipping");
                continue;
            }
            targets.push((name.clone(), url.clone()));
        }

        let total = targets.len();
        let results: Vec<(String, Result<String, FetchError>)> = stream::iter(targets)
            .map(|(name, url)| async move {
                tracing::debug!(source = %name, url = %url, "Fetching feed");
                let result = self.fetch_one(&url).await;
                (name, result)
            })
            .buffer_unordered(self.options.max_concurrent.max(1))
            .collect()
            .await;

        let mut snapshot = RawSnapshot::new();
        let mut failures = BTreeMap::new();
        for (name, result) in results {
            match result {
                Ok(body) => {
                    tracing::debug!(source = %name, bytes = body.len(), "Feed fetched");
                    snapshot.insert(name, body);
                }
                Err(e) => {
                    tracing::warn!(source = %name, error = %e, "Feed fetch failed, skipping source");
                    failures.insert(name, SourceFailure::Fetch(e));
                }
            }
        }

        tracing::info!(
            fetched = snapshot.len(),
            failed = failures.len(),
            total = total,
            "Fetch cycle complete"
        );

        Some(session.finish_fetch(snapshot, failures))
    }

    /// Fetches a single feed URL and returns its body as text.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Network`] - Connection, DNS or TLS errors
    /// - [`FetchError::Timeout`] - The attempt exceeded the request timeout
    /// - [`FetchError::HttpStatus`] - Any status other than 200, after retries
    /// - [`FetchError::ResponseTooLarge`] - Body exceeded 10MB
    /// - [`FetchError::IncompleteResponse`] - Body shorter than Content-Length
    pub async fn fetch_one(&self, url: &str) -> Result<String, FetchError> {
        let mut retry_count = 0;

        loop {
            let attempt = tokio::time::timeout(self.options.timeout, self.attempt(url))
                .await
                .map_err(|_| FetchError::Timeout)??;

            match attempt {
                Attempt::Body(bytes) => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
                Attempt::Status(status) if self.options.retry.should_retry(status, retry_count) => {
                    let delay = self.options.retry.backoff(retry_count);
                    tracing::warn!(
                        url = %url,
                        status = %status,
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Server error, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Attempt::Status(status) => return Err(FetchError::HttpStatus(status.as_u16())),
            }
        }
    }

    async fn attempt(&self, url: &str) -> Result<Attempt, FetchError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Ok(Attempt::Status(status));
        }

        read_limited_bytes(response, MAX_FEED_SIZE)
            .await
            .map(Attempt::Body)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
