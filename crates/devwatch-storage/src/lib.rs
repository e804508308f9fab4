//! SQLite project store + HTTP fetch utilities.

mod sqlite;

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub use sqlite::{ProjectStore, StoreError};

pub const CRATE_NAME: &str = "devwatch-storage";

/// Throttling and upstream 5xx responses are worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Connection, timeout and request-building transport failures are retried.
pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}

/// Capped exponential delay between attempts of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial_delay: Duration::from_millis(500),
            delay_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Every request is exactly one attempt.
    pub fn never() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (0-based).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let multiplier = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(multiplier)
            .map_or(self.delay_cap, |d| d.min(self.delay_cap))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn single_attempt(timeout: Duration, user_agent: Option<String>) -> Self {
        Self {
            timeout,
            user_agent,
            retry: RetryPolicy::never(),
        }
    }
}

/// Successful response body plus the URL it was finally served from.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        let builder = match config.user_agent {
            Some(ua) => builder.user_agent(ua),
            None => builder,
        };
        Ok(Self {
            client: builder.build().context("building HTTP client")?,
            retry: config.retry,
        })
    }

    pub fn attempts(&self) -> u32 {
        self.retry.retries + 1
    }

    /// GET with query parameters; retryable failures are retried per the policy.
    pub async fn get(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        let span = info_span!("http_get", source_id, url);
        self.get_retrying(url, query).instrument(span).await
    }

    pub async fn get_json(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, HttpError> {
        let resp = self.get(source_id, url, query).await?;
        serde_json::from_slice(&resp.body).map_err(|source| HttpError::Decode {
            url: resp.final_url,
            source,
        })
    }

    async fn get_retrying(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        let mut retry = 0u32;
        loop {
            let error = match self.client.get(url).query(query).send().await {
                Ok(resp) if resp.status().is_success() => return Self::read_body(resp).await,
                Ok(resp) => {
                    let status = resp.status();
                    let err = HttpError::Status {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    if !is_retryable_status(status) {
                        return Err(err);
                    }
                    err
                }
                Err(err) if is_retryable_error(&err) => HttpError::Request(err),
                Err(err) => return Err(HttpError::Request(err)),
            };

            if retry >= self.retry.retries {
                return Err(error);
            }
            let delay = self.retry.delay_before_retry(retry);
            debug!(%error, retry, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    async fn read_body(resp: reqwest::Response) -> Result<HttpResponse, HttpError> {
        let status = resp.status();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(HttpResponse {
            final_url,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_until_capped() {
        let policy = RetryPolicy {
            retries: 6,
            initial_delay: Duration::from_millis(250),
            delay_cap: Duration::from_secs(1),
        };
        let delays: Vec<_> = (0..5).map(|r| policy.delay_before_retry(r)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(policy.delay_before_retry(40), Duration::from_secs(1));
    }

    #[test]
    fn single_attempt_config_never_retries() {
        let config = HttpClientConfig::single_attempt(Duration::from_secs(10), None);
        let fetcher = HttpFetcher::new(config).expect("client");
        assert_eq!(fetcher.attempts(), 1);
        assert_eq!(HttpFetcher::new(HttpClientConfig::default()).unwrap().attempts(), 3);
    }

    #[test]
    fn only_throttling_and_server_errors_are_retryable() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn connection_refused_surfaces_as_request_error() {
        let fetcher = HttpFetcher::new(HttpClientConfig::single_attempt(
            Duration::from_secs(2),
            None,
        ))
        .expect("client");
        let err = fetcher
            .get("test", "http://127.0.0.1:9/unreachable", &[])
            .await
            .expect_err("nothing listens on the discard port");
        assert!(matches!(err, HttpError::Request(_)));
    }
}
