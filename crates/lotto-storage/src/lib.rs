//! Draw/result persistence + HTTP fetch utilities for lotto.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

mod store;

pub use store::{
    DrawStore, MemoryStore, PgStore, RecordOutcome, ResultStore, StoreError, UpsertOutcome,
};

pub const CRATE_NAME: &str = "lotto-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff. The fetcher never retries on its own; callers
/// consult this policy together with [`FetchError::retry_disposition`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub per_second: u32,
}

/// Token bucket shared by every request issued through one [`HttpFetcher`].
#[derive(Debug)]
pub struct RateLimiter {
    burst: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let per_second = config.per_second.max(1);
        Self {
            burst: config.burst.max(1),
            refill_every: Duration::from_secs(1) / per_second,
            state: Mutex::new(BucketState {
                tokens: config.burst.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && !self.refill_every.is_zero() {
                let refills = u32::try_from(elapsed.as_nanos() / self.refill_every.as_nanos())
                    .unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.burst);
                // Keep the unspent part of the current interval.
                state.last_refill += self.refill_every * refills;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

/// Tagged result of a lookup: absence is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Found(T),
    NotFound,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Transport faults and unexpected statuses. Undecodable bodies are permanent.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Decode { .. })
    }

    pub fn retry_disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Timeout { .. } => RetryDisposition::Retryable,
            Self::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }

}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
            rate_limiter: config.rate_limit.map(|c| Arc::new(RateLimiter::new(c))),
        })
    }

    /// GET `url` once. 404 maps to [`FetchOutcome::NotFound`]; any other non-2xx
    /// status or transport fault is an error. No retries happen here.
    pub async fn get_bytes(&self, url: &str) -> Result<FetchOutcome<Vec<u8>>, FetchError> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| self.request_error(url, err))?;
            let status = resp.status();
            debug!(status = status.as_u16(), "response received");

            if status == StatusCode::NOT_FOUND {
                return Ok(FetchOutcome::NotFound);
            }
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| self.request_error(url, err))?;
            Ok(FetchOutcome::Found(body.to_vec()))
        }
        .instrument(span)
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<FetchOutcome<T>, FetchError> {
        match self.get_bytes(url).await? {
            FetchOutcome::Found(body) => serde_json::from_slice(&body)
                .map(FetchOutcome::Found)
                .map_err(|source| FetchError::Decode {
                    url: url.to_string(),
                    source,
                }),
            FetchOutcome::NotFound => Ok(FetchOutcome::NotFound),
        }
    }

    fn request_error(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::StatusCode as AxumStatus, routing::get, Json, Router};
    use serde::Deserialize;
    use tokio::net::TcpListener;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        numero: u32,
    }

    async fn stub(Path(id): Path<u32>) -> Result<Json<serde_json::Value>, AxumStatus> {
        match id {
            404 => Err(AxumStatus::NOT_FOUND),
            500 => Err(AxumStatus::INTERNAL_SERVER_ERROR),
            400 => Err(AxumStatus::BAD_REQUEST),
            _ => Ok(Json(serde_json::json!({ "numero": id }))),
        }
    }

    async fn spawn_stub() -> String {
        let app = Router::new()
            .route("/draw/{id}", get(stub))
            .route("/garbage", get(|| async { "not json" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn success_not_found_and_errors_are_classified() {
        let base = spawn_stub().await;
        let http = fetcher();

        let found: FetchOutcome<Probe> = http.get_json(&format!("{base}/draw/7")).await.unwrap();
        assert_eq!(found, FetchOutcome::Found(Probe { numero: 7 }));

        let missing: FetchOutcome<Probe> =
            http.get_json(&format!("{base}/draw/404")).await.unwrap();
        assert_eq!(missing, FetchOutcome::NotFound);

        let server_err = http
            .get_json::<Probe>(&format!("{base}/draw/500"))
            .await
            .unwrap_err();
        assert!(matches!(server_err, FetchError::HttpStatus { status: 500, .. }));
        assert!(server_err.is_transient());
        assert_eq!(server_err.retry_disposition(), RetryDisposition::Retryable);

        let client_err = http
            .get_json::<Probe>(&format!("{base}/draw/400"))
            .await
            .unwrap_err();
        assert!(client_err.is_transient());
        assert_eq!(client_err.retry_disposition(), RetryDisposition::NonRetryable);

        let decode = http
            .get_json::<Probe>(&format!("{base}/garbage"))
            .await
            .unwrap_err();
        assert!(matches!(decode, FetchError::Decode { .. }));
        assert!(!decode.is_transient());
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = fetcher()
            .get_bytes(&format!("http://{addr}/draw/1"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.retry_disposition(), RetryDisposition::Retryable);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn rate_limiter_allows_burst_then_throttles() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst: 2,
            per_second: 20,
        });
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_keeps_partial_refill_progress() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst: 1,
            per_second: 10,
        });
        let start = Instant::now();
        limiter.acquire().await;

        tokio::time::advance(Duration::from_millis(150)).await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_millis(150));

        // 50ms carried over from the previous interval make the next token due now.
        tokio::time::advance(Duration::from_millis(50)).await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }
}
