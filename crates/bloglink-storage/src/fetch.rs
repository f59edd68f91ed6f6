//! Rate-limited HTTP page fetching with retry/backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

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
    pub global_concurrency: usize,
    /// Concurrent requests per scope (a source id or a target host).
    pub per_scope_concurrency: usize,
    pub max_body_bytes: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 32,
            per_scope_concurrency: 2,
            max_body_bytes: 4 * 1024 * 1024,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Request rate shared by every fetch through one [`HttpFetcher`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub per_second: f64,
    /// Requests allowed back to back before the rate applies.
    pub burst: u32,
}

/// Token bucket refilled continuously at `per_second`; `acquire` waits for
/// the next whole token.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            per_second: limit.per_second.max(f64::MIN_POSITIVE),
            burst: limit.burst.max(1),
        };
        Self {
            limit,
            state: Mutex::new(BucketState {
                tokens: f64::from(limit.burst),
                updated: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let refilled = now.duration_since(state.updated).as_secs_f64() * self.limit.per_second;
                state.tokens = (state.tokens + refilled).min(f64::from(self.limit.burst));
                state.updated = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.limit.per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn html(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            final_url: url.into(),
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: body.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Reject bodies that cannot be a web page (images, archives, PDFs).
    pub fn ensure_page(&self) -> Result<(), FetchError> {
        match self.content_type.as_deref() {
            None => Ok(()),
            Some(ct) => {
                let ct = ct.to_ascii_lowercase();
                if ct.contains("html") || ct.contains("xml") || ct.starts_with("text/") {
                    Ok(())
                } else {
                    Err(FetchError::UnsupportedContent {
                        content_type: ct,
                        url: self.final_url.clone(),
                    })
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unsupported content type {content_type} for {url}")]
    UnsupportedContent { content_type: String, url: String },
    #[error("response body for {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("fetcher is shut down")]
    Closed,
}

/// Anything that can fetch a page by URL.
///
/// `scope` groups requests for concurrency limiting and log context; callers
/// pass the source id for listings and the target host for site pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, scope: &str, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    /// Only scopes with a request in flight have an entry.
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(5));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            backoff: config.backoff,
            max_body_bytes: config.max_body_bytes,
        })
    }

    async fn scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    /// Forget `scope` once nothing else holds its semaphore, so one-off hosts
    /// do not accumulate over a long crawl.
    async fn release_scope(&self, scope: &str, semaphore: Arc<Semaphore>) {
        let mut map = self.per_scope.lock().await;
        drop(semaphore);
        if map
            .get(scope)
            .is_some_and(|held| Arc::strong_count(held) == 1)
        {
            map.remove(scope);
        }
    }

    #[cfg(test)]
    async fn tracked_scopes(&self) -> usize {
        self.per_scope.lock().await.len()
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let (disposition, err) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return self.read_page(resp).await,
                Ok(resp) => (
                    classify_status(resp.status()),
                    FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };
            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %err, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Read the body chunk by chunk and give up as soon as it passes `max_body_bytes`.
    async fn read_page(&self, mut resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let limit = self.max_body_bytes;
        let too_large = |url: &str| FetchError::TooLarge {
            url: url.to_string(),
            limit,
        };

        if resp.content_length().is_some_and(|len| len > limit as u64) {
            return Err(too_large(&final_url));
        }
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(too_large(&final_url));
            }
            body.extend_from_slice(&chunk);
        }
        debug!(status, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, scope: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let scope_limit = self.scope_semaphore(scope).await;
        let result = match scope_limit.acquire().await {
            Ok(_permit) => {
                if let Some(limiter) = &self.rate_limiter {
                    limiter.acquire().await;
                }
                self.fetch_with_retries(url)
                    .instrument(info_span!("http_fetch", scope, url))
                    .await
            }
            Err(_) => Err(FetchError::Closed),
        };
        self.release_scope(scope, scope_limit).await;
        result
    }
}
