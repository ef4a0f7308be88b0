use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{error, warn};
use serde_json::Value;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::api::rate_limiter::RateLimiter;
use crate::config::ApiConfig;
use crate::metrics::METRICS;

/// Outcome of one logical request (all attempts included).
///
/// "Not found" and "forbidden" are frequent, expected answers from the
/// upstream API, so they are values here rather than errors.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Success(Value),
    NotFound,
    RateLimited,
    Forbidden,
    TransientError(String),
    PermanentError(String),
    /// Shutdown was requested while the request was pending.
    Cancelled,
}

impl fmt::Display for FetchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchResult::Success(_) => write!(f, "success"),
            FetchResult::NotFound => write!(f, "not found"),
            FetchResult::RateLimited => write!(f, "rate limited (retries exhausted)"),
            FetchResult::Forbidden => write!(f, "forbidden (check API key and IP allow-list)"),
            FetchResult::TransientError(e) => write!(f, "transient error: {e}"),
            FetchResult::PermanentError(e) => write!(f, "permanent error: {e}"),
            FetchResult::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Raw HTTP answer as seen by the executor.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout,
    Connect(String),
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Connect(e) => write!(f, "connection failed: {e}"),
            TransportError::Other(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// The wire underneath the executor.
///
/// `path` is already percent-encoded and relative to the API base URL
/// (e.g. `/clans/%232PP/warlog`).
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - One instance is shared by every concurrent fetch
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<HttpResponse, TransportError>;

    /// Releases pooled connections. Called once on shutdown.
    async fn close(&self) {}
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per logical request, including the first one
    pub max_retries: u32,
    /// Delay before retry `n` is `base_backoff * 2^n`
    pub base_backoff: Duration,
    /// Ceiling for one attempt, independent of backoff
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &ApiConfig) -> Self {
        Self {
            max_retries: cfg.max_retries.max(1),
            base_backoff: cfg.backoff_base(),
            request_timeout: cfg.timeout(),
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }
}

/// A failed attempt that may be retried.
enum Retryable {
    RateLimited,
    Server(String),
    Transport(String),
}

impl Retryable {
    fn into_terminal(self) -> FetchResult {
        match self {
            Retryable::RateLimited => FetchResult::RateLimited,
            Retryable::Server(e) => FetchResult::PermanentError(e),
            Retryable::Transport(e) => FetchResult::TransientError(e),
        }
    }
}

/// Issues logical requests: rate limiting, timeout, retry and
/// classification of the HTTP status into a [`FetchResult`].
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            limiter,
            policy,
            cancel,
        }
    }

    /// Runs one logical request to completion.
    ///
    /// Never fails: exhausted retries end in `RateLimited`,
    /// `TransientError` or `PermanentError`, and total time spent
    /// backing off is bounded by the sum of the backoff delays.
    pub async fn execute(&self, endpoint: &str) -> FetchResult {
        let result = self.run_attempts(endpoint).await;
        record_terminal(&result);
        result
    }

    async fn run_attempts(&self, endpoint: &str) -> FetchResult {
        let attempts = self.policy.max_retries.max(1);
        let mut last = Retryable::Transport("no attempt made".to_string());

        for attempt in 0..attempts {
            tokio::select! {
                _ = self.cancel.cancelled() => return FetchResult::Cancelled,
                _ = self.limiter.acquire() => {}
            }

            METRICS.requests_sent.fetch_add(1, Ordering::Relaxed);
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return FetchResult::Cancelled,
                r = timeout(self.policy.request_timeout, self.transport.get(endpoint)) => {
                    r.unwrap_or(Err(TransportError::Timeout))
                }
            };

            last = match response {
                Ok(resp) => match classify(endpoint, resp) {
                    Ok(terminal) => return terminal,
                    Err(retry) => retry,
                },
                Err(e) => {
                    warn!(
                        "{} on {} (attempt {}/{})",
                        e,
                        endpoint,
                        attempt + 1,
                        attempts
                    );
                    Retryable::Transport(e.to_string())
                }
            };

            if attempt + 1 < attempts {
                let wait = self.policy.backoff(attempt);
                if matches!(last, Retryable::RateLimited) {
                    warn!("rate limited on {}, waiting {:?}", endpoint, wait);
                }
                METRICS.retries.fetch_add(1, Ordering::Relaxed);

                tokio::select! {
                    _ = self.cancel.cancelled() => return FetchResult::Cancelled,
                    _ = sleep(wait) => {}
                }
            }
        }

        let terminal = last.into_terminal();
        error!("giving up on {} after {} attempts: {}", endpoint, attempts, terminal);
        terminal
    }
}

/// Maps one HTTP response to either a terminal result or a retry.
fn classify(endpoint: &str, resp: HttpResponse) -> Result<FetchResult, Retryable> {
    match resp.status {
        200 => match serde_json::from_str::<Value>(&resp.body) {
            Ok(body) => Ok(FetchResult::Success(body)),
            Err(e) => {
                error!("unparseable body from {}: {}", endpoint, e);
                Ok(FetchResult::PermanentError(format!("invalid JSON: {e}")))
            }
        },
        404 => {
            warn!("resource not found: {}", endpoint);
            Ok(FetchResult::NotFound)
        }
        403 => {
            warn!("forbidden: {}", endpoint);
            Ok(FetchResult::Forbidden)
        }
        429 => Err(Retryable::RateLimited),
        status => {
            error!("API error {} on {}: {}", status, endpoint, snippet(&resp.body));
            Err(Retryable::Server(format!("HTTP {status}")))
        }
    }
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn record_terminal(result: &FetchResult) {
    let counter = match result {
        FetchResult::Success(_) | FetchResult::Cancelled => return,
        FetchResult::NotFound => &METRICS.not_found,
        FetchResult::Forbidden => &METRICS.forbidden,
        FetchResult::RateLimited => &METRICS.rate_limited,
        FetchResult::TransientError(_) => &METRICS.transient_errors,
        FetchResult::PermanentError(_) => &METRICS.permanent_errors,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}
