//! Token bucket admission control for outbound API requests.
//!
//! The bucket is refilled lazily on every acquisition attempt; there is
//! no background timer. Refill and decrement happen under one lock.
//!
//! Fairness is not guaranteed: waiters re-poll on a fixed interval and
//! whichever wakes first after a refill takes the token.

use std::sync::atomic::Ordering;

use log::debug;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};

use crate::config::RateLimitConfig;
use crate::metrics::METRICS;

/// Tolerance for float drift when comparing against a whole token.
const EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct TokenBucketState {
    capacity: f64,
    /// Invariant: 0 <= tokens <= capacity
    tokens: f64,
    seconds_per_token: f64,
    last_refill: Instant,
}

impl TokenBucketState {
    fn new(capacity: u32, seconds_per_token: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            seconds_per_token,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed / self.seconds_per_token).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens + EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }
}

/// Shared by every fetch path; wrap in `Arc` and pass it to the executor.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<TokenBucketState>,
    poll_interval: Duration,
}

impl RateLimiter {
    pub fn new(capacity: u32, seconds_per_token: f64, poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(TokenBucketState::new(
                capacity.max(1),
                seconds_per_token,
                Instant::now(),
            )),
            poll_interval,
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(
            cfg.capacity,
            cfg.seconds_per_token,
            Duration::from_millis(cfg.poll_interval_ms),
        )
    }

    /// Waits until a token is available and takes it.
    ///
    /// Returns `true` if the caller had to wait at least once.
    /// The lock is never held across the sleep, so dropping this
    /// future mid-wait leaves the bucket consistent.
    pub async fn acquire(&self) -> bool {
        let mut waited = false;

        loop {
            {
                let mut state = self.state.lock().await;
                if state.try_take(Instant::now()) {
                    return waited;
                }
            }

            if !waited {
                debug!("rate limiter: bucket empty, polling every {:?}", self.poll_interval);
                METRICS.limiter_waits.fetch_add(1, Ordering::Relaxed);
            }
            waited = true;
            sleep(self.poll_interval).await;
        }
    }

    /// Current token count after a lazy refill.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(Instant::now());
        state.tokens
    }
}
