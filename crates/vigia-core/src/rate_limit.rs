//! Global admission control for portal traffic.
//!
//! A single token bucket gates job claims across all three lanes. Refill is
//! lazy — `tokens = min(max, tokens + elapsed * rate)` computed on each
//! acquisition, no timers. Waiters sleep for the time one token takes to
//! refill, then re-check; the bucket's critical section never spans a
//! suspension point.
//!
//! [`RateLimitedJobStore`] wraps any [`JobStore`]: `next_ready` first takes
//! a token, and refunds it when the queue turns out to be empty so idle
//! polling does not burn portal budget.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{EnqueueRequest, JobState, Lane, ScrapeJob};
use crate::job_store::{JobStore, LaneCounts};

/// Configuration for the global rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window (bucket capacity).
    pub max: u32,
    /// Refill window.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    /// 10 requests per 60 seconds — sized for the portal's tolerance.
    fn default() -> Self {
        Self {
            max: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Tokens per second.
    fn rate(&self) -> f64 {
        f64::from(self.max) / self.window.as_secs_f64()
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token bucket with lazy refill.
#[derive(Clone)]
pub struct TokenBucket {
    config: RateLimitConfig,
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        let state = BucketState {
            tokens: f64::from(config.max),
            last_refill: Instant::now(),
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate-limit mutex");
            poisoned.into_inner()
        })
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        state.last_refill = Instant::now();
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.config.rate()).min(f64::from(self.config.max));
    }

    /// Take one token without waiting. Returns false when the bucket is
    /// empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock_state();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, sleeping until one refills.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.lock_state();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.config.rate())
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Return an unused token (claim found no job). Capped at capacity.
    pub fn refund(&self) {
        let mut state = self.lock_state();
        self.refill(&mut state);
        state.tokens = (state.tokens + 1.0).min(f64::from(self.config.max));
    }

    /// Currently available whole tokens.
    pub fn available(&self) -> u32 {
        let mut state = self.lock_state();
        self.refill(&mut state);
        state.tokens as u32
    }
}

/// A [`JobStore`] wrapper that gates `next_ready` through the shared token
/// bucket. All other operations pass through untouched.
#[derive(Clone)]
pub struct RateLimitedJobStore<S> {
    inner: S,
    bucket: TokenBucket,
}

impl<S: JobStore> RateLimitedJobStore<S> {
    pub fn new(inner: S, bucket: TokenBucket) -> Self {
        Self { inner, bucket }
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }
}

impl<S: JobStore> JobStore for RateLimitedJobStore<S> {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, AppError> {
        self.inner.enqueue(request).await
    }

    async fn next_ready(
        &self,
        worker_id: &str,
        lanes: &[Lane],
    ) -> Result<Option<ScrapeJob>, AppError> {
        self.bucket.acquire().await;
        match self.inner.next_ready(worker_id, lanes).await {
            Ok(Some(job)) => Ok(Some(job)),
            other => {
                // Nothing claimed: the portal was never touched.
                self.bucket.refund();
                other
            }
        }
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), AppError> {
        self.inner.complete(job_id).await
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error_kind: &str,
        error_message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.inner.fail(job_id, error_kind, error_message, retry_at).await
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        self.inner.release_worker_jobs(worker_id).await
    }

    async fn count(&self, lane: Lane, state: JobState) -> Result<i64, AppError> {
        self.inner.count(lane, state).await
    }

    async fn lane_counts(
        &self,
    ) -> Result<std::collections::HashMap<Lane, LaneCounts>, AppError> {
        self.inner.lane_counts().await
    }
}
