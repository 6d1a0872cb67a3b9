//! Circuit breaker protecting the portal.
//!
//! When the portal is down or actively blocking us, hammering it with the
//! full worker fleet only makes things worse. Consecutive portal-level
//! failures open the circuit; while open, jobs fail fast with a retryable
//! error and the queue's backoff spaces out the pressure.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// Limited requests allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Successful probes in half-open state to close the circuit.
    pub success_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub recovery_timeout: Duration,

    /// When the portal flags us as a bot, multiply the recovery timeout by
    /// this factor — probing again quickly just extends the block.
    pub bot_backoff_multiplier: f32,

    /// Maximum recovery timeout after repeated bot detections.
    pub max_recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            bot_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(900),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_error_message: Option<String>,
    current_recovery_timeout: Duration,
}

impl BreakerInner {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_error_message: None,
            current_recovery_timeout: config.recovery_timeout,
        }
    }
}

/// Error type for breaker-wrapped operations.
#[derive(Debug)]
pub enum BreakerError {
    /// Circuit is open — the portal was not touched.
    Open { retry_after: Duration },
    /// The inner operation failed.
    Inner(AppError),
}

impl std::fmt::Display for BreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open { retry_after } => {
                write!(
                    f,
                    "Portal circuit open. Retry after {} seconds.",
                    retry_after.as_secs()
                )
            }
            BreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BreakerError {}

/// Thread-safe circuit breaker guarding all portal traffic.
#[derive(Clone)]
pub struct PortalBreaker {
    config: BreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl PortalBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let inner = BreakerInner::new(&config);
        Self {
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned breaker mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Executes the given operation through the circuit breaker.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        {
            let mut inner = self.lock_inner();
            self.maybe_transition_to_half_open(&mut inner);

            if inner.state == CircuitState::Open {
                let retry_after = inner
                    .last_failure_time
                    .map(|t| {
                        inner
                            .current_recovery_timeout
                            .saturating_sub(t.elapsed())
                    })
                    .unwrap_or(inner.current_recovery_timeout);

                return Err(BreakerError::Open { retry_after });
            }
        }

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) => {
                if e.should_trip_circuit() {
                    self.record_failure(e);
                }
            }
        }

        result.map_err(BreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        "Portal circuit closing after {} successful probes",
                        inner.success_count
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_error_message = None;
                    inner.current_recovery_timeout = self.config.recovery_timeout;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();

        let is_bot_block = matches!(error, AppError::BotDetected);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                inner.last_error_message = Some(error.to_string());

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.failure_count,
                        error = %error,
                        "Portal circuit opening"
                    );
                    inner.state = CircuitState::Open;

                    if is_bot_block {
                        self.extend_recovery(&mut inner);
                    }
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    error = %error,
                    "Portal circuit probe failed, returning to open state"
                );
                inner.state = CircuitState::Open;
                inner.last_failure_time = Some(Instant::now());
                inner.last_error_message = Some(error.to_string());
                inner.success_count = 0;

                if is_bot_block {
                    self.extend_recovery(&mut inner);
                }
            }
            CircuitState::Open => {
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    fn extend_recovery(&self, inner: &mut BreakerInner) {
        inner.current_recovery_timeout = std::cmp::min(
            Duration::from_secs_f32(
                inner.current_recovery_timeout.as_secs_f32()
                    * self.config.bot_backoff_multiplier,
            ),
            self.config.max_recovery_timeout,
        );
        tracing::info!(
            recovery_timeout_secs = inner.current_recovery_timeout.as_secs(),
            "Extended recovery timeout after bot detection"
        );
    }

    fn maybe_transition_to_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(last_failure) = inner.last_failure_time {
                if last_failure.elapsed() >= inner.current_recovery_timeout {
                    tracing::info!("Portal circuit transitioning to half-open state");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_starts_closed() {
        let cb = PortalBreaker::new(BreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn circuit_opens_after_threshold_failures() {
        let config = BreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let cb = PortalBreaker::new(config);

        for _ in 0..3 {
            cb.record_failure(&AppError::PortalUnreachable("503".into()));
        }

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let config = BreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        };
        let cb = PortalBreaker::new(config);

        for _ in 0..4 {
            cb.record_failure(&AppError::Timeout(30));
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure(&AppError::Timeout(30));
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn circuit_transitions_to_half_open() {
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let cb = PortalBreaker::new(config);

        cb.record_failure(&AppError::PortalUnreachable("down".into()));
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_on_success() {
        let config = BreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            recovery_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        let cb = PortalBreaker::new(config);

        cb.record_failure(&AppError::Timeout(30));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_failure() {
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        let cb = PortalBreaker::new(config);

        cb.record_failure(&AppError::Timeout(30));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(&AppError::Timeout(30));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn bot_detection_extends_recovery_timeout() {
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            bot_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(900),
            ..Default::default()
        };
        let cb = PortalBreaker::new(config);

        cb.record_failure(&AppError::BotDetected);

        // Still open well past the base timeout's halfway point: the
        // effective timeout doubled to 120s.
        let inner = cb.lock_inner();
        assert_eq!(inner.current_recovery_timeout, Duration::from_secs(120));
    }

    #[test]
    fn bot_backoff_capped_at_max() {
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(600),
            bot_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(900),
            ..Default::default()
        };
        let cb = PortalBreaker::new(config);

        cb.record_failure(&AppError::BotDetected);

        let inner = cb.lock_inner();
        assert_eq!(inner.current_recovery_timeout, Duration::from_secs(900));
    }

    #[tokio::test]
    async fn call_returns_open_error_when_circuit_open() {
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let cb = PortalBreaker::new(config);
        cb.record_failure(&AppError::PortalUnreachable("down".into()));

        let result = cb
            .call(|| async { Ok::<_, AppError>("should not execute".to_string()) })
            .await;

        assert!(matches!(result, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn call_executes_when_closed() {
        let cb = PortalBreaker::new(BreakerConfig::default());

        let result = cb
            .call(|| async { Ok::<_, AppError>("ok".to_string()) })
            .await;

        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn non_portal_errors_do_not_trip() {
        let config = BreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let cb = PortalBreaker::new(config);

        let _ = cb
            .call(|| async { Err::<(), _>(AppError::DatabaseError("down".into())) })
            .await;

        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
