use crate::config::BreakerSettings;
use crate::error::{AppError, ErrorKind};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Per-dependency circuit breaker (spec.md §3 "CircuitBreaker", §4.7.2).
/// `closed` passes everything through; after `failure_threshold`
/// consecutive failures it trips to `open` and short-circuits for
/// `reset_timeout_secs`; it then allows one probe in `half_open` and
/// needs `success_threshold` consecutive successes to close again, or a
/// single failure sends it back to `open`.
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Returns true if a call should be allowed through right now. Moves
    /// `open` -> `half_open` once the reset timeout has elapsed.
    fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => true,
            State::HalfOpen => true,
            State::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= Duration::from_secs(self.settings.reset_timeout_secs) {
                    inner.state = State::HalfOpen;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures = 0;
            }
            State::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.settings.success_threshold {
                    inner.state = State::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                }
            }
            State::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
            }
            State::Open => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, State::Open)
    }

    /// Runs `op` through the breaker, recording the outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, AppError>>,
    {
        if !self.allow() {
            return Err(AppError::new(ErrorKind::CircuitOpen, "circuit breaker open"));
        }
        match op().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings { failure_threshold: 3, success_threshold: 2, reset_timeout_secs: 0 }
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(settings());
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>(AppError::internal("boom")) }).await;
        }
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::new(settings());
        let _ = breaker.call(|| async { Err::<(), _>(AppError::internal("boom")) }).await;
        let _ = breaker.call(|| async { Ok::<_, AppError>(()) }).await;
        let _ = breaker.call(|| async { Err::<(), _>(AppError::internal("boom")) }).await;
        let _ = breaker.call(|| async { Err::<(), _>(AppError::internal("boom")) }).await;
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(settings());
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>(AppError::internal("boom")) }).await;
        }
        assert!(breaker.is_open());
        // reset_timeout_secs is 0, so the very next call probes half-open.
        let _ = breaker.call(|| async { Ok::<_, AppError>(()) }).await;
        let _ = breaker.call(|| async { Ok::<_, AppError>(()) }).await;
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(settings());
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>(AppError::internal("boom")) }).await;
        }
        let _ = breaker.call(|| async { Err::<(), _>(AppError::internal("boom")) }).await;
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_op() {
        let settings = BreakerSettings { failure_threshold: 1, success_threshold: 1, reset_timeout_secs: 3600 };
        let breaker = CircuitBreaker::new(settings);
        let _ = breaker.call(|| async { Err::<(), _>(AppError::internal("boom")) }).await;
        assert!(breaker.is_open());
        let called = std::sync::atomic::AtomicBool::new(false);
        let result = breaker
            .call(|| async {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await;
        assert!(result.is_err());
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }
}
