use crate::config::RetryPolicy;
use crate::error::{AppError, ErrorKind};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;

/// Wraps `op` with exponential backoff plus jitter, per spec.md §4.7.1.
/// Only kinds flagged `retryable()` are retried; everything else returns
/// on the first attempt.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(policy.initial_delay_ms))
        .with_max_delay(Duration::from_millis(policy.max_delay_ms))
        .with_max_times(policy.max_attempts.saturating_sub(1) as usize)
        .with_jitter();

    op.retry(&backoff)
        .when(|e: &AppError| e.kind.retryable())
        .await
}

/// Same as [`with_retry`] but forces retryability regardless of kind,
/// used for call sites (like origin fallthrough) that already decided
/// the operation is worth retrying (spec.md §4.2.3).
pub async fn with_retry_always<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(policy.initial_delay_ms))
        .with_max_delay(Duration::from_millis(policy.max_delay_ms))
        .with_max_times(policy.max_attempts.saturating_sub(1) as usize)
        .with_jitter();

    op.retry(&backoff).await
}

pub fn unretryable_kind_short_circuits() -> AppError {
    AppError::new(ErrorKind::InvalidRequest, "not retried")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success_within_max_attempts() {
        let policy = RetryPolicy { max_attempts: 3, initial_delay_ms: 1, max_delay_ms: 5 };
        let attempts = AtomicU32::new(0);
        let result = with_retry(&policy, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(AppError::new(ErrorKind::OriginFetchFailed, "down"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_kind_fails_on_first_attempt() {
        let policy = RetryPolicy { max_attempts: 5, initial_delay_ms: 1, max_delay_ms: 5 };
        let attempts = AtomicU32::new(0);
        let result: Result<(), AppError> = with_retry(&policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(unretryable_kind_short_circuits())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_returns_last_error() {
        let policy = RetryPolicy { max_attempts: 2, initial_delay_ms: 1, max_delay_ms: 5 };
        let attempts = AtomicU32::new(0);
        let result: Result<(), AppError> = with_retry(&policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(AppError::new(ErrorKind::Timeout, "still down"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
