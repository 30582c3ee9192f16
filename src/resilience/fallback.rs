use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding failure log gating fallback activation (spec.md §4.7.3): a
/// dependency only starts serving its fallback once at least `min_failures`
/// failures landed within the trailing `window`.
pub struct FailureLog {
    entries: Mutex<VecDeque<Instant>>,
    window: Duration,
    min_failures: usize,
}

impl FailureLog {
    pub fn new(window: Duration, min_failures: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            window,
            min_failures,
        }
    }

    pub fn record_failure(&self) {
        let mut entries = self.entries.lock();
        entries.push_back(Instant::now());
        self.trim(&mut entries);
    }

    pub fn record_success(&self) {
        // A success does not clear history; the window naturally ages
        // old failures out (spec.md §4.7.3).
        let mut entries = self.entries.lock();
        self.trim(&mut entries);
    }

    fn trim(&self, entries: &mut VecDeque<Instant>) {
        let now = Instant::now();
        while let Some(front) = entries.front() {
            if now.duration_since(*front) > self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn should_fallback(&self) -> bool {
        let mut entries = self.entries.lock();
        self.trim(&mut entries);
        entries.len() >= self.min_failures
    }
}

/// Runs `primary`, unless the failure log already shows the dependency
/// unhealthy (spec.md §4.7 "if the sliding failure window already
/// contains >=5 entries, skip primary and call fallback directly") —
/// in which case `primary` is never polled at all. Otherwise tries
/// `primary`, and on failure records the error and falls back.
pub async fn execute_with_fallback<T, P, F>(log: &FailureLog, primary: P, fallback: F) -> T
where
    P: std::future::Future<Output = Result<T, crate::error::AppError>>,
    F: std::future::Future<Output = T>,
{
    if log.should_fallback() {
        return fallback.await;
    }
    match primary.await {
        Ok(v) => {
            log.record_success();
            v
        }
        Err(_) => {
            log.record_failure();
            fallback.await
        }
    }
}
