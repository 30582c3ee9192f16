//! Retry, circuit-breaking and fallback primitives composed around the
//! storage fetcher and the persistent cache (spec.md §4.7).

pub mod breaker;
pub mod fallback;
pub mod retry;

pub use breaker::CircuitBreaker;
pub use fallback::FailureLog;
