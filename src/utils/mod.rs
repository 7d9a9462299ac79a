//! Resilience utilities shared by workers and backends
//!
//! - [`retry`] - backoff strategies and the retry driver
//! - [`circuit_breaker`] - per-backend failure-state machine

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, Clock, ManualClock,
    SystemClock,
};
pub use retry::{
    BackoffConfig, BackoffStrategy, ConstantDelay, ExponentialBackoff, LinearBackoff,
    RetryWithStrategy,
};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
