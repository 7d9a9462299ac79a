//! Per-backend circuit breaker
//!
//! ```text
//! Closed    --(failure_threshold consecutive failures)--> Open
//! Open      --(reset_timeout elapsed, seen by is_open)--> HalfOpen
//! HalfOpen  --(half_open_max_calls successes)----------> Closed
//! HalfOpen  --(any failure)-----------------------------> Open
//! ```
//!
//! The time-based `Open -> HalfOpen` transition happens lazily inside
//! [`CircuitBreaker::is_open`], so callers must consult it before every
//! guarded call. [`CircuitBreaker::execute`] and
//! [`CircuitBreaker::execute_async`] do that for you.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// Circuit State
// ============================================================================

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// Trial calls pass through until the circuit closes or re-opens
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Source of monotonic time for the breaker
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock, used to drive breakers in tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before probing
    pub reset_timeout_secs: u64,

    /// Successful trial calls required to close a half-open circuit
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error returned by a guarded call
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit was open; the operation was not invoked
    Open { name: String },

    /// The operation ran and failed with its own error
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without running
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The operation's own error, if it ran
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { name } => write!(f, "Circuit '{name}' is open"),
            Self::Operation(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { .. } => None,
            Self::Operation(e) => Some(e),
        }
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Callback fired on every state transition: `(breaker name, from, to)`
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
}

type Transition = (CircuitState, CircuitState);

/// Failure-state machine protecting one backend
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
    on_state_change: Option<StateChangeCallback>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker using the system clock
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            clock: Arc::new(SystemClock),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_successes: 0,
                last_failure: None,
            }),
            on_state_change: None,
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a callback fired on every transition
    pub fn with_state_change_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without the lazy time check
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures counted while closed
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Whether calls must be rejected right now
    ///
    /// Moves an open circuit to half-open once `reset_timeout` has elapsed
    /// since the last failure.
    pub fn is_open(&self) -> bool {
        let (open, transition) = {
            let mut inner = self.lock();
            let mut transition = None;

            if inner.state == CircuitState::Open {
                let elapsed = inner
                    .last_failure
                    .map(|at| self.clock.now().saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);

                if elapsed >= self.config.reset_timeout() {
                    transition = Some(Self::transition(&mut inner, CircuitState::HalfOpen));
                }
            }

            (inner.state == CircuitState::Open, transition)
        };

        self.notify(transition);
        open
    }

    /// Record a successful guarded call
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_max_calls.max(1) {
                        Some(Self::transition(&mut inner, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };

        self.notify(transition);
    }

    /// Record a failed guarded call
    pub fn record_failure(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.last_failure = Some(self.clock.now());

            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        Some(Self::transition(&mut inner, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => Some(Self::transition(&mut inner, CircuitState::Open)),
                CircuitState::Open => None,
            }
        };

        self.notify(transition);
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.last_failure = None;
            if inner.state == CircuitState::Closed {
                inner.failure_count = 0;
                None
            } else {
                Some(Self::transition(&mut inner, CircuitState::Closed))
            }
        };

        self.notify(transition);
    }

    /// Run a synchronous operation through the breaker
    pub fn execute<T, E, F>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if self.is_open() {
            return Err(self.open_error());
        }

        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(e))
            }
        }
    }

    /// Run an asynchronous operation through the breaker
    ///
    /// A trip that happens while the operation is in flight does not cancel
    /// it; it only affects the next call.
    pub async fn execute_async<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.is_open() {
            return Err(self.open_error());
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(e))
            }
        }
    }

    fn open_error<E>(&self) -> CircuitBreakerError<E> {
        debug!(breaker = %self.name, "Circuit open, failing fast");
        CircuitBreakerError::Open {
            name: self.name.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a transition and reset the counters belonging to the new state
    fn transition(inner: &mut BreakerState, to: CircuitState) -> Transition {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::HalfOpen => inner.half_open_successes = 0,
            CircuitState::Open => inner.half_open_successes = 0,
        }
        (from, to)
    }

    /// Log the transition and fire the callback outside the lock
    fn notify(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };

        if to == CircuitState::Open {
            warn!(breaker = %self.name, from = %from, to = %to, "Circuit breaker tripped");
        } else {
            info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed");
        }

        if let Some(callback) = &self.on_state_change {
            let result = catch_unwind(AssertUnwindSafe(|| callback(&self.name, from, to)));
            if result.is_err() {
                warn!(breaker = %self.name, "State change callback panicked; ignoring");
            }
        }
    }
}
