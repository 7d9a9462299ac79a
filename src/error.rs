//! Unified error handling for orbweaver
//!
//! Domain errors live next to their modules ([`BackendError`],
//! [`CircuitBreakerError`](crate::utils::CircuitBreakerError)); this module
//! wraps them into a single [`Error`] so callers can branch on the kind of
//! failure instead of matching strings.
//!
//! # Usage
//!
//! ```rust,ignore
//! use orbweaver::error::{Error, ErrorCategory};
//!
//! match manager.add_task(task) {
//!     Err(e) if e.category() == ErrorCategory::Capacity => retry_later(),
//!     Err(e) => return Err(e),
//!     Ok(()) => {}
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::backend::BackendError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Backend crawl failures and open circuits
    Backend,
    /// Queue or registry capacity limits
    Capacity,
    /// Worker and task bookkeeping
    Scheduling,
    /// Configuration and validation errors
    Config,
    /// Everything else
    Other,
}

/// Unified error type for the orbweaver crate
#[derive(Error, Debug)]
pub enum Error {
    /// Backend circuit is open; the call was not attempted
    #[error("Circuit open for backend '{backend}'")]
    CircuitOpen { backend: String },

    /// No registered backend matches the URL
    #[error("No backend available for {url}")]
    NoBackend { url: String },

    /// Task queue is at capacity
    #[error("Task queue is full (limit {limit})")]
    QueueFull { limit: usize },

    /// Worker registry is at capacity
    #[error("Worker limit reached ({limit})")]
    WorkerLimit { limit: usize },

    /// Requested backend name is not registered
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// Worker id is not registered with the manager
    #[error("Worker not registered: {0}")]
    WorkerNotRegistered(String),

    /// Task could not be delivered to its worker
    #[error("Failed to dispatch task {task_id} to worker {worker_id}: {reason}")]
    Dispatch {
        task_id: String,
        worker_id: String,
        reason: String,
    },

    /// Backend-reported failure
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CircuitOpen { .. } | Self::NoBackend { .. } | Self::Backend(_) => {
                ErrorCategory::Backend
            }
            Self::QueueFull { .. } | Self::WorkerLimit { .. } => ErrorCategory::Capacity,
            Self::UnknownBackend(_) | Self::WorkerNotRegistered(_) | Self::Dispatch { .. } => {
                ErrorCategory::Scheduling
            }
            Self::Config(_) | Self::Toml(_) => ErrorCategory::Config,
            Self::Io(_) | Self::Json(_) | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether the caller may retry the same operation later
    ///
    /// A missing backend is terminal for the URL; an open circuit and a full
    /// queue clear up with time.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::CircuitOpen { .. }
            | Self::QueueFull { .. }
            | Self::WorkerLimit { .. }
            | Self::Dispatch { .. } => true,
            Self::Backend(e) => e.is_transient(),
            Self::Io(_) => true,
            Self::NoBackend { .. }
            | Self::UnknownBackend(_)
            | Self::WorkerNotRegistered(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::Toml(_)
            | Self::Other(_) => false,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
