//! orbweaver - distributed crawl orchestration
//!
//! Routes URLs to pluggable crawl backends and schedules the resulting work
//! across a pool of workers.
//!
//! # Architecture
//!
//! - [`backend`] - backend trait, registry, best-fit selection, HTTP backend
//! - [`distributed`] - crawl manager, workers and the in-process cluster
//! - [`coordinator`] - HTTP API over a manager
//! - [`utils`] - circuit breaker and retry/backoff strategies
//! - [`models`] - tasks, results, heartbeats, status
//! - [`config`] - configuration from environment or TOML
//! - [`metrics`] - Prometheus metrics
//! - [`error`] - unified error type
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use orbweaver::backend::{BackendCriteria, BackendRegistry, BackendSource, HttpBackend};
//! use orbweaver::config::Config;
//! use orbweaver::distributed::LocalCluster;
//! use orbweaver::models::WorkerTask;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let registry = Arc::new(BackendRegistry::new());
//!     registry.register_backend(
//!         "http",
//!         BackendSource::Instance(Arc::new(HttpBackend::new("http", config.http.clone())?)),
//!         Some(BackendCriteria::new()),
//!     )?;
//!
//!     let cluster = LocalCluster::start(&config, registry, None)?;
//!     cluster.submit(WorkerTask::new("https://example.com/", 2))?;
//!     cluster.wait_until_idle(std::time::Duration::from_millis(200), None).await;
//!     let status = cluster.shutdown().await;
//!     println!("{} tasks completed", status.completed_tasks);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod distributed;
pub mod error;
pub mod metrics;
pub mod models;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{
        Backend, BackendCriteria, BackendError, BackendRegistry, BackendSelector, BackendSource,
        CrawlOutput, CrawlTarget, Document, DocumentProcessor,
    };
    pub use crate::config::{Config, DistributedConfig};
    pub use crate::distributed::{
        CrawlWorker, Delivery, DistributedCrawlManager, LocalCluster, TaskDispatcher,
    };
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{
        ManagerStatus, TaskResult, TaskStatus, WorkerHeartbeat, WorkerInfo, WorkerStatus,
        WorkerTask,
    };
    pub use crate::utils::{
        BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryWithStrategy,
    };
}
