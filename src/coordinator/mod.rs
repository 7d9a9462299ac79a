//! HTTP coordinator over a crawl manager
//!
//! # Endpoints
//!
//! ```text
//! GET    /api/health             liveness and uptime
//! GET    /api/status             ManagerStatus snapshot
//! GET    /api/workers            registered workers
//! POST   /api/workers/register   register a remote worker
//! POST   /api/workers/heartbeat  heartbeat; returns assigned tasks
//! DELETE /api/workers/{id}       unregister (requeues its tasks)
//! POST   /api/tasks              submit a task
//! POST   /api/tasks/complete     report a TaskResult
//! GET    /api/tasks/{id}         finished task result
//! GET    /metrics                Prometheus text format
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use orbweaver::coordinator::CoordinatorServer;
//!
//! let server = CoordinatorServer::new(manager, config.api.clone());
//! server.start_with_shutdown(shutdown_signal()).await?;
//! ```

pub mod api;
pub mod server;

pub use server::{AppState, CoordinatorServer, ServerError};
