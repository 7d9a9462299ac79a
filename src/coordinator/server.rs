//! Coordinator HTTP server
//!
//! Wraps the API router with the optional CORS and request-tracing layers
//! and serves it until a shutdown future resolves.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiConfig;
use crate::distributed::DistributedCrawlManager;

use super::api::create_router;

// ============================================================================
// App State
// ============================================================================

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DistributedCrawlManager>,

    /// When the server was created; reported as uptime by `/api/health`
    pub start_time: Instant,

    pub config: ApiConfig,
}

// ============================================================================
// Server
// ============================================================================

/// HTTP front end for one crawl manager
pub struct CoordinatorServer {
    state: AppState,
}

impl CoordinatorServer {
    pub fn new(manager: Arc<DistributedCrawlManager>, config: ApiConfig) -> Self {
        Self {
            state: AppState {
                manager,
                start_time: Instant::now(),
                config,
            },
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }

    /// API routes plus the layers enabled in [`ApiConfig`]
    pub fn build_router(&self) -> Router {
        let config = &self.state.config;
        let mut router = create_router(self.state());

        if config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }
        if config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn start_with_shutdown<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.bind_address();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                reason: e.to_string(),
            })?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr().ok();
        info!(address = ?local, "Coordinator API listening");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))?;

        info!("Coordinator API stopped");
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("Server error: {0}")]
    Serve(String),
}
