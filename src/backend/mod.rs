//! Crawl backends and backend selection
//!
//! A backend is anything that can turn a URL into a [`CrawlOutput`]: a plain
//! HTTP client, a headless browser, an API adapter. The orchestration core only
//! sees the [`Backend`] trait and never inspects payloads beyond their size,
//! links and error fields.
//!
//! - [`criteria`] - declarative matching rules attached to a registration
//! - [`registry`] - name-keyed registry with lazy instantiation
//! - [`selector`] - deterministic best-fit selection for a URL
//! - [`http`] - reference backend over `reqwest`

pub mod criteria;
pub mod http;
pub mod registry;
pub mod selector;

pub use criteria::BackendCriteria;
pub use http::{HttpBackend, HttpBackendConfig};
pub use registry::{BackendFactory, BackendRegistry, BackendSource, BackendSummary};
pub use selector::BackendSelector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::models::WorkerTask;

// ============================================================================
// Backend Errors
// ============================================================================

/// Errors raised by backends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// URL could not be parsed or is not supported
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Network-level failure that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// Failure that will not go away by retrying
    #[error("{0}")]
    Permanent(String),

    /// Unexpected HTTP status
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// Backend was closed and no longer accepts work
    #[error("Backend '{0}' is closed")]
    Closed(String),

    /// Factory failed to construct the backend
    #[error("Failed to construct backend '{name}': {reason}")]
    Construction { name: String, reason: String },
}

impl BackendError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Crawl Input / Output
// ============================================================================

/// What a backend is asked to crawl
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlTarget {
    /// URL to fetch
    pub url: String,

    /// Remaining depth (1 = this page only)
    pub max_depth: u32,

    /// Expected content type, if known
    pub content_type: Option<String>,

    /// Per-request timeout hint
    #[serde(skip)]
    pub timeout: Option<Duration>,

    /// Free-form task metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CrawlTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_depth: 1,
            ..Default::default()
        }
    }

    /// Build the target for a worker task
    pub fn from_task(task: &WorkerTask, timeout: Option<Duration>) -> Self {
        Self {
            url: task.url.clone(),
            max_depth: task.max_depth,
            content_type: task
                .metadata
                .get("content_type")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            timeout,
            metadata: task.metadata.clone(),
        }
    }
}

/// Raw result of a crawl
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlOutput {
    /// Final URL (after redirects)
    pub url: String,

    /// Transport status code, when the backend has one
    pub status: Option<u16>,

    /// Page body
    pub content: String,

    /// Content type reported by the source
    pub content_type: Option<String>,

    /// Absolute URLs discovered on the page
    #[serde(default)]
    pub links: Vec<String>,

    /// Backend-specific metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Soft error reported alongside content
    pub error: Option<String>,
}

impl CrawlOutput {
    /// Size of the body in bytes
    pub fn content_size(&self) -> usize {
        self.content.len()
    }
}

/// Processed output handed to a [`DocumentProcessor`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    pub content: String,
    pub content_type: Option<String>,
    pub links: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub crawled_at: DateTime<Utc>,
}

impl From<CrawlOutput> for Document {
    fn from(output: CrawlOutput) -> Self {
        Self {
            url: output.url,
            content: output.content,
            content_type: output.content_type,
            links: output.links,
            metadata: output.metadata,
            crawled_at: Utc::now(),
        }
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// A crawl backend
///
/// Concrete backends are registered by name in a [`BackendRegistry`] and
/// chosen per URL by a [`BackendSelector`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Fetch the target
    async fn crawl(&self, target: &CrawlTarget) -> Result<CrawlOutput, BackendError>;

    /// Check that an output is usable
    fn validate(&self, output: &CrawlOutput) -> bool {
        output.error.is_none()
    }

    /// Turn a validated output into a document
    fn process(&self, output: CrawlOutput) -> Document {
        Document::from(output)
    }

    /// Release resources; called once when the backend is unregistered or
    /// its worker shuts down
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Consumer of crawled documents (indexing, storage, ...)
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    async fn process(&self, task: &WorkerTask, document: Document) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Transient("reset".into()).is_transient());
        assert!(BackendError::Status {
            status: 503,
            url: "https://a.test/".into()
        }
        .is_transient());
        assert!(BackendError::Status {
            status: 429,
            url: "https://a.test/".into()
        }
        .is_transient());
        assert!(!BackendError::Status {
            status: 404,
            url: "https://a.test/".into()
        }
        .is_transient());
        assert!(!BackendError::Permanent("bad".into()).is_transient());
    }

    #[test]
    fn test_target_reads_content_type_hint() {
        let mut task = WorkerTask::new("https://a.test/feed", 1);
        task.metadata
            .insert("content_type".into(), serde_json::json!("application/xml"));

        let target = CrawlTarget::from_task(&task, Some(Duration::from_secs(5)));
        assert_eq!(target.content_type.as_deref(), Some("application/xml"));
        assert_eq!(target.timeout, Some(Duration::from_secs(5)));
    }
}
