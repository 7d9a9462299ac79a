//! Reference HTTP backend
//!
//! Fetches pages with `reqwest` and discovers outgoing links. Requests pass
//! through two gates before hitting the network:
//! - a rate limiter that releases one request slot per minimum interval
//! - a semaphore bounding the number of requests in flight

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{header::CONTENT_TYPE, Client};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};
use url::Url;

use super::criteria::normalize_content_type;
use super::{Backend, BackendError, CrawlOutput, CrawlTarget};

/// HTTP backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    /// Request timeout in seconds, unless the target carries its own
    pub timeout_secs: u64,

    /// User agent header
    pub user_agent: String,

    /// Minimum interval between two requests, in milliseconds
    pub min_request_interval_ms: u64,

    /// Maximum requests in flight
    pub max_concurrent_requests: usize,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("orbweaver/{}", env!("CARGO_PKG_VERSION")),
            min_request_interval_ms: 500,
            max_concurrent_requests: 4,
        }
    }
}

/// Plain HTTP(S) backend
pub struct HttpBackend {
    name: String,
    client: Client,
    config: HttpBackendConfig,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl HttpBackend {
    /// Create a backend
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Construction` if the HTTP client cannot be built
    pub fn new(name: impl Into<String>, config: HttpBackendConfig) -> Result<Self, BackendError> {
        let name = name.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .cookie_store(true)
            .build()
            .map_err(|e| BackendError::Construction {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let interval = Duration::from_millis(config.min_request_interval_ms.max(1));
        let quota = Quota::with_period(interval)
            .ok_or_else(|| BackendError::Construction {
                name: name.clone(),
                reason: "request interval must be positive".to_string(),
            })?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            name,
            client,
            rate_limiter: RateLimiter::direct(quota),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }

    fn classify(&self, url: &str, error: reqwest::Error) -> BackendError {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            BackendError::Transient(format!("{url}: {error}"))
        } else if let Some(status) = error.status() {
            BackendError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else {
            BackendError::Permanent(format!("{url}: {error}"))
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, target), fields(backend = %self.name, url = %target.url))]
    async fn crawl(&self, target: &CrawlTarget) -> Result<CrawlOutput, BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed(self.name.clone()));
        }

        let url = Url::parse(&target.url).map_err(|e| BackendError::InvalidUrl(format!("{}: {e}", target.url)))?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BackendError::Closed(self.name.clone()))?;
        self.rate_limiter.until_ready().await;

        let mut request = self.client.get(url.clone());
        if let Some(timeout) = target.timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.classify(&target.url, e))?;

        let status = response.status();
        let final_url = response.url().clone();
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                url: final_url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let content = response
            .text()
            .await
            .map_err(|e| self.classify(&target.url, e))?;

        let is_html = content_type
            .as_deref()
            .map(|ct| normalize_content_type(ct) == "text/html")
            .unwrap_or(true);
        let links = if is_html {
            extract_links(&final_url, &content)
        } else {
            Vec::new()
        };

        debug!(
            status = status.as_u16(),
            bytes = content.len(),
            links = links.len(),
            "Fetched page"
        );

        Ok(CrawlOutput {
            url: final_url.to_string(),
            status: Some(status.as_u16()),
            content,
            content_type,
            links,
            metadata: Default::default(),
            error: None,
        })
    }

    fn validate(&self, output: &CrawlOutput) -> bool {
        output.error.is_none() && output.status.is_some_and(|s| (200..300).contains(&s))
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        Ok(())
    }
}

/// Absolute http(s) links of `a[href]` elements, deduplicated in page order
fn extract_links(base: &Url, html: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let mut seen = HashSet::new();

    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|link| matches!(link.scheme(), "http" | "https"))
        .map(|mut link| {
            link.set_fragment(None);
            link.to_string()
        })
        .filter(|link| seen.insert(link.clone()))
        .collect()
}
