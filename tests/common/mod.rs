//! Common test utilities

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use orbweaver::backend::{
    Backend, BackendCriteria, BackendError, BackendRegistry, BackendSource, CrawlOutput,
    CrawlTarget,
};
use orbweaver::config::{Config, DistributedConfig};
use orbweaver::utils::BackoffConfig;

/// Backend that replays scripted outcomes, then succeeds
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Result<(), BackendError>>>,
    links: Vec<String>,
    pub calls: AtomicUsize,
    pub closed: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            links: Vec::new(),
            calls: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn with_links(mut self, links: &[&str]) -> Self {
        self.links = links.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Queue failures returned before the first success
    #[allow(dead_code)]
    pub fn failing_with(self, errors: Vec<BackendError>) -> Self {
        self.script.lock().unwrap().extend(errors.into_iter().map(Err));
        self
    }

    #[allow(dead_code)]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn crawl(&self, target: &CrawlTarget) -> Result<CrawlOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        if let Some(Err(e)) = next {
            return Err(e);
        }

        Ok(CrawlOutput {
            url: target.url.clone(),
            status: Some(200),
            content: format!("<html>{}</html>", target.url),
            content_type: Some("text/html".to_string()),
            links: self.links.clone(),
            ..Default::default()
        })
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry holding one backend under `criteria`
#[allow(dead_code)]
pub fn registry_with(backend: Arc<ScriptedBackend>, criteria: BackendCriteria) -> Arc<BackendRegistry> {
    let registry = Arc::new(BackendRegistry::new());
    let name = backend.name().to_string();
    registry
        .register_backend(&name, BackendSource::Instance(backend), Some(criteria))
        .unwrap();
    registry
}

/// Config tuned for fast in-process tests
#[allow(dead_code)]
pub fn fast_config(workers: usize) -> Config {
    let mut config = Config::default();
    config.worker.workers = workers;
    config.distributed = DistributedConfig::builder()
        .assignment_poll_interval_ms(5)
        .enable_metrics(false)
        .build()
        .unwrap();
    config.backoff = BackoffConfig::Constant { delay_ms: 1 };
    config
}
