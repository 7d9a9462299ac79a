//! Crawl worker
//!
//! A worker turns one [`WorkerTask`] at a time into a [`TaskResult`]:
//!
//! 1. resolve a backend (explicit name first, selector otherwise)
//! 2. crawl through that backend's circuit breaker, retrying transient errors
//! 3. validate and process the output, hand it to the document processor
//! 4. synthesize child tasks for discovered links while depth remains
//!
//! Errors never escape [`CrawlWorker::process_task`]; they become failed
//! results carrying the error message.

use chrono::Utc;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    Backend, BackendError, BackendRegistry, BackendSelector, CrawlTarget, DocumentProcessor,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{TaskResult, WorkerHeartbeat, WorkerStatus, WorkerTask};
use crate::utils::{
    lock, BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    RetryWithStrategy,
};

/// Shortest heartbeat period a worker accepts
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Receives the worker's heartbeats
pub type HeartbeatCallback = Arc<dyn Fn(WorkerHeartbeat) + Send + Sync>;

/// Executes crawl tasks against the registered backends
pub struct CrawlWorker {
    worker_id: String,
    registry: Arc<BackendRegistry>,
    selector: BackendSelector,

    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    retry: RetryWithStrategy,

    /// Forwarded to backends as the per-request timeout
    task_timeout: Option<Duration>,
    heartbeat_interval: Duration,

    /// Whether shutdown closes the registry's backends
    owns_registry: bool,

    processor: Option<Arc<dyn DocumentProcessor>>,
    heartbeat_callback: Option<HeartbeatCallback>,

    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    active_tasks: AtomicUsize,
    current_task: Mutex<Option<String>>,

    shutdown_tx: watch::Sender<bool>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CrawlWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlWorker")
            .field("worker_id", &self.worker_id)
            .field("retry", &self.retry)
            .field("task_timeout", &self.task_timeout)
            .finish_non_exhaustive()
    }
}

impl CrawlWorker {
    /// Create a worker with default resilience settings
    pub fn new(worker_id: impl Into<String>, registry: Arc<BackendRegistry>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            worker_id: worker_id.into(),
            selector: BackendSelector::new(Arc::clone(&registry)),
            registry,
            breaker_config: CircuitBreakerConfig::default(),
            breakers: Mutex::new(HashMap::new()),
            retry: RetryWithStrategy::new(BackoffConfig::default().build(), 3),
            task_timeout: None,
            heartbeat_interval: Duration::from_secs(30),
            owns_registry: true,
            processor: None,
            heartbeat_callback: None,
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            active_tasks: AtomicUsize::new(0),
            current_task: Mutex::new(None),
            shutdown_tx,
            heartbeat_handle: Mutex::new(None),
        }
    }

    /// Create a worker from the application config
    pub fn from_config(
        worker_id: impl Into<String>,
        registry: Arc<BackendRegistry>,
        config: &Config,
    ) -> Self {
        Self::new(worker_id, registry)
            .with_circuit_breaker_config(config.circuit_breaker.clone())
            .with_retry(RetryWithStrategy::new(
                config.backoff.build(),
                config.distributed.retry_count,
            ))
            .with_task_timeout(config.distributed.task_timeout())
            .with_heartbeat_interval(config.distributed.heartbeat_interval())
    }

    pub fn with_circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryWithStrategy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Clamped to [`MIN_HEARTBEAT_INTERVAL`]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    /// Leave the registry's backends open on shutdown; whoever shares the
    /// registry closes them
    pub fn with_shared_registry(mut self) -> Self {
        self.owns_registry = false;
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn DocumentProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_heartbeat_callback(mut self, callback: HeartbeatCallback) -> Self {
        self.heartbeat_callback = Some(callback);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::Relaxed)
    }

    /// Circuit breaker guarding `backend` on this worker
    pub fn circuit_breaker(&self, backend: &str) -> Arc<CircuitBreaker> {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(backend.to_string()).or_insert_with(|| {
            let callback = Arc::new(|name: &str, from: CircuitState, to: CircuitState| {
                debug!(backend = %name, from = %from, to = %to, "Circuit transition");
                metrics::record_circuit_transition(name, to);
            });
            Arc::new(
                CircuitBreaker::new(backend, self.breaker_config.clone())
                    .with_state_change_callback(callback),
            )
        });
        Arc::clone(breaker)
    }

    /// Backends whose circuit is currently open
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = lock(&self.breakers)
            .iter()
            .filter(|(_, breaker)| breaker.state() == CircuitState::Open)
            .map(|(name, _)| name.clone())
            .collect();
        open.sort();
        open
    }

    // ------------------------------------------------------------------------
    // Task processing
    // ------------------------------------------------------------------------

    /// Process one task; failures are reported in the result
    #[instrument(skip(self, task), fields(worker_id = %self.worker_id, task_id = %task.task_id))]
    pub async fn process_task(&self, task: WorkerTask) -> TaskResult {
        let started_at = Utc::now();
        let timer = Instant::now();
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        *lock(&self.current_task) = Some(task.task_id.clone());

        let mut backend_name = None;
        let outcome = self.run_task(&task, started_at, &mut backend_name).await;

        *lock(&self.current_task) = None;
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);

        let elapsed = timer.elapsed().as_secs_f64();
        let label = backend_name.as_deref().unwrap_or("none");

        match outcome {
            Ok(result) => {
                self.tasks_completed.fetch_add(1, Ordering::Relaxed);
                metrics::record_crawl(label, true, elapsed);
                info!(
                    url = %task.url,
                    backend = %label,
                    bytes = result.content_size,
                    links = result.links_found,
                    children = result.child_tasks.len(),
                    "Task processed"
                );
                result
            }
            Err(e) => {
                self.tasks_failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_crawl(label, false, elapsed);
                warn!(url = %task.url, backend = %label, error = %e, "Task failed");

                let mut result = TaskResult::failure(&task, &self.worker_id, started_at, e.to_string());
                result.backend_name = backend_name;
                result
            }
        }
    }

    async fn run_task(
        &self,
        task: &WorkerTask,
        started_at: chrono::DateTime<Utc>,
        backend_name: &mut Option<String>,
    ) -> Result<TaskResult> {
        let target = CrawlTarget::from_task(task, self.task_timeout);
        let backend = self.resolve_backend(task, target.content_type.as_deref())?;
        let name = backend.name().to_string();
        *backend_name = Some(name.clone());

        let breaker = self.circuit_breaker(&name);
        let output = self
            .retry
            .run_if(
                || {
                    let breaker = &breaker;
                    let backend = &backend;
                    let target = &target;
                    async move { breaker.execute_async(|| backend.crawl(target)).await }
                },
                |e: &CircuitBreakerError<BackendError>| match e {
                    CircuitBreakerError::Operation(inner) => inner.is_transient(),
                    CircuitBreakerError::Open { .. } => false,
                },
            )
            .await
            .map_err(|e| match e {
                CircuitBreakerError::Open { .. } => Error::CircuitOpen {
                    backend: name.clone(),
                },
                CircuitBreakerError::Operation(inner) => Error::Backend(inner),
            })?;

        if !backend.validate(&output) {
            let reason = output
                .error
                .clone()
                .unwrap_or_else(|| format!("validation failed for {}", task.url));
            return Err(Error::Backend(BackendError::Permanent(reason)));
        }

        let content_size = output.content_size();
        let links = output.links.clone();
        let status = output.status;
        let document = backend.process(output);

        if let Some(processor) = &self.processor {
            processor
                .process(task, document)
                .await
                .map_err(|e| Error::other(format!("document processing failed: {e}")))?;
        }

        let mut result = TaskResult::success(task, &self.worker_id, started_at);
        result.backend_name = Some(name);
        result.content_size = content_size;
        result.links_found = links.len();
        if let Some(status) = status {
            result
                .metadata
                .insert("status".to_string(), serde_json::Value::from(status));
        }
        if task.max_depth > 1 {
            result.child_tasks = links.iter().map(|link| task.child(link.as_str())).collect();
        }

        Ok(result)
    }

    /// Explicit backend if it is registered, the selector's choice otherwise
    fn resolve_backend(&self, task: &WorkerTask, content_type: Option<&str>) -> Result<Arc<dyn Backend>> {
        if let Some(name) = task.backend_name.as_deref() {
            if self.registry.contains(name) {
                return self.registry.get_backend(name);
            }
            debug!(backend = %name, "Requested backend not registered, falling back to selection");
        }

        self.selector
            .select_backend(&task.url, content_type)?
            .ok_or_else(|| Error::NoBackend {
                url: task.url.clone(),
            })
    }

    // ------------------------------------------------------------------------
    // Heartbeats
    // ------------------------------------------------------------------------

    /// Current heartbeat snapshot
    pub fn heartbeat(&self) -> WorkerHeartbeat {
        let active = self.active_tasks.load(Ordering::SeqCst);
        let status = if active > 0 {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        };
        self.heartbeat_with_status(status)
    }

    fn heartbeat_with_status(&self, status: WorkerStatus) -> WorkerHeartbeat {
        let mut heartbeat = WorkerHeartbeat::new(&self.worker_id, status);
        heartbeat.current_task_id = lock(&self.current_task).clone();
        heartbeat.tasks_completed = self.tasks_completed();
        heartbeat.tasks_failed = self.tasks_failed();
        heartbeat.active_tasks = self.active_tasks.load(Ordering::SeqCst);
        heartbeat.open_circuits = self.open_circuits();
        heartbeat
    }

    /// Deliver a heartbeat; a panicking callback is logged and suppressed
    fn emit(&self, heartbeat: WorkerHeartbeat) {
        let Some(callback) = &self.heartbeat_callback else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback(heartbeat))).is_err() {
            warn!(worker_id = %self.worker_id, "Heartbeat callback panicked");
        }
    }

    /// Spawn the heartbeat loop; a second call does nothing
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut handle = lock(&self.heartbeat_handle);
        if handle.is_some() {
            return;
        }

        let worker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => worker.emit(worker.heartbeat()),
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!(worker_id = %worker.worker_id, "Heartbeat loop exited");
        }));
    }

    /// Stop heartbeats and report offline
    ///
    /// Closes every registered backend unless the registry is shared.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = lock(&self.heartbeat_handle).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        if self.owns_registry {
            self.registry.close_all().await;
        }
        self.emit(self.heartbeat_with_status(WorkerStatus::Offline));
        info!(
            worker_id = %self.worker_id,
            completed = self.tasks_completed(),
            failed = self.tasks_failed(),
            "Worker stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCriteria, BackendSource, CrawlOutput};
    use crate::utils::ConstantDelay;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Backend for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn crawl(&self, target: &CrawlTarget) -> std::result::Result<CrawlOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BackendError::Transient("connection reset".into()));
            }
            Ok(CrawlOutput {
                url: target.url.clone(),
                status: Some(200),
                content: "hello".into(),
                links: vec!["https://a.test/1".into(), "https://a.test/2".into()],
                ..Default::default()
            })
        }
    }

    fn worker_with(failures: u32) -> (CrawlWorker, Arc<Flaky>) {
        let backend = Arc::new(Flaky {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        });
        let registry = Arc::new(BackendRegistry::new());
        registry
            .register_backend(
                "flaky",
                BackendSource::Instance(backend.clone()),
                Some(BackendCriteria::new()),
            )
            .unwrap();

        let worker = CrawlWorker::new("w1", registry).with_retry(RetryWithStrategy::new(
            Arc::new(ConstantDelay::new(Duration::from_millis(1))),
            2,
        ));
        (worker, backend)
    }

    #[tokio::test]
    async fn test_retry_absorbs_transient_errors() {
        let (worker, backend) = worker_with(2);
        let result = worker.process_task(WorkerTask::new("https://a.test/", 1)).await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.backend_name.as_deref(), Some("flaky"));
        assert_eq!(result.content_size, 5);
        assert!(result.child_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_task() {
        let (worker, _) = worker_with(10);
        let result = worker.process_task(WorkerTask::new("https://a.test/", 1)).await;

        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("connection reset"));
        assert_eq!(worker.tasks_failed(), 1);
    }

    #[tokio::test]
    async fn test_children_for_deep_tasks() {
        let (worker, _) = worker_with(0);
        let task = WorkerTask::new("https://a.test/", 2).with_priority(3);
        let result = worker.process_task(task.clone()).await;

        assert_eq!(result.child_tasks.len(), 2);
        for child in &result.child_tasks {
            assert_eq!(child.max_depth, 1);
            assert_eq!(child.priority, 2);
            assert_eq!(child.parent_task_id.as_deref(), Some(task.task_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_unknown_explicit_backend_falls_back_to_selection() {
        let (worker, _) = worker_with(0);
        let task = WorkerTask::new("https://a.test/", 1).with_backend("missing");
        let result = worker.process_task(task).await;
        assert!(result.success);
        assert_eq!(result.backend_name.as_deref(), Some("flaky"));
    }

    #[tokio::test]
    async fn test_no_backend() {
        let (worker, _) = worker_with(0);
        let result = worker.process_task(WorkerTask::new("ftp://a.test/file", 1)).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("No backend available"));
        assert!(result.backend_name.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_reports_counters() {
        let (worker, _) = worker_with(0);
        worker.process_task(WorkerTask::new("https://a.test/", 1)).await;

        let hb = worker.heartbeat();
        assert_eq!(hb.status, WorkerStatus::Idle);
        assert_eq!(hb.tasks_completed, 1);
        assert!(hb.current_task_id.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_emits_offline_heartbeat() {
        let (worker, _) = worker_with(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let worker = Arc::new(worker.with_heartbeat_callback(Arc::new(move |hb: WorkerHeartbeat| {
            sink.lock().unwrap().push(hb.status);
        })));

        worker.start_heartbeat();
        worker.shutdown().await;

        let statuses = seen.lock().unwrap();
        assert_eq!(statuses.last(), Some(&WorkerStatus::Offline));
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let (worker, _) = worker_with(0);
        let worker = worker.with_heartbeat_callback(Arc::new(|_: WorkerHeartbeat| panic!("sink down")));
        worker.shutdown().await;
    }
}
