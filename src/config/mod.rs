//! Configuration management for orbweaver
//!
//! Configuration comes from environment variables ([`Config::from_env`]) or a
//! TOML file ([`Config::from_file`]). Every section has defaults, so a file
//! only needs the values it overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::backend::HttpBackendConfig;
use crate::utils::{BackoffConfig, CircuitBreakerConfig};

// ============================================================================
// Top-level Configuration
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Manager tunables
    pub distributed: DistributedConfig,

    /// In-process worker pool
    pub worker: WorkerConfig,

    /// Per-backend circuit breakers
    pub circuit_breaker: CircuitBreakerConfig,

    /// Backoff between retries of transient errors
    pub backoff: BackoffConfig,

    /// Reference HTTP backend
    pub http: HttpBackendConfig,

    /// HTTP API
    pub api: ApiConfig,

    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from `ORBWEAVER_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        let d = &mut config.distributed;

        d.max_workers = env_parse("ORBWEAVER_MAX_WORKERS", d.max_workers)?;
        d.task_timeout_secs = env_parse("ORBWEAVER_TASK_TIMEOUT", d.task_timeout_secs)?;
        d.retry_count = env_parse("ORBWEAVER_RETRY_COUNT", d.retry_count)?;
        d.heartbeat_interval_secs = env_parse("ORBWEAVER_HEARTBEAT_INTERVAL", d.heartbeat_interval_secs)?;
        d.worker_idle_timeout_secs =
            env_parse("ORBWEAVER_WORKER_IDLE_TIMEOUT", d.worker_idle_timeout_secs)?;
        d.task_queue_limit = env_parse("ORBWEAVER_TASK_QUEUE_LIMIT", d.task_queue_limit)?;
        d.metrics_interval_secs = env_parse("ORBWEAVER_METRICS_INTERVAL", d.metrics_interval_secs)?;
        d.enable_metrics = env_parse("ORBWEAVER_ENABLE_METRICS", d.enable_metrics)?;

        let w = &mut config.worker;
        w.workers = env_parse("ORBWEAVER_WORKERS", w.workers)?;
        if let Ok(prefix) = std::env::var("ORBWEAVER_WORKER_PREFIX") {
            w.id_prefix = prefix;
        }

        let cb = &mut config.circuit_breaker;
        cb.failure_threshold = env_parse("ORBWEAVER_CB_FAILURE_THRESHOLD", cb.failure_threshold)?;
        cb.reset_timeout_secs = env_parse("ORBWEAVER_CB_RESET_TIMEOUT", cb.reset_timeout_secs)?;
        cb.half_open_max_calls = env_parse("ORBWEAVER_CB_HALF_OPEN_MAX_CALLS", cb.half_open_max_calls)?;

        let http = &mut config.http;
        http.timeout_secs = env_parse("ORBWEAVER_HTTP_TIMEOUT", http.timeout_secs)?;
        http.min_request_interval_ms =
            env_parse("ORBWEAVER_HTTP_MIN_INTERVAL_MS", http.min_request_interval_ms)?;
        http.max_concurrent_requests =
            env_parse("ORBWEAVER_HTTP_MAX_CONCURRENT", http.max_concurrent_requests)?;
        if let Ok(agent) = std::env::var("ORBWEAVER_USER_AGENT") {
            http.user_agent = agent;
        }

        config.api.bind_address = env_parse("ORBWEAVER_BIND_ADDRESS", config.api.bind_address)?;

        if let Ok(level) = std::env::var("ORBWEAVER_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("ORBWEAVER_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.distributed.validate()?;

        if self.worker.workers == 0 {
            anyhow::bail!("worker.workers must be greater than 0");
        }

        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be greater than 0");
        }

        if self.http.max_concurrent_requests == 0 {
            anyhow::bail!("http.max_concurrent_requests must be greater than 0");
        }

        Ok(())
    }
}

/// Parse an environment variable, falling back to `default` when unset
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

// ============================================================================
// Distributed Configuration
// ============================================================================

/// Floor for every periodic interval derived from the config
const MIN_TICK: Duration = Duration::from_millis(1);

/// Tunables of the distributed crawl manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Maximum number of registered workers
    pub max_workers: usize,

    /// Per-task timeout forwarded to backends (seconds)
    pub task_timeout_secs: u64,

    /// Retries of transient backend errors within one task
    pub retry_count: u32,

    /// Interval between worker heartbeats (seconds)
    pub heartbeat_interval_secs: u64,

    /// Silence after which a worker is considered lost (seconds)
    pub worker_idle_timeout_secs: u64,

    /// Maximum number of pending tasks
    pub task_queue_limit: usize,

    /// Interval between metrics snapshots (seconds)
    pub metrics_interval_secs: u64,

    /// Run the metrics loop
    pub enable_metrics: bool,

    /// Recorded preference; assignment always picks any idle worker
    pub enable_load_balancing: bool,

    /// Order the queue by priority (FIFO when disabled)
    pub enable_task_prioritization: bool,

    /// Recorded preference; the pool size is fixed
    pub enable_auto_scaling: bool,

    /// Number of task durations kept for throughput metrics
    pub duration_history_limit: usize,

    /// Sleep of the assignment loop when there is nothing to assign (ms)
    pub assignment_poll_interval_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            task_timeout_secs: 300,
            retry_count: 3,
            heartbeat_interval_secs: 30,
            worker_idle_timeout_secs: 120,
            task_queue_limit: 10_000,
            metrics_interval_secs: 60,
            enable_metrics: true,
            enable_load_balancing: true,
            enable_task_prioritization: true,
            enable_auto_scaling: false,
            duration_history_limit: 1000,
            assignment_poll_interval_ms: 100,
        }
    }
}

impl DistributedConfig {
    /// Create a new config builder
    pub fn builder() -> DistributedConfigBuilder {
        DistributedConfigBuilder::default()
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Never zero, so it is always safe to hand to `tokio::time::interval`
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs).max(MIN_TICK)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }

    /// Never zero
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs).max(MIN_TICK)
    }

    pub fn assignment_poll_interval(&self) -> Duration {
        Duration::from_millis(self.assignment_poll_interval_ms).max(MIN_TICK)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be greater than 0");
        }

        if self.task_queue_limit == 0 {
            anyhow::bail!("task_queue_limit must be greater than 0");
        }

        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be greater than 0");
        }

        if self.worker_idle_timeout_secs <= self.heartbeat_interval_secs {
            anyhow::bail!("worker_idle_timeout_secs must be greater than heartbeat_interval_secs");
        }

        if self.enable_metrics && self.metrics_interval_secs == 0 {
            anyhow::bail!("metrics_interval_secs must be greater than 0 when metrics are enabled");
        }

        Ok(())
    }
}

/// Builder for DistributedConfig
#[derive(Debug, Default)]
pub struct DistributedConfigBuilder {
    config: Option<DistributedConfig>,
}

impl DistributedConfigBuilder {
    fn config(&mut self) -> &mut DistributedConfig {
        self.config.get_or_insert_with(DistributedConfig::default)
    }

    pub fn max_workers(mut self, max: usize) -> Self {
        self.config().max_workers = max;
        self
    }

    pub fn task_timeout_secs(mut self, secs: u64) -> Self {
        self.config().task_timeout_secs = secs;
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.config().retry_count = count;
        self
    }

    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.config().heartbeat_interval_secs = secs;
        self
    }

    pub fn worker_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.config().worker_idle_timeout_secs = secs;
        self
    }

    pub fn task_queue_limit(mut self, limit: usize) -> Self {
        self.config().task_queue_limit = limit;
        self
    }

    pub fn metrics_interval_secs(mut self, secs: u64) -> Self {
        self.config().metrics_interval_secs = secs;
        self
    }

    pub fn enable_metrics(mut self, enable: bool) -> Self {
        self.config().enable_metrics = enable;
        self
    }

    pub fn enable_task_prioritization(mut self, enable: bool) -> Self {
        self.config().enable_task_prioritization = enable;
        self
    }

    pub fn duration_history_limit(mut self, limit: usize) -> Self {
        self.config().duration_history_limit = limit;
        self
    }

    pub fn assignment_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config().assignment_poll_interval_ms = ms;
        self
    }

    /// Build and validate the config
    pub fn build(mut self) -> Result<DistributedConfig> {
        let config = self.config().clone();
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Other Sections
// ============================================================================

/// In-process worker pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers started by the local cluster
    pub workers: usize,

    /// Worker ids are `{id_prefix}-{n}`
    pub id_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            id_prefix: "worker".to_string(),
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Server bind address
    pub bind_address: SocketAddr,

    /// Enable CORS for API
    pub enable_cors: bool,

    /// Enable request logging
    pub enable_request_logging: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: true,
            enable_request_logging: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}
