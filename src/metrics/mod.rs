//! Prometheus metrics for the crawl manager and workers
//!
//! This module tracks:
//! - Manager: queue depth, running tasks, worker counts, outcomes, requeues
//! - Workers: crawl duration per backend, circuit transitions
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, or it is never called, metrics operations are
//! no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

use crate::models::ManagerStatus;
use crate::utils::CircuitState;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Manager-side metrics
struct ManagerMetrics {
    pending_tasks: Gauge,
    running_tasks: Gauge,
    workers: GaugeVec,
    tasks_completed: Counter,
    tasks_failed: Counter,
    tasks_requeued: Counter,
    queue_rejections: Counter,
    heartbeats: Counter,
    workers_timed_out: Counter,
}

/// Worker-side metrics
struct WorkerMetrics {
    crawl_duration: HistogramVec,
    crawl_outcomes: CounterVec,
    circuit_transitions: CounterVec,
}

static MANAGER_METRICS: OnceLock<ManagerMetrics> = OnceLock::new();

static WORKER_METRICS: OnceLock<WorkerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = orbweaver::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let manager = ManagerMetrics {
        pending_tasks: register_gauge!(
            "orbweaver_manager_pending_tasks",
            "Number of tasks waiting in the queue"
        )?,
        running_tasks: register_gauge!(
            "orbweaver_manager_running_tasks",
            "Number of tasks assigned to workers"
        )?,
        workers: register_gauge_vec!(
            "orbweaver_manager_workers",
            "Registered workers by status",
            &["status"]
        )?,
        tasks_completed: register_counter!(
            "orbweaver_manager_tasks_completed_total",
            "Total tasks completed successfully"
        )?,
        tasks_failed: register_counter!(
            "orbweaver_manager_tasks_failed_total",
            "Total tasks reported as failed"
        )?,
        tasks_requeued: register_counter!(
            "orbweaver_manager_tasks_requeued_total",
            "Total tasks returned to the queue after losing their worker"
        )?,
        queue_rejections: register_counter!(
            "orbweaver_manager_queue_rejections_total",
            "Total submissions rejected because the queue was full"
        )?,
        heartbeats: register_counter!(
            "orbweaver_manager_heartbeats_total",
            "Total heartbeats accepted from registered workers"
        )?,
        workers_timed_out: register_counter!(
            "orbweaver_manager_workers_timed_out_total",
            "Total workers unregistered after missing heartbeats"
        )?,
    };

    let worker = WorkerMetrics {
        crawl_duration: register_histogram_vec!(
            "orbweaver_worker_crawl_duration_seconds",
            "Time spent processing one task in seconds",
            &["backend"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
        )?,
        crawl_outcomes: register_counter_vec!(
            "orbweaver_worker_crawl_outcomes_total",
            "Task outcomes by backend",
            &["backend", "outcome"]
        )?,
        circuit_transitions: register_counter_vec!(
            "orbweaver_worker_circuit_transitions_total",
            "Circuit breaker state changes by backend and target state",
            &["backend", "state"]
        )?,
    };

    MANAGER_METRICS.set(manager).map_err(|_| "Manager metrics already initialized")?;
    WORKER_METRICS.set(worker).map_err(|_| "Worker metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    MANAGER_METRICS.get().is_some() && WORKER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Publish a manager status snapshot
pub fn update_manager_status(status: &ManagerStatus) {
    let Some(m) = MANAGER_METRICS.get() else {
        return;
    };

    m.pending_tasks.set(status.pending_tasks as f64);
    m.running_tasks.set(status.running_tasks as f64);
    m.workers.with_label_values(&["idle"]).set(status.idle_workers as f64);
    m.workers.with_label_values(&["busy"]).set(status.busy_workers as f64);
    m.workers
        .with_label_values(&["offline"])
        .set(status.offline_workers as f64);
}

/// Record a task outcome reported to the manager
pub fn record_task_outcome(success: bool) {
    if let Some(m) = MANAGER_METRICS.get() {
        if success {
            m.tasks_completed.inc();
        } else {
            m.tasks_failed.inc();
        }
    }
}

/// Record tasks put back into the queue
pub fn record_tasks_requeued(count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = MANAGER_METRICS.get() {
        m.tasks_requeued.inc_by(count as f64);
    }
}

/// Record a submission rejected by a full queue
pub fn record_queue_rejection() {
    if let Some(m) = MANAGER_METRICS.get() {
        m.queue_rejections.inc();
    }
}

/// Record an accepted heartbeat
pub fn record_heartbeat() {
    if let Some(m) = MANAGER_METRICS.get() {
        m.heartbeats.inc();
    }
}

/// Record workers dropped by the liveness sweep
pub fn record_workers_timed_out(count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = MANAGER_METRICS.get() {
        m.workers_timed_out.inc_by(count as f64);
    }
}

/// Record one processed task on a worker
pub fn record_crawl(backend: &str, success: bool, duration_secs: f64) {
    let Some(m) = WORKER_METRICS.get() else {
        return;
    };

    m.crawl_duration
        .with_label_values(&[backend])
        .observe(duration_secs);
    m.crawl_outcomes
        .with_label_values(&[backend, if success { "success" } else { "failure" }])
        .inc();
}

/// Record a circuit breaker transition
pub fn record_circuit_transition(backend: &str, to: CircuitState) {
    if let Some(m) = WORKER_METRICS.get() {
        m.circuit_transitions
            .with_label_values(&[backend, &to.to_string()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_are_noops_before_init() {
        // None of these may panic whether or not another test initialized
        // the registry first.
        update_manager_status(&ManagerStatus::default());
        record_task_outcome(true);
        record_tasks_requeued(2);
        record_queue_rejection();
        record_crawl("http", false, 0.5);
        record_circuit_transition("http", CircuitState::Open);
    }

    #[test]
    fn test_init_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());

        record_task_outcome(false);
        let text = encode_metrics().unwrap();
        assert!(text.contains("orbweaver_manager_tasks_failed_total"));
    }
}
