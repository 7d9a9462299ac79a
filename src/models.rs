//! Task and worker data model shared by the manager and workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Tasks
// ============================================================================

/// Lifecycle of a crawl task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Whether the task will not change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

/// A unit of crawl work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    /// Unique task identifier
    pub task_id: String,

    /// URL to crawl
    pub url: String,

    /// Crawl depth; values above 1 make the worker emit child tasks
    pub max_depth: u32,

    /// Backend to use instead of automatic selection
    pub backend_name: Option<String>,

    /// Higher runs first
    pub priority: i32,

    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Worker currently holding the task
    pub worker_id: Option<String>,

    /// Times the task went back to the queue
    pub retry_count: u32,

    /// Task whose crawl discovered this URL
    pub parent_task_id: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkerTask {
    /// Create a pending task with a fresh id and priority 0
    pub fn new(url: impl Into<String>, max_depth: u32) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            url: url.into(),
            max_depth,
            backend_name: None,
            priority: 0,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            retry_count: 0,
            parent_task_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_backend(mut self, backend_name: impl Into<String>) -> Self {
        self.backend_name = Some(backend_name.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Task for a link discovered while crawling this one
    pub fn child(&self, url: impl Into<String>) -> Self {
        let mut child = Self::new(url, self.max_depth.saturating_sub(1));
        child.priority = self.priority.saturating_sub(1);
        child.backend_name = self.backend_name.clone();
        child.parent_task_id = Some(self.task_id.clone());
        child
    }

    /// Put the task back into a schedulable state
    pub fn reset_to_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
        self.retry_count += 1;
    }
}

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub worker_id: String,
    pub url: String,
    pub success: bool,
    pub error_message: Option<String>,

    /// Backend that handled the task, if one was selected
    pub backend_name: Option<String>,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: f64,

    /// Bytes of content fetched
    pub content_size: usize,

    /// Links discovered on the page
    pub links_found: usize,

    /// Follow-up tasks for the manager to enqueue
    #[serde(default)]
    pub child_tasks: Vec<WorkerTask>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskResult {
    /// Successful result; size and link counts are filled by the caller
    pub fn success(task: &WorkerTask, worker_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        Self {
            task_id: task.task_id.clone(),
            worker_id: worker_id.into(),
            url: task.url.clone(),
            success: true,
            error_message: None,
            backend_name: None,
            started_at,
            completed_at,
            duration_secs: elapsed_secs(started_at, completed_at),
            content_size: 0,
            links_found: 0,
            child_tasks: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Failed result carrying the error message
    pub fn failure(
        task: &WorkerTask,
        worker_id: impl Into<String>,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error_message: Some(error.into()),
            ..Self::success(task, worker_id, started_at)
        }
    }
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ============================================================================
// Workers
// ============================================================================

/// Liveness status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Offline,
    Error,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Periodic snapshot sent by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub active_tasks: usize,

    /// Process CPU usage in percent, when the worker can measure it
    pub cpu_usage: Option<f64>,

    /// Resident memory in megabytes, when the worker can measure it
    pub memory_usage_mb: Option<f64>,

    /// Backends whose circuit is currently open
    #[serde(default)]
    pub open_circuits: Vec<String>,
}

impl WorkerHeartbeat {
    pub fn new(worker_id: impl Into<String>, status: WorkerStatus) -> Self {
        Self {
            worker_id: worker_id.into(),
            status,
            current_task_id: None,
            timestamp: Utc::now(),
            tasks_completed: 0,
            tasks_failed: 0,
            active_tasks: 0,
            cpu_usage: None,
            memory_usage_mb: None,
            open_circuits: Vec::new(),
        }
    }
}

/// The manager's cached view of a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub status: WorkerStatus,

    /// Where the worker can be reached, if it is remote
    pub address: Option<String>,

    /// Backends the worker has registered
    #[serde(default)]
    pub capabilities: Vec<String>,

    pub current_task_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub active_tasks: usize,
    pub cpu_usage: Option<f64>,
    pub memory_usage_mb: Option<f64>,

    #[serde(default)]
    pub open_circuits: Vec<String>,
}

impl WorkerInfo {
    pub fn new(worker_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Idle,
            address: None,
            capabilities: Vec::new(),
            current_task_id: None,
            registered_at: now,
            last_heartbeat: now,
            tasks_completed: 0,
            tasks_failed: 0,
            active_tasks: 0,
            cpu_usage: None,
            memory_usage_mb: None,
            open_circuits: Vec::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Refresh the cached fields from a heartbeat
    ///
    /// A heartbeat older than the last one applied is stale and leaves the
    /// entry untouched; returns whether it was applied.
    pub fn apply_heartbeat(&mut self, heartbeat: &WorkerHeartbeat) -> bool {
        if heartbeat.timestamp < self.last_heartbeat {
            return false;
        }

        self.status = heartbeat.status;
        self.current_task_id = heartbeat.current_task_id.clone();
        self.last_heartbeat = heartbeat.timestamp;
        self.tasks_completed = heartbeat.tasks_completed;
        self.tasks_failed = heartbeat.tasks_failed;
        self.active_tasks = heartbeat.active_tasks;
        self.cpu_usage = heartbeat.cpu_usage;
        self.memory_usage_mb = heartbeat.memory_usage_mb;
        self.open_circuits = heartbeat.open_circuits.clone();
        true
    }

    /// Seconds since the last heartbeat (negative if it is from the future)
    pub fn seconds_since_heartbeat(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_heartbeat).num_milliseconds() as f64 / 1000.0
    }
}

// ============================================================================
// Manager Status
// ============================================================================

/// Point-in-time view of a manager, computed on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ManagerStatus {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub offline_workers: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,

    /// Completed tasks per second of uptime
    pub tasks_per_second: f64,

    /// Mean duration over the recent task window
    pub average_task_time_secs: f64,

    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_task_inherits_lineage() {
        let parent = WorkerTask::new("https://a.test/", 3)
            .with_priority(5)
            .with_backend("http");
        let child = parent.child("https://a.test/next");

        assert_eq!(child.max_depth, 2);
        assert_eq!(child.priority, 4);
        assert_eq!(child.backend_name.as_deref(), Some("http"));
        assert_eq!(child.parent_task_id.as_deref(), Some(parent.task_id.as_str()));
        assert_ne!(child.task_id, parent.task_id);
        assert_eq!(child.status, TaskStatus::Pending);
    }

    #[test]
    fn test_reset_to_pending() {
        let mut task = WorkerTask::new("https://a.test/", 1);
        task.status = TaskStatus::Running;
        task.worker_id = Some("w1".into());
        task.started_at = Some(Utc::now());

        task.reset_to_pending();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.worker_id.is_none());
        assert!(task.started_at.is_none());
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn test_failure_result() {
        let task = WorkerTask::new("https://a.test/", 1);
        let result = TaskResult::failure(&task, "w1", Utc::now(), "boom");
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert!(result.child_tasks.is_empty());
    }

    #[test]
    fn test_task_serialization() {
        let task = WorkerTask::new("https://a.test/", 2).with_priority(3);
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        let back: WorkerTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_apply_heartbeat() {
        let mut info = WorkerInfo::new("w1");
        let mut hb = WorkerHeartbeat::new("w1", WorkerStatus::Busy);
        hb.current_task_id = Some("t1".into());
        hb.tasks_completed = 4;

        assert!(info.apply_heartbeat(&hb));
        assert_eq!(info.status, WorkerStatus::Busy);
        assert_eq!(info.current_task_id.as_deref(), Some("t1"));
        assert_eq!(info.tasks_completed, 4);
        assert_eq!(info.last_heartbeat, hb.timestamp);
    }

    #[test]
    fn test_stale_heartbeat_is_ignored() {
        let mut info = WorkerInfo::new("w1");
        let fresh = WorkerHeartbeat::new("w1", WorkerStatus::Busy);
        let mut late = WorkerHeartbeat::new("w1", WorkerStatus::Idle);
        late.timestamp = fresh.timestamp - chrono::Duration::seconds(5);

        assert!(info.apply_heartbeat(&fresh));
        assert!(!info.apply_heartbeat(&late));
        assert_eq!(info.last_heartbeat, fresh.timestamp);
        assert_eq!(info.status, WorkerStatus::Busy);
    }
}
