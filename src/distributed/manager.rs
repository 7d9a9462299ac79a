//! Distributed crawl manager
//!
//! Owns the task queue and the worker registry. All bookkeeping happens
//! synchronously under a single mutex, so a mutation is never observed half
//! done; the only suspension points are the dispatcher call and the loop
//! sleeps, both taken with the lock released.
//!
//! # Task lifecycle
//!
//! ```text
//! add_task ──> pending ──assign──> running ──complete──> completed | failed
//!                 ^                   │
//!                 └──── requeue ──────┘  (worker unregistered or timed out)
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::DistributedConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{
    ManagerStatus, TaskResult, TaskStatus, WorkerHeartbeat, WorkerInfo, WorkerStatus, WorkerTask,
};
use crate::utils::lock;

// ============================================================================
// Dispatch
// ============================================================================

/// How a dispatcher handled an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed to the worker
    Delivered,
    /// The worker is not reachable through this dispatcher; it collects the
    /// task from its next heartbeat response
    Deferred,
}

/// Delivers an assigned task to its worker
///
/// The manager records the assignment first and dispatches afterwards; a
/// dispatch error rolls the assignment back. Workers the dispatcher does not
/// know about are answered with [`Delivery::Deferred`], which keeps the
/// assignment.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, worker_id: &str, task: WorkerTask) -> Result<Delivery>;
}

// ============================================================================
// Queue
// ============================================================================

/// Heap entry: higher priority first, then earlier insertion
#[derive(Debug)]
struct QueuedTask {
    priority: i32,
    seq: u64,
    task: WorkerTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Default)]
struct ManagerState {
    queue: BinaryHeap<QueuedTask>,
    next_seq: u64,
    running: HashMap<String, WorkerTask>,
    completed: HashMap<String, TaskResult>,
    failed: HashMap<String, TaskResult>,
    workers: BTreeMap<String, WorkerInfo>,
    worker_tasks: HashMap<String, HashSet<String>>,
    durations: VecDeque<f64>,
}

impl ManagerState {
    fn push(&mut self, mut task: WorkerTask, prioritize: bool) {
        task.status = TaskStatus::Pending;
        let seq = self.next_seq;
        self.next_seq += 1;
        let priority = if prioritize { task.priority } else { 0 };
        self.queue.push(QueuedTask { priority, seq, task });
    }

    /// Remove a worker, returning the number of tasks put back in the queue
    fn remove_worker(&mut self, worker_id: &str, prioritize: bool) -> Option<usize> {
        self.workers.remove(worker_id)?;

        let task_ids = self.worker_tasks.remove(worker_id).unwrap_or_default();
        let mut requeued = 0;
        for task_id in task_ids {
            if let Some(mut task) = self.running.remove(&task_id) {
                task.reset_to_pending();
                self.push(task, prioritize);
                requeued += 1;
            }
        }
        Some(requeued)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Schedules tasks onto registered workers
pub struct DistributedCrawlManager {
    config: DistributedConfig,
    state: Mutex<ManagerState>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Option<JoinSet<()>>>,
}

impl std::fmt::Debug for DistributedCrawlManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCrawlManager")
            .field("config", &self.config)
            .field("has_dispatcher", &self.dispatcher.is_some())
            .finish_non_exhaustive()
    }
}

impl DistributedCrawlManager {
    /// Create a manager without a dispatcher
    ///
    /// Assignments are only recorded; remote workers pick them up through
    /// [`assigned_tasks`](Self::assigned_tasks).
    pub fn new(config: DistributedConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            state: Mutex::new(ManagerState::default()),
            dispatcher: None,
            started_at: Instant::now(),
            shutdown_tx,
            loops: Mutex::new(None),
        }
    }

    /// Push assignments to workers through `dispatcher`
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        lock(&self.state)
    }

    fn prioritize(&self) -> bool {
        self.config.enable_task_prioritization
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    /// Queue a task
    ///
    /// # Errors
    ///
    /// Returns `Error::QueueFull` when the queue already holds
    /// `task_queue_limit` tasks; the queue is left untouched.
    pub fn add_task(&self, task: WorkerTask) -> Result<()> {
        let mut state = self.state();
        let limit = self.config.task_queue_limit;
        if state.queue.len() >= limit {
            metrics::record_queue_rejection();
            warn!(task_id = %task.task_id, limit = limit, "Task queue full, rejecting task");
            return Err(Error::QueueFull { limit });
        }

        debug!(task_id = %task.task_id, url = %task.url, priority = task.priority, "Task queued");
        state.push(task, self.prioritize());
        Ok(())
    }

    /// Pop the highest-priority pending task
    pub fn get_next_task(&self) -> Option<WorkerTask> {
        self.state().queue.pop().map(|queued| queued.task)
    }

    /// Mark `task` as running on `worker_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::WorkerNotRegistered` for an unknown worker
    pub fn assign_task(&self, worker_id: &str, task: WorkerTask) -> Result<()> {
        let mut state = self.state();
        Self::assign_locked(&mut state, worker_id, task).map(|_| ())
    }

    fn assign_locked(
        state: &mut ManagerState,
        worker_id: &str,
        mut task: WorkerTask,
    ) -> Result<WorkerTask> {
        let Some(worker) = state.workers.get_mut(worker_id) else {
            return Err(Error::WorkerNotRegistered(worker_id.to_string()));
        };

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.worker_id = Some(worker_id.to_string());

        worker.status = WorkerStatus::Busy;
        worker.current_task_id = Some(task.task_id.clone());

        debug!(task_id = %task.task_id, worker_id = %worker_id, "Task assigned");

        state
            .worker_tasks
            .entry(worker_id.to_string())
            .or_default()
            .insert(task.task_id.clone());
        state.running.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    /// Record a task outcome
    ///
    /// Successful results enqueue their child tasks; failed results are
    /// terminal. Returns `false` if the task was not running, e.g. a late
    /// result for a task that was already requeued, or if it is running on a
    /// different worker than the one reporting. The result is recorded
    /// either way; in the second case its child tasks are left to the
    /// current owner.
    pub fn complete_task(&self, result: TaskResult) -> bool {
        let prioritize = self.prioritize();
        let mut state = self.state();

        // a result from a worker that no longer owns the task is recorded
        // without touching the current owner's assignment
        let owner = state
            .running
            .get(&result.task_id)
            .and_then(|task| task.worker_id.clone());
        if let Some(owner) = owner.filter(|owner| *owner != result.worker_id) {
            warn!(
                task_id = %result.task_id,
                worker_id = %result.worker_id,
                owner = %owner,
                "Result from a superseded worker, keeping current assignment"
            );
            let results = if result.success {
                &mut state.completed
            } else {
                &mut state.failed
            };
            results.insert(result.task_id.clone(), result);
            return false;
        }

        let running = state.running.remove(&result.task_id);
        let worker_id = running
            .as_ref()
            .and_then(|task| task.worker_id.clone())
            .unwrap_or_else(|| result.worker_id.clone());

        let worker_done = match state.worker_tasks.get_mut(&worker_id) {
            Some(tasks) => {
                tasks.remove(&result.task_id);
                tasks.is_empty()
            }
            None => true,
        };
        if worker_done {
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.status = WorkerStatus::Idle;
                worker.current_task_id = None;
            }
        }

        if running.is_none() {
            debug!(task_id = %result.task_id, worker_id = %worker_id, "Result for a task that is not running");
        }

        metrics::record_task_outcome(result.success);

        if result.success {
            let mut dropped = 0;
            for child in &result.child_tasks {
                if state.queue.len() >= self.config.task_queue_limit {
                    dropped += 1;
                    continue;
                }
                state.push(child.clone(), prioritize);
            }
            if dropped > 0 {
                metrics::record_queue_rejection();
                warn!(task_id = %result.task_id, dropped = dropped, "Task queue full, dropped child tasks");
            }

            let limit = self.config.duration_history_limit.max(1);
            state.durations.push_back(result.duration_secs);
            while state.durations.len() > limit {
                state.durations.pop_front();
            }

            info!(
                task_id = %result.task_id,
                worker_id = %worker_id,
                children = result.child_tasks.len() - dropped,
                duration_secs = result.duration_secs,
                "Task completed"
            );
            state.completed.insert(result.task_id.clone(), result);
        } else {
            info!(
                task_id = %result.task_id,
                worker_id = %worker_id,
                error = result.error_message.as_deref().unwrap_or("unknown error"),
                "Task failed"
            );
            state.failed.insert(result.task_id.clone(), result);
        }

        running.is_some()
    }

    // ------------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------------

    /// Register a worker, or refresh the entry of a known one
    ///
    /// # Errors
    ///
    /// Returns `Error::WorkerLimit` when `max_workers` workers are registered
    pub fn register_worker(&self, info: WorkerInfo) -> Result<()> {
        let mut state = self.state();
        let limit = self.config.max_workers;
        if !state.workers.contains_key(&info.worker_id) && state.workers.len() >= limit {
            warn!(worker_id = %info.worker_id, limit = limit, "Worker limit reached");
            return Err(Error::WorkerLimit { limit });
        }

        info!(worker_id = %info.worker_id, capabilities = ?info.capabilities, "Worker registered");
        state.workers.insert(info.worker_id.clone(), info);
        Ok(())
    }

    /// Remove a worker and requeue every task it was running
    ///
    /// Returns `false` if the worker was not registered.
    pub fn unregister_worker(&self, worker_id: &str) -> bool {
        let prioritize = self.prioritize();
        let removed = self.state().remove_worker(worker_id, prioritize);

        match removed {
            Some(requeued) => {
                metrics::record_tasks_requeued(requeued);
                if requeued > 0 {
                    warn!(worker_id = %worker_id, requeued = requeued, "Worker unregistered, tasks requeued");
                } else {
                    info!(worker_id = %worker_id, "Worker unregistered");
                }
                true
            }
            None => false,
        }
    }

    /// Refresh the cached view of a worker
    ///
    /// Heartbeats from unknown workers are logged and ignored, and so are
    /// heartbeats older than the last one applied. A worker that still holds
    /// assigned tasks stays busy even if the heartbeat, sent before the
    /// assignment arrived, says idle. Returns `false` for unknown workers.
    pub fn update_worker_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> bool {
        let mut state = self.state();
        let holds_tasks = state
            .worker_tasks
            .get(&heartbeat.worker_id)
            .is_some_and(|tasks| !tasks.is_empty());

        let Some(worker) = state.workers.get_mut(&heartbeat.worker_id) else {
            warn!(worker_id = %heartbeat.worker_id, "Heartbeat from unknown worker ignored");
            return false;
        };

        let previous = worker.status;
        let current_task = worker.current_task_id.clone();
        if !worker.apply_heartbeat(heartbeat) {
            debug!(
                worker_id = %heartbeat.worker_id,
                timestamp = %heartbeat.timestamp,
                last_heartbeat = %worker.last_heartbeat,
                "Stale heartbeat ignored"
            );
            return true;
        }
        if holds_tasks && heartbeat.status == WorkerStatus::Idle {
            worker.status = WorkerStatus::Busy;
            worker.current_task_id = current_task;
        }

        if previous != worker.status {
            debug!(
                worker_id = %heartbeat.worker_id,
                from = %previous,
                to = %worker.status,
                "Worker status changed"
            );
        }

        metrics::record_heartbeat();
        true
    }

    /// Id of any idle worker
    pub fn find_idle_worker(&self) -> Option<String> {
        Self::idle_worker_locked(&self.state())
    }

    fn idle_worker_locked(state: &ManagerState) -> Option<String> {
        state
            .workers
            .values()
            .find(|w| w.status == WorkerStatus::Idle)
            .map(|w| w.worker_id.clone())
    }

    /// Unregister every worker whose last heartbeat is older than the idle
    /// timeout; returns their ids
    pub fn check_worker_timeouts(&self) -> Vec<String> {
        self.check_worker_timeouts_at(Utc::now())
    }

    /// [`check_worker_timeouts`](Self::check_worker_timeouts) against an explicit clock
    pub fn check_worker_timeouts_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state();
        self.sweep_locked(&mut state, now)
    }

    fn sweep_locked(&self, state: &mut ManagerState, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.config.worker_idle_timeout_secs as f64;
        let expired: Vec<String> = state
            .workers
            .values()
            .filter(|w| w.seconds_since_heartbeat(now) > timeout)
            .map(|w| w.worker_id.clone())
            .collect();

        for worker_id in &expired {
            let requeued = state
                .remove_worker(worker_id, self.prioritize())
                .unwrap_or_default();
            metrics::record_tasks_requeued(requeued);
            warn!(
                worker_id = %worker_id,
                timeout_secs = self.config.worker_idle_timeout_secs,
                requeued = requeued,
                "Worker heartbeat timed out"
            );
        }

        metrics::record_workers_timed_out(expired.len());
        expired
    }

    /// Sweep timeouts, then pair an idle worker with the next pending task
    ///
    /// Runs as one critical section; the returned pair is already recorded
    /// as running.
    pub fn assign_next(&self) -> Option<(String, WorkerTask)> {
        let mut state = self.state();
        self.sweep_locked(&mut state, Utc::now());

        let worker_id = Self::idle_worker_locked(&state)?;
        let task = state.queue.pop()?.task;

        match Self::assign_locked(&mut state, &worker_id, task) {
            Ok(task) => Some((worker_id, task)),
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Assignment failed");
                None
            }
        }
    }

    /// Hand an assigned task to the dispatcher, rolling back on failure
    async fn dispatch(&self, worker_id: String, task: WorkerTask) {
        let Some(dispatcher) = self.dispatcher.clone() else {
            return;
        };

        let task_id = task.task_id.clone();
        match dispatcher.dispatch(&worker_id, task).await {
            Ok(Delivery::Delivered) => {
                debug!(task_id = %task_id, worker_id = %worker_id, "Task dispatched");
            }
            Ok(Delivery::Deferred) => {
                debug!(task_id = %task_id, worker_id = %worker_id, "Task left for heartbeat pickup");
            }
            Err(e) => {
                warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    error = %e,
                    "Dispatch failed, unregistering worker"
                );
                self.unregister_worker(&worker_id);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Point-in-time status
    pub fn get_status(&self) -> ManagerStatus {
        let state = self.state();
        let count = |status: WorkerStatus| state.workers.values().filter(|w| w.status == status).count();

        let uptime = self.started_at.elapsed();
        let completed = state.completed.len();
        let tasks_per_second = if uptime.as_secs_f64() > 0.0 {
            completed as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };
        let average_task_time_secs = if state.durations.is_empty() {
            0.0
        } else {
            state.durations.iter().sum::<f64>() / state.durations.len() as f64
        };

        ManagerStatus {
            total_workers: state.workers.len(),
            idle_workers: count(WorkerStatus::Idle),
            busy_workers: count(WorkerStatus::Busy),
            offline_workers: count(WorkerStatus::Offline),
            pending_tasks: state.queue.len(),
            running_tasks: state.running.len(),
            completed_tasks: completed,
            failed_tasks: state.failed.len(),
            tasks_per_second,
            average_task_time_secs,
            uptime_secs: uptime.as_secs(),
            timestamp: Utc::now(),
        }
    }

    /// Result of a finished task, successful or not
    pub fn get_task_result(&self, task_id: &str) -> Option<TaskResult> {
        let state = self.state();
        state
            .completed
            .get(task_id)
            .or_else(|| state.failed.get(task_id))
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.state().queue.len()
    }

    /// Snapshot of the pending queue, highest priority first
    pub fn pending_tasks(&self) -> Vec<WorkerTask> {
        let state = self.state();
        let mut entries: Vec<&QueuedTask> = state.queue.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|q| q.task.clone()).collect()
    }

    pub fn running_tasks(&self) -> Vec<WorkerTask> {
        self.state().running.values().cloned().collect()
    }

    /// Tasks currently assigned to `worker_id`
    pub fn assigned_tasks(&self, worker_id: &str) -> Vec<WorkerTask> {
        let state = self.state();
        state
            .worker_tasks
            .get(worker_id)
            .map(|ids| ids.iter().filter_map(|id| state.running.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.state().workers.values().cloned().collect()
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.state().workers.get(worker_id).cloned()
    }

    /// No task pending or running
    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.queue.is_empty() && state.running.is_empty()
    }

    // ------------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------------

    /// Spawn the assignment loop and, if enabled, the metrics loop
    ///
    /// Calling `start` on a running manager does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut loops = lock(&self.loops);
        if loops.is_some() {
            return;
        }

        self.shutdown_tx.send_replace(false);
        let mut set = JoinSet::new();

        let manager = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        set.spawn(async move { manager.assignment_loop(shutdown_rx).await });

        if self.config.enable_metrics {
            let manager = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            set.spawn(async move { manager.metrics_loop(shutdown_rx).await });
        }

        info!(
            metrics = self.config.enable_metrics,
            prioritization = self.config.enable_task_prioritization,
            "Crawl manager started"
        );
        *loops = Some(set);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.loops).is_some()
    }

    /// Stop both background loops together
    pub async fn shutdown(&self) {
        let loops = lock(&self.loops).take();
        let Some(mut set) = loops else {
            return;
        };

        self.shutdown_tx.send_replace(true);
        set.abort_all();
        while set.join_next().await.is_some() {}

        info!("Crawl manager stopped");
    }

    async fn assignment_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let idle_sleep = self.config.assignment_poll_interval();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.assign_next() {
                Some((worker_id, task)) => self.dispatch(worker_id, task).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(idle_sleep) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }

        debug!("Assignment loop exited");
    }

    async fn metrics_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.metrics_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.get_status();
                    metrics::update_manager_status(&status);
                    info!(
                        workers = status.total_workers,
                        idle = status.idle_workers,
                        busy = status.busy_workers,
                        pending = status.pending_tasks,
                        running = status.running_tasks,
                        completed = status.completed_tasks,
                        failed = status.failed_tasks,
                        tasks_per_second = status.tasks_per_second,
                        avg_task_secs = status.average_task_time_secs,
                        "Manager status"
                    );
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        debug!("Metrics loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn manager() -> DistributedCrawlManager {
        DistributedCrawlManager::new(DistributedConfig::default())
    }

    #[test]
    fn test_queue_orders_by_priority_then_insertion() {
        let m = manager();
        let low = WorkerTask::new("https://a.test/low", 1).with_priority(1);
        let first = WorkerTask::new("https://a.test/first", 1).with_priority(5);
        let second = WorkerTask::new("https://a.test/second", 1).with_priority(5);

        m.add_task(low.clone()).unwrap();
        m.add_task(first.clone()).unwrap();
        m.add_task(second.clone()).unwrap();

        assert_eq!(m.get_next_task().unwrap().task_id, first.task_id);
        assert_eq!(m.get_next_task().unwrap().task_id, second.task_id);
        assert_eq!(m.get_next_task().unwrap().task_id, low.task_id);
        assert!(m.get_next_task().is_none());
    }

    #[test]
    fn test_fifo_without_prioritization() {
        let config = DistributedConfig {
            enable_task_prioritization: false,
            ..Default::default()
        };
        let m = DistributedCrawlManager::new(config);
        let first = WorkerTask::new("https://a.test/1", 1).with_priority(1);
        let second = WorkerTask::new("https://a.test/2", 1).with_priority(9);

        m.add_task(first.clone()).unwrap();
        m.add_task(second).unwrap();
        assert_eq!(m.get_next_task().unwrap().task_id, first.task_id);
    }

    #[test]
    fn test_assign_unknown_worker() {
        let m = manager();
        let err = m
            .assign_task("ghost", WorkerTask::new("https://a.test/", 1))
            .unwrap_err();
        assert!(matches!(err, Error::WorkerNotRegistered(id) if id == "ghost"));
        assert!(m.running_tasks().is_empty());
    }

    #[test]
    fn test_assign_next_pairs_worker_and_task() {
        let m = manager();
        m.register_worker(WorkerInfo::new("w1")).unwrap();
        let task = WorkerTask::new("https://a.test/", 1);
        m.add_task(task.clone()).unwrap();

        let (worker_id, assigned) = m.assign_next().unwrap();
        assert_eq!(worker_id, "w1");
        assert_eq!(assigned.task_id, task.task_id);
        assert_eq!(assigned.status, TaskStatus::Running);
        assert!(assigned.started_at.is_some());

        let worker = m.worker("w1").unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
        assert_eq!(worker.current_task_id.as_deref(), Some(task.task_id.as_str()));
        assert!(m.find_idle_worker().is_none());
        assert!(m.assign_next().is_none());
    }

    #[test]
    fn test_stale_idle_heartbeat_keeps_worker_busy() {
        let m = manager();
        m.register_worker(WorkerInfo::new("w1")).unwrap();
        m.add_task(WorkerTask::new("https://a.test/", 1)).unwrap();
        m.assign_next().unwrap();

        assert!(m.update_worker_heartbeat(&WorkerHeartbeat::new("w1", WorkerStatus::Idle)));
        assert_eq!(m.worker("w1").unwrap().status, WorkerStatus::Busy);
    }

    #[test]
    fn test_worker_limit() {
        let config = DistributedConfig {
            max_workers: 1,
            ..Default::default()
        };
        let m = DistributedCrawlManager::new(config);
        m.register_worker(WorkerInfo::new("w1")).unwrap();
        m.register_worker(WorkerInfo::new("w1")).unwrap();
        assert!(matches!(
            m.register_worker(WorkerInfo::new("w2")),
            Err(Error::WorkerLimit { limit: 1 })
        ));
    }

    #[test]
    fn test_timeout_is_strictly_greater() {
        let m = manager();
        let mut info = WorkerInfo::new("w1");
        let now = Utc::now();
        info.last_heartbeat = now - ChronoDuration::seconds(120);
        m.register_worker(info).unwrap();

        assert!(m.check_worker_timeouts_at(now).is_empty());
        assert_eq!(
            m.check_worker_timeouts_at(now + ChronoDuration::seconds(1)),
            vec!["w1".to_string()]
        );
    }

    #[test]
    fn test_duration_history_is_bounded() {
        let config = DistributedConfig {
            duration_history_limit: 2,
            ..Default::default()
        };
        let m = DistributedCrawlManager::new(config);
        for secs in [10.0, 2.0, 4.0] {
            let task = WorkerTask::new("https://a.test/", 1);
            let mut result = TaskResult::success(&task, "w1", Utc::now());
            result.duration_secs = secs;
            m.complete_task(result);
        }
        assert!((m.get_status().average_task_time_secs - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let m = Arc::new(manager());
        m.start();
        m.start();
        assert!(m.is_running());

        m.shutdown().await;
        assert!(!m.is_running());
        m.shutdown().await;
    }
}
