//! In-process cluster: one manager and N workers connected by channels
//!
//! Each worker owns an `mpsc` inbox. The manager's [`ChannelDispatcher`]
//! pushes assignments into it; the worker's task loop feeds results back
//! through [`DistributedCrawlManager::complete_task`] and its heartbeat loop
//! calls [`DistributedCrawlManager::update_worker_heartbeat`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::manager::{Delivery, DistributedCrawlManager, TaskDispatcher};
use super::worker::CrawlWorker;
use crate::backend::{BackendRegistry, DocumentProcessor};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{ManagerStatus, WorkerHeartbeat, WorkerInfo, WorkerTask};

/// Inbox capacity per worker
const INBOX_CAPACITY: usize = 16;

/// [`TaskDispatcher`] over per-worker `mpsc` channels
#[derive(Debug, Default)]
pub struct ChannelDispatcher {
    inboxes: HashMap<String, mpsc::Sender<WorkerTask>>,
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route tasks for `worker_id` into `inbox`
    pub fn add_worker(&mut self, worker_id: impl Into<String>, inbox: mpsc::Sender<WorkerTask>) {
        self.inboxes.insert(worker_id.into(), inbox);
    }
}

#[async_trait]
impl TaskDispatcher for ChannelDispatcher {
    /// Remote workers registered on the same manager have no inbox here and
    /// are deferred to heartbeat pickup
    async fn dispatch(&self, worker_id: &str, task: WorkerTask) -> Result<Delivery> {
        let Some(inbox) = self.inboxes.get(worker_id) else {
            return Ok(Delivery::Deferred);
        };

        let task_id = task.task_id.clone();
        inbox.send(task).await.map_err(|_| Error::Dispatch {
            task_id,
            worker_id: worker_id.to_string(),
            reason: "worker inbox closed".to_string(),
        })?;
        Ok(Delivery::Delivered)
    }
}

/// A manager plus its in-process workers
pub struct LocalCluster {
    manager: Arc<DistributedCrawlManager>,
    registry: Arc<BackendRegistry>,
    workers: Vec<Arc<CrawlWorker>>,
    loops: JoinSet<()>,
}

impl LocalCluster {
    /// Build the cluster and start every loop
    ///
    /// Worker ids are `{worker.id_prefix}-{n}`, counting from 1.
    ///
    /// # Errors
    ///
    /// Returns an error if more workers are requested than the manager
    /// accepts, or if the config fails validation
    pub fn start(
        config: &Config,
        registry: Arc<BackendRegistry>,
        processor: Option<Arc<dyn DocumentProcessor>>,
    ) -> Result<Self> {
        let limit = config.distributed.max_workers;
        if config.worker.workers > limit {
            return Err(Error::WorkerLimit { limit });
        }
        config.validate().map_err(|e| Error::config(e.to_string()))?;

        let ids: Vec<String> = (1..=config.worker.workers)
            .map(|n| format!("{}-{}", config.worker.id_prefix, n))
            .collect();

        let mut dispatcher = ChannelDispatcher::new();
        let mut inboxes = Vec::with_capacity(ids.len());
        for id in &ids {
            let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
            dispatcher.add_worker(id.clone(), tx);
            inboxes.push(rx);
        }

        let manager = Arc::new(
            DistributedCrawlManager::new(config.distributed.clone())
                .with_dispatcher(Arc::new(dispatcher)),
        );

        let capabilities: Vec<String> = registry
            .all_backends()
            .into_iter()
            .map(|summary| summary.name)
            .collect();

        let mut workers = Vec::with_capacity(ids.len());
        let mut loops = JoinSet::new();

        for (id, mut inbox) in ids.into_iter().zip(inboxes) {
            let sink = Arc::clone(&manager);
            let mut worker = CrawlWorker::from_config(id.clone(), Arc::clone(&registry), config)
                .with_shared_registry()
                .with_heartbeat_callback(Arc::new(move |heartbeat: WorkerHeartbeat| {
                    sink.update_worker_heartbeat(&heartbeat);
                }));
            if let Some(processor) = &processor {
                worker = worker.with_processor(Arc::clone(processor));
            }
            let worker = Arc::new(worker);

            manager.register_worker(WorkerInfo::new(&id).with_capabilities(capabilities.clone()))?;
            worker.start_heartbeat();

            let task_worker = Arc::clone(&worker);
            let results = Arc::clone(&manager);
            loops.spawn(async move {
                while let Some(task) = inbox.recv().await {
                    let result = task_worker.process_task(task).await;
                    results.complete_task(result);
                }
                debug!(worker_id = %task_worker.worker_id(), "Worker inbox closed");
            });

            workers.push(worker);
        }

        manager.start();
        info!(workers = workers.len(), "Local cluster started");

        Ok(Self {
            manager,
            registry,
            workers,
            loops,
        })
    }

    pub fn manager(&self) -> &Arc<DistributedCrawlManager> {
        &self.manager
    }

    pub fn workers(&self) -> &[Arc<CrawlWorker>] {
        &self.workers
    }

    /// Queue a task on the manager
    pub fn submit(&self, task: WorkerTask) -> Result<()> {
        self.manager.add_task(task)
    }

    /// Wait until no task is pending or running
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_until_idle(&self, poll: Duration, timeout: Option<Duration>) -> bool {
        let wait = async {
            while !self.manager.is_idle() {
                tokio::time::sleep(poll).await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    /// Stop the manager loops, then every worker, then close the backends
    pub async fn shutdown(mut self) -> ManagerStatus {
        self.manager.shutdown().await;

        self.loops.abort_all();
        while self.loops.join_next().await.is_some() {}

        for worker in &self.workers {
            worker.shutdown().await;
        }
        self.registry.close_all().await;

        let status = self.manager.get_status();
        info!(
            completed = status.completed_tasks,
            failed = status.failed_tasks,
            pending = status.pending_tasks,
            "Local cluster stopped"
        );
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_to_unknown_worker_is_deferred() {
        let dispatcher = ChannelDispatcher::new();
        let delivery = dispatcher
            .dispatch("remote-a", WorkerTask::new("https://a.test/", 1))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Deferred);
    }

    #[tokio::test]
    async fn test_dispatch_to_closed_inbox() {
        let mut dispatcher = ChannelDispatcher::new();
        let (tx, rx) = mpsc::channel(1);
        dispatcher.add_worker("w1", tx);
        drop(rx);

        let err = dispatcher
            .dispatch("w1", WorkerTask::new("https://a.test/", 1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("worker inbox closed"));
    }

    #[tokio::test]
    async fn test_dispatch_delivers_task() {
        let mut dispatcher = ChannelDispatcher::new();
        let (tx, mut rx) = mpsc::channel(1);
        dispatcher.add_worker("w1", tx);

        let task = WorkerTask::new("https://a.test/", 1);
        let delivery = dispatcher.dispatch("w1", task.clone()).await.unwrap();
        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(rx.recv().await.unwrap().task_id, task.task_id);
    }
}
