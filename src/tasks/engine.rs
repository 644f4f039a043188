//! The worker pool.
//!
//! A [`TaskEngine`] owns the fair queue and a fixed number of workers.
//! Every state change goes through the store's compare-and-set
//! transitions, so several engines (a waiting CLI command and an
//! `eds worker` process) can share one database without running a task
//! twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use easy_dataset_core::error::{PipelineError, PipelineResult};
use easy_dataset_core::models::{Task, TaskPatch, TaskStatus, TaskType};
use easy_dataset_core::store::{Store, TaskQuery};

use super::queue::{FairQueue, QueueEntry};
use super::{CancelFlag, JobRequest, TaskContext, TaskHandler};
use crate::config::TasksConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub task_timeout: Duration,
    /// Maximum number of queued tasks before submissions fail with `QueueFull`.
    pub queue_capacity: usize,
    pub progress_interval: Duration,
    /// Idle workers re-check the store this often.
    pub poll_interval: Duration,
    /// Pick up queued tasks submitted by other processes.
    pub adopt_store_tasks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&TasksConfig::default())
    }
}

impl From<&TasksConfig> for EngineConfig {
    fn from(c: &TasksConfig) -> Self {
        Self {
            workers: c.max_concurrent_tasks.max(1),
            task_timeout: Duration::from_secs(c.task_timeout),
            queue_capacity: c.queue_capacity,
            progress_interval: Duration::from_millis(c.progress_interval_ms),
            poll_interval: Duration::from_secs(1),
            adopt_store_tasks: true,
        }
    }
}

/// Outcome of [`TaskEngine::recover`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    config: EngineConfig,
    queue: Mutex<FairQueue>,
    wake: Notify,
    running: Mutex<HashMap<String, CancelFlag>>,
    shutdown: CancelFlag,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self::with_handlers(store, config, HashMap::new())
    }

    pub fn with_handlers(
        store: Arc<dyn Store>,
        config: EngineConfig,
        handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                handlers,
                config,
                queue: Mutex::new(FairQueue::new()),
                wake: Notify::new(),
                running: Mutex::new(HashMap::new()),
                shutdown: CancelFlag::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn handles(&self, task_type: TaskType) -> bool {
        self.inner.handlers.contains_key(&task_type)
    }

    /// Persist a new `queued` task and wake a worker.
    pub async fn submit(&self, request: JobRequest) -> PipelineResult<Task> {
        let store = &self.inner.store;
        if store.get_project(&request.project_id).await?.is_none() {
            return Err(PipelineError::not_found("project", &request.project_id));
        }
        if !self.handles(request.task_type) {
            return Err(PipelineError::validation(format!(
                "no handler registered for {}",
                request.task_type.as_str()
            )));
        }
        let depth = store
            .list_tasks(&TaskQuery::status(TaskStatus::Queued))
            .await?
            .len();
        if depth >= self.inner.config.queue_capacity {
            warn!(depth, "task queue is full");
            return Err(PipelineError::QueueFull(depth));
        }

        let task = Task::new(
            &request.project_id,
            request.task_type,
            request.target_id,
            request.payload,
        );
        store.insert_task(&task).await?;
        self.inner.enqueue(&task);
        info!(
            task_id = %task.id,
            task_type = task.task_type.as_str(),
            project_id = %task.project_id,
            "task queued"
        );
        Ok(task)
    }

    /// Operator cancel. Queued tasks are cancelled at once; running tasks
    /// stop at their next checkpoint.
    pub async fn cancel(&self, task_id: &str) -> PipelineResult<Task> {
        let task = self.inner.store.request_cancel(task_id).await?;
        match task.status {
            TaskStatus::Cancelled => {
                self.inner.lock_queue().remove(task_id);
            }
            _ => {
                if let Some(flag) = self.inner.lock_running().get(task_id) {
                    flag.cancel();
                }
            }
        }
        info!(task_id, status = task.status.as_str(), "cancel requested");
        Ok(task)
    }

    /// Settle tasks left `running` by a previous process, then load the
    /// queued backlog in submission order.
    pub async fn recover(&self) -> PipelineResult<RecoveryReport> {
        let store = &self.inner.store;
        let mut report = RecoveryReport::default();
        for task in store
            .list_tasks(&TaskQuery::status(TaskStatus::Running))
            .await?
        {
            if self.inner.lock_running().contains_key(&task.id) {
                continue;
            }
            if task.task_type.is_resumable() && !task.cancel_requested {
                store
                    .transition_task(
                        &task.id,
                        &[TaskStatus::Running],
                        TaskStatus::Queued,
                        TaskPatch::default(),
                    )
                    .await?;
                info!(task_id = %task.id, resume_from = ?task.payload.get("resume_from"), "re-queued interrupted task");
                report.requeued.push(task.id);
            } else {
                let (to, err) = if task.cancel_requested {
                    (TaskStatus::Cancelled, PipelineError::Cancelled)
                } else {
                    (TaskStatus::Failed, PipelineError::InterruptedByRestart)
                };
                let patch = TaskPatch {
                    error: Some(err.view().with_task(&task.id)),
                    ..Default::default()
                };
                store
                    .transition_task(&task.id, &[TaskStatus::Running], to, patch)
                    .await?;
                warn!(task_id = %task.id, status = to.as_str(), "settled interrupted task");
                report.failed.push(task.id);
            }
        }
        self.inner.refill().await?;
        Ok(report)
    }

    /// Spawn the worker pool. Calling it twice has no effect.
    pub fn start(&self) {
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            return;
        }
        for n in 0..self.inner.config.workers {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move { inner.worker_loop(n).await }));
        }
        info!(workers = self.inner.config.workers, "task engine started");
    }

    /// Stop accepting work, signal running tasks, and wait for workers.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for flag in self.inner.lock_running().values() {
            flag.cancel();
        }
        self.inner.wake.notify_waiters();
        let handles: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker exited abnormally");
            }
        }
        info!("task engine stopped");
    }

    /// Poll the store until the task reaches a terminal state.
    pub async fn wait(&self, task_id: &str, poll: Duration) -> PipelineResult<Task> {
        loop {
            let task = self
                .inner
                .store
                .get_task(task_id)
                .await?
                .ok_or_else(|| PipelineError::not_found("task", task_id))?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock_queue().len()
    }

    pub fn running(&self) -> Vec<String> {
        self.inner.lock_running().keys().cloned().collect()
    }
}

impl Inner {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, FairQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelFlag>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, task: &Task) {
        if self
            .lock_queue()
            .push(QueueEntry::new(&task.id, &task.project_id))
        {
            self.wake.notify_one();
        }
    }

    /// Load queued tasks from the store that this engine does not know yet.
    async fn refill(&self) -> PipelineResult<()> {
        let queued = self
            .store
            .list_tasks(&TaskQuery::status(TaskStatus::Queued))
            .await?;
        for task in queued
            .iter()
            .filter(|t| self.handlers.contains_key(&t.task_type))
        {
            self.enqueue(task);
        }
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let next = self.lock_queue().pop();
            match next {
                Some(entry) => self.dispatch(entry).await,
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {
                            if self.config.adopt_store_tasks {
                                if let Err(e) = self.refill().await {
                                    warn!(worker, error = %e, "failed to poll queued tasks");
                                }
                            }
                        }
                    }
                }
            }
        }
        debug!(worker, "worker stopped");
    }

    async fn dispatch(&self, entry: QueueEntry) {
        let task = match self.store.start_task(&entry.task_id).await {
            Ok(task) => task,
            Err(PipelineError::Conflict(reason)) => {
                self.defer(entry, reason).await;
                return;
            }
            Err(e) => {
                error!(task_id = %entry.task_id, error = %e, "failed to start task");
                self.lock_queue().forget(&entry.task_id);
                return;
            }
        };
        let id = task.id.clone();
        self.execute(task).await;
        self.lock_running().remove(&id);
        self.lock_queue().forget(&id);
        self.wake.notify_waiters();
    }

    /// A start conflict means either the task is no longer queued (another
    /// engine took it, or it was cancelled) or a sibling on the same target
    /// is still running. Only the latter is retried.
    async fn defer(&self, entry: QueueEntry, reason: String) {
        let still_queued = matches!(
            self.store.get_task(&entry.task_id).await,
            Ok(Some(t)) if t.status == TaskStatus::Queued
        );
        if !still_queued {
            debug!(task_id = %entry.task_id, %reason, "dropping task that is no longer queued");
            self.lock_queue().forget(&entry.task_id);
            return;
        }
        debug!(task_id = %entry.task_id, %reason, "deferring task");
        self.lock_queue().push_front(entry);
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    async fn execute(&self, task: Task) {
        let id = task.id.clone();
        let task_type = task.task_type;
        let Some(handler) = self.handlers.get(&task_type).cloned() else {
            let err = PipelineError::validation(format!(
                "no handler registered for {}",
                task_type.as_str()
            ));
            self.finish(&id, Err(err), false).await;
            return;
        };

        let cancel = CancelFlag::new();
        if task.cancel_requested {
            cancel.cancel();
        }
        self.lock_running().insert(id.clone(), cancel.clone());
        info!(task_id = %id, task_type = task_type.as_str(), project_id = %task.project_id, "task started");

        let mut ctx = TaskContext::new(
            task,
            self.store.clone(),
            cancel.clone(),
            self.config.progress_interval,
        );
        let mut job = tokio::spawn(async move {
            let outcome = handler.run(&mut ctx).await;
            if let Err(e) = ctx.flush().await {
                warn!(task_id = %ctx.id(), error = %e, "failed to flush progress");
            }
            outcome
        });

        let timeout = self.config.task_timeout;
        let outcome = match tokio::time::timeout(timeout, &mut job).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(PipelineError::Storage(format!("task panicked: {}", join))),
            Err(_) => {
                cancel.cancel();
                job.abort();
                Err(PipelineError::Timeout(timeout.as_secs()))
            }
        };
        let cancelled = cancel.is_cancelled();
        self.finish(&id, outcome, cancelled).await;
    }

    async fn finish(&self, id: &str, outcome: PipelineResult<Value>, cancelled: bool) {
        let (to, patch) = match outcome {
            Ok(result) => (
                TaskStatus::Succeeded,
                TaskPatch {
                    progress: Some(1.0),
                    result: Some(result),
                    ..Default::default()
                },
            ),
            Err(e) => {
                let to = match &e {
                    PipelineError::Cancelled => TaskStatus::Cancelled,
                    PipelineError::Timeout(_) => TaskStatus::Failed,
                    _ if cancelled => TaskStatus::Cancelled,
                    _ => TaskStatus::Failed,
                };
                let err = if to == TaskStatus::Cancelled {
                    PipelineError::Cancelled
                } else {
                    e
                };
                (
                    to,
                    TaskPatch {
                        error: Some(err.view().with_task(id)),
                        ..Default::default()
                    },
                )
            }
        };
        match self
            .store
            .transition_task(id, &[TaskStatus::Running], to, patch)
            .await
        {
            Ok(task) => match to {
                TaskStatus::Succeeded => info!(task_id = id, "task succeeded"),
                TaskStatus::Cancelled => info!(task_id = id, completed = task.completed_units, "task cancelled"),
                _ => warn!(
                    task_id = id,
                    error = task.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                    "task failed"
                ),
            },
            Err(e) => error!(task_id = id, error = %e, "failed to record task outcome"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use easy_dataset_core::error::ErrorKind;
    use easy_dataset_core::models::Project;
    use easy_dataset_core::store::memory::InMemoryStore;
    use serde_json::json;

    /// Completes `units` units, sleeping `step` before each.
    struct Counting {
        step: Duration,
    }

    #[async_trait]
    impl TaskHandler for Counting {
        async fn run(&self, ctx: &mut TaskContext) -> PipelineResult<Value> {
            let units = ctx.task().payload["units"].as_u64().unwrap_or(3);
            let start = ctx.resume_from().map(|c| c as u64 + 1).unwrap_or(0);
            ctx.set_total(units).await?;
            ctx.set_completed(start);
            for n in start..units {
                ctx.checkpoint().await?;
                tokio::time::sleep(self.step).await;
                ctx.advance(n as i64).await?;
            }
            Ok(json!({ "started_at": start, "units": units }))
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskHandler for Failing {
        async fn run(&self, _ctx: &mut TaskContext) -> PipelineResult<Value> {
            Err(PipelineError::Permanent {
                provider: "mock".into(),
                message: "bad request".into(),
            })
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            workers: 2,
            task_timeout: Duration::from_secs(30),
            queue_capacity: 10,
            progress_interval: Duration::ZERO,
            poll_interval: Duration::from_millis(20),
            adopt_store_tasks: true,
        }
    }

    async fn engine(step: Duration, config: EngineConfig) -> (TaskEngine, String) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let project = Project::new("demo", "");
        store.create_project(&project).await.unwrap();
        let mut handlers: HashMap<TaskType, Arc<dyn TaskHandler>> = HashMap::new();
        handlers.insert(TaskType::QuestionGeneration, Arc::new(Counting { step }));
        handlers.insert(TaskType::DataCleaning, Arc::new(Failing));
        (TaskEngine::with_handlers(store, config, handlers), project.id)
    }

    fn job(project: &str, units: u64) -> JobRequest {
        JobRequest::new(TaskType::QuestionGeneration, project, json!({ "units": units }))
    }

    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn submitted_task_runs_to_success() {
        let (engine, project) = engine(Duration::ZERO, config()).await;
        engine.start();
        let task = engine.submit(job(&project, 4)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        let done = engine.wait(&task.id, POLL).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.completed_units, 4);
        assert_eq!(done.result.unwrap()["units"], 4);
        assert!((done.progress - 1.0).abs() < 1e-9);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn handler_error_fails_task_with_view() {
        let (engine, project) = engine(Duration::ZERO, config()).await;
        engine.start();
        let task = engine
            .submit(JobRequest::new(TaskType::DataCleaning, &project, json!({})))
            .await
            .unwrap();
        let done = engine.wait(&task.id, POLL).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        let err = done.error.unwrap();
        assert_eq!(err.kind, ErrorKind::Permanent);
        assert_eq!(err.task_id.as_deref(), Some(task.id.as_str()));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_project_and_unhandled_type_are_rejected() {
        let (engine, project) = engine(Duration::ZERO, config()).await;
        let err = engine.submit(job("nope", 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = engine
            .submit(JobRequest::new(TaskType::DatasetEvaluation, &project, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn full_queue_rejects_submissions() {
        let mut cfg = config();
        cfg.queue_capacity = 2;
        let (engine, project) = engine(Duration::ZERO, cfg).await;
        engine.submit(job(&project, 1)).await.unwrap();
        engine.submit(job(&project, 1)).await.unwrap();
        let err = engine.submit(job(&project, 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueFull);
        assert_eq!(engine.queue_depth(), 2);
    }

    #[tokio::test]
    async fn cancel_queued_task_never_runs() {
        let (engine, project) = engine(Duration::ZERO, config()).await;
        let task = engine.submit(job(&project, 2)).await.unwrap();
        let cancelled = engine.cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(engine.queue_depth(), 0);
        engine.start();
        let done = engine.wait(&task.id, POLL).await.unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);
        assert!(done.started_at.is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_running_task_stops_at_checkpoint() {
        let (engine, project) = engine(Duration::from_millis(50), config()).await;
        engine.start();
        let task = engine.submit(job(&project, 100)).await.unwrap();
        loop {
            let t = engine.store().get_task(&task.id).await.unwrap().unwrap();
            if t.completed_units >= 2 {
                break;
            }
            tokio::time::sleep(POLL).await;
        }
        engine.cancel(&task.id).await.unwrap();
        let done = engine.wait(&task.id, POLL).await.unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);
        assert!(done.completed_units < 100);
        assert_eq!(done.error.unwrap().kind, ErrorKind::Cancelled);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_fails_task() {
        let mut cfg = config();
        cfg.task_timeout = Duration::from_millis(100);
        let (engine, project) = engine(Duration::from_millis(50), cfg).await;
        engine.start();
        let task = engine.submit(job(&project, 100)).await.unwrap();
        let done = engine.wait(&task.id, POLL).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.unwrap().kind, ErrorKind::Timeout);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn recover_requeues_resumable_and_fails_others() {
        let (engine, project) = engine(Duration::ZERO, config()).await;
        let store = engine.store().clone();

        let mut resumable = Task::new(&project, TaskType::QuestionGeneration, None, json!({ "units": 5 }));
        resumable.target_id = Some("f1".into());
        store.insert_task(&resumable).await.unwrap();
        store.start_task(&resumable.id).await.unwrap();
        store
            .update_task_progress(
                &resumable.id,
                TaskPatch {
                    completed_units: Some(3),
                    payload: Some(json!({ "units": 5, "resume_from": 2 })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let other = Task::new(&project, TaskType::DataCleaning, None, json!({}));
        store.insert_task(&other).await.unwrap();
        store.start_task(&other.id).await.unwrap();

        let report = engine.recover().await.unwrap();
        assert_eq!(report.requeued, vec![resumable.id.clone()]);
        assert_eq!(report.failed, vec![other.id.clone()]);
        let failed = store.get_task(&other.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.unwrap().kind, ErrorKind::InterruptedByRestart);

        engine.start();
        let done = engine.wait(&resumable.id, POLL).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.result.unwrap()["started_at"], 3, "resumed after the cursor");
        assert_eq!(done.completed_units, 5);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn same_target_tasks_run_one_at_a_time() {
        let (engine, project) = engine(Duration::from_millis(20), config()).await;
        engine.start();
        let a = engine.submit(job(&project, 3).with_target("file")).await.unwrap();
        let b = engine.submit(job(&project, 3).with_target("file")).await.unwrap();
        let a = engine.wait(&a.id, POLL).await.unwrap();
        let b = engine.wait(&b.id, POLL).await.unwrap();
        assert_eq!(a.status, TaskStatus::Succeeded);
        assert_eq!(b.status, TaskStatus::Succeeded);
        assert!(b.started_at.unwrap() >= a.finished_at.unwrap());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn tasks_from_other_processes_are_adopted() {
        let (engine, project) = engine(Duration::ZERO, config()).await;
        let task = Task::new(&project, TaskType::QuestionGeneration, None, json!({ "units": 1 }));
        engine.store().insert_task(&task).await.unwrap();
        engine.start();
        let done = engine.wait(&task.id, POLL).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        engine.shutdown().await;
    }
}
