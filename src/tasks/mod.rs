//! Background task execution.
//!
//! Every long-running pipeline operation (file processing and the six
//! generators) runs as a persisted [`Task`]. Callers submit a
//! [`JobRequest`] to the [`TaskEngine`], get the task id back at once, and
//! poll the store for progress. Workers pull from a per-project fair queue
//! and hand each task to the [`TaskHandler`] registered for its type.
//!
//! ```text
//! submit ──▶ queued ──▶ running ──┬──▶ succeeded
//!              │                  ├──▶ failed      (error, timeout, restart)
//!              └──────────────────┴──▶ cancelled   (operator request)
//! ```
//!
//! Handlers are cooperative. They call [`TaskContext::checkpoint`] between
//! units of work, which is where an operator cancel (local flag or the
//! persisted `cancel_requested` column) is observed, and
//! [`TaskContext::advance`] after each completed unit, which records the
//! `resume_from` cursor and throttles progress writes.

pub mod engine;
pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use easy_dataset_core::error::{PipelineError, PipelineResult};
use easy_dataset_core::models::{Task, TaskPatch, TaskType};
use easy_dataset_core::store::Store;

pub use engine::{EngineConfig, RecoveryReport, TaskEngine};

/// How often a running task re-reads its row to notice a cancel issued
/// from another process.
const CANCEL_POLL: Duration = Duration::from_millis(500);

// ═══════════════════════════════════════════════════════════════════════
// Cancellation
// ═══════════════════════════════════════════════════════════════════════

/// A shared, one-way cancel signal.
///
/// Cloning shares the flag. Once set it stays set.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> PipelineResult<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the flag is set.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelFlag")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Jobs and handlers
// ═══════════════════════════════════════════════════════════════════════

/// What a caller submits to the engine.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub task_type: TaskType,
    pub project_id: String,
    /// File, dataset, or other entity the job works on. Two jobs with the
    /// same `(project, type, target)` never run at the same time.
    pub target_id: Option<String>,
    pub payload: Value,
}

impl JobRequest {
    pub fn new(task_type: TaskType, project_id: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type,
            project_id: project_id.into(),
            target_id: None,
            payload,
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }
}

/// Executes one task type.
///
/// The returned value becomes the task's `result`. Returning
/// [`PipelineError::Cancelled`] marks the task cancelled; any other error
/// marks it failed.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &mut TaskContext) -> PipelineResult<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// Per-task context
// ═══════════════════════════════════════════════════════════════════════

/// Handle a running task uses to report progress and observe cancellation.
pub struct TaskContext {
    task: Task,
    store: Arc<dyn Store>,
    cancel: CancelFlag,
    progress_interval: Duration,
    last_write: Instant,
    last_poll: Instant,
    dirty: bool,
}

impl TaskContext {
    pub fn new(
        task: Task,
        store: Arc<dyn Store>,
        cancel: CancelFlag,
        progress_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            task,
            store,
            cancel,
            progress_interval,
            last_write: now,
            last_poll: now,
            dirty: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn project_id(&self) -> &str {
        &self.task.project_id
    }

    pub fn target_id(&self) -> Option<&str> {
        self.task.target_id.as_deref()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Deserialize the task payload into the handler's parameter type.
    pub fn params<T: DeserializeOwned>(&self) -> PipelineResult<T> {
        serde_json::from_value(self.task.payload.clone()).map_err(|e| {
            PipelineError::validation(format!(
                "invalid {} payload: {}",
                self.task.task_type.as_str(),
                e
            ))
        })
    }

    /// Last completed ordinal recorded by a previous run.
    pub fn resume_from(&self) -> Option<i64> {
        self.task.resume_from()
    }

    /// Named stage recorded by a previous run (file processing).
    pub fn resume_stage(&self) -> Option<&str> {
        self.task.payload.get("resume_from").and_then(Value::as_str)
    }

    pub fn completed_units(&self) -> u64 {
        self.task.completed_units
    }

    pub fn total_units(&self) -> u64 {
        self.task.total_units
    }

    pub fn progress(&self) -> f64 {
        if self.task.total_units == 0 {
            0.0
        } else {
            (self.task.completed_units as f64 / self.task.total_units as f64).min(1.0)
        }
    }

    /// Cancellation checkpoint.
    ///
    /// Fails with [`PipelineError::Cancelled`] when the local flag is set or,
    /// at most every half second, when the persisted row carries a cancel
    /// request.
    pub async fn checkpoint(&mut self) -> PipelineResult<()> {
        self.cancel.check()?;
        if self.last_poll.elapsed() >= CANCEL_POLL {
            self.last_poll = Instant::now();
            if let Some(row) = self.store.get_task(&self.task.id).await? {
                if row.cancel_requested {
                    debug!(task_id = %self.task.id, "cancel request observed");
                    self.cancel.cancel();
                }
            }
        }
        self.cancel.check()
    }

    /// Declare the number of units and persist it.
    pub async fn set_total(&mut self, total: u64) -> PipelineResult<()> {
        self.task.total_units = total;
        if self.task.completed_units > total {
            self.task.completed_units = total;
        }
        self.dirty = true;
        self.flush().await
    }

    /// Units already done before this run started (resume).
    pub fn set_completed(&mut self, completed: u64) {
        self.task.completed_units = completed;
        self.dirty = true;
    }

    /// Record one completed unit and its resume cursor.
    ///
    /// Progress is written when `progress_interval` has passed since the
    /// last write or when the final unit completes.
    pub async fn advance(&mut self, cursor: impl Into<Value>) -> PipelineResult<()> {
        self.task.completed_units += 1;
        self.set_cursor(cursor.into());
        let last_unit = self.task.completed_units >= self.task.total_units;
        if last_unit || self.last_write.elapsed() >= self.progress_interval {
            self.flush().await?;
        }
        Ok(())
    }

    /// Record a named stage as the resume cursor and persist it now.
    pub async fn reach_stage(&mut self, stage: &str) -> PipelineResult<()> {
        self.set_cursor(Value::String(stage.to_string()));
        self.flush().await
    }

    fn set_cursor(&mut self, cursor: Value) {
        if !self.task.payload.is_object() {
            self.task.payload = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut self.task.payload {
            map.insert("resume_from".to_string(), cursor);
        }
        self.dirty = true;
    }

    /// Replace the payload (keeping any resume cursor) and persist it.
    ///
    /// Handlers use this to pin a target list resolved on the first run.
    pub async fn freeze_payload(&mut self, payload: Value) -> PipelineResult<()> {
        let cursor = self.task.payload.get("resume_from").cloned();
        self.task.payload = payload;
        if let Some(cursor) = cursor {
            self.set_cursor(cursor);
        }
        self.dirty = true;
        self.flush().await
    }

    /// Write pending progress, if any.
    pub async fn flush(&mut self) -> PipelineResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let patch = TaskPatch {
            progress: Some(self.progress()),
            completed_units: Some(self.task.completed_units),
            total_units: Some(self.task.total_units),
            payload: Some(self.task.payload.clone()),
            ..Default::default()
        };
        self.store.update_task_progress(&self.task.id, patch).await?;
        self.last_write = Instant::now();
        self.dirty = false;
        Ok(())
    }
}
