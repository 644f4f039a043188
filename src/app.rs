//! Process-wide wiring shared by the CLI commands.
//!
//! [`App::open`] connects the database, applies the schema, builds the
//! provider registry and LLM service, and assembles a [`TaskEngine`] with
//! a handler for every task type. Only the provider connection pools and
//! the rate limiter are shared across tasks; everything else is per task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use easy_dataset_core::models::Task;
use easy_dataset_core::store::Store;

use crate::config::Config;
use crate::dataset::DatasetAssembler;
use crate::db;
use crate::generators::{self, GeneratorEnv};
use crate::ingest::FileProcessor;
use crate::llm::service::LlmService;
use crate::llm::ProviderRegistry;
use crate::migrate;
use crate::processors::ProcessorRegistry;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::sqlite_store::SqliteStore;
use crate::storage::FileStorage;
use crate::tasks::{EngineConfig, JobRequest, TaskEngine};

/// How often a waiting command re-reads its task.
const WAIT_POLL: Duration = Duration::from_millis(500);

/// Whether the engine picks up tasks queued by other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Run only what this process submits (one-shot CLI commands).
    Inline,
    /// Recover interrupted tasks and drain the shared queue (`eds worker`).
    Worker,
}

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: Arc<dyn Store>,
    pub storage: FileStorage,
    pub files: FileProcessor,
    pub llm: Arc<LlmService>,
    pub generators: GeneratorEnv,
    pub engine: TaskEngine,
    pub datasets: DatasetAssembler,
}

impl App {
    pub async fn open(config: Config, mode: EngineMode) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply_schema(&pool)
            .await
            .context("Failed to apply database schema")?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));

        let processors = Arc::new(ProcessorRegistry::with_builtins());
        let storage = FileStorage::new(
            config.app.upload_dir.clone(),
            config.app.max_upload_size,
            store.clone(),
            processors.clone(),
        );
        let files = FileProcessor::new(store.clone(), processors, config.chunking.clone());

        let registry = ProviderRegistry::from_config(&config)?;
        let llm = Arc::new(LlmService::from_config(&config, registry, store.clone()));
        let generators = GeneratorEnv::new(llm.clone(), store.clone(), config.generation.clone());

        let mut engine_config = EngineConfig::from(&config.tasks);
        engine_config.adopt_store_tasks = mode == EngineMode::Worker;
        let engine = TaskEngine::with_handlers(
            store.clone(),
            engine_config,
            generators::task_handlers(generators.clone(), files.clone()),
        );

        Ok(Self {
            datasets: DatasetAssembler::new(store.clone()),
            config,
            pool,
            store,
            storage,
            files,
            llm,
            generators,
            engine,
        })
    }

    /// Submit a job. Without `detach`, run it here and wait for the end,
    /// reporting progress; Ctrl-C cancels it.
    pub async fn run_job(
        &self,
        request: JobRequest,
        detach: bool,
        reporter: &dyn ProgressReporter,
    ) -> Result<Task> {
        let mut tasks = self.run_jobs(vec![request], detach, reporter).await?;
        tasks.pop().context("no task was submitted")
    }

    /// Submit several jobs at once so the engine can run them side by side,
    /// then wait for each in submission order. Ctrl-C cancels the whole batch.
    pub async fn run_jobs(
        &self,
        requests: Vec<JobRequest>,
        detach: bool,
        reporter: &dyn ProgressReporter,
    ) -> Result<Vec<Task>> {
        if !detach {
            self.engine.start();
        }
        let mut submitted = Vec::with_capacity(requests.len());
        for request in requests {
            submitted.push(self.engine.submit(request).await?);
        }
        if detach {
            return Ok(submitted);
        }

        let mut finished = Vec::with_capacity(submitted.len());
        for task in &submitted {
            match self.watch(&task.id, reporter).await? {
                Some(done) => finished.push(done),
                None => {
                    warn!(tasks = submitted.len(), "interrupted, cancelling tasks");
                    return self.cancel_batch(&submitted, reporter).await;
                }
            }
        }
        Ok(finished)
    }

    /// Poll one task until it ends. `None` means the user pressed Ctrl-C.
    async fn watch(&self, task_id: &str, reporter: &dyn ProgressReporter) -> Result<Option<Task>> {
        let mut last = None;
        loop {
            let current = self
                .store
                .get_task(task_id)
                .await?
                .context("task disappeared while waiting")?;
            let snapshot = (current.status, current.completed_units, current.total_units);
            if last != Some(snapshot) {
                reporter.report(ProgressEvent::from_task(&current));
                last = Some(snapshot);
            }
            if current.status.is_terminal() {
                return Ok(Some(current));
            }
            tokio::select! {
                _ = tokio::time::sleep(WAIT_POLL) => {}
                _ = tokio::signal::ctrl_c() => return Ok(None),
            }
        }
    }

    async fn cancel_batch(
        &self,
        tasks: &[Task],
        reporter: &dyn ProgressReporter,
    ) -> Result<Vec<Task>> {
        for task in tasks {
            // Already-finished tasks reject the request; that is fine.
            if let Err(e) = self.engine.cancel(&task.id).await {
                debug!(task_id = %task.id, error = %e, "cancel skipped");
            }
        }
        let mut settled = Vec::with_capacity(tasks.len());
        for task in tasks {
            let done = self.engine.wait(&task.id, WAIT_POLL).await?;
            reporter.report(ProgressEvent::from_task(&done));
            settled.push(done);
        }
        Ok(settled)
    }

    /// Run the engine until Ctrl-C, resuming interrupted tasks first.
    pub async fn run_worker(&self) -> Result<()> {
        let report = self.engine.recover().await?;
        info!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "recovered tasks"
        );
        self.engine.start();
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("shutting down worker");
        Ok(())
    }

    pub async fn close(self) {
        self.engine.shutdown().await;
        self.pool.close().await;
    }
}
