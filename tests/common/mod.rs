//! Shared fixtures for the integration tests: a temporary SQLite-backed
//! pipeline and a scripted LLM provider.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use easy_dataset::config::GenerationConfig;
use easy_dataset::db;
use easy_dataset::generators::{self, GeneratorEnv};
use easy_dataset::ingest::FileProcessor;
use easy_dataset::llm::rate_limit::RateLimiter;
use easy_dataset::llm::retry::RetryPolicy;
use easy_dataset::llm::service::LlmService;
use easy_dataset::llm::{
    Capability, Completion, GenerationParams, LlmProvider, Message, ProviderRegistry, Usage,
};
use easy_dataset::migrate;
use easy_dataset::processors::ProcessorRegistry;
use easy_dataset::sqlite_store::SqliteStore;
use easy_dataset::storage::FileStorage;
use easy_dataset::tasks::{EngineConfig, TaskEngine};
use easy_dataset_core::chunk::ChunkerConfig;
use easy_dataset_core::models::{Project, Task};
use easy_dataset_core::store::Store;
use easy_dataset_core::{PipelineError, PipelineResult};

pub const POLL: Duration = Duration::from_millis(20);

/// Answers question prompts with numbered questions and answer prompts
/// with a fixed sentence. Queued failures are returned first.
pub struct MockProvider {
    failures: Mutex<VecDeque<PipelineError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Self::slow(Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(VecDeque::new()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn fail_next(&self, error: PipelineError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn rate_limited() -> PipelineError {
    PipelineError::Transient {
        provider: "mock".into(),
        message: "HTTP 429 Too Many Requests".into(),
        retry_after: None,
    }
}

fn reply_to(prompt: &str) -> String {
    if prompt.contains("Question Generation Expert") {
        let n: usize = prompt
            .split("exactly ")
            .nth(1)
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);
        // Name the first paragraph of the chunk so questions differ across chunks.
        let paragraph = prompt
            .split("Paragraph ")
            .nth(1)
            .and_then(|s| s.get(..2))
            .unwrap_or("??");
        let questions: Vec<String> = (0..n)
            .map(|i| format!("What does paragraph {} say in part {}?", paragraph, i))
            .collect();
        json!({ "questions": questions }).to_string()
    } else if prompt.contains("Grounded Answer Writer") {
        "<think>find the sentence</think>It covers the numbered paragraphs.".to_string()
    } else {
        "{}".to_string()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn kind(&self) -> &str {
        "mock"
    }

    fn supports(&self, capability: Capability) -> bool {
        capability == Capability::Complete
    }

    async fn complete(
        &self,
        messages: &[Message],
        _params: &GenerationParams,
    ) -> PipelineResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        let (text, reasoning) = easy_dataset::llm::split_reasoning(&reply_to(prompt));
        Ok(Completion {
            text,
            reasoning,
            usage: Usage::new(30, 12),
            ..Default::default()
        })
    }
}

/// A pipeline over a temporary SQLite database and upload directory.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<dyn Store>,
    pub storage: FileStorage,
    pub files: FileProcessor,
    pub env: GeneratorEnv,
    pub engine: TaskEngine,
    pub project: Project,
}

impl Harness {
    pub async fn new(provider: Arc<MockProvider>) -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("eds.sqlite").display());
        let pool = db::connect_url(&url).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

        let processors = Arc::new(ProcessorRegistry::with_builtins());
        let storage = FileStorage::new(
            dir.path().join("uploads"),
            10 * 1024 * 1024,
            store.clone(),
            processors.clone(),
        );
        let files = FileProcessor::new(store.clone(), processors, ChunkerConfig::default());

        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        let retry = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            max_attempts: 5,
        };
        let llm = Arc::new(LlmService::new(
            registry,
            store.clone(),
            RateLimiter::unlimited(),
            retry,
        ));
        let settings = GenerationConfig {
            provider: Some("mock".into()),
            model: Some("m1".into()),
            ..GenerationConfig::default()
        };
        let env = GeneratorEnv::new(llm, store.clone(), settings);

        let config = EngineConfig {
            workers: 2,
            task_timeout: Duration::from_secs(60),
            queue_capacity: 100,
            progress_interval: Duration::ZERO,
            poll_interval: Duration::from_millis(50),
            adopt_store_tasks: false,
        };
        let engine = TaskEngine::with_handlers(
            store.clone(),
            config,
            generators::task_handlers(env.clone(), files.clone()),
        );

        let project = Project::new("handbook", "integration fixture");
        store.create_project(&project).await.unwrap();

        Self {
            dir,
            store,
            storage,
            files,
            env,
            engine,
            project,
        }
    }

    /// Write a file into the temp directory and return its path.
    pub fn write(&self, name: &str, body: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir.path().join("incoming").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        path
    }

    pub async fn wait(&self, task: &Task) -> Task {
        tokio::time::timeout(Duration::from_secs(30), self.engine.wait(&task.id, POLL))
            .await
            .expect("task did not settle in time")
            .unwrap()
    }
}

/// 32 paragraphs of exactly 256 bytes each (8 KiB total).
pub fn eight_kib_text() -> String {
    let mut text = String::new();
    for i in 0..32 {
        let mut para = format!("Paragraph {:02} talks about topic {}. ", i, i % 7);
        while para.len() < 254 {
            para.push_str("word ");
        }
        para.truncate(253);
        para.push('.');
        para.push_str("\n\n");
        text.push_str(&para);
    }
    text
}
