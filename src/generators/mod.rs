//! Generators: LLM-backed producers of dataset content.
//!
//! Each generator is a [`TaskHandler`] for one task type and also exposes
//! a direct API for callers that do not go through the engine. All of them
//! talk to providers only through the [`LlmService`], fetch prompts by
//! name (and optional pinned version), and stamp a [`Provenance`] on what
//! they write.
//!
//! | Task type | Generator | Writes |
//! |-----------|-----------|--------|
//! | `question_generation` | [`question::QuestionGenerator`] | questions per chunk |
//! | `answer_generation` | [`answer::AnswerGenerator`] | answers on questions |
//! | `data_cleaning` | [`cleaning::Cleaner`] | nothing; edits go in the task result |
//! | `dataset_evaluation` | [`evaluation::Evaluator`] | scores, dataset summary |
//! | `conversation_generation` | [`conversation::ConversationGenerator`] | question conversations |
//!
//! GA-pair generation ([`ga_pair::GaPairGenerator`]) is a single call and
//! runs inline rather than as a task.
//!
//! [`Provenance`]: easy_dataset_core::models::Provenance

pub mod answer;
pub mod cleaning;
pub mod conversation;
pub mod evaluation;
pub mod ga_pair;
pub mod question;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use easy_dataset_core::models::{ModelConfig, TaskType};
use easy_dataset_core::store::Store;
use easy_dataset_core::{PipelineError, PipelineResult};

use crate::config::GenerationConfig;
use crate::ingest::FileProcessor;
use crate::llm::service::LlmService;
use crate::tasks::TaskHandler;

/// Everything a generator needs, shared by all of them.
#[derive(Clone)]
pub struct GeneratorEnv {
    pub llm: Arc<LlmService>,
    pub store: Arc<dyn Store>,
    pub settings: GenerationConfig,
}

impl GeneratorEnv {
    pub fn new(llm: Arc<LlmService>, store: Arc<dyn Store>, settings: GenerationConfig) -> Self {
        Self {
            llm,
            store,
            settings,
        }
    }

    /// Fill in the model and language from configuration where the
    /// request left them out.
    pub fn resolve(&self, choice: &ModelChoice) -> PipelineResult<Resolved> {
        let model = match &choice.model {
            Some(mc) => mc.clone(),
            None => self.settings.model_config().ok_or_else(|| {
                PipelineError::validation(
                    "no model given and [generation] provider/model are not configured",
                )
            })?,
        };
        self.llm.registry().get(&model.provider)?;
        Ok(Resolved {
            model,
            language: choice
                .language
                .clone()
                .unwrap_or_else(|| self.settings.language.clone()),
            prompt_version: choice.prompt_version,
        })
    }
}

/// Model, language, and prompt pin carried in every generator payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Prompt template version; the built-in version when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub model: ModelConfig,
    pub language: String,
    pub prompt_version: Option<u32>,
}

/// One item a generator skipped because of a non-retryable failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: String,
    pub error: easy_dataset_core::ErrorView,
}

/// Failures confined to a single item: the generator records them and
/// moves on. Everything else ends the task.
pub(crate) fn is_item_failure(e: &PipelineError) -> bool {
    matches!(
        e,
        PipelineError::Permanent { .. } | PipelineError::Validation(_)
    )
}

/// Deterministic id for a generated entity, so re-running a step
/// overwrites what it wrote before.
pub(crate) fn stable_id(kind: &str, parts: &[&str]) -> String {
    let name = format!("{}:{}", kind, parts.join("/"));
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Handlers for every task type, ready for
/// [`TaskEngine::with_handlers`](crate::tasks::TaskEngine::with_handlers).
pub fn task_handlers(
    env: GeneratorEnv,
    files: FileProcessor,
) -> HashMap<TaskType, Arc<dyn TaskHandler>> {
    let mut handlers: HashMap<TaskType, Arc<dyn TaskHandler>> = HashMap::new();
    handlers.insert(TaskType::FileProcessing, Arc::new(files));
    handlers.insert(
        TaskType::QuestionGeneration,
        Arc::new(question::QuestionGenerator::new(env.clone())),
    );
    handlers.insert(
        TaskType::AnswerGeneration,
        Arc::new(answer::AnswerGenerator::new(env.clone())),
    );
    handlers.insert(
        TaskType::DataCleaning,
        Arc::new(cleaning::Cleaner::new(env.clone())),
    );
    handlers.insert(
        TaskType::DatasetEvaluation,
        Arc::new(evaluation::Evaluator::new(env.clone())),
    );
    handlers.insert(
        TaskType::ConversationGeneration,
        Arc::new(conversation::ConversationGenerator::new(env)),
    );
    handlers
}

/// Scripted provider shared by the generator tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use easy_dataset_core::chunk::{chunk_document, ChunkerConfig};
    use easy_dataset_core::document::ProcessedDocument;
    use easy_dataset_core::models::{Chunk, ModelConfig, Project, UploadFile};
    use easy_dataset_core::store::memory::InMemoryStore;
    use easy_dataset_core::store::Store;
    use easy_dataset_core::PipelineResult;

    use super::GeneratorEnv;
    use crate::config::GenerationConfig;
    use crate::llm::rate_limit::RateLimiter;
    use crate::llm::retry::RetryPolicy;
    use crate::llm::service::LlmService;
    use crate::llm::{Capability, Completion, GenerationParams, LlmProvider, Message, ProviderRegistry, Usage};

    /// Answers each call with the reply produced by `reply` for its prompt.
    pub struct Scripted {
        replies: Mutex<VecDeque<PipelineResult<String>>>,
        fallback: Box<dyn Fn(&str) -> String + Send + Sync>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        pub fn with(fallback: impl Fn(&str) -> String + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                fallback: Box::new(fallback),
                prompts: Mutex::new(Vec::new()),
            })
        }

        pub fn queue(&self, reply: PipelineResult<String>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            "mock"
        }
        fn kind(&self) -> &str {
            "mock"
        }
        fn supports(&self, c: Capability) -> bool {
            c == Capability::Complete
        }
        async fn complete(
            &self,
            messages: &[Message],
            _params: &GenerationParams,
        ) -> PipelineResult<Completion> {
            let prompt = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.prompts.lock().unwrap().push(prompt.clone());
            let queued = self.replies.lock().unwrap().pop_front();
            let text = match queued {
                Some(reply) => reply?,
                None => (self.fallback)(&prompt),
            };
            let (text, reasoning) = crate::llm::finish_text(&text, None);
            Ok(Completion {
                text,
                reasoning,
                usage: Usage::new(20, 10),
                ..Default::default()
            })
        }
    }

    pub fn env(provider: Arc<Scripted>, store: Arc<dyn Store>) -> GeneratorEnv {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        let retry = RetryPolicy {
            base: std::time::Duration::from_millis(1),
            cap: std::time::Duration::from_millis(5),
            max_attempts: 5,
        };
        let llm = LlmService::new(registry, store.clone(), RateLimiter::unlimited(), retry);
        let settings = GenerationConfig {
            provider: Some("mock".into()),
            model: Some("m1".into()),
            ..GenerationConfig::default()
        };
        GeneratorEnv::new(Arc::new(llm), store, settings)
    }

    pub fn model() -> ModelConfig {
        ModelConfig::new("mock", "m1")
    }

    /// A project with one text file chunked into roughly 2 KB chunks.
    pub async fn seeded(text: &str) -> (Arc<dyn Store>, Project, UploadFile, Vec<Chunk>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let project = Project::new("demo", "");
        store.create_project(&project).await.unwrap();
        let file = UploadFile {
            id: "file-1".into(),
            project_id: project.id.clone(),
            file_name: "notes.txt".into(),
            extension: "txt".into(),
            file_type: "txt".into(),
            stored_path: "/dev/null".into(),
            size: text.len() as u64,
            md5: "0123456789abcdef0123456789abcdef".into(),
            metadata: serde_json::json!({}),
            created_at: chrono::Utc::now(),
        };
        store.insert_file(&file).await.unwrap();
        let doc = ProcessedDocument {
            text: text.to_string(),
            ..Default::default()
        };
        let chunks =
            chunk_document(&project.id, &file.id, "notes", &doc, &ChunkerConfig::default()).unwrap();
        store.replace_chunks(&file.id, &chunks).await.unwrap();
        (store, project, file, chunks)
    }

    /// Filler prose with numbered sentences so chunks differ.
    pub fn prose(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("Sentence number {} describes a fact about the system.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_ids_are_deterministic() {
        assert_eq!(stable_id("q", &["c1", "0"]), stable_id("q", &["c1", "0"]));
        assert_ne!(stable_id("q", &["c1", "0"]), stable_id("q", &["c1", "1"]));
        assert_ne!(stable_id("q", &["c1"]), stable_id("a", &["c1"]));
    }

    #[test]
    fn item_failures_are_permanent_or_validation() {
        assert!(is_item_failure(&PipelineError::validation("x")));
        assert!(!is_item_failure(&PipelineError::Cancelled));
        assert!(!is_item_failure(&PipelineError::Timeout(1)));
    }
}
