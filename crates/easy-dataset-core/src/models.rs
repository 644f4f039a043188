//! Core data model shared by every pipeline stage.
//!
//! The ownership chain is a tree: `Project → UploadFile → Chunk → Question`,
//! with `Dataset` hanging off `Project`. Back-references such as a
//! dataset's question ids are lookups, never ownership edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorView, PipelineError, PipelineResult};

/// Root of tenancy for every other entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

/// A stored upload. `md5` is the dedupe key within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFile {
    pub id: String,
    pub project_id: String,
    pub file_name: String,
    pub extension: String,
    /// Processor tag (`pdf`, `docx`, `epub`, `markdown`, `txt`, or a registered custom tag).
    pub file_type: String,
    pub stored_path: String,
    pub size: u64,
    /// 32 lowercase hex characters.
    pub md5: String,
    /// Metadata enrichment from processing (page count, title, ...).
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// A bounded, offset-anchored slice of a processed document.
///
/// `start_offset..end_offset` is the non-overlapped region of the
/// normalized text. When the chunker runs with overlap, `content`
/// additionally starts with `overlap` bytes taken from the previous chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub project_id: String,
    pub file_id: String,
    pub ordinal: u32,
    pub name: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub overlap: usize,
    pub content: String,
    pub token_estimate: usize,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    /// SHA-256 of `content`, hex encoded.
    pub hash: String,
}

impl Chunk {
    /// The chunk body without the overlap prefix.
    pub fn body(&self) -> &str {
        self.content.get(self.overlap..).unwrap_or(&self.content)
    }

    pub fn len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.start_offset == self.end_offset
    }
}

/// Project-scoped label for chunks and questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub project_id: String,
    pub label: String,
    pub parent_id: Option<String>,
}

/// A (genre, audience) descriptor conditioning question generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaPair {
    pub id: String,
    pub project_id: String,
    pub file_id: Option<String>,
    pub chunk_id: Option<String>,
    /// 1-based position among the pairs generated for the same target.
    pub ordinal: u32,
    pub genre_title: String,
    pub genre_desc: String,
    pub audience_title: String,
    pub audience_desc: String,
    pub active: bool,
}

impl GaPair {
    /// Prompt fragment describing this pair.
    pub fn describe(&self) -> String {
        format!(
            "Genre: {} ({})\nAudience: {} ({})",
            self.genre_title, self.genre_desc, self.audience_title, self.audience_desc
        )
    }
}

/// Who produced a generated artifact, and with which prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub model: String,
    pub prompt: String,
    pub prompt_version: u32,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Rejected,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionStatus::Pending => "pending",
            QuestionStatus::Answered => "answered",
            QuestionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "pending" => Ok(QuestionStatus::Pending),
            "answered" => Ok(QuestionStatus::Answered),
            "rejected" => Ok(QuestionStatus::Rejected),
            other => Err(PipelineError::validation(format!(
                "unknown question status '{}'",
                other
            ))),
        }
    }
}

/// A grounded answer, stored on its question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Reasoning split out of `<think>` blocks, when the model emitted any.
    pub chain_of_thought: Option<String>,
    pub provenance: Provenance,
    /// Evaluation score in `[0, 1]`.
    pub score: Option<f64>,
    pub evaluation: Option<String>,
    /// Provider retries spent producing this answer.
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub project_id: String,
    pub file_id: String,
    pub chunk_id: String,
    /// Position within the chunk's generated set.
    pub ordinal: u32,
    pub text: String,
    pub provenance: Provenance,
    pub tags: Vec<String>,
    pub ga_pair_id: Option<String>,
    pub status: QuestionStatus,
    pub answer: Option<Answer>,
    /// Multi-turn rendition seeded by this question, without a system turn.
    #[serde(default)]
    pub conversation: Option<Vec<Turn>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Which questions a dataset snapshot includes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    Ids { question_ids: Vec<String> },
    Filter(SelectionFilter),
}

/// Filter over a project's answered questions. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionFilter {
    #[serde(default)]
    pub file_ids: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Draft,
    Snapshotted,
    Exported,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Draft => "draft",
            DatasetStatus::Snapshotted => "snapshotted",
            DatasetStatus::Exported => "exported",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "draft" => Ok(DatasetStatus::Draft),
            "snapshotted" => Ok(DatasetStatus::Snapshotted),
            "exported" => Ok(DatasetStatus::Exported),
            other => Err(PipelineError::validation(format!(
                "unknown dataset status '{}'",
                other
            ))),
        }
    }
}

/// Aggregate evaluation statistics persisted on a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub selection: Selection,
    pub status: DatasetStatus,
    pub materialize_ga_pairs: bool,
    pub system_prompt: Option<String>,
    pub snapshot_at: Option<DateTime<Utc>>,
    pub evaluation: Option<EvaluationSummary>,
    pub created_at: DateTime<Utc>,
}

/// One snapshot entry. Text is copied at snapshot time so later edits to
/// the source question never leak into an exported dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConversation {
    pub id: String,
    pub dataset_id: String,
    pub ordinal: u32,
    pub question_id: String,
    pub chunk_id: String,
    pub question: String,
    pub answer: String,
    pub tags: Vec<String>,
    pub ga_pair_id: Option<String>,
    pub turns: Vec<Turn>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FileProcessing,
    QuestionGeneration,
    AnswerGeneration,
    DataCleaning,
    DatasetEvaluation,
    ConversationGeneration,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::FileProcessing,
        TaskType::QuestionGeneration,
        TaskType::AnswerGeneration,
        TaskType::DataCleaning,
        TaskType::DatasetEvaluation,
        TaskType::ConversationGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::FileProcessing => "file_processing",
            TaskType::QuestionGeneration => "question_generation",
            TaskType::AnswerGeneration => "answer_generation",
            TaskType::DataCleaning => "data_cleaning",
            TaskType::DatasetEvaluation => "dataset_evaluation",
            TaskType::ConversationGeneration => "conversation_generation",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PipelineError::validation(format!("unknown task type '{}'", s)))
    }

    /// Resumable tasks are re-queued after a restart instead of failed.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            TaskType::FileProcessing | TaskType::QuestionGeneration | TaskType::AnswerGeneration
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(PipelineError::validation(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Valid edges of the task state machine.
    ///
    /// `running → queued` exists only for restart recovery of resumable tasks.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Queued)
        )
    }
}

/// A persisted background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub task_type: TaskType,
    /// Entity the task works on (file, dataset, ...). Part of the
    /// single-runner key `(project, type, target)`.
    pub target_id: Option<String>,
    pub status: TaskStatus,
    pub progress: f64,
    pub completed_units: u64,
    pub total_units: u64,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<ErrorView>,
    /// Set by an operator cancel; the runner observes it at its next checkpoint.
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh `queued` task.
    pub fn new(
        project_id: &str,
        task_type: TaskType,
        target_id: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            task_type,
            target_id,
            status: TaskStatus::Queued,
            progress: 0.0,
            completed_units: 0,
            total_units: 0,
            payload,
            result: None,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// The `resume_from` cursor stored in the payload, if any.
    pub fn resume_from(&self) -> Option<i64> {
        self.payload.get("resume_from").and_then(Value::as_i64)
    }

    /// Copy every field present in `patch` onto this task.
    pub fn apply_patch(&mut self, patch: TaskPatch) {
        if let Some(p) = patch.progress {
            self.progress = p.clamp(0.0, 1.0);
        }
        if let Some(n) = patch.completed_units {
            self.completed_units = n;
        }
        if let Some(n) = patch.total_units {
            self.total_units = n;
        }
        if let Some(payload) = patch.payload {
            self.payload = payload;
        }
        if let Some(result) = patch.result {
            self.result = Some(result);
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
    }
}

/// Fields written together with a task state transition.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub progress: Option<f64>,
    pub completed_units: Option<u64>,
    pub total_units: Option<u64>,
    pub payload: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<ErrorView>,
}

/// Model selection plus default generation parameters for a generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registered provider name.
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            seed: None,
            timeout_secs: None,
        }
    }
}
