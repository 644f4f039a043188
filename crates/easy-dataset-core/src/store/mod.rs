//! Storage abstraction for the dataset pipeline.
//!
//! The [`Store`] trait is the persistence contract every stage is written
//! against. Each call is a short transaction; multi-row writes such as
//! [`replace_chunks`](Store::replace_chunks) are atomic. Deleting a
//! project, file, or chunk cascades to everything it owns.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::PipelineResult;
use crate::models::{
    Answer, Chunk, Dataset, DatasetConversation, GaPair, Project, Question, QuestionStatus, Tag,
    Task, TaskPatch, TaskStatus, TaskType, UploadFile,
};
use crate::prompt::PromptTemplate;

/// Filter for [`Store::list_questions`]. Absent fields match everything.
#[derive(Debug, Clone, Default)]
pub struct QuestionQuery {
    pub project_id: Option<String>,
    pub file_id: Option<String>,
    pub chunk_id: Option<String>,
    pub status: Option<QuestionStatus>,
}

impl QuestionQuery {
    pub fn project(project_id: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            ..Default::default()
        }
    }

    pub fn chunk(chunk_id: &str) -> Self {
        Self {
            chunk_id: Some(chunk_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: QuestionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, q: &Question) -> bool {
        self.project_id.as_deref().map_or(true, |p| p == q.project_id)
            && self.file_id.as_deref().map_or(true, |f| f == q.file_id)
            && self.chunk_id.as_deref().map_or(true, |c| c == q.chunk_id)
            && self.status.map_or(true, |s| s == q.status)
    }
}

/// Filter for [`Store::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub project_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
}

impl TaskQuery {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, t: &Task) -> bool {
        self.project_id.as_deref().map_or(true, |p| p == t.project_id)
            && self.status.map_or(true, |s| s == t.status)
            && self.task_type.map_or(true, |ty| ty == t.task_type)
    }
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | projects | `create_project`, `get_project`, `list_projects`, `delete_project` |
/// | files | `insert_file`, `get_file`, `find_file_by_md5`, `list_files`, `update_file_metadata`, `delete_file` |
/// | chunks | `replace_chunks`, `get_chunk`, `list_chunks`, `set_chunk_tags` |
/// | tags | `upsert_tag`, `list_tags` |
/// | GA pairs | `replace_ga_pairs`, `list_ga_pairs`, `set_ga_pair_active` |
/// | questions | `replace_chunk_questions`, `get_question`, `list_questions`, `update_question`, `set_answer`, `delete_question` |
/// | datasets | `create_dataset`, `get_dataset`, `list_datasets`, `update_dataset`, `save_dataset_snapshot`, `list_dataset_entries` |
/// | tasks | `insert_task`, `get_task`, `list_tasks`, `transition_task`, `start_task`, `update_task_progress`, `request_cancel` |
/// | prompts | `save_prompt`, `get_prompt`, `list_prompts` |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_project(&self, project: &Project) -> PipelineResult<()>;
    async fn get_project(&self, id: &str) -> PipelineResult<Option<Project>>;
    async fn list_projects(&self) -> PipelineResult<Vec<Project>>;
    /// Delete a project and everything it owns.
    async fn delete_project(&self, id: &str) -> PipelineResult<()>;

    /// Insert `file` unless the project already holds one with the same MD5.
    ///
    /// Returns the stored record and whether it was newly created.
    async fn insert_file(&self, file: &UploadFile) -> PipelineResult<(UploadFile, bool)>;
    async fn get_file(&self, id: &str) -> PipelineResult<Option<UploadFile>>;
    async fn find_file_by_md5(&self, project_id: &str, md5: &str)
        -> PipelineResult<Option<UploadFile>>;
    async fn list_files(&self, project_id: &str) -> PipelineResult<Vec<UploadFile>>;
    async fn update_file_metadata(&self, id: &str, metadata: &serde_json::Value)
        -> PipelineResult<()>;
    /// Delete a file with its chunks and their questions.
    async fn delete_file(&self, id: &str) -> PipelineResult<()>;

    /// Atomically replace all chunks of a file. Questions on chunks whose
    /// id disappears, or whose hash or offsets change, are deleted.
    async fn replace_chunks(&self, file_id: &str, chunks: &[Chunk]) -> PipelineResult<()>;
    async fn get_chunk(&self, id: &str) -> PipelineResult<Option<Chunk>>;
    /// Chunks of one file, ordered by ordinal.
    async fn list_chunks(&self, file_id: &str) -> PipelineResult<Vec<Chunk>>;
    async fn set_chunk_tags(&self, chunk_id: &str, tags: &[String]) -> PipelineResult<()>;

    async fn upsert_tag(&self, tag: &Tag) -> PipelineResult<()>;
    async fn list_tags(&self, project_id: &str) -> PipelineResult<Vec<Tag>>;

    /// Replace the GA pairs generated for a file.
    async fn replace_ga_pairs(&self, file_id: &str, pairs: &[GaPair]) -> PipelineResult<()>;
    async fn list_ga_pairs(
        &self,
        project_id: &str,
        file_id: Option<&str>,
    ) -> PipelineResult<Vec<GaPair>>;
    async fn set_ga_pair_active(&self, id: &str, active: bool) -> PipelineResult<()>;

    /// Replace the generated question set of one chunk.
    ///
    /// Writes are keyed by `(chunk_id, ordinal)`, so re-running a chunk
    /// overwrites its earlier output instead of appending to it.
    async fn replace_chunk_questions(
        &self,
        chunk_id: &str,
        questions: &[Question],
    ) -> PipelineResult<()>;
    async fn get_question(&self, id: &str) -> PipelineResult<Option<Question>>;
    /// Questions ordered by file, chunk ordinal, then question ordinal.
    async fn list_questions(&self, query: &QuestionQuery) -> PipelineResult<Vec<Question>>;
    /// Overwrite the editable fields of a question (text, tags, status, answer).
    async fn update_question(&self, question: &Question) -> PipelineResult<()>;
    /// Store an answer and mark the question `answered`.
    async fn set_answer(&self, question_id: &str, answer: &Answer) -> PipelineResult<()>;
    async fn delete_question(&self, id: &str) -> PipelineResult<()>;

    async fn create_dataset(&self, dataset: &Dataset) -> PipelineResult<()>;
    async fn get_dataset(&self, id: &str) -> PipelineResult<Option<Dataset>>;
    async fn list_datasets(&self, project_id: &str) -> PipelineResult<Vec<Dataset>>;
    async fn update_dataset(&self, dataset: &Dataset) -> PipelineResult<()>;
    /// Update the dataset row and replace its entries in one transaction.
    async fn save_dataset_snapshot(
        &self,
        dataset: &Dataset,
        entries: &[DatasetConversation],
    ) -> PipelineResult<()>;
    /// Entries ordered by ordinal.
    async fn list_dataset_entries(
        &self,
        dataset_id: &str,
    ) -> PipelineResult<Vec<DatasetConversation>>;

    async fn insert_task(&self, task: &Task) -> PipelineResult<()>;
    async fn get_task(&self, id: &str) -> PipelineResult<Option<Task>>;
    /// Tasks ordered by creation time, oldest first.
    async fn list_tasks(&self, query: &TaskQuery) -> PipelineResult<Vec<Task>>;
    /// Compare-and-set a task's status.
    ///
    /// Fails with `Conflict` when the current status is not in `from`.
    /// Terminal states stamp `finished_at`.
    async fn transition_task(
        &self,
        id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        patch: TaskPatch,
    ) -> PipelineResult<Task>;
    /// Move a queued task to `running`, unless another task with the same
    /// `(project, type, target)` is already running (`Conflict`).
    async fn start_task(&self, id: &str) -> PipelineResult<Task>;
    /// Persist progress of a running task.
    async fn update_task_progress(&self, id: &str, patch: TaskPatch) -> PipelineResult<()>;
    /// Record an operator cancel. A queued task moves straight to
    /// `cancelled`; a running task gets `cancel_requested` set. Terminal
    /// tasks are a `Conflict`.
    async fn request_cancel(&self, id: &str) -> PipelineResult<Task>;

    async fn save_prompt(&self, prompt: &PromptTemplate) -> PipelineResult<()>;
    async fn get_prompt(
        &self,
        name: &str,
        version: u32,
        language: &str,
    ) -> PipelineResult<Option<PromptTemplate>>;
    async fn list_prompts(&self) -> PipelineResult<Vec<PromptTemplate>>;
}
