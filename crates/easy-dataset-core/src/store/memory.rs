//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All state lives in one `RwLock`, so every method is trivially atomic.
//! Cascading deletes mirror the SQLite schema's `ON DELETE CASCADE`.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Answer, Chunk, Dataset, DatasetConversation, GaPair, Project, Question, QuestionStatus, Tag,
    Task, TaskPatch, TaskStatus, UploadFile,
};
use crate::prompt::PromptTemplate;

use super::{QuestionQuery, Store, TaskQuery};

#[derive(Default)]
struct State {
    projects: BTreeMap<String, Project>,
    files: BTreeMap<String, UploadFile>,
    chunks: BTreeMap<String, Chunk>,
    tags: BTreeMap<String, Tag>,
    ga_pairs: BTreeMap<String, GaPair>,
    questions: BTreeMap<String, Question>,
    datasets: BTreeMap<String, Dataset>,
    entries: BTreeMap<String, Vec<DatasetConversation>>,
    tasks: Vec<Task>,
    prompts: BTreeMap<(String, u32, String), PromptTemplate>,
}

impl State {
    fn drop_chunk_questions(&mut self, chunk_ids: &[String]) {
        self.questions
            .retain(|_, q| !chunk_ids.iter().any(|c| *c == q.chunk_id));
    }

    fn drop_file(&mut self, file_id: &str) {
        let chunk_ids: Vec<String> = self
            .chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .map(|c| c.id.clone())
            .collect();
        self.drop_chunk_questions(&chunk_ids);
        self.chunks.retain(|_, c| c.file_id != file_id);
        self.ga_pairs
            .retain(|_, g| g.file_id.as_deref() != Some(file_id));
        self.files.remove(file_id);
    }

    fn chunk_ordinal(&self, chunk_id: &str) -> u32 {
        self.chunks.get(chunk_id).map(|c| c.ordinal).unwrap_or(u32::MAX)
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> PipelineResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| PipelineError::Storage("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> PipelineResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| PipelineError::Storage("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_project(&self, project: &Project) -> PipelineResult<()> {
        let mut st = self.write()?;
        if st.projects.contains_key(&project.id) {
            return Err(PipelineError::Conflict(format!(
                "project {} already exists",
                project.id
            )));
        }
        st.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn get_project(&self, id: &str) -> PipelineResult<Option<Project>> {
        Ok(self.read()?.projects.get(id).cloned())
    }

    async fn list_projects(&self) -> PipelineResult<Vec<Project>> {
        let mut out: Vec<Project> = self.read()?.projects.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn delete_project(&self, id: &str) -> PipelineResult<()> {
        let mut st = self.write()?;
        if st.projects.remove(id).is_none() {
            return Err(PipelineError::not_found("project", id));
        }
        let file_ids: Vec<String> = st
            .files
            .values()
            .filter(|f| f.project_id == id)
            .map(|f| f.id.clone())
            .collect();
        for f in &file_ids {
            st.drop_file(f);
        }
        st.tags.retain(|_, t| t.project_id != id);
        st.ga_pairs.retain(|_, g| g.project_id != id);
        st.questions.retain(|_, q| q.project_id != id);
        let dataset_ids: Vec<String> = st
            .datasets
            .values()
            .filter(|d| d.project_id == id)
            .map(|d| d.id.clone())
            .collect();
        for d in &dataset_ids {
            st.datasets.remove(d);
            st.entries.remove(d);
        }
        st.tasks.retain(|t| t.project_id != id);
        Ok(())
    }

    async fn insert_file(&self, file: &UploadFile) -> PipelineResult<(UploadFile, bool)> {
        let mut st = self.write()?;
        if !st.projects.contains_key(&file.project_id) {
            return Err(PipelineError::not_found("project", &file.project_id));
        }
        if let Some(existing) = st
            .files
            .values()
            .find(|f| f.project_id == file.project_id && f.md5 == file.md5)
        {
            return Ok((existing.clone(), false));
        }
        st.files.insert(file.id.clone(), file.clone());
        Ok((file.clone(), true))
    }

    async fn get_file(&self, id: &str) -> PipelineResult<Option<UploadFile>> {
        Ok(self.read()?.files.get(id).cloned())
    }

    async fn find_file_by_md5(
        &self,
        project_id: &str,
        md5: &str,
    ) -> PipelineResult<Option<UploadFile>> {
        Ok(self
            .read()?
            .files
            .values()
            .find(|f| f.project_id == project_id && f.md5 == md5)
            .cloned())
    }

    async fn list_files(&self, project_id: &str) -> PipelineResult<Vec<UploadFile>> {
        let mut out: Vec<UploadFile> = self
            .read()?
            .files
            .values()
            .filter(|f| f.project_id == project_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn update_file_metadata(
        &self,
        id: &str,
        metadata: &serde_json::Value,
    ) -> PipelineResult<()> {
        let mut st = self.write()?;
        let file = st
            .files
            .get_mut(id)
            .ok_or_else(|| PipelineError::not_found("file", id))?;
        file.metadata = metadata.clone();
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> PipelineResult<()> {
        let mut st = self.write()?;
        if !st.files.contains_key(id) {
            return Err(PipelineError::not_found("file", id));
        }
        st.drop_file(id);
        Ok(())
    }

    async fn replace_chunks(&self, file_id: &str, chunks: &[Chunk]) -> PipelineResult<()> {
        let mut st = self.write()?;
        if !st.files.contains_key(file_id) {
            return Err(PipelineError::not_found("file", file_id));
        }
        // Questions go with removed chunks and with chunks whose text changed.
        let stale: Vec<String> = st
            .chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .filter(|c| match chunks.iter().find(|n| n.id == c.id) {
                None => true,
                Some(n) => {
                    n.hash != c.hash
                        || n.start_offset != c.start_offset
                        || n.end_offset != c.end_offset
                }
            })
            .map(|c| c.id.clone())
            .collect();
        st.drop_chunk_questions(&stale);
        st.chunks.retain(|_, c| c.file_id != file_id);
        for c in chunks {
            st.chunks.insert(c.id.clone(), c.clone());
        }
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> PipelineResult<Option<Chunk>> {
        Ok(self.read()?.chunks.get(id).cloned())
    }

    async fn list_chunks(&self, file_id: &str) -> PipelineResult<Vec<Chunk>> {
        let mut out: Vec<Chunk> = self
            .read()?
            .chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.ordinal);
        Ok(out)
    }

    async fn set_chunk_tags(&self, chunk_id: &str, tags: &[String]) -> PipelineResult<()> {
        let mut st = self.write()?;
        let chunk = st
            .chunks
            .get_mut(chunk_id)
            .ok_or_else(|| PipelineError::not_found("chunk", chunk_id))?;
        chunk.tags = tags.to_vec();
        Ok(())
    }

    async fn upsert_tag(&self, tag: &Tag) -> PipelineResult<()> {
        let mut st = self.write()?;
        st.tags
            .retain(|id, t| *id == tag.id || !(t.project_id == tag.project_id && t.label == tag.label));
        st.tags.insert(tag.id.clone(), tag.clone());
        Ok(())
    }

    async fn list_tags(&self, project_id: &str) -> PipelineResult<Vec<Tag>> {
        let mut out: Vec<Tag> = self
            .read()?
            .tags
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(out)
    }

    async fn replace_ga_pairs(&self, file_id: &str, pairs: &[GaPair]) -> PipelineResult<()> {
        let mut st = self.write()?;
        if !st.files.contains_key(file_id) {
            return Err(PipelineError::not_found("file", file_id));
        }
        st.ga_pairs
            .retain(|_, g| g.file_id.as_deref() != Some(file_id));
        for p in pairs {
            st.ga_pairs.insert(p.id.clone(), p.clone());
        }
        Ok(())
    }

    async fn list_ga_pairs(
        &self,
        project_id: &str,
        file_id: Option<&str>,
    ) -> PipelineResult<Vec<GaPair>> {
        let mut out: Vec<GaPair> = self
            .read()?
            .ga_pairs
            .values()
            .filter(|g| g.project_id == project_id)
            .filter(|g| file_id.map_or(true, |f| g.file_id.as_deref() == Some(f)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.file_id.cmp(&b.file_id).then(a.ordinal.cmp(&b.ordinal)));
        Ok(out)
    }

    async fn set_ga_pair_active(&self, id: &str, active: bool) -> PipelineResult<()> {
        let mut st = self.write()?;
        let pair = st
            .ga_pairs
            .get_mut(id)
            .ok_or_else(|| PipelineError::not_found("ga_pair", id))?;
        pair.active = active;
        Ok(())
    }

    async fn replace_chunk_questions(
        &self,
        chunk_id: &str,
        questions: &[Question],
    ) -> PipelineResult<()> {
        let mut st = self.write()?;
        if !st.chunks.contains_key(chunk_id) {
            return Err(PipelineError::not_found("chunk", chunk_id));
        }
        st.questions.retain(|_, q| q.chunk_id != chunk_id);
        for q in questions {
            st.questions.insert(q.id.clone(), q.clone());
        }
        Ok(())
    }

    async fn get_question(&self, id: &str) -> PipelineResult<Option<Question>> {
        Ok(self.read()?.questions.get(id).cloned())
    }

    async fn list_questions(&self, query: &QuestionQuery) -> PipelineResult<Vec<Question>> {
        let st = self.read()?;
        let mut out: Vec<Question> = st
            .questions
            .values()
            .filter(|q| query.matches(q))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.file_id
                .cmp(&b.file_id)
                .then(st.chunk_ordinal(&a.chunk_id).cmp(&st.chunk_ordinal(&b.chunk_id)))
                .then(a.ordinal.cmp(&b.ordinal))
        });
        Ok(out)
    }

    async fn update_question(&self, question: &Question) -> PipelineResult<()> {
        let mut st = self.write()?;
        let q = st
            .questions
            .get_mut(&question.id)
            .ok_or_else(|| PipelineError::not_found("question", &question.id))?;
        q.text = question.text.clone();
        q.tags = question.tags.clone();
        q.status = question.status;
        q.answer = question.answer.clone();
        Ok(())
    }

    async fn set_answer(&self, question_id: &str, answer: &Answer) -> PipelineResult<()> {
        let mut st = self.write()?;
        let q = st
            .questions
            .get_mut(question_id)
            .ok_or_else(|| PipelineError::not_found("question", question_id))?;
        q.answer = Some(answer.clone());
        q.status = QuestionStatus::Answered;
        Ok(())
    }

    async fn delete_question(&self, id: &str) -> PipelineResult<()> {
        let mut st = self.write()?;
        st.questions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| PipelineError::not_found("question", id))
    }

    async fn create_dataset(&self, dataset: &Dataset) -> PipelineResult<()> {
        let mut st = self.write()?;
        if !st.projects.contains_key(&dataset.project_id) {
            return Err(PipelineError::not_found("project", &dataset.project_id));
        }
        if st
            .datasets
            .values()
            .any(|d| d.project_id == dataset.project_id && d.name == dataset.name)
        {
            return Err(PipelineError::Conflict(format!(
                "dataset '{}' already exists",
                dataset.name
            )));
        }
        st.datasets.insert(dataset.id.clone(), dataset.clone());
        Ok(())
    }

    async fn get_dataset(&self, id: &str) -> PipelineResult<Option<Dataset>> {
        Ok(self.read()?.datasets.get(id).cloned())
    }

    async fn list_datasets(&self, project_id: &str) -> PipelineResult<Vec<Dataset>> {
        let mut out: Vec<Dataset> = self
            .read()?
            .datasets
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn update_dataset(&self, dataset: &Dataset) -> PipelineResult<()> {
        let mut st = self.write()?;
        let d = st
            .datasets
            .get_mut(&dataset.id)
            .ok_or_else(|| PipelineError::not_found("dataset", &dataset.id))?;
        *d = dataset.clone();
        Ok(())
    }

    async fn save_dataset_snapshot(
        &self,
        dataset: &Dataset,
        entries: &[DatasetConversation],
    ) -> PipelineResult<()> {
        let mut st = self.write()?;
        let d = st
            .datasets
            .get_mut(&dataset.id)
            .ok_or_else(|| PipelineError::not_found("dataset", &dataset.id))?;
        *d = dataset.clone();
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| e.ordinal);
        st.entries.insert(dataset.id.clone(), sorted);
        Ok(())
    }

    async fn list_dataset_entries(
        &self,
        dataset_id: &str,
    ) -> PipelineResult<Vec<DatasetConversation>> {
        Ok(self
            .read()?
            .entries
            .get(dataset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_task(&self, task: &Task) -> PipelineResult<()> {
        let mut st = self.write()?;
        if st.tasks.iter().any(|t| t.id == task.id) {
            return Err(PipelineError::Conflict(format!("task {} already exists", task.id)));
        }
        st.tasks.push(task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> PipelineResult<Option<Task>> {
        Ok(self.read()?.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn list_tasks(&self, query: &TaskQuery) -> PipelineResult<Vec<Task>> {
        Ok(self
            .read()?
            .tasks
            .iter()
            .filter(|t| query.matches(t))
            .cloned()
            .collect())
    }

    async fn transition_task(
        &self,
        id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        patch: TaskPatch,
    ) -> PipelineResult<Task> {
        let mut st = self.write()?;
        let task = st
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| PipelineError::not_found("task", id))?;
        if !from.contains(&task.status) {
            return Err(PipelineError::Conflict(format!(
                "task {} is {}, cannot move to {}",
                id,
                task.status.as_str(),
                to.as_str()
            )));
        }
        task.status = to;
        task.apply_patch(patch);
        if to == TaskStatus::Queued {
            task.cancel_requested = false;
        }
        if to.is_terminal() {
            task.finished_at = Some(Utc::now());
        }
        Ok(task.clone())
    }

    async fn start_task(&self, id: &str) -> PipelineResult<Task> {
        let mut st = self.write()?;
        let (project, ty, target) = {
            let t = st
                .tasks
                .iter()
                .find(|t| t.id == id)
                .ok_or_else(|| PipelineError::not_found("task", id))?;
            if t.status != TaskStatus::Queued {
                return Err(PipelineError::Conflict(format!(
                    "task {} is {}, not queued",
                    id,
                    t.status.as_str()
                )));
            }
            (t.project_id.clone(), t.task_type, t.target_id.clone())
        };
        if st.tasks.iter().any(|t| {
            t.id != id
                && t.status == TaskStatus::Running
                && t.project_id == project
                && t.task_type == ty
                && t.target_id == target
        }) {
            return Err(PipelineError::Conflict(format!(
                "another {} task is already running for this target",
                ty.as_str()
            )));
        }
        let task = st
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| PipelineError::not_found("task", id))?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        Ok(task.clone())
    }

    async fn update_task_progress(&self, id: &str, patch: TaskPatch) -> PipelineResult<()> {
        let mut st = self.write()?;
        let task = st
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| PipelineError::not_found("task", id))?;
        task.apply_patch(patch);
        Ok(())
    }

    async fn request_cancel(&self, id: &str) -> PipelineResult<Task> {
        let mut st = self.write()?;
        let task = st
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| PipelineError::not_found("task", id))?;
        match task.status {
            TaskStatus::Queued => {
                task.status = TaskStatus::Cancelled;
                task.cancel_requested = true;
                task.error = Some(PipelineError::Cancelled.view().with_task(id));
                task.finished_at = Some(Utc::now());
            }
            TaskStatus::Running => task.cancel_requested = true,
            other => {
                return Err(PipelineError::Conflict(format!(
                    "task {} is already {}",
                    id,
                    other.as_str()
                )))
            }
        }
        Ok(task.clone())
    }

    async fn save_prompt(&self, prompt: &PromptTemplate) -> PipelineResult<()> {
        let mut st = self.write()?;
        st.prompts.insert(
            (prompt.name.clone(), prompt.version, prompt.language.clone()),
            prompt.clone(),
        );
        Ok(())
    }

    async fn get_prompt(
        &self,
        name: &str,
        version: u32,
        language: &str,
    ) -> PipelineResult<Option<PromptTemplate>> {
        Ok(self
            .read()?
            .prompts
            .get(&(name.to_string(), version, language.to_string()))
            .cloned())
    }

    async fn list_prompts(&self) -> PipelineResult<Vec<PromptTemplate>> {
        Ok(self.read()?.prompts.values().cloned().collect())
    }
}
