//! Dataset assembly.
//!
//! A [`Dataset`] starts as a `draft` holding only its selection. A
//! snapshot resolves the selection, checks that every selected question
//! is answered, and copies each one into a [`DatasetConversation`]. The
//! copies are what evaluation and export read, so edits made to questions
//! after the snapshot never leak into it.
//!
//! ```text
//! draft ──snapshot──▶ snapshotted ──export──▶ exported
//!                        ▲     │
//!                        └─────┘  re-snapshot
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use easy_dataset_core::conversation::{single_turn, validate_turns};
use easy_dataset_core::models::{
    Dataset, DatasetConversation, DatasetStatus, GaPair, Question, QuestionStatus, Role, Selection,
    Turn,
};
use easy_dataset_core::store::{QuestionQuery, Store};
use easy_dataset_core::{PipelineError, PipelineResult};

use crate::generators::stable_id;

/// Parameters for a new dataset.
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub name: String,
    pub selection: Selection,
    pub materialize_ga_pairs: bool,
    pub system_prompt: Option<String>,
}

#[derive(Clone)]
pub struct DatasetAssembler {
    store: Arc<dyn Store>,
}

impl DatasetAssembler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a draft dataset.
    pub async fn create(&self, project_id: &str, request: NewDataset) -> PipelineResult<Dataset> {
        if request.name.trim().is_empty() {
            return Err(PipelineError::validation("dataset name must not be empty"));
        }
        if let Selection::Filter(filter) = &request.selection {
            if let Some(min) = filter.min_score {
                if !(0.0..=1.0).contains(&min) {
                    return Err(PipelineError::validation("min_score must be within [0, 1]"));
                }
            }
        }
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("project", project_id))?;
        let dataset = Dataset {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            name: request.name,
            selection: request.selection,
            status: DatasetStatus::Draft,
            materialize_ga_pairs: request.materialize_ga_pairs,
            system_prompt: request.system_prompt.filter(|s| !s.trim().is_empty()),
            snapshot_at: None,
            evaluation: None,
            created_at: Utc::now(),
        };
        self.store.create_dataset(&dataset).await?;
        info!(dataset_id = %dataset.id, name = %dataset.name, "created dataset");
        Ok(dataset)
    }

    pub async fn get(&self, dataset_id: &str) -> PipelineResult<Dataset> {
        self.store
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("dataset", dataset_id))
    }

    /// Questions a selection names, in selection order.
    ///
    /// An id list returns its questions whatever their status; a filter
    /// only ever matches answered questions.
    pub async fn resolve_selection(&self, dataset: &Dataset) -> PipelineResult<Vec<Question>> {
        match &dataset.selection {
            Selection::Ids { question_ids } => {
                let mut seen = HashSet::new();
                let mut out = Vec::with_capacity(question_ids.len());
                for id in question_ids {
                    if !seen.insert(id.as_str()) {
                        continue;
                    }
                    let question = self
                        .store
                        .get_question(id)
                        .await?
                        .filter(|q| q.project_id == dataset.project_id)
                        .ok_or_else(|| PipelineError::not_found("question", id))?;
                    out.push(question);
                }
                Ok(out)
            }
            Selection::Filter(filter) => {
                let query =
                    QuestionQuery::project(&dataset.project_id).with_status(QuestionStatus::Answered);
                let questions = self.store.list_questions(&query).await?;
                Ok(questions
                    .into_iter()
                    .filter(|q| {
                        filter
                            .file_ids
                            .as_ref()
                            .map_or(true, |files| files.contains(&q.file_id))
                    })
                    .filter(|q| {
                        filter
                            .tags
                            .as_ref()
                            .map_or(true, |tags| q.tags.iter().any(|t| tags.contains(t)))
                    })
                    .filter(|q| match filter.min_score {
                        None => true,
                        Some(min) => q
                            .answer
                            .as_ref()
                            .and_then(|a| a.score)
                            .is_some_and(|s| s >= min),
                    })
                    .collect())
            }
        }
    }

    /// Freeze the selection into entries.
    ///
    /// Fails with `IncompleteSelection` listing every selected question
    /// that is not answered, and with `Conflict` once the dataset has
    /// been exported.
    pub async fn snapshot(
        &self,
        dataset_id: &str,
    ) -> PipelineResult<(Dataset, Vec<DatasetConversation>)> {
        let mut dataset = self.get(dataset_id).await?;
        if dataset.status == DatasetStatus::Exported {
            return Err(PipelineError::Conflict(format!(
                "dataset '{}' has been exported and is immutable",
                dataset.name
            )));
        }
        let questions = self.resolve_selection(&dataset).await?;
        let missing: Vec<String> = questions
            .iter()
            .filter(|q| q.status != QuestionStatus::Answered || q.answer.is_none())
            .map(|q| q.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::IncompleteSelection(missing));
        }

        let pairs = if dataset.materialize_ga_pairs {
            self.active_pairs(&dataset.project_id).await?
        } else {
            HashMap::new()
        };

        let mut entries = Vec::new();
        for question in &questions {
            let variants: Vec<Option<&GaPair>> = match pairs.get(&question.file_id) {
                Some(list) if !list.is_empty() => list.iter().map(Some).collect(),
                _ => vec![None],
            };
            for pair in variants {
                let ordinal = entries.len() as u32;
                entries.push(build_entry(&dataset, question, pair, ordinal)?);
            }
        }

        dataset.status = DatasetStatus::Snapshotted;
        dataset.snapshot_at = Some(Utc::now());
        dataset.evaluation = None;
        self.store.save_dataset_snapshot(&dataset, &entries).await?;
        info!(
            dataset_id = %dataset.id,
            questions = questions.len(),
            entries = entries.len(),
            "snapshotted dataset"
        );
        Ok((dataset, entries))
    }

    /// Entries of a snapshotted or exported dataset.
    pub async fn entries(&self, dataset: &Dataset) -> PipelineResult<Vec<DatasetConversation>> {
        if dataset.status == DatasetStatus::Draft {
            return Err(PipelineError::validation(format!(
                "dataset '{}' has no snapshot yet",
                dataset.name
            )));
        }
        self.store.list_dataset_entries(&dataset.id).await
    }

    /// Record a completed export. Exported datasets are immutable.
    pub async fn mark_exported(&self, dataset: &mut Dataset) -> PipelineResult<()> {
        if dataset.status == DatasetStatus::Draft {
            return Err(PipelineError::validation(format!(
                "dataset '{}' has no snapshot yet",
                dataset.name
            )));
        }
        if dataset.status != DatasetStatus::Exported {
            dataset.status = DatasetStatus::Exported;
            self.store.update_dataset(dataset).await?;
        }
        Ok(())
    }

    async fn active_pairs(&self, project_id: &str) -> PipelineResult<HashMap<String, Vec<GaPair>>> {
        let mut by_file: HashMap<String, Vec<GaPair>> = HashMap::new();
        for pair in self.store.list_ga_pairs(project_id, None).await? {
            if let (true, Some(file_id)) = (pair.active, pair.file_id.clone()) {
                by_file.entry(file_id).or_default().push(pair);
            }
        }
        for list in by_file.values_mut() {
            list.sort_by_key(|p| p.ordinal);
        }
        Ok(by_file)
    }
}

/// System turn content for an entry: the dataset prompt, then the GA
/// description when the entry is a variation.
fn system_text(dataset: &Dataset, pair: Option<&GaPair>) -> Option<String> {
    let parts: Vec<String> = dataset
        .system_prompt
        .iter()
        .cloned()
        .chain(pair.map(GaPair::describe))
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

fn build_entry(
    dataset: &Dataset,
    question: &Question,
    pair: Option<&GaPair>,
    ordinal: u32,
) -> PipelineResult<DatasetConversation> {
    let answer = question
        .answer
        .as_ref()
        .ok_or_else(|| PipelineError::IncompleteSelection(vec![question.id.clone()]))?;
    let system = system_text(dataset, pair);
    let turns = match &question.conversation {
        Some(conversation) => {
            let mut turns: Vec<Turn> = conversation
                .iter()
                .filter(|t| t.role != Role::System)
                .cloned()
                .collect();
            let existing = conversation
                .first()
                .filter(|t| t.role == Role::System)
                .map(|t| t.content.clone());
            if let Some(sys) = system.or(existing) {
                turns.insert(0, Turn::new(Role::System, sys));
            }
            turns
        }
        None => single_turn(&question.text, &answer.text, system.as_deref()),
    };
    validate_turns(&turns).map_err(|e| {
        PipelineError::validation(format!("question {}: {}", question.id, e))
    })?;

    let variant = pair.map(|p| p.id.as_str()).unwrap_or("");
    Ok(DatasetConversation {
        id: stable_id("entry", &[&dataset.id, &question.id, variant]),
        dataset_id: dataset.id.clone(),
        ordinal,
        question_id: question.id.clone(),
        chunk_id: question.chunk_id.clone(),
        question: question.text.clone(),
        answer: answer.text.clone(),
        tags: question.tags.clone(),
        ga_pair_id: pair.map(|p| p.id.clone()),
        turns,
        score: answer.score,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use easy_dataset_core::models::{Answer, Project, Provenance, SelectionFilter, UploadFile};
    use easy_dataset_core::store::memory::InMemoryStore;

    fn provenance() -> Provenance {
        Provenance {
            model: "m1".into(),
            prompt: "question".into(),
            prompt_version: 1,
            generated_at: Utc::now(),
        }
    }

    /// A project with `n` questions on one chunk; the first `answered` of
    /// them carry answers scored `0.1 * i`.
    pub(crate) async fn store_with_questions(
        n: usize,
        answered: usize,
    ) -> (Arc<dyn Store>, Project, Vec<Question>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let project = Project::new("demo", "");
        store.create_project(&project).await.unwrap();
        let file = UploadFile {
            id: "file-1".into(),
            project_id: project.id.clone(),
            file_name: "a.txt".into(),
            extension: "txt".into(),
            file_type: "txt".into(),
            stored_path: "/dev/null".into(),
            size: 10,
            md5: "00000000000000000000000000000001".into(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        store.insert_file(&file).await.unwrap();
        let chunk = easy_dataset_core::models::Chunk {
            id: "chunk-1".into(),
            project_id: project.id.clone(),
            file_id: file.id.clone(),
            ordinal: 0,
            name: "a-part-1".into(),
            start_offset: 0,
            end_offset: 10,
            overlap: 0,
            content: "0123456789".into(),
            token_estimate: 3,
            summary: None,
            tags: vec!["intro".into()],
            hash: String::new(),
        };
        store.replace_chunks(&file.id, &[chunk]).await.unwrap();
        let questions: Vec<Question> = (0..n)
            .map(|i| Question {
                id: format!("q{}", i),
                project_id: project.id.clone(),
                file_id: file.id.clone(),
                chunk_id: "chunk-1".into(),
                ordinal: i as u32,
                text: format!("Question {}?", i),
                provenance: provenance(),
                tags: if i % 2 == 0 { vec!["even".into()] } else { vec![] },
                ga_pair_id: None,
                status: QuestionStatus::Pending,
                answer: None,
                conversation: None,
            })
            .collect();
        store.replace_chunk_questions("chunk-1", &questions).await.unwrap();
        for (i, q) in questions.iter().enumerate().take(answered) {
            let answer = Answer {
                text: format!("Answer {}.", i),
                chain_of_thought: None,
                provenance: provenance(),
                score: Some(0.1 * i as f64),
                evaluation: None,
                retries: 0,
            };
            store.set_answer(&q.id, &answer).await.unwrap();
        }
        let questions = store
            .list_questions(&QuestionQuery::project(&project.id))
            .await
            .unwrap();
        (store, project, questions)
    }

    fn all_answered() -> Selection {
        Selection::Filter(SelectionFilter::default())
    }

    fn new_dataset(selection: Selection) -> NewDataset {
        NewDataset {
            name: "train".into(),
            selection,
            materialize_ga_pairs: false,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn filter_snapshot_copies_answered_questions() {
        let (store, project, _qs) = store_with_questions(5, 3).await;
        let assembler = DatasetAssembler::new(store.clone());
        let dataset = assembler.create(&project.id, new_dataset(all_answered())).await.unwrap();
        let (dataset, entries) = assembler.snapshot(&dataset.id).await.unwrap();
        assert_eq!(dataset.status, DatasetStatus::Snapshotted);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].turns.len(), 2);
        assert_eq!(entries[0].turns[0].role, Role::User);

        // Later edits do not leak into the snapshot.
        let mut q0 = store.get_question("q0").await.unwrap().unwrap();
        q0.text = "Edited?".into();
        store.update_question(&q0).await.unwrap();
        let stored = assembler.entries(&dataset).await.unwrap();
        assert_eq!(stored[0].question, "Question 0?");
    }

    #[tokio::test]
    async fn filter_by_tag_and_score() {
        let (store, project, _qs) = store_with_questions(6, 6).await;
        let assembler = DatasetAssembler::new(store);
        let selection = Selection::Filter(SelectionFilter {
            tags: Some(vec!["even".into()]),
            min_score: Some(0.15),
            ..Default::default()
        });
        let dataset = assembler.create(&project.id, new_dataset(selection)).await.unwrap();
        let picked: Vec<String> = assembler
            .resolve_selection(&dataset)
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(picked, vec!["q2", "q4"]);
    }

    #[tokio::test]
    async fn unanswered_ids_are_an_incomplete_selection() {
        let (store, project, _qs) = store_with_questions(4, 2).await;
        let assembler = DatasetAssembler::new(store);
        let selection = Selection::Ids {
            question_ids: vec!["q0".into(), "q2".into(), "q3".into()],
        };
        let dataset = assembler.create(&project.id, new_dataset(selection)).await.unwrap();
        match assembler.snapshot(&dataset.id).await.unwrap_err() {
            PipelineError::IncompleteSelection(ids) => assert_eq!(ids, vec!["q2", "q3"]),
            other => panic!("unexpected error: {other}"),
        }
        let unchanged = assembler.get(&dataset.id).await.unwrap();
        assert_eq!(unchanged.status, DatasetStatus::Draft);
    }

    #[tokio::test]
    async fn ga_variations_and_system_prompt() {
        let (store, project, _qs) = store_with_questions(2, 2).await;
        let pair = |n: u32, active: bool| GaPair {
            id: format!("ga-{}", n),
            project_id: project.id.clone(),
            file_id: Some("file-1".into()),
            chunk_id: None,
            ordinal: n,
            genre_title: format!("Genre {}", n),
            genre_desc: "desc".into(),
            audience_title: "Audience".into(),
            audience_desc: "desc".into(),
            active,
        };
        store
            .replace_ga_pairs("file-1", &[pair(1, true), pair(2, true), pair(3, false)])
            .await
            .unwrap();
        let assembler = DatasetAssembler::new(store);
        let dataset = assembler
            .create(
                &project.id,
                NewDataset {
                    name: "variants".into(),
                    selection: all_answered(),
                    materialize_ga_pairs: true,
                    system_prompt: Some("You are helpful.".into()),
                },
            )
            .await
            .unwrap();
        let (_, entries) = assembler.snapshot(&dataset.id).await.unwrap();
        assert_eq!(entries.len(), 4);
        let ordinals: Vec<u32> = entries.iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3]);
        assert_eq!(entries[1].ga_pair_id.as_deref(), Some("ga-2"));
        let system = &entries[1].turns[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.starts_with("You are helpful."));
        assert!(system.content.contains("Genre: Genre 2"));
    }

    #[tokio::test]
    async fn stored_conversation_is_used() {
        let (store, project, _qs) = store_with_questions(1, 1).await;
        let mut q0 = store.get_question("q0").await.unwrap().unwrap();
        q0.conversation = Some(vec![
            Turn::new(Role::User, "Hi?"),
            Turn::new(Role::Assistant, "Hello."),
            Turn::new(Role::User, "More?"),
            Turn::new(Role::Assistant, "Sure."),
        ]);
        store.update_question(&q0).await.unwrap();
        let assembler = DatasetAssembler::new(store);
        let dataset = assembler.create(&project.id, new_dataset(all_answered())).await.unwrap();
        let (_, entries) = assembler.snapshot(&dataset.id).await.unwrap();
        assert_eq!(entries[0].turns.len(), 4);
        assert_eq!(entries[0].answer, "Answer 0.");
    }

    #[tokio::test]
    async fn exported_dataset_is_immutable() {
        let (store, project, _qs) = store_with_questions(2, 2).await;
        let assembler = DatasetAssembler::new(store);
        let dataset = assembler.create(&project.id, new_dataset(all_answered())).await.unwrap();
        let err = assembler.entries(&dataset).await.unwrap_err();
        assert_eq!(err.kind(), easy_dataset_core::ErrorKind::Validation);

        let (mut dataset, _) = assembler.snapshot(&dataset.id).await.unwrap();
        // Re-snapshot before export is allowed.
        assembler.snapshot(&dataset.id).await.unwrap();
        assembler.mark_exported(&mut dataset).await.unwrap();
        let err = assembler.snapshot(&dataset.id).await.unwrap_err();
        assert_eq!(err.kind(), easy_dataset_core::ErrorKind::Conflict);
    }
}
