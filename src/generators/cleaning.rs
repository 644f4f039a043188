//! Data cleaning: proposes edits to question/answer pairs.
//!
//! A run never writes to the store. It produces a list of [`Edit`]s in
//! the task result, built from three sources in order:
//!
//! 1. a duplicate pre-pass that rejects every repeat of an earlier
//!    question (trimmed, case-insensitive),
//! 2. the text normalizers, which turn into `revise` edits when they
//!    change anything,
//! 3. optionally, an LLM critique of the remaining pairs in batches.
//!
//! [`apply_edits`] is the separate step that writes edits back.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use easy_dataset_core::models::{Question, QuestionStatus};
use easy_dataset_core::prompt::{self, Vars};
use easy_dataset_core::store::{QuestionQuery, Store};
use easy_dataset_core::{PipelineError, PipelineResult};

use super::{is_item_failure, GeneratorEnv, ItemFailure, ModelChoice, Resolved};
use crate::llm::schema;
use crate::tasks::{CancelFlag, TaskContext, TaskHandler};

// ═══════════════════════════════════════════════════════════════════════
// Normalizers
// ═══════════════════════════════════════════════════════════════════════

/// Collapse runs of whitespace to one space and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse repeated punctuation (`!!` → `!`, `??` → `?`, `,,` → `,`).
///
/// Ellipses (`...`) are left alone.
pub fn remove_duplicate_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if prev == Some(c) && matches!(c, '!' | '?' | ',' | ';' | ':' | '！' | '？' | '，' | '；' | '。') {
            continue;
        }
        prev = Some(c);
        out.push(c);
    }
    out
}

fn space_before_punct() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+([,.;:!?])").expect("valid punctuation regex"))
}

fn missing_space_after_punct() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([,;:!?])([A-Za-z])").expect("valid punctuation regex"))
}

/// Remove spaces before ASCII punctuation and add one after it when a
/// letter follows directly. Digits are not touched, so `3.14` and
/// `1,000` survive.
pub fn fix_spacing(text: &str) -> String {
    let text = space_before_punct().replace_all(text, "$1");
    missing_space_after_punct()
        .replace_all(&text, "$1 $2")
        .into_owned()
}

/// All normalizers in order.
pub fn clean_text(text: &str) -> String {
    fix_spacing(&remove_duplicate_punctuation(&normalize_whitespace(text)))
}

// ═══════════════════════════════════════════════════════════════════════
// Edits
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditAction {
    Accept,
    Revise,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub question_id: String,
    pub action: EditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Edit {
    fn reject(question_id: &str, reason: impl Into<String>) -> Self {
        Self {
            question_id: question_id.to_string(),
            action: EditAction::Reject,
            question: None,
            answer: None,
            reason: Some(reason.into()),
        }
    }
}

/// Reject every question whose trimmed, lowercased text repeats an
/// earlier one in `questions`.
pub fn duplicate_edits(questions: &[Question]) -> Vec<Edit> {
    let mut first: HashMap<String, &str> = HashMap::new();
    let mut edits = Vec::new();
    for q in questions {
        let key = q.text.trim().to_lowercase();
        match first.get(key.as_str()) {
            Some(original) => edits.push(Edit::reject(&q.id, format!("duplicate of {}", original))),
            None => {
                first.insert(key, &q.id);
            }
        }
    }
    edits
}

/// A `revise` edit when the normalizers change the question or answer.
pub fn normalizer_edit(question: &Question) -> Option<Edit> {
    let cleaned_q = clean_text(&question.text);
    let cleaned_a = question
        .answer
        .as_ref()
        .map(|a| clean_text(&a.text))
        .filter(|c| Some(c) != question.answer.as_ref().map(|a| &a.text));
    let q_changed = cleaned_q != question.text;
    if !q_changed && cleaned_a.is_none() {
        return None;
    }
    Some(Edit {
        question_id: question.id.clone(),
        action: EditAction::Revise,
        question: q_changed.then_some(cleaned_q),
        answer: cleaned_a,
        reason: Some("normalized text".to_string()),
    })
}

/// Counts of what [`apply_edits`] changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub revised: usize,
    pub rejected: usize,
    pub accepted: usize,
    pub missing: usize,
}

/// Write edits back: `reject` marks the question rejected, `revise`
/// replaces the text and/or answer, `accept` changes nothing.
pub async fn apply_edits(store: &dyn Store, edits: &[Edit]) -> PipelineResult<ApplySummary> {
    let mut summary = ApplySummary::default();
    for edit in edits {
        let Some(mut question) = store.get_question(&edit.question_id).await? else {
            summary.missing += 1;
            continue;
        };
        match edit.action {
            EditAction::Accept => {
                summary.accepted += 1;
                continue;
            }
            EditAction::Reject => {
                question.status = QuestionStatus::Rejected;
                summary.rejected += 1;
            }
            EditAction::Revise => {
                if let Some(text) = edit.question.as_deref().filter(|t| !t.trim().is_empty()) {
                    question.text = text.to_string();
                }
                if let (Some(text), Some(answer)) = (edit.answer.as_deref(), question.answer.as_mut()) {
                    answer.text = text.to_string();
                }
                summary.revised += 1;
            }
        }
        store.update_question(&question).await?;
    }
    info!(revised = summary.revised, rejected = summary.rejected, "applied cleaning edits");
    Ok(summary)
}

// ═══════════════════════════════════════════════════════════════════════
// Task
// ═══════════════════════════════════════════════════════════════════════

/// Payload of a `data_cleaning` task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleaningParams {
    #[serde(default)]
    pub question_ids: Option<Vec<String>>,
    #[serde(default)]
    pub file_id: Option<String>,
    /// Run the LLM critique after the deterministic passes.
    #[serde(default)]
    pub llm: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default, flatten)]
    pub choice: ModelChoice,
}

#[derive(Clone)]
pub struct Cleaner {
    env: GeneratorEnv,
}

impl Cleaner {
    pub fn new(env: GeneratorEnv) -> Self {
        Self { env }
    }

    async fn target_questions(
        &self,
        project_id: &str,
        params: &CleaningParams,
    ) -> PipelineResult<Vec<Question>> {
        match &params.question_ids {
            Some(ids) => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    let q = self
                        .env
                        .store
                        .get_question(id)
                        .await?
                        .filter(|q| q.project_id == project_id)
                        .ok_or_else(|| PipelineError::not_found("question", id))?;
                    out.push(q);
                }
                Ok(out)
            }
            None => {
                let mut query = QuestionQuery::project(project_id);
                query.file_id = params.file_id.clone();
                Ok(self
                    .env
                    .store
                    .list_questions(&query)
                    .await?
                    .into_iter()
                    .filter(|q| q.status != QuestionStatus::Rejected)
                    .collect())
            }
        }
    }

    /// Ask the model to review one batch. Edits for ids outside the batch
    /// are dropped.
    pub async fn critique(
        &self,
        batch: &[Question],
        resolved: &Resolved,
        cancel: &CancelFlag,
    ) -> PipelineResult<Vec<Edit>> {
        let items = batch
            .iter()
            .map(|q| {
                json!({
                    "id": q.id,
                    "question": q.text,
                    "answer": q.answer.as_ref().map(|a| a.text.as_str()),
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut vars = Vars::new();
        vars.insert("items", items);
        let rendered = self
            .env
            .llm
            .render(prompt::CLEAN, resolved.prompt_version, &resolved.language, &vars)
            .await?;
        let reply = self
            .env
            .llm
            .chat_json(
                &resolved.model,
                &rendered.messages,
                "edits",
                &schema::edits_schema(),
                &resolved.language,
                cancel,
            )
            .await?;

        let known: HashSet<&str> = batch.iter().map(|q| q.id.as_str()).collect();
        let mut edits = Vec::new();
        for item in reply.value["edits"].as_array().map(Vec::as_slice).unwrap_or_default() {
            let id = item["id"].as_str().unwrap_or_default();
            if !known.contains(id) {
                warn!(id, "critique returned an edit for an unknown id");
                continue;
            }
            let action = serde_json::from_value::<EditAction>(item["action"].clone())
                .map_err(|e| PipelineError::validation(format!("bad edit action: {}", e)))?;
            let text = |k: &str| {
                item[k]
                    .as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            edits.push(Edit {
                question_id: id.to_string(),
                action,
                question: text("question").filter(|_| action == EditAction::Revise),
                answer: text("answer").filter(|_| action == EditAction::Revise),
                reason: text("reason"),
            });
        }
        Ok(edits)
    }
}

#[async_trait]
impl TaskHandler for Cleaner {
    async fn run(&self, ctx: &mut TaskContext) -> PipelineResult<Value> {
        let params: CleaningParams = ctx.params()?;
        let questions = self.target_questions(ctx.project_id(), &params).await?;

        let mut edits = duplicate_edits(&questions);
        let rejected: HashSet<String> = edits.iter().map(|e| e.question_id.clone()).collect();
        let remaining: Vec<Question> = questions
            .into_iter()
            .filter(|q| !rejected.contains(&q.id))
            .collect();
        edits.extend(remaining.iter().filter_map(normalizer_edit));

        let mut failures = Vec::new();
        if params.llm {
            let resolved = self.env.resolve(&params.choice)?;
            let size = params
                .batch_size
                .unwrap_or(self.env.settings.clean_batch_size)
                .max(1);
            let batches: Vec<&[Question]> = remaining.chunks(size).collect();
            ctx.set_total(batches.len() as u64).await?;
            for (index, batch) in batches.into_iter().enumerate() {
                ctx.checkpoint().await?;
                let cancel = ctx.cancel_flag().clone();
                match self.critique(batch, &resolved, &cancel).await {
                    Ok(found) => merge_edits(&mut edits, found),
                    Err(e) if is_item_failure(&e) => {
                        warn!(batch = index, error = %e, "critique failed for batch");
                        failures.push(ItemFailure {
                            id: format!("batch-{}", index),
                            error: e.view(),
                        });
                    }
                    Err(e) => return Err(e),
                }
                ctx.advance(index as i64).await?;
            }
        }

        info!(task_id = %ctx.id(), edits = edits.len(), "cleaning finished");
        Ok(json!({
            "reviewed": remaining.len() + rejected.len(),
            "edits": edits,
            "failures": failures,
        }))
    }
}

/// Model edits win over normalizer edits for the same question; a model
/// `accept` keeps the normalizer's revision.
fn merge_edits(edits: &mut Vec<Edit>, found: Vec<Edit>) {
    for edit in found {
        match edits.iter().position(|e| e.question_id == edit.question_id) {
            Some(_) if edit.action == EditAction::Accept => {}
            Some(i) => edits[i] = edit,
            None => edits.push(edit),
        }
    }
}
