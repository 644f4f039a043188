//! Question generation.
//!
//! One unit of work is one chunk. For each chunk the generator asks for
//! `n = clamp(⌊len / chars_per_question⌋, min, max)` questions in total,
//! split across the requested GA pairs (or in one call without a pair),
//! drops duplicates, and replaces the chunk's questions in a single store
//! call. Answered questions survive a repeated run and count against `n`.
//! Question ids are derived from `(chunk, ordinal)`, so a resumed or
//! repeated run overwrites unanswered questions instead of appending.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use easy_dataset_core::models::{Chunk, GaPair, Question, QuestionStatus};
use easy_dataset_core::prompt::{self, Vars};
use easy_dataset_core::store::QuestionQuery;
use easy_dataset_core::{PipelineError, PipelineResult};

use super::{is_item_failure, stable_id, GeneratorEnv, ItemFailure, ModelChoice, Resolved};
use crate::llm::schema;
use crate::tasks::{CancelFlag, TaskContext, TaskHandler};

/// Characters per question used when no bounds are configured.
pub const LEGACY_CHARS_PER_QUESTION: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionBounds {
    pub min_questions: usize,
    pub max_questions: usize,
    pub chars_per_question: usize,
}

impl QuestionBounds {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.min_questions == 0 || self.min_questions > self.max_questions {
            return Err(PipelineError::validation(format!(
                "question bounds must satisfy 1 <= min <= max (got {} / {})",
                self.min_questions, self.max_questions
            )));
        }
        if self.chars_per_question == 0 {
            return Err(PipelineError::validation("chars_per_question must be > 0"));
        }
        Ok(())
    }
}

/// Number of questions to request for a chunk of `len` characters.
///
/// Without bounds this is `max(1, len / 240)`.
pub fn question_count(len: usize, bounds: Option<&QuestionBounds>) -> usize {
    match bounds {
        Some(b) => (len / b.chars_per_question).clamp(b.min_questions, b.max_questions),
        None => (len / LEGACY_CHARS_PER_QUESTION).max(1),
    }
}

/// Lowercase and collapse whitespace: the key duplicates are compared on.
pub fn normalize_question(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Drop blank and duplicate questions, keeping first occurrences.
pub fn dedupe_questions(questions: Vec<String>, seen: &mut HashSet<String>) -> Vec<String> {
    questions
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .filter(|q| seen.insert(normalize_question(q)))
        .collect()
}

/// Payload of a `question_generation` task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionGenerationParams {
    /// Restrict to one file. Without this and `chunk_ids`, every chunk of
    /// the project is processed.
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub chunk_ids: Option<Vec<String>>,
    /// Condition on one GA pair.
    #[serde(default)]
    pub ga_pair_id: Option<String>,
    /// Condition on every active GA pair of each chunk's file.
    #[serde(default)]
    pub use_ga_pairs: bool,
    #[serde(default)]
    pub bounds: Option<QuestionBounds>,
    #[serde(default, flatten)]
    pub choice: ModelChoice,
}

/// Output of one chunk.
#[derive(Debug, Clone)]
pub struct ChunkQuestions {
    pub questions: Vec<Question>,
    pub repaired: usize,
    pub retries: u32,
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    chunks_total: usize,
    chunks_processed: usize,
    chunks_resumed: usize,
    questions: usize,
    answered_kept: usize,
    retries: u32,
    repaired: usize,
    failures: Vec<ItemFailure>,
}

#[derive(Clone)]
pub struct QuestionGenerator {
    env: GeneratorEnv,
}

impl QuestionGenerator {
    pub fn new(env: GeneratorEnv) -> Self {
        Self { env }
    }

    fn default_bounds(&self) -> QuestionBounds {
        let s = &self.env.settings;
        QuestionBounds {
            min_questions: s.min_questions,
            max_questions: s.max_questions,
            chars_per_question: s.chars_per_question,
        }
    }

    /// Chunks a request covers, in file then ordinal order.
    pub async fn target_chunks(
        &self,
        project_id: &str,
        params: &QuestionGenerationParams,
    ) -> PipelineResult<Vec<Chunk>> {
        let store = &self.env.store;
        if let Some(ids) = &params.chunk_ids {
            let mut chunks = Vec::with_capacity(ids.len());
            for id in ids {
                let chunk = store
                    .get_chunk(id)
                    .await?
                    .filter(|c| c.project_id == project_id)
                    .ok_or_else(|| PipelineError::not_found("chunk", id))?;
                chunks.push(chunk);
            }
            return Ok(chunks);
        }
        let files = match &params.file_id {
            Some(id) => vec![store
                .get_file(id)
                .await?
                .filter(|f| f.project_id == project_id)
                .ok_or_else(|| PipelineError::not_found("file", id))?],
            None => store.list_files(project_id).await?,
        };
        let mut chunks = Vec::new();
        for file in files {
            chunks.extend(store.list_chunks(&file.id).await?);
        }
        Ok(chunks)
    }

    /// GA pairs to condition a chunk on. `[None]` means unconditioned.
    async fn pairs_for(
        &self,
        chunk: &Chunk,
        params: &QuestionGenerationParams,
    ) -> PipelineResult<Vec<Option<GaPair>>> {
        if let Some(id) = &params.ga_pair_id {
            let pair = self
                .env
                .store
                .list_ga_pairs(&chunk.project_id, None)
                .await?
                .into_iter()
                .find(|p| &p.id == id)
                .ok_or_else(|| PipelineError::not_found("ga_pair", id))?;
            return Ok(vec![Some(pair)]);
        }
        if params.use_ga_pairs {
            let active: Vec<Option<GaPair>> = self
                .env
                .store
                .list_ga_pairs(&chunk.project_id, Some(&chunk.file_id))
                .await?
                .into_iter()
                .filter(|p| p.active)
                .map(Some)
                .collect();
            if !active.is_empty() {
                return Ok(active);
            }
        }
        Ok(vec![None])
    }

    /// Generate the questions for one chunk without persisting them.
    pub async fn generate_for_chunk(
        &self,
        chunk: &Chunk,
        pairs: &[Option<GaPair>],
        bounds: Option<&QuestionBounds>,
        resolved: &Resolved,
        cancel: &CancelFlag,
    ) -> PipelineResult<ChunkQuestions> {
        self.generate_beside(chunk, &[], pairs, bounds, resolved, cancel)
            .await
    }

    /// Generate new questions for a chunk that already holds `kept`.
    ///
    /// The kept questions count against the chunk's budget, their texts
    /// are not repeated, and their ordinals are not reused. Only the new
    /// questions are returned.
    pub async fn generate_beside(
        &self,
        chunk: &Chunk,
        kept: &[Question],
        pairs: &[Option<GaPair>],
        bounds: Option<&QuestionBounds>,
        resolved: &Resolved,
        cancel: &CancelFlag,
    ) -> PipelineResult<ChunkQuestions> {
        let text = chunk.content.as_str();
        let length = text.chars().count();
        let number = question_count(length, bounds);
        let budget = number.saturating_sub(kept.len());
        let mut seen: HashSet<String> = kept.iter().map(|q| normalize_question(&q.text)).collect();
        let mut taken: HashSet<u32> = kept.iter().map(|q| q.ordinal).collect();
        let mut next_ordinal = 0u32;
        let mut out = ChunkQuestions {
            questions: Vec::new(),
            repaired: 0,
            retries: 0,
        };

        // The budget covers the whole chunk and is shared across pairs.
        for (i, pair) in pairs.iter().enumerate() {
            let remaining = budget.saturating_sub(out.questions.len());
            if remaining == 0 {
                break;
            }
            let share = remaining.div_ceil(pairs.len() - i);
            cancel.check()?;
            let description = pair.as_ref().map(GaPair::describe);
            let (ga_prompt, ga_note, ga_check) =
                prompt::ga_fragments(&resolved.language, description.as_deref());
            let mut vars = Vars::new();
            vars.insert("textLength", length.to_string());
            vars.insert("number", share.to_string());
            vars.insert("text", text.to_string());
            vars.insert("gaPrompt", ga_prompt);
            vars.insert("gaPromptNote", ga_note);
            vars.insert("gaPromptCheck", ga_check);
            let rendered = self
                .env
                .llm
                .render(prompt::QUESTION, resolved.prompt_version, &resolved.language, &vars)
                .await?;

            let reply = self
                .env
                .llm
                .chat_json(
                    &resolved.model,
                    &rendered.messages,
                    "questions",
                    &schema::questions_schema(share),
                    &resolved.language,
                    cancel,
                )
                .await?;
            out.retries += reply.retries;
            out.repaired += usize::from(reply.repaired);

            let raw: Vec<String> = reply.value["questions"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let mut fresh = dedupe_questions(raw, &mut seen);
            fresh.truncate(share);

            let provenance = rendered.provenance(&resolved.model);
            for text in fresh {
                while !taken.insert(next_ordinal) {
                    next_ordinal += 1;
                }
                let ordinal = next_ordinal;
                out.questions.push(Question {
                    id: stable_id("question", &[&chunk.id, &ordinal.to_string()]),
                    project_id: chunk.project_id.clone(),
                    file_id: chunk.file_id.clone(),
                    chunk_id: chunk.id.clone(),
                    ordinal,
                    text,
                    provenance: provenance.clone(),
                    tags: chunk.tags.clone(),
                    ga_pair_id: pair.as_ref().map(|p| p.id.clone()),
                    status: QuestionStatus::Pending,
                    answer: None,
                    conversation: None,
                });
            }
        }
        debug!(
            chunk_id = %chunk.id,
            requested = budget,
            kept = kept.len(),
            generated = out.questions.len(),
            "generated questions"
        );
        Ok(out)
    }
}

#[async_trait]
impl TaskHandler for QuestionGenerator {
    async fn run(&self, ctx: &mut TaskContext) -> PipelineResult<Value> {
        let params: QuestionGenerationParams = ctx.params()?;
        let resolved = self.env.resolve(&params.choice)?;
        let bounds = params.bounds.unwrap_or_else(|| self.default_bounds());
        bounds.validate()?;

        let chunks = self.target_chunks(ctx.project_id(), &params).await?;
        let skip = ctx.resume_from().map(|c| (c + 1).max(0) as usize).unwrap_or(0);
        ctx.set_total(chunks.len() as u64).await?;
        ctx.set_completed(skip.min(chunks.len()) as u64);
        if skip > 0 {
            info!(task_id = %ctx.id(), skip, "resuming question generation");
        }

        let mut summary = RunSummary {
            chunks_total: chunks.len(),
            chunks_resumed: skip.min(chunks.len()),
            ..Default::default()
        };
        for (index, chunk) in chunks.iter().enumerate().skip(skip) {
            ctx.checkpoint().await?;
            let pairs = self.pairs_for(chunk, &params).await?;
            let mut questions: Vec<Question> = self
                .env
                .store
                .list_questions(&QuestionQuery::chunk(&chunk.id))
                .await?
                .into_iter()
                .filter(|q| q.status == QuestionStatus::Answered)
                .collect();
            let cancel = ctx.cancel_flag().clone();
            match self
                .generate_beside(chunk, &questions, &pairs, Some(&bounds), &resolved, &cancel)
                .await
            {
                Ok(generated) => {
                    summary.answered_kept += questions.len();
                    summary.questions += generated.questions.len();
                    questions.extend(generated.questions);
                    self.env
                        .store
                        .replace_chunk_questions(&chunk.id, &questions)
                        .await?;
                    summary.retries += generated.retries;
                    summary.repaired += generated.repaired;
                    summary.chunks_processed += 1;
                }
                Err(e) if is_item_failure(&e) => {
                    warn!(chunk_id = %chunk.id, error = %e, "question generation failed for chunk");
                    summary.failures.push(ItemFailure {
                        id: chunk.id.clone(),
                        error: e.view(),
                    });
                }
                Err(e) => return Err(e),
            }
            ctx.advance(index as i64).await?;
        }

        info!(
            task_id = %ctx.id(),
            chunks = summary.chunks_processed,
            questions = summary.questions,
            "question generation finished"
        );
        Ok(serde_json::to_value(summary)?)
    }
}
