//! Answer generation: one grounded answer per question.
//!
//! The prompt carries the question and the full content of its chunk.
//! Reasoning returned by the provider (a `<think>` block or a reasoning
//! field) is kept as the answer's chain of thought.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use easy_dataset_core::models::{Answer, Question, QuestionStatus};
use easy_dataset_core::prompt::{self, Vars};
use easy_dataset_core::store::QuestionQuery;
use easy_dataset_core::{PipelineError, PipelineResult};

use super::{is_item_failure, GeneratorEnv, ItemFailure, ModelChoice, Resolved};
use crate::llm::ResponseFormat;
use crate::tasks::{CancelFlag, TaskContext, TaskHandler};

/// Payload of an `answer_generation` task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerGenerationParams {
    /// Explicit questions. Otherwise every pending question of the file
    /// (or project) is answered.
    #[serde(default)]
    pub question_ids: Option<Vec<String>>,
    #[serde(default)]
    pub file_id: Option<String>,
    /// Also regenerate answers that already exist.
    #[serde(default)]
    pub include_answered: bool,
    /// Extra instructions appended to the answer prompt.
    #[serde(default)]
    pub template_prompt: Option<String>,
    #[serde(default, flatten)]
    pub choice: ModelChoice,
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    questions_total: usize,
    answered: usize,
    resumed: usize,
    retries: u32,
    failures: Vec<ItemFailure>,
}

#[derive(Clone)]
pub struct AnswerGenerator {
    env: GeneratorEnv,
}

impl AnswerGenerator {
    pub fn new(env: GeneratorEnv) -> Self {
        Self { env }
    }

    /// Question ids a request covers, in store order.
    pub async fn target_questions(
        &self,
        project_id: &str,
        params: &AnswerGenerationParams,
    ) -> PipelineResult<Vec<String>> {
        if let Some(ids) = &params.question_ids {
            return Ok(ids.clone());
        }
        let mut query = QuestionQuery::project(project_id);
        query.file_id = params.file_id.clone();
        let questions = self.env.store.list_questions(&query).await?;
        Ok(questions
            .into_iter()
            .filter(|q| match q.status {
                QuestionStatus::Pending => true,
                QuestionStatus::Answered => params.include_answered,
                QuestionStatus::Rejected => false,
            })
            .map(|q| q.id)
            .collect())
    }

    /// Generate an answer for one question without persisting it.
    pub async fn answer(
        &self,
        question: &Question,
        template_prompt: Option<&str>,
        resolved: &Resolved,
        cancel: &CancelFlag,
    ) -> PipelineResult<Answer> {
        let chunk = self
            .env
            .store
            .get_chunk(&question.chunk_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("chunk", &question.chunk_id))?;

        let mut vars = Vars::new();
        vars.insert("text", chunk.content);
        vars.insert("question", question.text.clone());
        vars.insert("templatePrompt", template_prompt.unwrap_or_default().to_string());
        let rendered = self
            .env
            .llm
            .render(prompt::ANSWER, resolved.prompt_version, &resolved.language, &vars)
            .await?;

        let reply = self
            .env
            .llm
            .chat(&resolved.model, &rendered.messages, ResponseFormat::Text, cancel)
            .await?;
        let text = reply.completion.text.trim().to_string();
        if text.is_empty() {
            return Err(PipelineError::Permanent {
                provider: resolved.model.provider.clone(),
                message: "empty answer".to_string(),
            });
        }
        Ok(Answer {
            text,
            chain_of_thought: reply.completion.reasoning.filter(|r| !r.trim().is_empty()),
            provenance: rendered.provenance(&resolved.model),
            score: None,
            evaluation: None,
            retries: reply.retries,
        })
    }
}

#[async_trait]
impl TaskHandler for AnswerGenerator {
    async fn run(&self, ctx: &mut TaskContext) -> PipelineResult<Value> {
        let mut params: AnswerGenerationParams = ctx.params()?;
        let resolved = self.env.resolve(&params.choice)?;

        // Freeze the target list on first run so the resume cursor keeps
        // pointing at the same question after earlier ones are answered.
        let ids = match &params.question_ids {
            Some(ids) => ids.clone(),
            None => {
                let ids = self.target_questions(ctx.project_id(), &params).await?;
                params.question_ids = Some(ids.clone());
                let frozen = serde_json::to_value(&params)?;
                ctx.freeze_payload(frozen).await?;
                ids
            }
        };

        let skip = ctx.resume_from().map(|c| (c + 1).max(0) as usize).unwrap_or(0);
        ctx.set_total(ids.len() as u64).await?;
        ctx.set_completed(skip.min(ids.len()) as u64);

        let mut summary = RunSummary {
            questions_total: ids.len(),
            resumed: skip.min(ids.len()),
            ..Default::default()
        };
        for (index, id) in ids.iter().enumerate().skip(skip) {
            ctx.checkpoint().await?;
            let question = self
                .env
                .store
                .get_question(id)
                .await?
                .filter(|q| q.project_id == ctx.project_id());
            let Some(question) = question else {
                summary.failures.push(ItemFailure {
                    id: id.clone(),
                    error: PipelineError::not_found("question", id).view(),
                });
                ctx.advance(index as i64).await?;
                continue;
            };
            let cancel = ctx.cancel_flag().clone();
            match self
                .answer(&question, params.template_prompt.as_deref(), &resolved, &cancel)
                .await
            {
                Ok(answer) => {
                    summary.retries += answer.retries;
                    self.env.store.set_answer(&question.id, &answer).await?;
                    summary.answered += 1;
                }
                Err(e) if is_item_failure(&e) => {
                    warn!(question_id = %question.id, error = %e, "answer generation failed for question");
                    summary.failures.push(ItemFailure {
                        id: question.id.clone(),
                        error: e.view(),
                    });
                }
                Err(e) => return Err(e),
            }
            ctx.advance(index as i64).await?;
        }

        info!(task_id = %ctx.id(), answered = summary.answered, "answer generation finished");
        Ok(serde_json::to_value(summary)?)
    }
}
