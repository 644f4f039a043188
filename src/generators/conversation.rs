//! Multi-turn conversation generation.
//!
//! Seeded either by an answered question (the result is stored on the
//! question and picked up by later dataset snapshots) or by a free topic
//! (the result is returned in the task output only).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use easy_dataset_core::conversation::{truncate_exchanges, validate_turns};
use easy_dataset_core::models::{Question, QuestionStatus, Role, Turn};
use easy_dataset_core::prompt::{self, Vars};
use easy_dataset_core::store::QuestionQuery;
use easy_dataset_core::{PipelineError, PipelineResult};

use super::{is_item_failure, GeneratorEnv, ItemFailure, ModelChoice, Resolved};
use crate::llm::schema;
use crate::tasks::{CancelFlag, TaskContext, TaskHandler};

/// Payload of a `conversation_generation` task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationParams {
    #[serde(default)]
    pub question_ids: Option<Vec<String>>,
    #[serde(default)]
    pub file_id: Option<String>,
    /// Seed a single conversation from a topic instead of questions.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub role_a: Option<String>,
    #[serde(default)]
    pub role_b: Option<String>,
    #[serde(default)]
    pub max_turns: Option<usize>,
    /// Becomes the leading system turn.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default, flatten)]
    pub choice: ModelChoice,
}

/// Scenario settings with configuration defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub scenario: String,
    pub role_a: String,
    pub role_b: String,
    pub max_turns: usize,
    pub system_prompt: Option<String>,
}

/// What a conversation starts from.
#[derive(Debug, Clone, Copy)]
pub enum Seed<'a> {
    Pair {
        question: &'a str,
        answer: &'a str,
        source: &'a str,
    },
    Topic(&'a str),
}

#[derive(Clone)]
pub struct ConversationGenerator {
    env: GeneratorEnv,
}

impl ConversationGenerator {
    pub fn new(env: GeneratorEnv) -> Self {
        Self { env }
    }

    pub fn scenario(&self, params: &ConversationParams) -> PipelineResult<Scenario> {
        let s = &self.env.settings;
        let max_turns = params.max_turns.unwrap_or(s.conversation_max_turns);
        if max_turns == 0 {
            return Err(PipelineError::validation("max_turns must be at least 1"));
        }
        Ok(Scenario {
            scenario: params.scenario.clone().unwrap_or_else(|| s.conversation_scenario.clone()),
            role_a: params.role_a.clone().unwrap_or_else(|| s.conversation_role_a.clone()),
            role_b: params.role_b.clone().unwrap_or_else(|| s.conversation_role_b.clone()),
            max_turns,
            system_prompt: params.system_prompt.clone().filter(|p| !p.trim().is_empty()),
        })
    }

    /// Generate one conversation. The result satisfies the turn rules and
    /// holds at most `max_turns` exchanges.
    pub async fn generate(
        &self,
        seed: Seed<'_>,
        scenario: &Scenario,
        resolved: &Resolved,
        cancel: &CancelFlag,
    ) -> PipelineResult<Vec<Turn>> {
        let (question, answer, text) = match seed {
            Seed::Pair {
                question,
                answer,
                source,
            } => (question, answer, source),
            Seed::Topic(topic) => (topic, "", topic),
        };
        let mut vars = Vars::new();
        vars.insert("scenario", scenario.scenario.clone());
        vars.insert("roleA", scenario.role_a.clone());
        vars.insert("roleB", scenario.role_b.clone());
        vars.insert("maxTurns", scenario.max_turns.to_string());
        vars.insert("question", question.to_string());
        vars.insert("answer", answer.to_string());
        vars.insert("text", text.to_string());
        let rendered = self
            .env
            .llm
            .render(prompt::CONVERSATION, resolved.prompt_version, &resolved.language, &vars)
            .await?;
        let reply = self
            .env
            .llm
            .chat_json(
                &resolved.model,
                &rendered.messages,
                "conversation",
                &schema::conversation_schema(),
                &resolved.language,
                cancel,
            )
            .await?;

        let mut turns: Vec<Turn> = serde_json::from_value(reply.value["turns"].clone())
            .map_err(|e| PipelineError::validation(format!("bad conversation turns: {}", e)))?;
        turns.retain(|t| t.role != Role::System);
        if let Some(system) = &scenario.system_prompt {
            turns.insert(0, Turn::new(Role::System, system.clone()));
        }
        let turns = truncate_exchanges(turns, scenario.max_turns);
        validate_turns(&turns)?;
        Ok(turns)
    }

    async fn target_questions(
        &self,
        project_id: &str,
        params: &ConversationParams,
    ) -> PipelineResult<Vec<Question>> {
        let questions = match &params.question_ids {
            Some(ids) => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    out.push(
                        self.env
                            .store
                            .get_question(id)
                            .await?
                            .filter(|q| q.project_id == project_id)
                            .ok_or_else(|| PipelineError::not_found("question", id))?,
                    );
                }
                out
            }
            None => {
                let mut query = QuestionQuery::project(project_id);
                query.file_id = params.file_id.clone();
                self.env.store.list_questions(&query).await?
            }
        };
        Ok(questions
            .into_iter()
            .filter(|q| q.status == QuestionStatus::Answered && q.answer.is_some())
            .collect())
    }
}

#[async_trait]
impl TaskHandler for ConversationGenerator {
    async fn run(&self, ctx: &mut TaskContext) -> PipelineResult<Value> {
        let params: ConversationParams = ctx.params()?;
        let resolved = self.env.resolve(&params.choice)?;
        let scenario = self.scenario(&params)?;

        if let Some(topic) = params.topic.as_deref().filter(|t| !t.trim().is_empty()) {
            ctx.set_total(1).await?;
            ctx.checkpoint().await?;
            let cancel = ctx.cancel_flag().clone();
            let turns = self
                .generate(Seed::Topic(topic), &scenario, &resolved, &cancel)
                .await?;
            ctx.advance(0).await?;
            return Ok(json!({ "topic": topic, "turns": turns }));
        }

        let questions = self.target_questions(ctx.project_id(), &params).await?;
        ctx.set_total(questions.len() as u64).await?;
        let mut generated = 0usize;
        let mut failures = Vec::new();
        for (index, question) in questions.into_iter().enumerate() {
            ctx.checkpoint().await?;
            let Some(chunk) = self.env.store.get_chunk(&question.chunk_id).await? else {
                ctx.advance(index as i64).await?;
                continue;
            };
            let answer = question
                .answer
                .as_ref()
                .map(|a| a.text.as_str())
                .unwrap_or_default();
            let seed = Seed::Pair {
                question: &question.text,
                answer,
                source: &chunk.content,
            };
            let cancel = ctx.cancel_flag().clone();
            match self.generate(seed, &scenario, &resolved, &cancel).await {
                Ok(turns) => {
                    let mut updated = question.clone();
                    updated.conversation = Some(turns);
                    self.env.store.update_question(&updated).await?;
                    generated += 1;
                }
                Err(e) if is_item_failure(&e) => {
                    warn!(question_id = %question.id, error = %e, "conversation generation failed");
                    failures.push(ItemFailure {
                        id: question.id.clone(),
                        error: e.view(),
                    });
                }
                Err(e) => return Err(e),
            }
            ctx.advance(index as i64).await?;
        }

        info!(task_id = %ctx.id(), generated, "conversation generation finished");
        Ok(json!({ "generated": generated, "failures": failures }))
    }
}
