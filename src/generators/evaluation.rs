//! Dataset evaluation: score a sample of a dataset's pairs.
//!
//! Each sampled pair is scored in `[0, 1]` against its source chunk. The
//! score and rationale are written to the question's answer and to the
//! dataset entries; the aggregate `{count, mean, p50, p95}` is persisted
//! on the dataset.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use easy_dataset_core::models::{DatasetConversation, DatasetStatus, EvaluationSummary};
use easy_dataset_core::prompt::{self, Vars};
use easy_dataset_core::{PipelineError, PipelineResult};

use super::{is_item_failure, GeneratorEnv, ItemFailure, ModelChoice, Resolved};
use crate::llm::schema;
use crate::tasks::{CancelFlag, TaskContext, TaskHandler};

/// Seed used when a request does not pin one.
const DEFAULT_SEED: u64 = 42;

/// Payload of a `dataset_evaluation` task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationParams {
    pub dataset_id: String,
    /// Evaluate at most this many entries; all of them when absent.
    #[serde(default)]
    pub sample_size: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default, flatten)]
    pub choice: ModelChoice,
}

/// Score and rationale for one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Score {
    pub entry_id: String,
    pub question_id: String,
    pub score: f64,
    pub evaluation: String,
}

/// Indices of a deterministic sample of `size` out of `len`, ascending.
pub fn sample_indices(len: usize, size: Option<usize>, seed: u64) -> Vec<usize> {
    match size {
        Some(n) if n < len => {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut picked = sample(&mut rng, len, n).into_vec();
            picked.sort_unstable();
            picked
        }
        _ => (0..len).collect(),
    }
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Aggregate scores. `None` when nothing was scored.
pub fn summarize(scores: &[f64]) -> Option<EvaluationSummary> {
    if scores.is_empty() {
        return None;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(EvaluationSummary {
        count: sorted.len(),
        mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
        p50: percentile(&sorted, 50.0),
        p95: percentile(&sorted, 95.0),
        evaluated_at: Utc::now(),
    })
}

#[derive(Clone)]
pub struct Evaluator {
    env: GeneratorEnv,
}

impl Evaluator {
    pub fn new(env: GeneratorEnv) -> Self {
        Self { env }
    }

    /// Score one entry against its chunk.
    pub async fn score(
        &self,
        entry: &DatasetConversation,
        resolved: &Resolved,
        cancel: &CancelFlag,
    ) -> PipelineResult<Score> {
        let chunk = self
            .env
            .store
            .get_chunk(&entry.chunk_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("chunk", &entry.chunk_id))?;
        let mut vars = Vars::new();
        vars.insert("text", chunk.content);
        vars.insert("question", entry.question.clone());
        vars.insert("answer", entry.answer.clone());
        let rendered = self
            .env
            .llm
            .render(prompt::EVALUATE, resolved.prompt_version, &resolved.language, &vars)
            .await?;
        let reply = self
            .env
            .llm
            .chat_json(
                &resolved.model,
                &rendered.messages,
                "evaluation",
                &schema::evaluation_schema(),
                &resolved.language,
                cancel,
            )
            .await?;
        let score = reply.value["score"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
        let evaluation = reply.value["evaluation"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(Score {
            entry_id: entry.id.clone(),
            question_id: entry.question_id.clone(),
            score,
            evaluation,
        })
    }

    async fn record(&self, score: &Score) -> PipelineResult<()> {
        let Some(mut question) = self.env.store.get_question(&score.question_id).await? else {
            return Ok(());
        };
        if let Some(answer) = question.answer.as_mut() {
            answer.score = Some(score.score);
            answer.evaluation = Some(score.evaluation.clone());
            self.env.store.update_question(&question).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for Evaluator {
    async fn run(&self, ctx: &mut TaskContext) -> PipelineResult<Value> {
        let params: EvaluationParams = ctx.params()?;
        let resolved = self.env.resolve(&params.choice)?;
        let mut dataset = self
            .env
            .store
            .get_dataset(&params.dataset_id)
            .await?
            .filter(|d| d.project_id == ctx.project_id())
            .ok_or_else(|| PipelineError::not_found("dataset", &params.dataset_id))?;
        if dataset.status == DatasetStatus::Draft {
            return Err(PipelineError::validation(format!(
                "dataset '{}' must be snapshotted before evaluation",
                dataset.name
            )));
        }

        let mut entries = self.env.store.list_dataset_entries(&dataset.id).await?;
        let picked = sample_indices(
            entries.len(),
            params.sample_size,
            params.seed.unwrap_or(DEFAULT_SEED),
        );
        ctx.set_total(picked.len() as u64).await?;

        let mut scores = Vec::with_capacity(picked.len());
        let mut failures = Vec::new();
        for (n, &index) in picked.iter().enumerate() {
            ctx.checkpoint().await?;
            let cancel = ctx.cancel_flag().clone();
            match self.score(&entries[index], &resolved, &cancel).await {
                Ok(score) => {
                    self.record(&score).await?;
                    scores.push(score);
                }
                Err(e) if is_item_failure(&e) => {
                    warn!(entry_id = %entries[index].id, error = %e, "evaluation failed for entry");
                    failures.push(ItemFailure {
                        id: entries[index].id.clone(),
                        error: e.view(),
                    });
                }
                Err(e) => return Err(e),
            }
            ctx.advance(n as i64).await?;
        }

        let by_entry: HashMap<&str, f64> = scores.iter().map(|s| (s.entry_id.as_str(), s.score)).collect();
        for entry in &mut entries {
            if let Some(score) = by_entry.get(entry.id.as_str()) {
                entry.score = Some(*score);
            }
        }
        let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
        dataset.evaluation = summarize(&values);
        self.env.store.save_dataset_snapshot(&dataset, &entries).await?;
        info!(
            task_id = %ctx.id(),
            dataset_id = %dataset.id,
            scored = values.len(),
            mean = dataset.evaluation.as_ref().map(|s| s.mean),
            "dataset evaluation finished"
        );
        Ok(serde_json::json!({
            "dataset_id": dataset.id,
            "summary": dataset.evaluation,
            "scores": scores,
            "failures": failures,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::store_with_questions;
    use crate::dataset::{DatasetAssembler, NewDataset};
    use crate::generators::testing::{env, Scripted};
    use easy_dataset_core::models::{Selection, SelectionFilter, Task, TaskType};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn percentiles_use_nearest_rank() {
        let s = summarize(&[0.2, 0.4, 0.6, 0.8, 1.0]).unwrap();
        assert_eq!(s.count, 5);
        assert!((s.mean - 0.6).abs() < 1e-9);
        assert_eq!(s.p50, 0.6);
        assert_eq!(s.p95, 1.0);
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn sampling_is_deterministic() {
        let a = sample_indices(100, Some(10), 7);
        assert_eq!(a, sample_indices(100, Some(10), 7));
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sample_indices(3, Some(10), 7), vec![0, 1, 2]);
        assert_eq!(sample_indices(3, None, 7), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn scores_are_persisted_on_questions_entries_and_dataset() {
        let (store, project, _qs) = store_with_questions(4, 4).await;
        let assembler = DatasetAssembler::new(store.clone());
        let dataset = assembler
            .create(
                &project.id,
                NewDataset {
                    name: "eval".into(),
                    selection: Selection::Filter(SelectionFilter::default()),
                    materialize_ga_pairs: false,
                    system_prompt: None,
                },
            )
            .await
            .unwrap();
        assembler.snapshot(&dataset.id).await.unwrap();

        let mock = Scripted::with(|prompt: &str| {
            let score = if prompt.contains("Question 1?") { 1.5 } else { 0.5 };
            json!({"score": score, "evaluation": "fine"}).to_string()
        });
        // 1.5 is out of range; the repair prompt no longer names the
        // question, so the second reply is in range.
        let evaluator = Evaluator::new(env(mock.clone(), store.clone()));

        let mut task = Task::new(
            &project.id,
            TaskType::DatasetEvaluation,
            Some(dataset.id.clone()),
            json!({"dataset_id": dataset.id}),
        );
        store.insert_task(&task).await.unwrap();
        task = store.start_task(&task.id).await.unwrap();
        let mut ctx = TaskContext::new(task, store.clone(), CancelFlag::new(), Duration::ZERO);
        let result = evaluator.run(&mut ctx).await.unwrap();
        assert_eq!(result["scores"].as_array().unwrap().len(), 4);

        let stored = store.get_dataset(&dataset.id).await.unwrap().unwrap();
        let summary = stored.evaluation.unwrap();
        assert_eq!(summary.count, 4);
        assert!(summary.p95 <= 1.0);

        let entries = store.list_dataset_entries(&dataset.id).await.unwrap();
        assert!(entries.iter().all(|e| e.score.is_some()));
        let q3 = store.get_question("q3").await.unwrap().unwrap();
        assert_eq!(q3.answer.unwrap().evaluation.as_deref(), Some("fine"));
    }

    #[tokio::test]
    async fn draft_dataset_is_rejected() {
        let (store, project, _qs) = store_with_questions(1, 1).await;
        let assembler = DatasetAssembler::new(store.clone());
        let dataset = assembler
            .create(
                &project.id,
                NewDataset {
                    name: "draft".into(),
                    selection: Selection::Filter(SelectionFilter::default()),
                    materialize_ga_pairs: false,
                    system_prompt: None,
                },
            )
            .await
            .unwrap();
        let evaluator = Evaluator::new(env(Scripted::with(|_| String::new()), store.clone()));
        let mut task = Task::new(
            &project.id,
            TaskType::DatasetEvaluation,
            None,
            json!({"dataset_id": dataset.id}),
        );
        store.insert_task(&task).await.unwrap();
        task = store.start_task(&task.id).await.unwrap();
        let mut ctx = TaskContext::new(task, store.clone(), CancelFlag::new(), Duration::ZERO);
        let err = evaluator.run(&mut ctx).await.unwrap_err();
        assert_eq!(err.kind(), easy_dataset_core::ErrorKind::Validation);
    }
}
