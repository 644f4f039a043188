//! Genre/audience pair generation for a file.

use serde_json::Value;
use tracing::info;

use easy_dataset_core::models::GaPair;
use easy_dataset_core::prompt::{self, Vars};
use easy_dataset_core::{PipelineError, PipelineResult};

use super::{stable_id, GeneratorEnv, ModelChoice};
use crate::llm::schema;
use crate::tasks::CancelFlag;

/// Most pairs proposed per file.
pub const MAX_GA_PAIRS: usize = 5;

/// Characters of a file's leading text shown to the model.
const LEADING_TEXT_CHARS: usize = 6000;

#[derive(Clone)]
pub struct GaPairGenerator {
    env: GeneratorEnv,
}

impl GaPairGenerator {
    pub fn new(env: GeneratorEnv) -> Self {
        Self { env }
    }

    /// Propose up to `count` pairs for a file and replace its stored pairs.
    ///
    /// All new pairs start active.
    pub async fn generate(
        &self,
        file_id: &str,
        count: usize,
        choice: &ModelChoice,
        cancel: &CancelFlag,
    ) -> PipelineResult<Vec<GaPair>> {
        let count = count.clamp(1, MAX_GA_PAIRS);
        let file = self
            .env
            .store
            .get_file(file_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("file", file_id))?;
        let resolved = self.env.resolve(choice)?;
        let text = self.leading_text(file_id).await?;
        if text.trim().is_empty() {
            return Err(PipelineError::validation(format!(
                "file '{}' has no chunks; process it first",
                file.file_name
            )));
        }

        let mut vars = Vars::new();
        vars.insert("number", count.to_string());
        vars.insert("text", text);
        let rendered = self
            .env
            .llm
            .render(prompt::GA_PAIR, resolved.prompt_version, &resolved.language, &vars)
            .await?;
        let reply = self
            .env
            .llm
            .chat_json(
                &resolved.model,
                &rendered.messages,
                "ga_pairs",
                &schema::ga_pairs_schema(),
                &resolved.language,
                cancel,
            )
            .await?;

        let pairs: Vec<GaPair> = reply.value["pairs"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .take(count)
            .enumerate()
            .map(|(i, item)| {
                let ordinal = i as u32 + 1;
                GaPair {
                    id: stable_id("ga_pair", &[&file.id, &ordinal.to_string()]),
                    project_id: file.project_id.clone(),
                    file_id: Some(file.id.clone()),
                    chunk_id: None,
                    ordinal,
                    genre_title: field(item, "genre", "title"),
                    genre_desc: field(item, "genre", "description"),
                    audience_title: field(item, "audience", "title"),
                    audience_desc: field(item, "audience", "description"),
                    active: true,
                }
            })
            .collect();

        self.env.store.replace_ga_pairs(&file.id, &pairs).await?;
        info!(file_id = %file.id, pairs = pairs.len(), "generated GA pairs");
        Ok(pairs)
    }

    async fn leading_text(&self, file_id: &str) -> PipelineResult<String> {
        let mut text = String::new();
        for chunk in self.env.store.list_chunks(file_id).await? {
            if text.chars().count() >= LEADING_TEXT_CHARS {
                break;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(chunk.body());
        }
        Ok(text.chars().take(LEADING_TEXT_CHARS).collect())
    }
}

fn field(item: &Value, outer: &str, inner: &str) -> String {
    item[outer][inner].as_str().unwrap_or_default().trim().to_string()
}
