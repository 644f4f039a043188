//! Ollama adapter (`/api/chat`, `/api/embeddings`).
//!
//! Endpoints configured with a trailing `/v1` or `/api` are normalized to
//! the server root, so an OpenAI-style Ollama URL works unchanged.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};

use easy_dataset_core::PipelineResult;

use super::http::{self, Framing};
use super::openai::parse_embedding;
use super::{
    finish_text, role_str, Capability, Completion, GenerationParams, LlmProvider, Message,
    ResponseFormat, TokenStream, Usage,
};

pub struct OllamaProvider {
    name: String,
    base: String,
    client: reqwest::Client,
    timeout: Duration,
    embedding_model: Option<String>,
}

impl OllamaProvider {
    pub fn new(name: &str, endpoint: String, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            base: normalize_endpoint(&endpoint),
            client,
            timeout,
            embedding_model: None,
        }
    }

    pub fn with_embedding_model(mut self, model: Option<String>) -> Self {
        self.embedding_model = model;
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub(crate) fn request_body(messages: &[Message], params: &GenerationParams, stream: bool) -> Value {
        let msgs: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": role_str(m.role), "content": m.content}))
            .collect();

        let mut options = Map::new();
        if let Some(t) = params.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(p) = params.top_p {
            options.insert("top_p".into(), json!(p));
        }
        if let Some(n) = params.max_tokens {
            options.insert("num_predict".into(), json!(n));
        }
        if let Some(seed) = params.seed {
            options.insert("seed".into(), json!(seed));
        }
        if !params.stop.is_empty() {
            options.insert("stop".into(), json!(params.stop));
        }

        let mut body = json!({
            "model": params.model,
            "messages": msgs,
            "stream": stream,
            "options": Value::Object(options),
        });
        match &params.response_format {
            ResponseFormat::Text => {}
            ResponseFormat::JsonObject => body["format"] = json!("json"),
            ResponseFormat::JsonSchema { schema, .. } => body["format"] = schema.clone(),
        }
        body
    }

    fn post(&self, path: &str, timeout: Option<Duration>) -> reqwest::RequestBuilder {
        self.client
            .post(http::join(&self.base, path))
            .timeout(timeout.unwrap_or(self.timeout))
    }
}

/// Strip a trailing `/v1` or `/api` so paths can be appended uniformly.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    let root = trimmed
        .strip_suffix("/v1")
        .or_else(|| trimmed.strip_suffix("/api"))
        .unwrap_or(trimmed);
    root.to_string()
}

pub(crate) fn parse_chat(json: &Value) -> Completion {
    let message = &json["message"];
    let content = message["content"].as_str().unwrap_or_default();
    let (text, reasoning) = finish_text(content, message["thinking"].as_str());
    Completion {
        text,
        reasoning,
        usage: Usage::new(
            json["prompt_eval_count"].as_u64().unwrap_or(0),
            json["eval_count"].as_u64().unwrap_or(0),
        ),
        finish_reason: json["done_reason"].as_str().map(str::to_string),
        rate_limit: Default::default(),
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "ollama"
    }

    fn supports(&self, _capability: Capability) -> bool {
        true
    }

    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> PipelineResult<Completion> {
        let req = self
            .post("api/chat", params.timeout)
            .json(&Self::request_body(messages, params, false));
        let (resp, hint) = http::send(&self.name, None, req).await?;
        let json = http::json_body(&self.name, None, resp).await?;
        let mut completion = parse_chat(&json);
        completion.rate_limit = hint;
        Ok(completion)
    }

    async fn stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> PipelineResult<TokenStream> {
        let req = self
            .post("api/chat", params.timeout)
            .json(&Self::request_body(messages, params, true));
        let (resp, _) = http::send(&self.name, None, req).await?;
        let tokens = http::events(&self.name, resp, Framing::Ndjson).filter_map(|event| async move {
            match event {
                Ok(v) => v["message"]["content"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .map(|s| Ok(s.to_string())),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(tokens))
    }

    /// Uses the configured `embedding_model`; Ollama serves embeddings from
    /// any pulled model, so a missing setting is a validation error.
    async fn embed(&self, text: &str) -> PipelineResult<Vec<f32>> {
        let Some(model) = &self.embedding_model else {
            return Err(easy_dataset_core::PipelineError::validation(format!(
                "provider '{}' has no embedding_model configured",
                self.name
            )));
        };
        let req = self
            .post("api/embeddings", None)
            .json(&json!({"model": model, "prompt": text}));
        let (resp, _) = http::send(&self.name, None, req).await?;
        let json = http::json_body(&self.name, None, resp).await?;
        parse_embedding(&self.name, &json["embedding"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalization() {
        assert_eq!(normalize_endpoint("http://localhost:11434/v1"), "http://localhost:11434");
        assert_eq!(normalize_endpoint("http://localhost:11434/api/"), "http://localhost:11434");
        assert_eq!(normalize_endpoint("http://gpu:11434"), "http://gpu:11434");
    }

    #[test]
    fn params_map_to_options() {
        let mut params = GenerationParams::new("qwen2.5:7b");
        params.temperature = Some(0.2);
        params.max_tokens = Some(128);
        params.seed = Some(1);
        params.stop = vec!["\n\n".into()];
        params.response_format = ResponseFormat::JsonSchema {
            name: "x".into(),
            schema: json!({"type": "object"}),
        };
        let body = OllamaProvider::request_body(&[Message::user("hi")], &params, false);
        assert_eq!(body["options"]["num_predict"], 128);
        assert_eq!(body["options"]["seed"], 1);
        assert_eq!(body["options"]["stop"][0], "\n\n");
        assert_eq!(body["format"]["type"], "object");
        assert_eq!(body["stream"], false);

        let params = GenerationParams::new("m").with_format(ResponseFormat::JsonObject);
        let body = OllamaProvider::request_body(&[Message::user("hi")], &params, true);
        assert_eq!(body["format"], "json");
    }

    #[test]
    fn parses_thinking_and_counts() {
        let json = json!({
            "message": {"role": "assistant", "content": "Answer", "thinking": "reason"},
            "prompt_eval_count": 12,
            "eval_count": 4,
            "done_reason": "stop"
        });
        let c = parse_chat(&json);
        assert_eq!(c.text, "Answer");
        assert_eq!(c.reasoning.as_deref(), Some("reason"));
        assert_eq!(c.usage.total_tokens, 16);
    }
}
