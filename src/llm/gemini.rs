//! Google Gemini adapter (`generateContent`).
//!
//! Roles map `assistant → model`; system messages are concatenated into
//! `systemInstruction`. The API key travels in the `x-goog-api-key`
//! header so it never appears in a URL or a transport error.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};

use easy_dataset_core::models::Role;
use easy_dataset_core::{PipelineError, PipelineResult};

use super::http::{self, Framing};
use super::openai::parse_embedding;
use super::{
    finish_text, Capability, Completion, GenerationParams, LlmProvider, Message, ResponseFormat,
    TokenStream, Usage,
};

pub struct GeminiProvider {
    name: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
    embedding_model: Option<String>,
}

impl GeminiProvider {
    pub fn new(
        name: &str,
        endpoint: String,
        api_key: String,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            client,
            timeout,
            embedding_model: None,
        }
    }

    pub fn with_embedding_model(mut self, model: Option<String>) -> Self {
        self.embedding_model = model;
        self
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/models/{}:{}", self.endpoint, model, method)
    }

    fn post(&self, url: String, timeout: Option<Duration>) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .timeout(timeout.unwrap_or(self.timeout))
            .header("x-goog-api-key", self.api_key.as_str())
    }

    pub(crate) fn request_body(messages: &[Message], params: &GenerationParams) -> Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut config = Map::new();
        if let Some(t) = params.temperature {
            config.insert("temperature".into(), json!(t));
        }
        if let Some(p) = params.top_p {
            config.insert("topP".into(), json!(p));
        }
        if let Some(n) = params.max_tokens {
            config.insert("maxOutputTokens".into(), json!(n));
        }
        if !params.stop.is_empty() {
            config.insert("stopSequences".into(), json!(params.stop));
        }
        if let Some(seed) = params.seed {
            config.insert("seed".into(), json!(seed));
        }
        match &params.response_format {
            ResponseFormat::Text => {}
            ResponseFormat::JsonObject => {
                config.insert("responseMimeType".into(), json!("application/json"));
            }
            ResponseFormat::JsonSchema { schema, .. } => {
                config.insert("responseMimeType".into(), json!("application/json"));
                config.insert("responseJsonSchema".into(), schema.clone());
            }
        }

        let mut body = json!({"contents": contents});
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
        }
        if !config.is_empty() {
            body["generationConfig"] = Value::Object(config);
        }
        body
    }
}

/// Visible text and thought parts of the first candidate.
fn candidate_text(json: &Value) -> (String, String) {
    let mut text = String::new();
    let mut thoughts = String::new();
    if let Some(parts) = json["candidates"][0]["content"]["parts"].as_array() {
        for part in parts {
            let Some(t) = part["text"].as_str() else {
                continue;
            };
            if part["thought"].as_bool() == Some(true) {
                thoughts.push_str(t);
            } else {
                text.push_str(t);
            }
        }
    }
    (text, thoughts)
}

pub(crate) fn parse_generate(provider: &str, json: &Value) -> PipelineResult<Completion> {
    if json["candidates"].as_array().map_or(true, |c| c.is_empty()) {
        let reason = json["promptFeedback"]["blockReason"]
            .as_str()
            .unwrap_or("no candidates returned");
        return Err(PipelineError::Permanent {
            provider: provider.to_string(),
            message: format!("response blocked: {}", reason),
        });
    }
    let (raw, thoughts) = candidate_text(json);
    let (text, reasoning) = finish_text(&raw, Some(thoughts.as_str()));
    let meta = &json["usageMetadata"];
    let mut usage = Usage::new(
        meta["promptTokenCount"].as_u64().unwrap_or(0),
        meta["candidatesTokenCount"].as_u64().unwrap_or(0),
    );
    if let Some(total) = meta["totalTokenCount"].as_u64() {
        usage.total_tokens = total;
    }
    Ok(Completion {
        text,
        reasoning,
        usage,
        finish_reason: json["candidates"][0]["finishReason"]
            .as_str()
            .map(str::to_string),
        rate_limit: Default::default(),
    })
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "gemini"
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Complete | Capability::Stream => true,
            Capability::Embed => self.embedding_model.is_some(),
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> PipelineResult<Completion> {
        let secret = Some(self.api_key.as_str());
        let req = self
            .post(self.model_url(&params.model, "generateContent"), params.timeout)
            .json(&Self::request_body(messages, params));
        let (resp, hint) = http::send(&self.name, secret, req).await?;
        let json = http::json_body(&self.name, secret, resp).await?;
        let mut completion = parse_generate(&self.name, &json)?;
        completion.rate_limit = hint;
        Ok(completion)
    }

    async fn stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> PipelineResult<TokenStream> {
        let url = format!(
            "{}?alt=sse",
            self.model_url(&params.model, "streamGenerateContent")
        );
        let req = self
            .post(url, params.timeout)
            .json(&Self::request_body(messages, params));
        let (resp, _) = http::send(&self.name, Some(self.api_key.as_str()), req).await?;
        let tokens = http::events(&self.name, resp, Framing::Sse).filter_map(|event| async move {
            match event {
                Ok(v) => {
                    let (text, _) = candidate_text(&v);
                    (!text.is_empty()).then_some(Ok(text))
                }
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(tokens))
    }

    async fn embed(&self, text: &str) -> PipelineResult<Vec<f32>> {
        let Some(model) = &self.embedding_model else {
            return Err(self.unsupported(Capability::Embed));
        };
        let secret = Some(self.api_key.as_str());
        let req = self
            .post(self.model_url(model, "embedContent"), None)
            .json(&json!({"content": {"parts": [{"text": text}]}}));
        let (resp, _) = http::send(&self.name, secret, req).await?;
        let json = http::json_body(&self.name, secret, resp).await?;
        parse_embedding(&self.name, &json["embedding"]["values"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_goes_to_instruction_and_roles_map() {
        let mut params = GenerationParams::new("gemini-1.5-flash");
        params.max_tokens = Some(64);
        params.response_format = ResponseFormat::JsonObject;
        let body = GeminiProvider::request_body(
            &[
                Message::system("be terse"),
                Message::user("q"),
                Message::assistant("a"),
                Message::user("q2"),
            ],
            &params,
        );
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(body["contents"].as_array().unwrap().len(), 3);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }

    #[test]
    fn parses_candidates_and_thoughts() {
        let json = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "plan", "thought": true},
                    {"text": "Hello"},
                    {"text": " world"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 9}
        });
        let c = parse_generate("g", &json).unwrap();
        assert_eq!(c.text, "Hello world");
        assert_eq!(c.reasoning.as_deref(), Some("plan"));
        assert_eq!(c.usage.total_tokens, 9);
    }

    #[test]
    fn blocked_prompt_is_permanent() {
        let json = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = parse_generate("g", &json).unwrap_err();
        assert_eq!(err.kind(), easy_dataset_core::ErrorKind::Permanent);
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn model_urls() {
        let p = GeminiProvider::new(
            "g",
            "https://generativelanguage.googleapis.com/v1beta/".into(),
            "key".into(),
            reqwest::Client::new(),
            Duration::from_secs(1),
        );
        assert_eq!(
            p.model_url("models/gemini-pro", "generateContent"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
        );
    }
}
