//! OpenAI-compatible chat-completions adapter.
//!
//! Serves every endpoint that speaks the `/chat/completions` wire format:
//! OpenAI itself, the vendor aliases (DeepSeek, SiliconFlow, Zhipu,
//! Alibaba Bailian, vLLM, LM Studio), and OpenRouter.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use easy_dataset_core::{PipelineError, PipelineResult};

use super::http::{self, Framing};
use super::{
    finish_text, role_str, Capability, Completion, GenerationParams, LlmProvider, Message,
    ResponseFormat, TokenStream, Usage,
};

const OPENROUTER_REFERER: &str = "https://github.com/easy-dataset/easy-dataset";
const OPENROUTER_TITLE: &str = "Easy Dataset";

pub struct OpenAiProvider {
    name: String,
    kind: &'static str,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
    headers: BTreeMap<String, String>,
    embedding_model: Option<String>,
    native_json_schema: bool,
}

impl OpenAiProvider {
    pub fn new(
        name: &str,
        kind: &'static str,
        endpoint: String,
        api_key: Option<String>,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            client,
            timeout,
            headers: BTreeMap::new(),
            embedding_model: None,
            native_json_schema: false,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_embedding_model(mut self, model: Option<String>) -> Self {
        self.embedding_model = model;
        self
    }

    /// Send `json_schema` response formats as-is. Otherwise they are
    /// downgraded to `json_object`, which every compatible server accepts,
    /// and the schema is enforced by the service.
    pub fn with_native_json_schema(mut self, enabled: bool) -> Self {
        self.native_json_schema = enabled;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post(&self, path: &str, timeout: Option<Duration>) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(http::join(&self.endpoint, path))
            .timeout(timeout.unwrap_or(self.timeout))
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }

    pub(crate) fn request_body(
        &self,
        messages: &[Message],
        params: &GenerationParams,
        stream: bool,
    ) -> Value {
        let msgs: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": role_str(m.role), "content": m.content}))
            .collect();
        let mut body = json!({
            "model": params.model,
            "messages": msgs,
            "stream": stream,
        });
        let obj = match body.as_object_mut() {
            Some(obj) => obj,
            None => return body,
        };
        if let Some(t) = params.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = params.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if let Some(n) = params.max_tokens {
            obj.insert("max_tokens".into(), json!(n));
        }
        if !params.stop.is_empty() {
            obj.insert("stop".into(), json!(params.stop));
        }
        if let Some(seed) = params.seed {
            obj.insert("seed".into(), json!(seed));
        }
        match &params.response_format {
            ResponseFormat::Text => {}
            ResponseFormat::JsonObject => {
                obj.insert("response_format".into(), json!({"type": "json_object"}));
            }
            ResponseFormat::JsonSchema { name, schema } if self.native_json_schema => {
                obj.insert(
                    "response_format".into(),
                    json!({
                        "type": "json_schema",
                        "json_schema": {"name": name, "schema": schema, "strict": false},
                    }),
                );
            }
            ResponseFormat::JsonSchema { .. } => {
                obj.insert("response_format".into(), json!({"type": "json_object"}));
            }
        }
        body
    }
}

/// Parse a chat-completions response body.
pub(crate) fn parse_completion(provider: &str, json: &Value) -> PipelineResult<Completion> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| PipelineError::Permanent {
            provider: provider.to_string(),
            message: "response has no choices".to_string(),
        })?;
    let message = &choice["message"];
    let content = message["content"].as_str().unwrap_or_default();
    let reasoning = message["reasoning_content"]
        .as_str()
        .or_else(|| message["reasoning"].as_str());
    let (text, reasoning) = finish_text(content, reasoning);

    let usage = &json["usage"];
    let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let completion = usage["completion_tokens"].as_u64().unwrap_or(0);
    let mut usage = Usage::new(prompt, completion);
    if let Some(total) = json["usage"]["total_tokens"].as_u64() {
        usage.total_tokens = total;
    }

    Ok(Completion {
        text,
        reasoning,
        usage,
        finish_reason: choice["finish_reason"].as_str().map(str::to_string),
        rate_limit: Default::default(),
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        self.kind
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
        let secret = self.api_key.as_deref();
        let req = self
            .post("chat/completions", params.timeout)
            .json(&self.request_body(messages, params, false));
        let (resp, hint) = http::send(&self.name, secret, req).await?;
        let json = http::json_body(&self.name, secret, resp).await?;
        let mut completion = parse_completion(&self.name, &json)?;
        completion.rate_limit = hint;
        Ok(completion)
    }

    async fn stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> PipelineResult<TokenStream> {
        let req = self
            .post("chat/completions", params.timeout)
            .json(&self.request_body(messages, params, true));
        let (resp, _) = http::send(&self.name, self.api_key.as_deref(), req).await?;
        let tokens = http::events(&self.name, resp, Framing::Sse).filter_map(|event| async move {
            match event {
                Ok(v) => v["choices"][0]["delta"]["content"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .map(|s| Ok(s.to_string())),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(tokens))
    }

    async fn embed(&self, text: &str) -> PipelineResult<Vec<f32>> {
        let Some(model) = &self.embedding_model else {
            return Err(self.unsupported(Capability::Embed));
        };
        let secret = self.api_key.as_deref();
        let req = self
            .post("embeddings", None)
            .json(&json!({"model": model, "input": text}));
        let (resp, _) = http::send(&self.name, secret, req).await?;
        let json = http::json_body(&self.name, secret, resp).await?;
        parse_embedding(&self.name, &json["data"][0]["embedding"])
    }
}

pub(crate) fn parse_embedding(provider: &str, value: &Value) -> PipelineResult<Vec<f32>> {
    let arr = value.as_array().ok_or_else(|| PipelineError::Permanent {
        provider: provider.to_string(),
        message: "response has no embedding".to_string(),
    })?;
    Ok(arr
        .iter()
        .filter_map(|v| v.as_f64())
        .map(|v| v as f32)
        .collect())
}

/// OpenRouter attribution headers, unless the configuration sets its own.
pub fn openrouter_headers(configured: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut headers = configured.clone();
    headers
        .entry("HTTP-Referer".to_string())
        .or_insert_with(|| OPENROUTER_REFERER.to_string());
    headers
        .entry("X-Title".to_string())
        .or_insert_with(|| OPENROUTER_TITLE.to_string());
    headers
}
