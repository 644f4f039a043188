//! LLM provider abstraction and adapters.
//!
//! Every back-end implements [`LlmProvider`]: `complete`, `stream`, and
//! `embed`, where a provider that lacks a capability returns
//! `CapabilityUnsupported`. Adapters normalize their HTTP error shapes
//! into the shared taxonomy (`Transient` vs `Permanent`) and never retry
//! on their own; retries, rate limiting, and structured output live in
//! [`service::LlmService`].
//!
//! # Provider kinds
//!
//! | Kind | Adapter | Wire format |
//! |------|---------|-------------|
//! | `openai` (+ `deepseek`, `siliconflow`, `zhipu`, `alibailian`, `vllm`, `lmstudio`) | [`openai::OpenAiProvider`] | `/chat/completions`, SSE |
//! | `openrouter` | [`openai::OpenAiProvider`] | same, with attribution headers |
//! | `ollama` | [`ollama::OllamaProvider`] | `/api/chat`, NDJSON |
//! | `gemini` | [`gemini::GeminiProvider`] | `:generateContent`, SSE |
//! | `litellm` | [`litellm::LiteLlmProvider`] | delegates by model prefix |

pub mod gemini;
pub mod http;
pub mod litellm;
pub mod ollama;
pub mod openai;
pub mod rate_limit;
pub mod retry;
pub mod schema;
pub mod service;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use easy_dataset_core::models::{ModelConfig, Role};
use easy_dataset_core::{PipelineError, PipelineResult};

use crate::config::{Config, ProviderConfig};

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    JsonObject,
    /// Output must validate against `schema`.
    JsonSchema { name: String, schema: Value },
}

/// Generation parameters. The field set is closed: every adapter maps
/// exactly these onto its wire format.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub response_format: ResponseFormat,
    pub seed: Option<u64>,
    pub timeout: Option<Duration>,
}

impl GenerationParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn from_model_config(mc: &ModelConfig) -> Self {
        Self {
            model: mc.model.clone(),
            temperature: mc.temperature,
            top_p: mc.top_p,
            max_tokens: mc.max_tokens,
            stop: Vec::new(),
            response_format: ResponseFormat::Text,
            seed: mc.seed,
            timeout: mc.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }
}

/// Token counts reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Rate-limit information read from response headers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateLimitHint {
    pub retry_after: Option<Duration>,
    pub remaining_requests: Option<u64>,
    pub reset_requests: Option<Duration>,
}

impl RateLimitHint {
    /// How long the caller should hold off before the next request, if at all.
    pub fn backoff(&self) -> Option<Duration> {
        if let Some(d) = self.retry_after {
            return Some(d);
        }
        match (self.remaining_requests, self.reset_requests) {
            (Some(0), Some(reset)) => Some(reset),
            _ => None,
        }
    }
}

/// Result of one `complete` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    /// Visible answer text, with any reasoning block removed.
    pub text: String,
    /// Chain of thought, from a `<think>` block or a provider reasoning field.
    pub reasoning: Option<String>,
    pub usage: Usage,
    pub finish_reason: Option<String>,
    pub rate_limit: RateLimitHint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Complete,
    Stream,
    Embed,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Complete => "complete",
            Capability::Stream => "stream",
            Capability::Embed => "embed",
        }
    }
}

/// Stream of generated tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = PipelineResult<String>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registered provider name (the `[providers.<name>]` key).
    fn name(&self) -> &str;

    /// Adapter kind, e.g. `openai` or `ollama`.
    fn kind(&self) -> &str;

    fn supports(&self, capability: Capability) -> bool;

    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> PipelineResult<Completion>;

    async fn stream(
        &self,
        _messages: &[Message],
        _params: &GenerationParams,
    ) -> PipelineResult<TokenStream> {
        Err(self.unsupported(Capability::Stream))
    }

    async fn embed(&self, _text: &str) -> PipelineResult<Vec<f32>> {
        Err(self.unsupported(Capability::Embed))
    }

    fn unsupported(&self, capability: Capability) -> PipelineError {
        PipelineError::CapabilityUnsupported {
            provider: self.name().to_string(),
            capability: capability.as_str().to_string(),
        }
    }
}

/// Providers keyed by name.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Build every `[providers.<name>]` entry, sharing one HTTP client.
    ///
    /// `litellm` providers are built last so their routes resolve against
    /// the already-registered providers.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = http::build_client()?;
        let mut registry = Self::new();
        let (meta, direct): (Vec<_>, Vec<_>) = config
            .providers
            .iter()
            .partition(|(_, p)| canonical_kind(&p.kind) == Some("litellm"));

        for (name, pc) in direct {
            registry.register(create_provider(name, pc, client.clone())?);
        }
        for (name, pc) in meta {
            let provider = litellm::LiteLlmProvider::from_config(
                name,
                pc,
                &config.litellm,
                &registry,
            )?;
            registry.register(Arc::new(provider));
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn get(&self, name: &str) -> PipelineResult<Arc<dyn LlmProvider>> {
        self.find(name)
            .ok_or_else(|| PipelineError::not_found("provider", name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of providers supporting `capability`.
    pub fn with_capability(&self, capability: Capability) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .iter()
            .filter(|(_, p)| p.supports(capability))
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a configured `kind` (including vendor aliases) to its adapter kind.
pub fn canonical_kind(kind: &str) -> Option<&'static str> {
    match kind.to_ascii_lowercase().as_str() {
        "openai" | "deepseek" | "siliconflow" | "zhipu" | "alibailian" | "vllm" | "lmstudio" => {
            Some("openai")
        }
        "openrouter" => Some("openrouter"),
        "ollama" => Some("ollama"),
        "gemini" => Some("gemini"),
        "litellm" => Some("litellm"),
        _ => None,
    }
}

/// Default base URL for a configured kind.
pub fn default_endpoint(kind: &str) -> Option<&'static str> {
    match kind.to_ascii_lowercase().as_str() {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "siliconflow" => Some("https://api.siliconflow.cn/v1"),
        "zhipu" => Some("https://open.bigmodel.cn/api/paas/v4"),
        "alibailian" => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
        "vllm" => Some("http://localhost:8000/v1"),
        "lmstudio" => Some("http://localhost:1234/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "ollama" => Some("http://localhost:11434"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta"),
        _ => None,
    }
}

/// Instantiate a direct (non-meta) provider.
pub fn create_provider(
    name: &str,
    config: &ProviderConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn LlmProvider>> {
    let endpoint = config
        .endpoint
        .clone()
        .or_else(|| default_endpoint(&config.kind).map(str::to_string));
    let Some(endpoint) = endpoint else {
        bail!("providers.{}: endpoint is required for kind '{}'", name, config.kind);
    };
    let timeout = Duration::from_secs(config.timeout_secs);
    let api_key = config.resolve_api_key();

    match canonical_kind(&config.kind) {
        Some("openai") => Ok(Arc::new(
            openai::OpenAiProvider::new(name, "openai", endpoint, api_key, client, timeout)
                .with_headers(config.headers.clone())
                .with_embedding_model(config.embedding_model.clone())
                .with_native_json_schema(config.kind.eq_ignore_ascii_case("openai")),
        )),
        Some("openrouter") => Ok(Arc::new(
            openai::OpenAiProvider::new(name, "openrouter", endpoint, api_key, client, timeout)
                .with_headers(openai::openrouter_headers(&config.headers))
                .with_embedding_model(config.embedding_model.clone()),
        )),
        Some("ollama") => Ok(Arc::new(
            ollama::OllamaProvider::new(name, endpoint, client, timeout)
                .with_embedding_model(config.embedding_model.clone()),
        )),
        Some("gemini") => {
            let Some(key) = api_key else {
                bail!("providers.{}: gemini requires api_key or api_key_env", name);
            };
            Ok(Arc::new(
                gemini::GeminiProvider::new(name, endpoint, key, client, timeout)
                    .with_embedding_model(config.embedding_model.clone()),
            ))
        }
        Some("litellm") => bail!(
            "providers.{}: litellm providers are built by ProviderRegistry::from_config",
            name
        ),
        _ => bail!("providers.{}: unknown kind '{}'", name, config.kind),
    }
}

/// Split a `<think>…</think>` or `<thinking>…</thinking>` block from the
/// visible text. Returns `(visible, reasoning)`.
pub fn split_reasoning(text: &str) -> (String, Option<String>) {
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        let Some(start) = text.find(open) else {
            continue;
        };
        let inner_start = start + open.len();
        let (inner, rest) = match text[inner_start..].find(close) {
            Some(end) => (
                &text[inner_start..inner_start + end],
                &text[inner_start + end + close.len()..],
            ),
            // Unterminated: everything after the tag is reasoning.
            None => (&text[inner_start..], ""),
        };
        let visible = format!("{}{}", &text[..start], rest).trim().to_string();
        let reasoning = inner.trim();
        let reasoning = (!reasoning.is_empty()).then(|| reasoning.to_string());
        return (visible, reasoning);
    }
    (text.to_string(), None)
}

/// Merge a provider's reasoning field with any inline `<think>` block.
pub(crate) fn finish_text(text: &str, reasoning_field: Option<&str>) -> (String, Option<String>) {
    let (visible, inline) = split_reasoning(text);
    let field = reasoning_field
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    (visible, field.or(inline))
}

pub(crate) fn role_str(role: Role) -> &'static str {
    role.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_map_to_openai() {
        for alias in ["deepseek", "SiliconFlow", "zhipu", "alibailian", "vllm", "lmstudio"] {
            assert_eq!(canonical_kind(alias), Some("openai"), "{}", alias);
        }
        assert_eq!(canonical_kind("openrouter"), Some("openrouter"));
        assert_eq!(canonical_kind("bard"), None);
        assert_eq!(default_endpoint("openrouter"), Some("https://openrouter.ai/api/v1"));
    }

    #[test]
    fn think_blocks_are_split() {
        let (v, r) = split_reasoning("<think>step 1\nstep 2</think>\n\nFinal answer.");
        assert_eq!(v, "Final answer.");
        assert_eq!(r.as_deref(), Some("step 1\nstep 2"));

        let (v, r) = split_reasoning("Answer <thinking>hmm</thinking>");
        assert_eq!(v, "Answer");
        assert_eq!(r.as_deref(), Some("hmm"));

        let (v, r) = split_reasoning("plain");
        assert_eq!((v.as_str(), r), ("plain", None));
    }

    #[test]
    fn reasoning_field_wins() {
        let (v, r) = finish_text("<think>inline</think>ok", Some("field"));
        assert_eq!(v, "ok");
        assert_eq!(r.as_deref(), Some("field"));
    }

    #[test]
    fn rate_limit_backoff() {
        let hint = RateLimitHint {
            retry_after: None,
            remaining_requests: Some(0),
            reset_requests: Some(Duration::from_secs(2)),
        };
        assert_eq!(hint.backoff(), Some(Duration::from_secs(2)));
        assert_eq!(RateLimitHint::default().backoff(), None);
    }

    #[test]
    fn provider_config_builds_registry() {
        let cfg = crate::config::parse_config(
            r#"
            [providers.local]
            kind = "ollama"

            [providers.router]
            kind = "openrouter"
            api_key = "k"

            [providers.meta]
            kind = "litellm"

            [litellm.routes]
            "ollama/" = "local"
            "#,
        )
        .unwrap();
        let reg = ProviderRegistry::from_config(&cfg).unwrap();
        assert_eq!(reg.names(), vec!["local", "meta", "router"]);
        assert!(reg.find("local").unwrap().supports(Capability::Embed));
        assert_eq!(reg.get("meta").unwrap().kind(), "litellm");
        assert!(reg.get("missing").is_err());
    }
}
