//! The LLM service: the only caller of provider adapters.
//!
//! Adds what adapters deliberately leave out:
//!
//! - prompt resolution (stored template, else built-in) and rendering
//! - rate limiting per `(provider, model)`
//! - retries of `Transient` failures with full-jitter backoff
//! - structured output: JSON extraction, schema validation, and a single
//!   repair round trip
//! - usage accounting per `(provider, model)`

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use easy_dataset_core::models::{ModelConfig, Provenance};
use easy_dataset_core::prompt::{self, PromptTemplate, Vars, BUILTIN_VERSION};
use easy_dataset_core::store::Store;
use easy_dataset_core::{PipelineError, PipelineResult};

use super::rate_limit::RateLimiter;
use super::retry::{with_retry, RetryPolicy};
use super::schema;
use super::{
    Capability, Completion, GenerationParams, Message, ProviderRegistry, ResponseFormat,
    TokenStream,
};
use crate::config::Config;
use crate::tasks::CancelFlag;

/// Accumulated usage for one `(provider, model)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub retries: u64,
    pub failures: u64,
}

/// A completed call.
#[derive(Debug, Clone)]
pub struct Reply {
    pub completion: Completion,
    /// Retries spent on this call.
    pub retries: u32,
}

/// A completed structured call.
#[derive(Debug, Clone)]
pub struct StructuredReply {
    pub value: Value,
    pub completion: Completion,
    pub retries: u32,
    /// Whether the repair prompt was needed.
    pub repaired: bool,
}

/// A rendered template, ready to send.
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub template: PromptTemplate,
    pub messages: Vec<Message>,
}

impl RenderedPrompt {
    pub fn provenance(&self, mc: &ModelConfig) -> Provenance {
        Provenance {
            model: mc.model.clone(),
            prompt: self.template.name.clone(),
            prompt_version: self.template.version,
            generated_at: Utc::now(),
        }
    }
}

pub struct LlmService {
    registry: ProviderRegistry,
    store: Arc<dyn Store>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    usage: Mutex<BTreeMap<(String, String), UsageRecord>>,
}

impl LlmService {
    pub fn new(
        registry: ProviderRegistry,
        store: Arc<dyn Store>,
        limiter: RateLimiter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            store,
            limiter,
            retry,
            usage: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &Config, registry: ProviderRegistry, store: Arc<dyn Store>) -> Self {
        Self::new(
            registry,
            store,
            RateLimiter::from_config(config),
            RetryPolicy::from(&config.retry),
        )
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Resolve a template: a stored override first, then the built-in.
    ///
    /// `version` defaults to the built-in version. Stored templates are
    /// looked up in `language`, then in English.
    pub async fn template(
        &self,
        name: &str,
        version: Option<u32>,
        language: &str,
    ) -> PipelineResult<PromptTemplate> {
        let version = version.unwrap_or(BUILTIN_VERSION);
        if let Some(t) = self.store.get_prompt(name, version, language).await? {
            return Ok(t);
        }
        if language != prompt::DEFAULT_LANGUAGE {
            if let Some(t) = self
                .store
                .get_prompt(name, version, prompt::DEFAULT_LANGUAGE)
                .await?
            {
                return Ok(t);
            }
        }
        if version == BUILTIN_VERSION {
            if let Some(t) = prompt::builtin(name, language) {
                return Ok(t);
            }
        }
        Err(PipelineError::not_found(
            "prompt",
            format!("{}@v{} ({})", name, version, language),
        ))
    }

    /// Resolve and render a template into chat messages.
    pub async fn render(
        &self,
        name: &str,
        version: Option<u32>,
        language: &str,
        vars: &Vars,
    ) -> PipelineResult<RenderedPrompt> {
        let template = self.template(name, version, language).await?;
        let body = template.render(vars)?;
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = template.system.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(body));
        Ok(RenderedPrompt { template, messages })
    }

    /// One completion, rate limited and retried.
    pub async fn chat(
        &self,
        mc: &ModelConfig,
        messages: &[Message],
        format: ResponseFormat,
        cancel: &CancelFlag,
    ) -> PipelineResult<Reply> {
        let provider = self.registry.get(&mc.provider)?;
        if !provider.supports(Capability::Complete) {
            return Err(provider.unsupported(Capability::Complete));
        }
        let params = GenerationParams::from_model_config(mc).with_format(format);

        let outcome = with_retry(&self.retry, &mc.provider, cancel, |_| {
            let provider = provider.clone();
            let params = &params;
            async move {
                self.limiter.acquire(&mc.provider, &mc.model).await;
                let result = provider.complete(messages, params).await;
                let hint = match &result {
                    Ok(c) => c.rate_limit.backoff(),
                    Err(PipelineError::Transient { retry_after, .. }) => *retry_after,
                    Err(_) => None,
                };
                if let Some(delay) = hint {
                    self.limiter.penalize(&mc.provider, &mc.model, delay);
                }
                result
            }
        })
        .await;

        match outcome {
            Ok((completion, retries)) => {
                debug!(
                    provider = %mc.provider,
                    model = %mc.model,
                    prompt_tokens = completion.usage.prompt_tokens,
                    completion_tokens = completion.usage.completion_tokens,
                    retries,
                    "completion"
                );
                self.record(mc, |u| {
                    u.requests += u64::from(retries) + 1;
                    u.retries += u64::from(retries);
                    u.prompt_tokens += completion.usage.prompt_tokens;
                    u.completion_tokens += completion.usage.completion_tokens;
                    u.total_tokens += completion.usage.total_tokens;
                });
                Ok(Reply {
                    completion,
                    retries,
                })
            }
            Err(e) => {
                let attempts = match &e {
                    PipelineError::ProviderFailure { attempts, .. } => u64::from(*attempts),
                    PipelineError::Cancelled => 0,
                    _ => 1,
                };
                self.record(mc, |u| {
                    u.requests += attempts;
                    u.retries += attempts.saturating_sub(1);
                    u.failures += u64::from(attempts > 0);
                });
                Err(e)
            }
        }
    }

    /// A completion whose output must be JSON matching `schema`.
    ///
    /// When the first reply cannot be parsed or fails validation, one
    /// repair prompt carrying the validator's message is sent. A second
    /// failure is `Permanent`.
    pub async fn chat_json(
        &self,
        mc: &ModelConfig,
        messages: &[Message],
        schema_name: &str,
        schema: &Value,
        language: &str,
        cancel: &CancelFlag,
    ) -> PipelineResult<StructuredReply> {
        let format = ResponseFormat::JsonSchema {
            name: schema_name.to_string(),
            schema: schema.clone(),
        };
        let first = self.chat(mc, messages, format.clone(), cancel).await?;
        let error = match parse_checked(&first.completion.text, schema) {
            Ok(value) => {
                return Ok(StructuredReply {
                    value,
                    completion: first.completion,
                    retries: first.retries,
                    repaired: false,
                })
            }
            Err(error) => error,
        };

        warn!(
            provider = %mc.provider,
            model = %mc.model,
            schema = schema_name,
            error = %error,
            "structured output invalid, sending repair prompt"
        );
        let repair = self.template(prompt::REPAIR, None, language).await?;
        let mut vars = Vars::new();
        vars.insert("error", error);
        vars.insert("schema", serde_json::to_string_pretty(schema)?);
        vars.insert("output", first.completion.text.clone());
        let mut conversation = messages.to_vec();
        conversation.push(Message::assistant(first.completion.text.clone()));
        conversation.push(Message::user(repair.render(&vars)?));

        let second = self.chat(mc, &conversation, format, cancel).await?;
        match parse_checked(&second.completion.text, schema) {
            Ok(value) => Ok(StructuredReply {
                value,
                completion: second.completion,
                retries: first.retries + second.retries,
                repaired: true,
            }),
            Err(error) => Err(PipelineError::Permanent {
                provider: mc.provider.clone(),
                message: format!(
                    "output does not match schema '{}' after repair: {}",
                    schema_name, error
                ),
            }),
        }
    }

    /// Token stream. Only the connection attempt is rate limited; streams
    /// are not retried once tokens start flowing.
    pub async fn stream(
        &self,
        mc: &ModelConfig,
        messages: &[Message],
    ) -> PipelineResult<TokenStream> {
        let provider = self.registry.get(&mc.provider)?;
        if !provider.supports(Capability::Stream) {
            return Err(provider.unsupported(Capability::Stream));
        }
        self.limiter.acquire(&mc.provider, &mc.model).await;
        self.record(mc, |u| u.requests += 1);
        provider
            .stream(messages, &GenerationParams::from_model_config(mc))
            .await
    }

    pub async fn embed(&self, provider: &str, text: &str) -> PipelineResult<Vec<f32>> {
        let p = self.registry.get(provider)?;
        if !p.supports(Capability::Embed) {
            return Err(p.unsupported(Capability::Embed));
        }
        p.embed(text).await
    }

    fn record(&self, mc: &ModelConfig, update: impl FnOnce(&mut UsageRecord)) {
        let mut usage = match self.usage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = usage
            .entry((mc.provider.clone(), mc.model.clone()))
            .or_insert_with(|| UsageRecord {
                provider: mc.provider.clone(),
                model: mc.model.clone(),
                ..Default::default()
            });
        update(entry);
    }

    /// Usage per `(provider, model)`, sorted.
    pub fn usage(&self) -> Vec<UsageRecord> {
        match self.usage.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    pub fn usage_for(&self, provider: &str, model: &str) -> Option<UsageRecord> {
        self.usage()
            .into_iter()
            .find(|u| u.provider == provider && u.model == model)
    }
}

fn parse_checked(text: &str, schema: &Value) -> Result<Value, String> {
    let value = schema::extract_json(text)
        .ok_or_else(|| "reply does not contain a JSON object or array".to_string())?;
    schema::validate(&value, schema)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmProvider, Usage};
    use async_trait::async_trait;
    use easy_dataset_core::store::memory::InMemoryStore;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Replays canned results and records the prompts it saw.
    struct Scripted {
        replies: Mutex<VecDeque<PipelineResult<String>>>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl Scripted {
        fn new(replies: Vec<PipelineResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            "mock"
        }
        fn kind(&self) -> &str {
            "mock"
        }
        fn supports(&self, c: Capability) -> bool {
            c == Capability::Complete
        }
        async fn complete(
            &self,
            messages: &[Message],
            _params: &GenerationParams,
        ) -> PipelineResult<Completion> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let next = self.replies.lock().unwrap().pop_front().expect("script exhausted");
            next.map(|text| Completion {
                text,
                usage: Usage::new(10, 5),
                ..Default::default()
            })
        }
    }

    fn rate_limited() -> PipelineResult<String> {
        Err(PipelineError::Transient {
            provider: "mock".into(),
            message: "HTTP 429".into(),
            retry_after: None,
        })
    }

    fn service(provider: Arc<Scripted>, store: Arc<dyn Store>) -> LlmService {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        let retry = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            max_attempts: 5,
        };
        LlmService::new(registry, store, RateLimiter::unlimited(), retry)
    }

    fn mc() -> ModelConfig {
        ModelConfig::new("mock", "m1")
    }

    #[tokio::test]
    async fn retries_and_accounts_usage() {
        let mock = Scripted::new(vec![rate_limited(), rate_limited(), Ok("hello".into())]);
        let svc = service(mock, Arc::new(InMemoryStore::new()));
        let reply = svc
            .chat(&mc(), &[Message::user("hi")], ResponseFormat::Text, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(reply.completion.text, "hello");
        assert_eq!(reply.retries, 2);

        let usage = svc.usage_for("mock", "m1").unwrap();
        assert_eq!(usage.requests, 3);
        assert_eq!(usage.retries, 2);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.failures, 0);
    }

    #[tokio::test]
    async fn repair_prompt_fixes_bad_json() {
        let mock = Scripted::new(vec![
            Ok("I think the questions are: what, why".into()),
            Ok("```json\n{\"questions\": [\"What?\"]}\n```".into()),
        ]);
        let svc = service(mock.clone(), Arc::new(InMemoryStore::new()));
        let reply = svc
            .chat_json(
                &mc(),
                &[Message::user("make questions")],
                "questions",
                &schema::questions_schema(3),
                "en",
                &CancelFlag::new(),
            )
            .await
            .unwrap();
        assert!(reply.repaired);
        assert_eq!(reply.value["questions"][0], "What?");

        let seen = mock.seen.lock().unwrap();
        let repair = &seen[1];
        assert_eq!(repair.len(), 3);
        assert!(repair[2].content.contains("does not contain a JSON object"));
    }

    #[tokio::test]
    async fn second_schema_failure_is_permanent() {
        let mock = Scripted::new(vec![
            Ok("{\"questions\": \"nope\"}".into()),
            Ok("{\"questions\": 3}".into()),
        ]);
        let svc = service(mock, Arc::new(InMemoryStore::new()));
        let err = svc
            .chat_json(
                &mc(),
                &[Message::user("q")],
                "questions",
                &schema::questions_schema(3),
                "en",
                &CancelFlag::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), easy_dataset_core::ErrorKind::Permanent);
        assert!(err.to_string().contains("after repair"));
    }

    #[tokio::test]
    async fn stored_template_overrides_builtin() {
        let store = Arc::new(InMemoryStore::new());
        store
            .save_prompt(&PromptTemplate::new(
                prompt::ANSWER,
                1,
                "en",
                None,
                "Custom: {{question}}",
            ))
            .await
            .unwrap();
        let svc = service(Scripted::new(vec![]), store);

        let mut vars = Vars::new();
        vars.insert("question", "Why?".to_string());
        let rendered = svc.render(prompt::ANSWER, None, "en", &vars).await.unwrap();
        assert_eq!(rendered.messages.len(), 1);
        assert_eq!(rendered.messages[0].content, "Custom: Why?");

        let builtin = svc.template(prompt::QUESTION, None, "zh").await.unwrap();
        assert_eq!(builtin.language, "zh");
        let missing = svc.template(prompt::QUESTION, Some(7), "en").await.unwrap_err();
        assert_eq!(missing.kind(), easy_dataset_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let svc = service(Scripted::new(vec![]), Arc::new(InMemoryStore::new()));
        let err = svc
            .chat(
                &ModelConfig::new("nope", "m"),
                &[Message::user("x")],
                ResponseFormat::Text,
                &CancelFlag::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), easy_dataset_core::ErrorKind::NotFound);
    }
}
