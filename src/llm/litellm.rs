//! LiteLLM-style meta-adapter.
//!
//! Routes each request to another registered provider by model-name
//! prefix. The longest matching prefix wins and is stripped before
//! delegation, so `ollama/qwen2.5:7b` reaches the `ollama` route as
//! `qwen2.5:7b`. Unmatched models go to `default_provider` unchanged, or
//! to a LiteLLM proxy when the provider entry has an `endpoint`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use easy_dataset_core::{PipelineError, PipelineResult};

use super::openai::OpenAiProvider;
use super::{
    Capability, Completion, GenerationParams, LlmProvider, Message, ProviderRegistry, TokenStream,
};
use crate::config::{LiteLlmConfig, ProviderConfig};

pub struct LiteLlmProvider {
    name: String,
    /// Sorted by descending prefix length.
    routes: Vec<(String, Arc<dyn LlmProvider>)>,
    fallback: Option<Arc<dyn LlmProvider>>,
}

impl LiteLlmProvider {
    pub fn new(
        name: &str,
        mut routes: Vec<(String, Arc<dyn LlmProvider>)>,
        fallback: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self {
            name: name.to_string(),
            routes,
            fallback,
        }
    }

    /// Resolve routes against providers that are already registered.
    pub fn from_config(
        name: &str,
        provider: &ProviderConfig,
        litellm: &LiteLlmConfig,
        registry: &ProviderRegistry,
    ) -> Result<Self> {
        let mut routes = Vec::new();
        for (prefix, target) in &litellm.routes {
            let Some(p) = registry.find(target) else {
                bail!("litellm route '{}' targets unknown provider '{}'", prefix, target);
            };
            routes.push((prefix.clone(), p));
        }

        let fallback = match (&litellm.default_provider, &provider.endpoint) {
            (Some(target), _) => match registry.find(target) {
                Some(p) => Some(p),
                None => bail!("litellm default_provider '{}' is not configured", target),
            },
            (None, Some(endpoint)) => {
                let proxy = OpenAiProvider::new(
                    name,
                    "litellm",
                    endpoint.clone(),
                    provider.resolve_api_key(),
                    super::http::build_client()?,
                    Duration::from_secs(provider.timeout_secs),
                )
                .with_headers(provider.headers.clone())
                .with_embedding_model(provider.embedding_model.clone());
                Some(Arc::new(proxy) as Arc<dyn LlmProvider>)
            }
            (None, None) => None,
        };

        if routes.is_empty() && fallback.is_none() {
            bail!(
                "providers.{}: litellm needs [litellm.routes], default_provider, or an endpoint",
                name
            );
        }
        Ok(Self::new(name, routes, fallback))
    }

    /// The delegate for `model` and the model name it should receive.
    pub fn route<'a>(&self, model: &'a str) -> PipelineResult<(Arc<dyn LlmProvider>, &'a str)> {
        for (prefix, provider) in &self.routes {
            if let Some(rest) = model.strip_prefix(prefix.as_str()) {
                return Ok((provider.clone(), rest));
            }
        }
        match &self.fallback {
            Some(p) => Ok((p.clone(), model)),
            None => Err(PipelineError::validation(format!(
                "provider '{}' has no route for model '{}'",
                self.name, model
            ))),
        }
    }

    fn delegate(&self, params: &GenerationParams) -> PipelineResult<(Arc<dyn LlmProvider>, GenerationParams)> {
        let (provider, model) = self.route(&params.model)?;
        let mut routed = params.clone();
        routed.model = model.to_string();
        Ok((provider, routed))
    }
}

#[async_trait]
impl LlmProvider for LiteLlmProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "litellm"
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Embed => self
                .fallback
                .as_ref()
                .is_some_and(|p| p.supports(Capability::Embed)),
            other => self
                .routes
                .iter()
                .map(|(_, p)| p)
                .chain(self.fallback.iter())
                .any(|p| p.supports(other)),
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> PipelineResult<Completion> {
        let (provider, routed) = self.delegate(params)?;
        provider.complete(messages, &routed).await
    }

    async fn stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> PipelineResult<TokenStream> {
        let (provider, routed) = self.delegate(params)?;
        provider.stream(messages, &routed).await
    }

    /// Embeddings carry no model name, so they go to the fallback.
    async fn embed(&self, text: &str) -> PipelineResult<Vec<f32>> {
        match &self.fallback {
            Some(p) => p.embed(text).await,
            None => Err(self.unsupported(Capability::Embed)),
        }
    }
}
