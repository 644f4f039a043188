//! Configuration loading.
//!
//! Configuration is a TOML file whose sections all have defaults, so an
//! empty file is valid. After parsing, `EASY_DATASET_*` environment
//! variables override the matching `[app]` and `[tasks]` fields, then the
//! result is validated.
//!
//! ```toml
//! [app]
//! database_url = "sqlite:./data/easy-dataset.sqlite"
//! upload_dir = "./data/uploads"
//!
//! [tasks]
//! max_concurrent_tasks = 5
//!
//! [providers.local]
//! kind = "ollama"
//! endpoint = "http://localhost:11434"
//!
//! [generation]
//! provider = "local"
//! model = "qwen2.5:7b"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use easy_dataset_core::chunk::ChunkerConfig;
use easy_dataset_core::models::ModelConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub chunking: ChunkerConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub litellm: LiteLlmConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Read by an HTTP front end; the pipeline itself ignores the cors fields.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub cors_allow_credentials: bool,
    #[serde(default)]
    pub cors_allow_methods: Vec<String>,
    #[serde(default)]
    pub cors_allow_headers: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            upload_dir: default_upload_dir(),
            max_upload_size: default_max_upload_size(),
            log_level: default_log_level(),
            cors_origins: Vec::new(),
            cors_allow_credentials: false,
            cors_allow_methods: Vec::new(),
            cors_allow_headers: Vec::new(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:./data/easy-dataset.sqlite".to_string()
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_max_upload_size() -> u64 {
    100 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Per-task wall-clock timeout in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout: default_task_timeout(),
            queue_capacity: default_queue_capacity(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

fn default_max_concurrent_tasks() -> usize {
    5
}
fn default_task_timeout() -> u64 {
    3600
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_progress_interval_ms() -> u64 {
    2000
}

/// Defaults for the generators.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Provider name from `[providers]` used when a command names none.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_min_questions")]
    pub min_questions: usize,
    #[serde(default = "default_max_questions")]
    pub max_questions: usize,
    #[serde(default = "default_chars_per_question")]
    pub chars_per_question: usize,
    #[serde(default = "default_max_turns")]
    pub conversation_max_turns: usize,
    #[serde(default = "default_scenario")]
    pub conversation_scenario: String,
    #[serde(default = "default_role_a")]
    pub conversation_role_a: String,
    #[serde(default = "default_role_b")]
    pub conversation_role_b: String,
    #[serde(default = "default_clean_batch")]
    pub clean_batch_size: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            language: default_language(),
            min_questions: default_min_questions(),
            max_questions: default_max_questions(),
            chars_per_question: default_chars_per_question(),
            conversation_max_turns: default_max_turns(),
            conversation_scenario: default_scenario(),
            conversation_role_a: default_role_a(),
            conversation_role_b: default_role_b(),
            clean_batch_size: default_clean_batch(),
        }
    }
}

impl GenerationConfig {
    /// The default model selection, if `provider` and `model` are both set.
    pub fn model_config(&self) -> Option<ModelConfig> {
        let provider = self.provider.as_ref()?;
        let model = self.model.as_ref()?;
        let mut mc = ModelConfig::new(provider.clone(), model.clone());
        mc.temperature = self.temperature;
        mc.top_p = self.top_p;
        mc.max_tokens = self.max_tokens;
        Some(mc)
    }
}

fn default_language() -> String {
    "en".to_string()
}
fn default_min_questions() -> usize {
    1
}
fn default_max_questions() -> usize {
    10
}
fn default_chars_per_question() -> usize {
    240
}
fn default_max_turns() -> usize {
    4
}
fn default_scenario() -> String {
    "A learner asks an expert about the material".to_string()
}
fn default_role_a() -> String {
    "curious learner".to_string()
}
fn default_role_b() -> String {
    "subject-matter expert".to_string()
}
fn default_clean_batch() -> usize {
    10
}

/// Token-bucket defaults applied to every `(provider, model)`.
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rps")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            burst: default_burst(),
        }
    }
}

fn default_rps() -> f64 {
    2.0
}
fn default_burst() -> u32 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_ms() -> u64 {
    500
}
fn default_cap_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}

/// One `[providers.<name>]` entry.
#[derive(Deserialize, Clone)]
pub struct ProviderConfig {
    /// Adapter kind: `openai` (and its aliases), `openrouter`, `ollama`, `gemini`, or `litellm`.
    pub kind: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key, read at startup.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_provider_timeout() -> u64 {
    120
}

impl ProviderConfig {
    /// Resolve the API key from `api_key` or `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|v| !v.is_empty())
        })
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("api_key_env", &self.api_key_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("requests_per_second", &self.requests_per_second)
            .field("burst", &self.burst)
            .finish()
    }
}

/// LiteLLM meta-adapter routing: model-name prefix → provider name.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LiteLlmConfig {
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub default_provider: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
    #[serde(default = "default_split_ratio")]
    pub validation_ratio: f64,
    #[serde(default = "default_split_ratio")]
    pub test_ratio: f64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            train_ratio: default_train_ratio(),
            validation_ratio: default_split_ratio(),
            test_ratio: default_split_ratio(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_train_ratio() -> f64 {
    0.8
}
fn default_split_ratio() -> f64 {
    0.1
}
fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}

pub const ENV_PREFIX: &str = "EASY_DATASET_";

/// Read, override from the process environment, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&content)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Like [`load_config`], but a missing file means built-in defaults plus
/// environment overrides.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        return load_config(path);
    }
    let mut config = parse_config("")?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

/// Apply `EASY_DATASET_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

    if let Some(v) = get("DATABASE_URL") {
        config.app.database_url = v;
    }
    if let Some(v) = get("UPLOAD_DIR") {
        config.app.upload_dir = PathBuf::from(v);
    }
    if let Some(v) = get("MAX_UPLOAD_SIZE") {
        config.app.max_upload_size = parse_num(&v, "MAX_UPLOAD_SIZE")?;
    }
    if let Some(v) = get("LOG_LEVEL") {
        config.app.log_level = v;
    }
    if let Some(v) = get("MAX_CONCURRENT_TASKS") {
        config.tasks.max_concurrent_tasks = parse_num(&v, "MAX_CONCURRENT_TASKS")?;
    }
    if let Some(v) = get("TASK_TIMEOUT") {
        config.tasks.task_timeout = parse_num(&v, "TASK_TIMEOUT")?;
    }
    if let Some(v) = get("QUEUE_CAPACITY") {
        config.tasks.queue_capacity = parse_num(&v, "QUEUE_CAPACITY")?;
    }
    if let Some(v) = get("CORS_ORIGINS") {
        config.app.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
    }
    Ok(())
}

fn parse_num<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{}{} must be a number, got '{}'", ENV_PREFIX, name, value))
}

pub fn validate(config: &Config) -> Result<()> {
    if config.tasks.max_concurrent_tasks == 0 {
        bail!("tasks.max_concurrent_tasks must be > 0");
    }
    if config.tasks.task_timeout == 0 {
        bail!("tasks.task_timeout must be > 0");
    }
    if config.tasks.queue_capacity == 0 {
        bail!("tasks.queue_capacity must be > 0");
    }
    if config.app.max_upload_size == 0 {
        bail!("app.max_upload_size must be > 0");
    }
    config
        .chunking
        .validate()
        .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;

    let g = &config.generation;
    if g.min_questions == 0 || g.min_questions > g.max_questions {
        bail!("generation.min_questions must be in 1..=max_questions");
    }
    if g.chars_per_question == 0 {
        bail!("generation.chars_per_question must be > 0");
    }
    if g.conversation_max_turns == 0 {
        bail!("generation.conversation_max_turns must be > 0");
    }
    if let Some(p) = &g.provider {
        if !config.providers.contains_key(p) {
            bail!("generation.provider '{}' is not defined under [providers]", p);
        }
    }

    if config.rate_limit.requests_per_second <= 0.0 || config.rate_limit.burst == 0 {
        bail!("rate_limit.requests_per_second and rate_limit.burst must be > 0");
    }
    if config.retry.max_attempts == 0 || config.retry.base_ms > config.retry.cap_ms {
        bail!("retry.max_attempts must be > 0 and retry.base_ms <= retry.cap_ms");
    }

    for (name, p) in &config.providers {
        if crate::llm::canonical_kind(&p.kind).is_none() {
            bail!("providers.{}: unknown kind '{}'", name, p.kind);
        }
    }
    for (prefix, target) in &config.litellm.routes {
        if !config.providers.contains_key(target) {
            bail!(
                "litellm.routes: prefix '{}' points at undefined provider '{}'",
                prefix,
                target
            );
        }
    }

    let e = &config.export;
    let sum = e.train_ratio + e.validation_ratio + e.test_ratio;
    if [e.train_ratio, e.validation_ratio, e.test_ratio]
        .iter()
        .any(|r| *r < 0.0)
        || (sum - 1.0).abs() > 1e-6
    {
        bail!("export split ratios must be non-negative and sum to 1.0");
    }
    Ok(())
}
