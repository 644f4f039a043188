//! Error taxonomy for the dataset pipeline.
//!
//! Every failure that crosses a component boundary is a [`PipelineError`].
//! Callers branch on [`PipelineError::kind`] rather than on variants, and
//! user-facing surfaces render [`ErrorView`], which never carries
//! provider credentials.
//!
//! | Kind | Raised by | Policy |
//! |------|-----------|--------|
//! | `validation` | any | surfaced |
//! | `not_found` / `conflict` | store, engine | surfaced |
//! | `unsupported_file_type` / `capability_unsupported` | storage, processors, adapters | surfaced |
//! | `transient` | adapters | retried by the LLM service |
//! | `permanent` | adapters, service | surfaced immediately |
//! | `provider_failure` | service | transient retries exhausted |
//! | `timeout` / `cancelled` / `interrupted_by_restart` | task engine | task marked terminal |
//! | `queue_full` / `size_exceeds_limit` / `storage_io` | admission, storage | surfaced |

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result alias used across the pipeline.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Flat classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    UnsupportedFileType,
    CapabilityUnsupported,
    Transient,
    Permanent,
    ProviderFailure,
    Timeout,
    Cancelled,
    InterruptedByRestart,
    QueueFull,
    SizeExceedsLimit,
    StorageIo,
    IncompleteSelection,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::UnsupportedFileType => "unsupported_file_type",
            ErrorKind::CapabilityUnsupported => "capability_unsupported",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::ProviderFailure => "provider_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InterruptedByRestart => "interrupted_by_restart",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::SizeExceedsLimit => "size_exceeds_limit",
            ErrorKind::StorageIo => "storage_io",
            ErrorKind::IncompleteSelection => "incomplete_selection",
            ErrorKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("provider '{provider}' does not support {capability}")]
    CapabilityUnsupported {
        provider: String,
        capability: String,
    },

    #[error("transient error from '{provider}': {message}")]
    Transient {
        provider: String,
        message: String,
        /// Provider-requested delay before the next attempt, if any.
        retry_after: Option<Duration>,
    },

    #[error("permanent error from '{provider}': {message}")]
    Permanent { provider: String, message: String },

    #[error("provider '{provider}' failed after {attempts} attempt(s): {message}")]
    ProviderFailure {
        provider: String,
        message: String,
        attempts: u32,
    },

    #[error("task exceeded its wall-clock timeout of {0}s")]
    Timeout(u64),

    #[error("cancelled by operator")]
    Cancelled,

    #[error("interrupted by process restart")]
    InterruptedByRestart,

    #[error("task queue is full ({0} queued)")]
    QueueFull(usize),

    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    SizeExceedsLimit { size: u64, limit: u64 },

    #[error("storage I/O error: {0}")]
    StorageIo(String),

    #[error("selection incomplete: {} question(s) have no answer", .0.len())]
    IncompleteSelection(Vec<String>),

    #[error("persistence error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::Conflict(_) => ErrorKind::Conflict,
            PipelineError::UnsupportedFileType(_) => ErrorKind::UnsupportedFileType,
            PipelineError::CapabilityUnsupported { .. } => ErrorKind::CapabilityUnsupported,
            PipelineError::Transient { .. } => ErrorKind::Transient,
            PipelineError::Permanent { .. } => ErrorKind::Permanent,
            PipelineError::ProviderFailure { .. } => ErrorKind::ProviderFailure,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::InterruptedByRestart => ErrorKind::InterruptedByRestart,
            PipelineError::QueueFull(_) => ErrorKind::QueueFull,
            PipelineError::SizeExceedsLimit { .. } => ErrorKind::SizeExceedsLimit,
            PipelineError::StorageIo(_) => ErrorKind::StorageIo,
            PipelineError::IncompleteSelection(_) => ErrorKind::IncompleteSelection,
            PipelineError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient { .. })
    }

    /// The provider name attached to provider-originated errors.
    pub fn provider(&self) -> Option<&str> {
        match self {
            PipelineError::CapabilityUnsupported { provider, .. }
            | PipelineError::Transient { provider, .. }
            | PipelineError::Permanent { provider, .. }
            | PipelineError::ProviderFailure { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Build the user-visible shape of this error.
    pub fn view(&self) -> ErrorView {
        let entity_id = match self {
            PipelineError::NotFound { id, .. } => Some(id.clone()),
            PipelineError::IncompleteSelection(ids) => ids.first().cloned(),
            _ => None,
        };
        ErrorView {
            kind: self.kind(),
            message: self.to_string(),
            task_id: None,
            entity_id,
            provider: self.provider().map(str::to_string),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::StorageIo(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Validation(format!("invalid JSON: {}", e))
    }
}

/// User-visible error record persisted on failed tasks and printed by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorView {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl ErrorView {
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Replace every occurrence of `secret` in `message` with a placeholder.
///
/// Adapters run provider error bodies through this before wrapping them.
pub fn redact(message: &str, secret: Option<&str>) -> String {
    match secret {
        Some(s) if s.len() >= 4 => message.replace(s, "[redacted]"),
        _ => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_snake_case() {
        assert_eq!(ErrorKind::InterruptedByRestart.as_str(), "interrupted_by_restart");
        let json = serde_json::to_string(&ErrorKind::QueueFull).unwrap();
        assert_eq!(json, "\"queue_full\"");
    }

    #[test]
    fn view_carries_provider_and_entity() {
        let err = PipelineError::Permanent {
            provider: "openai".into(),
            message: "401 unauthorized".into(),
        };
        let view = err.view().with_task("t-1");
        assert_eq!(view.kind, ErrorKind::Permanent);
        assert_eq!(view.provider.as_deref(), Some("openai"));
        assert_eq!(view.task_id.as_deref(), Some("t-1"));

        let view = PipelineError::not_found("chunk", "c-9").view();
        assert_eq!(view.entity_id.as_deref(), Some("c-9"));
        assert!(view.provider.is_none());
    }

    #[test]
    fn redact_removes_secret() {
        let msg = "bad key sk-abcdef123 supplied";
        assert_eq!(redact(msg, Some("sk-abcdef123")), "bad key [redacted] supplied");
        assert_eq!(redact(msg, None), msg);
    }

    #[test]
    fn incomplete_selection_message_counts_ids() {
        let err = PipelineError::IncompleteSelection(vec!["q1".into(), "q2".into()]);
        assert!(err.to_string().contains("2 question(s)"));
    }
}
