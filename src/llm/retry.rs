//! Exponential backoff with full jitter.
//!
//! Attempt `n` (zero-based) sleeps a uniform random duration in
//! `[0, min(cap, base * 2^n)]`. A provider `Retry-After` raises the floor
//! of that sleep but never past `cap`. Only `Transient` errors are retried;
//! once `max_attempts` calls have failed the last error becomes
//! `ProviderFailure`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use easy_dataset_core::{PipelineError, PipelineResult};

use crate::config::RetryConfig;
use crate::tasks::CancelFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(c.base_ms),
            cap: Duration::from_millis(c.cap_ms),
            max_attempts: c.max_attempts.max(1),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the jitter window before attempt `attempt + 1`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Sleep before the next attempt.
    pub fn delay<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let ceiling = self.ceiling(attempt);
        let jitter = if ceiling.is_zero() {
            Duration::ZERO
        } else {
            rng.gen_range(Duration::ZERO..=ceiling)
        };
        match retry_after {
            Some(hint) => jitter.max(hint.min(self.cap)),
            None => jitter,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Returns the value and the number of retries spent. Cancellation is
/// checked before every attempt and interrupts backoff sleeps.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    provider: &str,
    cancel: &CancelFlag,
    mut op: F,
) -> PipelineResult<(T, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        cancel.check()?;
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(PipelineError::Transient {
                message,
                retry_after,
                ..
            }) => {
                if attempt + 1 >= policy.max_attempts {
                    return Err(PipelineError::ProviderFailure {
                        provider: provider.to_string(),
                        message,
                        attempts: attempt + 1,
                    });
                }
                let delay = policy.delay(attempt, retry_after, &mut rand::thread_rng());
                warn!(
                    provider,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "transient provider error, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                }
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}
