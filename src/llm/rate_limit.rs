//! Process-wide token buckets keyed by `(provider, model)`.
//!
//! Each bucket refills at `requests_per_second` up to `burst` tokens.
//! Provider hints (`Retry-After`, exhausted `x-ratelimit-remaining-requests`)
//! push the bucket's next-available instant forward for every caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::{Config, RateLimitConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Zero or negative disables limiting.
    pub requests_per_second: f64,
    pub burst: u32,
}

impl From<&RateLimitConfig> for BucketSpec {
    fn from(c: &RateLimitConfig) -> Self {
        Self {
            requests_per_second: c.requests_per_second,
            burst: c.burst,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

#[derive(Debug)]
pub struct TokenBucket {
    spec: BucketSpec,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(spec: BucketSpec) -> Self {
        let burst = f64::from(spec.burst.max(1));
        Self {
            spec,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
                blocked_until: None,
            }),
        }
    }

    fn unlimited(&self) -> bool {
        self.spec.requests_per_second <= 0.0
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&self, now: Instant) -> Result<(), Duration> {
        let mut st = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(until) = st.blocked_until {
            if until > now {
                return Err(until - now);
            }
            st.blocked_until = None;
        }
        if self.unlimited() {
            return Ok(());
        }

        let capacity = f64::from(self.spec.burst.max(1));
        let elapsed = now.saturating_duration_since(st.last_refill).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.spec.requests_per_second).min(capacity);
        st.last_refill = now;

        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - st.tokens;
            Err(Duration::from_secs_f64(missing / self.spec.requests_per_second))
        }
    }

    /// Wait for a token. Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            match self.try_take(Instant::now()) {
                Ok(()) => return started.elapsed(),
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Hold every caller off for `delay` from now.
    pub fn penalize(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut st = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        st.blocked_until = Some(st.blocked_until.map_or(until, |u| u.max(until)));
    }
}

/// Buckets for every `(provider, model)` seen so far.
#[derive(Debug, Default)]
pub struct RateLimiter {
    default: Option<BucketSpec>,
    per_provider: HashMap<String, BucketSpec>,
    buckets: Mutex<HashMap<(String, String), Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(default: BucketSpec) -> Self {
        Self {
            default: Some(default),
            ..Default::default()
        }
    }

    /// No limiting unless a provider hint arrives.
    pub fn unlimited() -> Self {
        Self::new(BucketSpec {
            requests_per_second: 0.0,
            burst: 1,
        })
    }

    /// `[rate_limit]` defaults with per-provider overrides.
    pub fn from_config(config: &Config) -> Self {
        let default = BucketSpec::from(&config.rate_limit);
        let mut limiter = Self::new(default);
        for (name, p) in &config.providers {
            if p.requests_per_second.is_some() || p.burst.is_some() {
                limiter.per_provider.insert(
                    name.clone(),
                    BucketSpec {
                        requests_per_second: p
                            .requests_per_second
                            .unwrap_or(default.requests_per_second),
                        burst: p.burst.unwrap_or(default.burst),
                    },
                );
            }
        }
        limiter
    }

    pub fn with_provider(mut self, provider: &str, spec: BucketSpec) -> Self {
        self.per_provider.insert(provider.to_string(), spec);
        self
    }

    pub fn bucket(&self, provider: &str, model: &str) -> Arc<TokenBucket> {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets
            .entry((provider.to_string(), model.to_string()))
            .or_insert_with(|| {
                let spec = self
                    .per_provider
                    .get(provider)
                    .copied()
                    .or(self.default)
                    .unwrap_or(BucketSpec {
                        requests_per_second: 0.0,
                        burst: 1,
                    });
                Arc::new(TokenBucket::new(spec))
            })
            .clone()
    }

    pub async fn acquire(&self, provider: &str, model: &str) -> Duration {
        let waited = self.bucket(provider, model).acquire().await;
        if !waited.is_zero() {
            debug!(provider, model, waited_ms = waited.as_millis() as u64, "rate limited");
        }
        waited
    }

    pub fn penalize(&self, provider: &str, model: &str, delay: Duration) {
        self.bucket(provider, model).penalize(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rps: f64, burst: u32) -> BucketSpec {
        BucketSpec {
            requests_per_second: rps,
            burst,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill_rate() {
        let bucket = TokenBucket::new(spec(2.0, 2));
        assert!(bucket.acquire().await.is_zero());
        assert!(bucket.acquire().await.is_zero());
        let waited = bucket.acquire().await;
        assert!(waited >= Duration::from_millis(490), "{:?}", waited);
        assert!(waited <= Duration::from_millis(600), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_blocks_even_unlimited_buckets() {
        let bucket = TokenBucket::new(spec(0.0, 1));
        assert!(bucket.acquire().await.is_zero());
        bucket.penalize(Duration::from_secs(3));
        bucket.penalize(Duration::from_secs(1));
        let waited = bucket.acquire().await;
        assert!(waited >= Duration::from_secs(3), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_are_per_provider_and_model() {
        let limiter = RateLimiter::new(spec(1.0, 1)).with_provider("fast", spec(0.0, 1));
        assert!(limiter.acquire("slow", "a").await.is_zero());
        assert!(limiter.acquire("slow", "b").await.is_zero());
        assert!(!limiter.acquire("slow", "a").await.is_zero());
        for _ in 0..5 {
            assert!(limiter.acquire("fast", "a").await.is_zero());
        }
        assert!(Arc::ptr_eq(&limiter.bucket("slow", "a"), &limiter.bucket("slow", "a")));
    }
}
