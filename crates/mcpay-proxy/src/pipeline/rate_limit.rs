//! Per-upstream-host token bucket with minimum spacing.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::RateLimitConfig;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    /// May lie in the future when capacity is already reserved by waiting callers.
    last_refill_ms: u64,
    last_request_ms: Option<u64>,
}

impl TokenBucket {
    fn full(capacity: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
            last_request_ms: None,
        }
    }

    fn refill(&mut self, at_ms: u64, config: &RateLimitConfig) {
        let elapsed_ms = at_ms.saturating_sub(self.last_refill_ms);
        if elapsed_ms > 0 {
            self.tokens =
                (self.tokens + elapsed_ms as f64 * config.refill_per_sec / 1000.0).min(config.capacity);
            self.last_refill_ms = at_ms;
        }
    }

    /// Reserve one token and return when the caller may send.
    fn reserve(&mut self, now_ms: u64, config: &RateLimitConfig) -> u64 {
        self.refill(now_ms, config);

        let token_ready_ms = if self.tokens >= 1.0 {
            now_ms
        } else {
            let deficit_ms = ((1.0 - self.tokens) / config.refill_per_sec * 1000.0).ceil() as u64;
            self.last_refill_ms.max(now_ms) + deficit_ms
        };
        let spacing_ready_ms = self
            .last_request_ms
            .map(|last| last + config.min_spacing.as_millis() as u64)
            .unwrap_or(now_ms);
        let send_at_ms = now_ms.max(token_ready_ms).max(spacing_ready_ms);

        self.refill(send_at_ms, config);
        self.tokens -= 1.0;
        self.last_request_ms = Some(send_at_ms);
        send_at_ms
    }
}

/// Shared limiter keyed by upstream hostname. Buckets are created on first use
/// and live for the process lifetime.
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
            clock,
        }
    }

    /// Wait until `host` has capacity, then consume it. Returns the time waited.
    ///
    /// The slot is reserved under the map entry lock, so concurrent callers queue
    /// behind each other instead of all waking at once.
    pub async fn acquire(&self, host: &str) -> Duration {
        let now_ms = self.clock.now_millis();
        let send_at_ms = {
            let mut bucket = self
                .buckets
                .entry(host.to_ascii_lowercase())
                .or_insert_with(|| TokenBucket::full(self.config.capacity, now_ms));
            bucket.reserve(now_ms, &self.config)
        };

        let wait = Duration::from_millis(send_at_ms.saturating_sub(now_ms));
        if !wait.is_zero() {
            tracing::debug!(host = %host, wait_ms = wait.as_millis() as u64, "upstream rate limit wait");
            self.clock.sleep(wait).await;
        }
        wait
    }

    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        self.buckets.len()
    }
}
