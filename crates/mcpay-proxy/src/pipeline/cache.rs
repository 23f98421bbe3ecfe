//! In-memory GET response cache.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::pipeline::context::HeaderList;

/// Entries kept before expired ones are swept on insert.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    stored_at_ms: u64,
    ttl_ms: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.stored_at_ms) >= self.ttl_ms
    }
}

/// Process-wide response cache keyed by `sha256(method, url, body)`.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            clock,
        }
    }

    /// Slower-changing hosts (docs, static content) keep entries longer.
    pub fn ttl_for_host(&self, host: &str) -> Duration {
        let host = host.to_ascii_lowercase();
        if self
            .config
            .long_ttl_hosts
            .iter()
            .any(|fragment| host.contains(fragment.as_str()))
        {
            self.config.long_ttl
        } else {
            self.config.default_ttl
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let now = self.clock.now_millis();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.response.clone())
    }

    pub fn put(&self, key: String, host: &str, response: CachedResponse) {
        let now = self.clock.now_millis();
        if self.entries.len() >= SWEEP_THRESHOLD {
            self.entries.retain(|_, e| !e.is_expired(now));
        }
        let ttl_ms = self.ttl_for_host(host).as_millis() as u64;
        self.entries.insert(
            key,
            CacheEntry {
                response,
                stored_at_ms: now,
                ttl_ms,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
