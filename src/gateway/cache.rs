//! Content-addressed response cache and per-operation cost optimizer.
//!
//! Cache keys are UUIDv5 hashes of the operation type plus the *normalized*
//! payload, so semantically-identical-enough requests collapse to one entry
//! and keys stay stable across process restarts. Normalization (whitespace
//! trim, character-bounded truncation) is the same on write and read. A hit
//! returns without touching the rate limiter or the upstream, which is the
//! whole cost-saving point of this layer. Fallback values returned after a
//! failed `produce` are never cached.

use crate::gateway::types::{CacheConfig, GatewayError, OperationPayload, OperationType};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const CACHE_NAMESPACE: &str = "prensa-gateway/response-cache";

#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: DashMap<Uuid, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Per-call cache knobs supplied by the façade.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub ttl: Option<Duration>,
    pub max_field_length: Option<usize>,
    /// Degraded result returned instead of propagating a `produce` failure.
    pub fallback: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct CachedResult {
    pub value: serde_json::Value,
    pub outcome: CacheOutcome,
}

/// Output of the prompt optimizer: a possibly-shortened system prompt and a
/// max-output-token budget tuned per operation type.
#[derive(Debug, Clone)]
pub struct PromptPlan {
    pub system_prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache lookup around `produce`. On a live entry the stored value is
    /// returned immediately; otherwise `produce` runs with the normalized
    /// payload and its result is stored under the content key. Concurrent
    /// misses for the same key are not serialized; both call the upstream
    /// and the last store wins.
    pub async fn execute_with_optimization<F, Fut>(
        &self,
        operation: OperationType,
        payload: OperationPayload,
        options: CacheOptions,
        produce: F,
    ) -> Result<CachedResult, GatewayError>
    where
        F: FnOnce(OperationPayload) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, GatewayError>>,
    {
        let max_len = options.max_field_length.unwrap_or(self.config.max_field_length);
        let normalized = normalize_payload(&payload, max_len);
        let key = cache_key(operation, &normalized);

        if let Some(entry) = self.entries.get(&key)
            && entry.expires_at > Instant::now()
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, %operation, "cache hit");
            return Ok(CachedResult {
                value: entry.value.clone(),
                outcome: CacheOutcome::Hit,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);

        match produce(normalized).await {
            Ok(value) => {
                let ttl = options.ttl.unwrap_or(self.config.ttl);
                self.entries.insert(
                    key,
                    CacheEntry {
                        value: value.clone(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                Ok(CachedResult {
                    value,
                    outcome: CacheOutcome::Miss,
                })
            }
            Err(err) => match options.fallback {
                Some(fallback) => {
                    warn!(%operation, error = %err, "upstream call failed, returning fallback value");
                    Ok(CachedResult {
                        value: fallback,
                        outcome: CacheOutcome::Fallback,
                    })
                }
                None => Err(err),
            },
        }
    }

    /// Shortens the system prompt and picks a max-output-token budget for
    /// the operation type, reducing cost per call.
    pub fn optimize_prompt(&self, base_prompt: &str, operation: OperationType) -> PromptPlan {
        let max_tokens = match operation {
            OperationType::Rewrite => 600,
            OperationType::Categorize => 150,
            OperationType::Search => 400,
            OperationType::GenerateText => 800,
            OperationType::TitleGeneration => 200,
        };

        let trimmed = base_prompt.trim();
        let system_prompt = truncate_chars(trimmed, self.config.max_prompt_length);

        PromptPlan {
            system_prompt,
            max_tokens,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            entries: self.entries.len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Evicts expired entries, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Deterministic content key for an operation and its normalized payload.
pub fn cache_key(operation: OperationType, normalized: &OperationPayload) -> Uuid {
    let namespace = Uuid::new_v5(&Uuid::NAMESPACE_OID, CACHE_NAMESPACE.as_bytes());
    let mut material = Vec::from(operation.as_str().as_bytes());
    material.push(0);
    // Struct field order is fixed, so this serialization is stable.
    material.extend(serde_json::to_vec(normalized).unwrap_or_default());
    Uuid::new_v5(&namespace, &material)
}

/// Trims whitespace and truncates long text fields so equivalent requests
/// hash to the same key. Applied identically before hashing and before the
/// payload reaches the upstream.
pub fn normalize_payload(payload: &OperationPayload, max_len: usize) -> OperationPayload {
    let norm = |field: &Option<String>| {
        field
            .as_ref()
            .map(|s| truncate_chars(s.trim(), max_len))
            .filter(|s| !s.is_empty())
    };
    OperationPayload {
        title: norm(&payload.title),
        content: norm(&payload.content),
        url: norm(&payload.url),
        query: norm(&payload.query),
        prompt: norm(&payload.prompt),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
