use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// One logical AI operation requested by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Rewrite,
    Categorize,
    Search,
    GenerateText,
    TitleGeneration,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Rewrite => "rewrite",
            OperationType::Categorize => "categorize",
            OperationType::Search => "search",
            OperationType::GenerateText => "generate_text",
            OperationType::TitleGeneration => "title_generation",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured input for an operation. Only the fields relevant to the
/// operation type are set; the rest stay `None` and do not affect the
/// cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub title: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub query: Option<String>,
    pub prompt: Option<String>,
}

impl OperationPayload {
    pub fn article(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }

    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }
}

/// Caller-tunable knobs for `generate_text`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
}

/// Result of `categorize`: a category from the fixed enumeration, an
/// optional region and a confidence score. `fallback` marks degraded
/// results produced without a successful upstream call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Categorization {
    pub category: String,
    pub region: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub fallback: bool,
}

impl Categorization {
    /// The degraded result handed out when the model output carries no
    /// recoverable category.
    pub fn default_value() -> Self {
        Self {
            category: "general".to_string(),
            region: None,
            confidence: 0.3,
            fallback: false,
        }
    }
}

/// Result of `rewrite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteResult {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub fallback: bool,
}

/// Result of `search`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub answer: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub fallback: bool,
}

/// Result of `title_and_summary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleSummary {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub fallback: bool,
}

/// Token counts reported by the upstream for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Append-only usage log record, one per completed logical operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub operation: OperationType,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model: String,
    pub cost: f64,
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
}

/// Audit record mirroring the usage log, written on every quota deduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionLogEntry {
    pub id: Uuid,
    pub user_id: String,
    pub operation: OperationType,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Per-user daily interaction ledger. Created lazily on first deduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub user_id: String,
    pub daily_limit: u32,
    pub consumed_today: u32,
    pub last_reset_at: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn available_today(&self) -> u32 {
        self.daily_limit.saturating_sub(self.consumed_today)
    }
}

/// Read-path view of a user's quota state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaBalance {
    pub available: u32,
    pub consumed_today: u32,
    pub daily_limit: u32,
    pub last_reset: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimiterConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            usage: UsageConfig::default(),
            quota: QuotaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Per-attempt deadline; retries do not extend it.
    pub request_timeout: Duration,
    pub temperature: f32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            request_timeout: Duration::from_secs(15),
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt, so `2` means at most 3 attempts.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Maximum permits held in the bucket (burst size).
    pub burst_capacity: u32,
    pub refill_interval: Duration,
    pub permits_per_refill: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst_capacity: 10,
            refill_interval: Duration::from_secs(1),
            permits_per_refill: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Payload text fields are truncated to this many characters before
    /// hashing and before reaching the upstream.
    pub max_field_length: usize,
    /// System prompts longer than this are shortened by the optimizer.
    pub max_prompt_length: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_field_length: 4000,
            max_prompt_length: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Buffered entries are flushed to the store once this many accumulate.
    pub flush_threshold: usize,
    /// USD per 1M tokens, keyed by model name. Unknown models use
    /// [`UsageConfig::DEFAULT_PRICING_KEY`].
    pub pricing: HashMap<String, ModelPricing>,
}

impl UsageConfig {
    pub const DEFAULT_PRICING_KEY: &'static str = "default";
}

impl Default for UsageConfig {
    fn default() -> Self {
        let mut pricing = HashMap::new();
        pricing.insert(
            "gpt-4o-mini".to_string(),
            ModelPricing {
                prompt_per_million: 0.15,
                completion_per_million: 0.60,
            },
        );
        pricing.insert(
            "gpt-4o".to_string(),
            ModelPricing {
                prompt_per_million: 2.50,
                completion_per_million: 10.00,
            },
        );
        pricing.insert(
            "deepseek-chat".to_string(),
            ModelPricing {
                prompt_per_million: 0.14,
                completion_per_million: 0.28,
            },
        );
        pricing.insert(
            Self::DEFAULT_PRICING_KEY.to_string(),
            ModelPricing {
                prompt_per_million: 0.50,
                completion_per_million: 1.50,
            },
        );
        Self {
            flush_threshold: 32,
            pricing,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub default_daily_limit: u32,
    /// Offset of the operating timezone from UTC, in minutes. The daily
    /// reset boundary is local midnight in that offset.
    pub utc_offset_minutes: i32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: 250,
            utc_offset_minutes: 0,
        }
    }
}

/// Errors surfaced by the gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        retryable: bool,
    },
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("could not parse model output: {0}")]
    Parse(String),
    #[error("daily quota exhausted for user {user_id}")]
    QuotaExceeded { user_id: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    /// Whether the retry loop may attempt the call again. Only transport
    /// failures and 429/5xx responses qualify; an open circuit fails fast
    /// and malformed model output is recovered locally instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Upstream { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<crate::storage::StoreError> for GatewayError {
    fn from(err: crate::storage::StoreError) -> Self {
        GatewayError::Storage(err.to_string())
    }
}
