//! The `AIGateway` façade used by the rest of the application.
//!
//! Every public operation follows the same pipeline: cache lookup →
//! (on miss) rate-limiter permit → circuit-breaker-guarded upstream call
//! with a per-attempt deadline and bounded jittered retry → layered JSON
//! extraction with safe defaults → usage accounting and quota deduction.
//! Bookkeeping is best-effort: a failed usage or quota write never fails a
//! logically-successful operation. Anonymous calls (no user id) skip
//! accounting entirely.

use crate::gateway::cache::{CacheOptions, CacheOutcome, CacheStats, ResponseCache};
use crate::gateway::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus};
use crate::gateway::parse;
use crate::gateway::rate_limiter::{RateLimiter, RateLimiterStatus};
use crate::gateway::types::{
    Categorization, GatewayConfig, GatewayError, GenerateOptions, OperationPayload, OperationType,
    QuotaBalance, RewriteResult, SearchResult, TitleSummary, TokenUsage,
};
use crate::gateway::quota::QuotaManager;
use crate::gateway::upstream::{ChatMessage, ChatRequest, ChatResponse, UpstreamClient};
use crate::gateway::usage_tracker::{DailyStats, UsageMetrics, UsageTracker};
use crate::storage::GatewayStore;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const REWRITE_PROMPT: &str = "Eres un editor de noticias. Reescribe el artículo con un estilo \
claro y neutral, conservando todos los hechos. Responde únicamente con JSON: \
{\"title\": \"...\", \"content\": \"...\"}";

const CATEGORIZE_PROMPT: &str = "Eres un clasificador de noticias. Asigna una categoría de esta \
lista: general, deportes, politica, economia, internacional, nacional, cultura, tecnologia, \
sociedad, espectaculos, policial, salud. Responde únicamente con JSON: \
{\"category\": \"...\", \"region\": \"...\" | null, \"confidence\": 0.0-1.0}";

const SEARCH_PROMPT: &str = "Eres un asistente de búsqueda de noticias. Responde la consulta \
con información concreta. Responde únicamente con JSON: \
{\"answer\": \"...\", \"keywords\": [\"...\"]}";

const TITLE_SUMMARY_PROMPT: &str = "Eres un editor de noticias. Genera un titular breve y un \
resumen de dos frases para el artículo. Responde únicamente con JSON: \
{\"title\": \"...\", \"summary\": \"...\"}";

/// Overrides applied to the upstream request for a single call.
#[derive(Debug, Clone, Default)]
struct CallOverrides {
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

/// Aggregate operational view consumed by dashboards.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub rate_limiter: RateLimiterStatus,
    pub circuit_breaker: CircuitBreakerStatus,
    pub cache: CacheStats,
}

pub struct AIGateway {
    config: GatewayConfig,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    cache: Arc<ResponseCache>,
    usage_tracker: Arc<UsageTracker>,
    quota: Arc<QuotaManager>,
    upstream: Arc<dyn UpstreamClient>,
}

impl AIGateway {
    /// Wires one gateway instance around the given upstream and store. The
    /// rate limiter and circuit breaker are shared by every caller holding
    /// this instance; hold it for the process lifetime.
    pub fn new(
        config: GatewayConfig,
        upstream: Arc<dyn UpstreamClient>,
        store: Arc<dyn GatewayStore>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let usage_tracker = Arc::new(UsageTracker::new(config.usage.clone(), Arc::clone(&store)));
        let quota = Arc::new(QuotaManager::new(config.quota.clone(), store));

        Self {
            config,
            rate_limiter,
            circuit_breaker,
            cache,
            usage_tracker,
            quota,
            upstream,
        }
    }

    /// Rewrites an article. Degrades to the original text when the upstream
    /// is unavailable.
    pub async fn rewrite(
        &self,
        title: &str,
        content: &str,
        user_id: Option<&str>,
    ) -> Result<RewriteResult, GatewayError> {
        let payload = OperationPayload::article(title, content);
        let fallback = serde_json::to_value(RewriteResult {
            title: title.to_string(),
            content: content.to_string(),
            fallback: true,
        })
        .ok();

        let original_title = title.to_string();
        let value = self
            .execute_operation(
                OperationType::Rewrite,
                payload,
                user_id,
                fallback,
                CallOverrides::default(),
                REWRITE_PROMPT,
                |p| {
                    format!(
                        "Título: {}\n\nContenido:\n{}",
                        p.title.as_deref().unwrap_or(""),
                        p.content.as_deref().unwrap_or("")
                    )
                },
                move |text| {
                    serde_json::to_value(parse::parse_rewrite(text, &original_title))
                        .unwrap_or(Value::Null)
                },
            )
            .await?;

        serde_json::from_value(value).map_err(|err| GatewayError::Parse(err.to_string()))
    }

    /// Assigns a category from the fixed enumeration. Degrades to
    /// `general`/0.3 instead of failing.
    pub async fn categorize(
        &self,
        title: &str,
        content: &str,
        url: &str,
        user_id: Option<&str>,
    ) -> Result<Categorization, GatewayError> {
        let payload = OperationPayload {
            title: Some(title.to_string()),
            content: Some(content.to_string()),
            url: Some(url.to_string()),
            ..Default::default()
        };
        let fallback = serde_json::to_value(Categorization {
            fallback: true,
            ..Categorization::default_value()
        })
        .ok();

        let value = self
            .execute_operation(
                OperationType::Categorize,
                payload,
                user_id,
                fallback,
                CallOverrides::default(),
                CATEGORIZE_PROMPT,
                |p| {
                    format!(
                        "Título: {}\nURL: {}\n\nContenido:\n{}",
                        p.title.as_deref().unwrap_or(""),
                        p.url.as_deref().unwrap_or(""),
                        p.content.as_deref().unwrap_or("")
                    )
                },
                |text| serde_json::to_value(parse::parse_categorization(text)).unwrap_or(Value::Null),
            )
            .await?;

        serde_json::from_value(value).map_err(|err| GatewayError::Parse(err.to_string()))
    }

    /// Answers a news query. No fallback: transport failures surface to the
    /// caller.
    pub async fn search(
        &self,
        query: &str,
        user_id: Option<&str>,
    ) -> Result<SearchResult, GatewayError> {
        let payload = OperationPayload::query(query);

        let value = self
            .execute_operation(
                OperationType::Search,
                payload,
                user_id,
                None,
                CallOverrides::default(),
                SEARCH_PROMPT,
                |p| p.query.clone().unwrap_or_default(),
                |text| serde_json::to_value(parse::parse_search(text)).unwrap_or(Value::Null),
            )
            .await?;

        serde_json::from_value(value).map_err(|err| GatewayError::Parse(err.to_string()))
    }

    /// Free-form generation; returns the model's raw text.
    pub async fn generate_text(
        &self,
        prompt: &str,
        options: GenerateOptions,
        user_id: Option<&str>,
    ) -> Result<String, GatewayError> {
        let payload = OperationPayload::prompt(prompt);
        let overrides = CallOverrides {
            model: options.model,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let value = self
            .execute_operation(
                OperationType::GenerateText,
                payload,
                user_id,
                None,
                overrides,
                "Eres un asistente de redacción para un sitio de noticias.",
                |p| p.prompt.clone().unwrap_or_default(),
                |text| Value::String(text.trim().to_string()),
            )
            .await?;

        match value {
            Value::String(text) => Ok(text),
            other => Ok(other.to_string()),
        }
    }

    /// Generates a headline plus a short summary for an article. Degrades to
    /// a truncation of the content.
    pub async fn title_and_summary(
        &self,
        content: &str,
        user_id: Option<&str>,
    ) -> Result<TitleSummary, GatewayError> {
        let payload = OperationPayload {
            content: Some(content.to_string()),
            ..Default::default()
        };
        let fallback = serde_json::to_value(TitleSummary {
            title: truncate_chars(content.trim(), 80),
            summary: truncate_chars(content.trim(), 240),
            fallback: true,
        })
        .ok();

        let value = self
            .execute_operation(
                OperationType::TitleGeneration,
                payload,
                user_id,
                fallback,
                CallOverrides::default(),
                TITLE_SUMMARY_PROMPT,
                |p| p.content.clone().unwrap_or_default(),
                |text| serde_json::to_value(parse::parse_title_summary(text)).unwrap_or(Value::Null),
            )
            .await?;

        serde_json::from_value(value).map_err(|err| GatewayError::Parse(err.to_string()))
    }

    /// The shared pipeline behind every public operation.
    #[allow(clippy::too_many_arguments)]
    async fn execute_operation<B, P>(
        &self,
        operation: OperationType,
        payload: OperationPayload,
        user_id: Option<&str>,
        fallback: Option<Value>,
        overrides: CallOverrides,
        system_prompt: &str,
        build_user_message: B,
        parse_output: P,
    ) -> Result<Value, GatewayError>
    where
        B: FnOnce(&OperationPayload) -> String,
        P: FnOnce(&str) -> Value,
    {
        let plan = self.cache.optimize_prompt(system_prompt, operation);
        // The produce closure writes the upstream's token usage here so the
        // bookkeeping below can see it once the cache layer returns.
        let usage_slot: Arc<Mutex<Option<(TokenUsage, String)>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&usage_slot);
        let result = self
            .cache
            .execute_with_optimization(
                operation,
                payload,
                CacheOptions {
                    ttl: None,
                    max_field_length: None,
                    fallback,
                },
                |normalized| async move {
                    let request = ChatRequest {
                        model: overrides
                            .model
                            .unwrap_or_else(|| self.config.upstream.model.clone()),
                        messages: vec![
                            ChatMessage::system(plan.system_prompt),
                            ChatMessage::user(build_user_message(&normalized)),
                        ],
                        max_tokens: overrides.max_tokens.unwrap_or(plan.max_tokens),
                        temperature: overrides
                            .temperature
                            .unwrap_or(self.config.upstream.temperature),
                        stream: false,
                    };

                    let model = request.model.clone();
                    let response = self.call_upstream_with_retry(request).await?;
                    *slot.lock().await =
                        Some((response.usage, response.model.clone().unwrap_or(model)));
                    Ok(parse_output(response.content()))
                },
            )
            .await?;

        if result.outcome != CacheOutcome::Fallback
            && let Some(user) = user_id
        {
            self.record_bookkeeping(user, operation, result.outcome, &usage_slot)
                .await;
        }

        Ok(result.value)
    }

    /// Usage log + quota deduction. Failures here are logged and swallowed;
    /// the caller's operation already succeeded.
    async fn record_bookkeeping(
        &self,
        user_id: &str,
        operation: OperationType,
        outcome: CacheOutcome,
        usage_slot: &Mutex<Option<(TokenUsage, String)>>,
    ) {
        let cache_hit = outcome == CacheOutcome::Hit;
        let (usage, model) = usage_slot
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| (TokenUsage::default(), self.config.upstream.model.clone()));

        if let Err(err) = self
            .usage_tracker
            .track_usage(Some(user_id), operation, usage, &model, cache_hit)
            .await
        {
            warn!(%operation, error = %err, "failed to record usage entry");
        }

        match self
            .quota
            .deduct_interaction(user_id, operation, json!({ "cache_hit": cache_hit }))
            .await
        {
            Ok(balance) => {
                debug!(user = user_id, available = balance.available, "interaction deducted")
            }
            Err(err) => warn!(user = user_id, error = %err, "failed to deduct interaction"),
        }
    }

    /// One rate-limiter permit, then breaker-guarded attempts with a
    /// per-attempt deadline and capped exponential backoff. 429/5xx and
    /// transport failures retry; an open circuit fails fast and is never
    /// retried.
    async fn call_upstream_with_retry(
        &self,
        request: ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        let permit = self.rate_limiter.acquire().await;
        debug!(permit_id = %permit.permit_id, granted_at = %permit.granted_at, "rate permit granted");
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            let outcome = self
                .circuit_breaker
                .execute(|| async {
                    match tokio::time::timeout(
                        self.config.upstream.request_timeout,
                        self.upstream.chat_completion(request.clone()),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::Transport(
                            "upstream attempt deadline exceeded".to_string(),
                        )),
                    }
                })
                .await;

            match outcome {
                Ok(response) => return Ok(response),
                Err(GatewayError::CircuitOpen) => return Err(GatewayError::CircuitOpen),
                Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                    let delay = backoff_delay(retry, attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "upstream call failed, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn quota_balance(&self, user_id: &str) -> Result<QuotaBalance, GatewayError> {
        self.quota.balance(user_id).await
    }

    /// Advisory check: `Err(QuotaExceeded)` when the user's daily allowance
    /// is spent. Purely informational, operations are never blocked.
    pub async fn check_quota(&self, user_id: &str) -> Result<QuotaBalance, GatewayError> {
        self.quota.check_quota(user_id).await
    }

    pub async fn set_daily_limit(&self, user_id: &str, limit: u32) -> Result<(), GatewayError> {
        self.quota.set_daily_limit(user_id, limit).await
    }

    pub async fn today_stats(&self) -> Result<DailyStats, GatewayError> {
        self.usage_tracker.today_stats().await
    }

    pub async fn metrics(&self, days: u32) -> Result<UsageMetrics, GatewayError> {
        self.usage_tracker.metrics(days).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cleanup_cache(&self) -> usize {
        self.cache.cleanup()
    }

    pub fn clear_cache(&self) {
        self.cache.clear()
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            rate_limiter: self.rate_limiter.status().await,
            circuit_breaker: self.circuit_breaker.status().await,
            cache: self.cache.stats(),
        }
    }

    /// Flushes buffered usage entries; call before process exit.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.usage_tracker.shutdown().await
    }
}

fn backoff_delay(retry: &crate::gateway::types::RetryConfig, attempt: u32) -> Duration {
    let base = retry.base_backoff.as_millis() as f64
        * retry.backoff_multiplier.powi(attempt.min(10) as i32);
    // ±10% jitter keeps concurrent retries from synchronizing.
    let jitter = (rand::random::<f64>() - 0.5) * 0.2;
    let delay = Duration::from_millis((base * (1.0 + jitter)) as u64);
    delay.min(retry.max_backoff)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
