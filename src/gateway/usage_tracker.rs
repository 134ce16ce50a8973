//! Token and cost accounting for every call that reaches the upstream.
//!
//! Entries are buffered in memory and flushed to the store once the buffer
//! fills, on an explicit [`UsageTracker::flush_logs`], and at shutdown. A
//! failed flush puts the entries back in the buffer so data is retried
//! rather than dropped. Aggregation feeds the metrics dashboards.

use crate::gateway::types::{
    GatewayError, ModelPricing, OperationType, TokenUsage, UsageConfig, UsageLogEntry,
};
use crate::storage::GatewayStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct UsageTracker {
    config: UsageConfig,
    store: Arc<dyn GatewayStore>,
    buffer: Mutex<Vec<UsageLogEntry>>,
}

/// Aggregates for one calendar day (UTC).
#[derive(Debug, Clone, Default)]
pub struct DailyStats {
    pub date: String,
    pub operations: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub by_operation: HashMap<String, OperationStats>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    pub operations: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Multi-day rollup consumed by the metrics dashboards.
#[derive(Debug, Clone)]
pub struct UsageMetrics {
    pub period_days: u32,
    pub operations: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub cache_hit_rate: f64,
    pub daily: Vec<DailyStats>,
}

/// Canonical form for user identifiers coming from different subsystems
/// (numeric ids, UUID strings). Used as the aggregation key everywhere.
pub fn canonical_user_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl UsageTracker {
    pub fn new(config: UsageConfig, store: Arc<dyn GatewayStore>) -> Self {
        Self {
            config,
            store,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Appends one usage entry. Cost is derived from the pricing table.
    /// Fire-and-forget from the caller's perspective; the façade logs and
    /// swallows any error so bookkeeping never fails a logical operation.
    pub async fn track_usage(
        &self,
        user_id: Option<&str>,
        operation: OperationType,
        usage: TokenUsage,
        model: &str,
        cache_hit: bool,
    ) -> Result<(), GatewayError> {
        let entry = UsageLogEntry {
            id: Uuid::new_v4(),
            user_id: user_id.map(canonical_user_id),
            operation,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            model: model.to_string(),
            cost: self.calculate_cost(model, usage.prompt_tokens, usage.completion_tokens),
            cache_hit,
            created_at: Utc::now(),
        };

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(entry);
            buffer.len() >= self.config.flush_threshold
        };

        if should_flush {
            self.flush_logs().await?;
        }
        Ok(())
    }

    /// Writes all buffered entries to the store. On failure the entries are
    /// put back so the next flush retries them.
    pub async fn flush_logs(&self) -> Result<usize, GatewayError> {
        let drained: Vec<UsageLogEntry> = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return Ok(0);
        }

        match self.store.append_usage(&drained).await {
            Ok(()) => {
                debug!(count = drained.len(), "flushed usage log entries");
                Ok(drained.len())
            }
            Err(err) => {
                let mut buffer = self.buffer.lock().await;
                let mut restored = drained;
                restored.append(&mut buffer);
                *buffer = restored;
                Err(err.into())
            }
        }
    }

    /// Monetary cost of a call, from the per-model pricing table. Unknown
    /// models use the default row instead of erroring.
    pub fn calculate_cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let pricing = self
            .config
            .pricing
            .get(model)
            .or_else(|| self.config.pricing.get(UsageConfig::DEFAULT_PRICING_KEY))
            .copied()
            .unwrap_or(ModelPricing {
                prompt_per_million: 0.0,
                completion_per_million: 0.0,
            });

        prompt_tokens as f64 / 1_000_000.0 * pricing.prompt_per_million
            + completion_tokens as f64 / 1_000_000.0 * pricing.completion_per_million
    }

    /// Aggregates for the current UTC day.
    pub async fn today_stats(&self) -> Result<DailyStats, GatewayError> {
        self.flush_logs().await?;
        let day_start = Utc::now()
            .date_naive()
            .and_time(chrono::NaiveTime::MIN)
            .and_utc();
        let entries = self.store.usage_since(day_start).await?;
        Ok(aggregate_day(
            &Utc::now().format("%Y-%m-%d").to_string(),
            &entries,
        ))
    }

    /// Daily breakdown plus totals over the last `days` days.
    pub async fn metrics(&self, days: u32) -> Result<UsageMetrics, GatewayError> {
        self.flush_logs().await?;
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let entries = self.store.usage_since(cutoff).await?;

        let mut by_date: HashMap<String, Vec<&UsageLogEntry>> = HashMap::new();
        for entry in &entries {
            by_date
                .entry(entry.created_at.format("%Y-%m-%d").to_string())
                .or_default()
                .push(entry);
        }

        let mut daily: Vec<DailyStats> = by_date
            .into_iter()
            .map(|(date, group)| {
                let owned: Vec<UsageLogEntry> = group.into_iter().cloned().collect();
                aggregate_day(&date, &owned)
            })
            .collect();
        daily.sort_by(|a, b| a.date.cmp(&b.date));

        let operations = entries.len() as u64;
        let cache_hits = entries.iter().filter(|e| e.cache_hit).count() as u64;
        Ok(UsageMetrics {
            period_days: days,
            operations,
            total_tokens: entries.iter().map(|e| e.total_tokens).sum(),
            total_cost: entries.iter().map(|e| e.cost).sum(),
            cache_hit_rate: if operations > 0 {
                cache_hits as f64 / operations as f64
            } else {
                0.0
            },
            daily,
        })
    }

    /// Flushes synchronously-awaited at process shutdown so buffered entries
    /// are not lost on exit.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.flush_logs().await?;
        Ok(())
    }

    pub async fn buffered_entries(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

fn aggregate_day(date: &str, entries: &[UsageLogEntry]) -> DailyStats {
    let mut stats = DailyStats {
        date: date.to_string(),
        ..Default::default()
    };

    for entry in entries {
        stats.operations += 1;
        stats.prompt_tokens += entry.prompt_tokens;
        stats.completion_tokens += entry.completion_tokens;
        stats.total_tokens += entry.total_tokens;
        stats.total_cost += entry.cost;
        if entry.cache_hit {
            stats.cache_hits += 1;
        }

        let op = stats
            .by_operation
            .entry(entry.operation.as_str().to_string())
            .or_default();
        op.operations += 1;
        op.total_tokens += entry.total_tokens;
        op.total_cost += entry.cost;
    }

    if stats.operations > 0 {
        stats.cache_hit_rate = stats.cache_hits as f64 / stats.operations as f64;
    }
    stats
}
