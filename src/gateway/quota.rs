//! Per-user daily interaction ledger.
//!
//! One unit is deducted per completed logical operation. Records are created
//! lazily on first deduction and reset lazily: whenever a record's
//! `last_reset_at` precedes the start of the current day (local midnight in
//! the configured UTC offset), the counter is zeroed inline before the
//! deduction. No background cron is needed for correctness.
//!
//! The quota is soft by design: deduction happens after the upstream call
//! already completed, so a burst of concurrent requests can drive
//! `consumed_today` past the limit. Overage is reported, never blocked.

use crate::gateway::types::{
    GatewayError, InteractionLogEntry, OperationType, QuotaBalance, QuotaConfig, QuotaRecord,
};
use crate::gateway::usage_tracker::canonical_user_id;
use crate::storage::GatewayStore;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug)]
pub struct QuotaManager {
    config: QuotaConfig,
    store: Arc<dyn GatewayStore>,
}

impl QuotaManager {
    pub fn new(config: QuotaConfig, store: Arc<dyn GatewayStore>) -> Self {
        Self { config, store }
    }

    /// Consumes one interaction for `user_id` and appends an audit entry.
    /// The reset-then-deduct sequence is atomic from the caller's point of
    /// view. Returns the updated balance.
    pub async fn deduct_interaction(
        &self,
        user_id: &str,
        operation: OperationType,
        metadata: serde_json::Value,
    ) -> Result<QuotaBalance, GatewayError> {
        let user_id = canonical_user_id(user_id);
        let now = Utc::now();

        let mut record = self
            .store
            .quota_record(&user_id)
            .await?
            .unwrap_or_else(|| QuotaRecord {
                user_id: user_id.clone(),
                daily_limit: self.config.default_daily_limit,
                consumed_today: 0,
                last_reset_at: now,
            });

        if record.last_reset_at < self.day_start(now) {
            record.consumed_today = 0;
            record.last_reset_at = now;
        }

        // The upstream call already happened, so the deduction always lands
        // even when the allowance is exhausted.
        record.consumed_today += 1;
        if record.consumed_today > record.daily_limit {
            warn!(
                user = %user_id,
                consumed = record.consumed_today,
                limit = record.daily_limit,
                "daily quota exceeded"
            );
        }

        self.store.put_quota_record(&record).await?;
        self.store
            .append_interaction(&InteractionLogEntry {
                id: Uuid::new_v4(),
                user_id: user_id.clone(),
                operation,
                metadata,
                created_at: now,
            })
            .await?;

        Ok(QuotaBalance {
            available: record.available_today(),
            consumed_today: record.consumed_today,
            daily_limit: record.daily_limit,
            last_reset: Some(record.last_reset_at),
        })
    }

    /// Read-path balance. Users without a record get the full default
    /// allowance; stale records are presented as reset without persisting.
    pub async fn balance(&self, user_id: &str) -> Result<QuotaBalance, GatewayError> {
        let user_id = canonical_user_id(user_id);
        let now = Utc::now();

        match self.store.quota_record(&user_id).await? {
            Some(record) if record.last_reset_at >= self.day_start(now) => Ok(QuotaBalance {
                available: record.available_today(),
                consumed_today: record.consumed_today,
                daily_limit: record.daily_limit,
                last_reset: Some(record.last_reset_at),
            }),
            // Stale record: present it as already reset, with the current
            // day boundary as the reset time.
            Some(record) => Ok(QuotaBalance {
                available: record.daily_limit,
                consumed_today: 0,
                daily_limit: record.daily_limit,
                last_reset: Some(self.day_start(now)),
            }),
            None => Ok(QuotaBalance {
                available: self.config.default_daily_limit,
                consumed_today: 0,
                daily_limit: self.config.default_daily_limit,
                last_reset: None,
            }),
        }
    }

    /// Advisory pre-flight check for surfaces that want to warn before
    /// spending an upstream call. Returns [`GatewayError::QuotaExceeded`]
    /// when the allowance is spent; operations themselves are never blocked
    /// by it.
    pub async fn check_quota(&self, user_id: &str) -> Result<QuotaBalance, GatewayError> {
        let balance = self.balance(user_id).await?;
        if balance.available == 0 {
            return Err(GatewayError::QuotaExceeded {
                user_id: canonical_user_id(user_id),
            });
        }
        Ok(balance)
    }

    /// Per-user override of the daily allowance.
    pub async fn set_daily_limit(&self, user_id: &str, limit: u32) -> Result<(), GatewayError> {
        let user_id = canonical_user_id(user_id);
        let now = Utc::now();

        let mut record = self
            .store
            .quota_record(&user_id)
            .await?
            .unwrap_or_else(|| QuotaRecord {
                user_id: user_id.clone(),
                daily_limit: limit,
                consumed_today: 0,
                last_reset_at: now,
            });
        record.daily_limit = limit;
        self.store.put_quota_record(&record).await?;
        Ok(())
    }

    /// Start of the current day in the operating timezone, expressed in UTC.
    fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let utc_midnight = now.date_naive().and_time(chrono::NaiveTime::MIN).and_utc();
        match FixedOffset::east_opt(self.config.utc_offset_minutes * 60) {
            Some(offset) => now
                .with_timezone(&offset)
                .date_naive()
                .and_time(chrono::NaiveTime::MIN)
                .and_local_timezone(offset)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(utc_midnight),
            // Misconfigured offsets fall back to UTC midnight.
            None => utc_midnight,
        }
    }
}
