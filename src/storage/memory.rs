use crate::gateway::types::{InteractionLogEntry, QuotaRecord, UsageLogEntry};
use crate::storage::{GatewayStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

/// In-memory store backing tests and `--ephemeral` CLI runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    usage: Mutex<Vec<UsageLogEntry>>,
    interactions: Mutex<Vec<InteractionLogEntry>>,
    quotas: DashMap<String, QuotaRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn append_usage(&self, entries: &[UsageLogEntry]) -> Result<(), StoreError> {
        self.usage.lock().await.extend_from_slice(entries);
        Ok(())
    }

    async fn usage_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<UsageLogEntry>, StoreError> {
        Ok(self
            .usage
            .lock()
            .await
            .iter()
            .filter(|entry| entry.created_at >= cutoff)
            .cloned()
            .collect())
    }

    async fn quota_record(&self, user_id: &str) -> Result<Option<QuotaRecord>, StoreError> {
        Ok(self.quotas.get(user_id).map(|record| record.clone()))
    }

    async fn put_quota_record(&self, record: &QuotaRecord) -> Result<(), StoreError> {
        self.quotas.insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn append_interaction(&self, entry: &InteractionLogEntry) -> Result<(), StoreError> {
        self.interactions.lock().await.push(entry.clone());
        Ok(())
    }

    async fn interactions_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<InteractionLogEntry>, StoreError> {
        Ok(self
            .interactions
            .lock()
            .await
            .iter()
            .filter(|entry| entry.created_at >= cutoff)
            .cloned()
            .collect())
    }
}
