//! Persistence seam for usage logs, interaction logs and quota records.
//!
//! The gateway only needs create/read/update semantics keyed by user id plus
//! an "entries since" query for aggregation, so the store is a small trait
//! with two backends: an in-memory store for tests and ephemeral runs, and a
//! JSON-file store for single-node deployments.

pub mod json_file;
pub mod memory;

#[cfg(test)]
pub mod tests;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use crate::gateway::types::{InteractionLogEntry, QuotaRecord, UsageLogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Durable storage used by the usage tracker and the quota manager.
#[async_trait]
pub trait GatewayStore: Send + Sync + std::fmt::Debug {
    /// Appends a batch of usage log entries. Entries are append-only and
    /// never mutated after creation.
    async fn append_usage(&self, entries: &[UsageLogEntry]) -> Result<(), StoreError>;

    /// All usage entries created at or after `cutoff`.
    async fn usage_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<UsageLogEntry>, StoreError>;

    async fn quota_record(&self, user_id: &str) -> Result<Option<QuotaRecord>, StoreError>;

    async fn put_quota_record(&self, record: &QuotaRecord) -> Result<(), StoreError>;

    async fn append_interaction(&self, entry: &InteractionLogEntry) -> Result<(), StoreError>;

    /// All interaction entries created at or after `cutoff`.
    async fn interactions_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<InteractionLogEntry>, StoreError>;
}
