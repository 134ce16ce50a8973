use crate::gateway::types::{InteractionLogEntry, QuotaRecord, UsageLogEntry};
use crate::storage::{GatewayStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

const USAGE_LOG_FILE: &str = "usage.jsonl";
const INTERACTION_LOG_FILE: &str = "interactions.jsonl";
const QUOTA_FILE: &str = "quotas.json";

/// File-backed store for single-node deployments: JSON-lines logs for usage
/// and interactions, one JSON document for quota records. Quota writes go
/// through a temp file plus rename so a crash never leaves a half-written
/// document.
#[derive(Debug)]
pub struct JsonFileStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;
        Ok(Self {
            data_dir,
            write_lock: Mutex::new(()),
        })
    }

    async fn append_lines<T: serde::Serialize>(
        &self,
        file_name: &str,
        items: &[T],
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut buf = Vec::new();
        for item in items {
            buf.extend(serde_json::to_vec(item)?);
            buf.push(b'\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(file_name))
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: serde::de::DeserializeOwned>(
        &self,
        file_name: &str,
    ) -> Result<Vec<T>, StoreError> {
        let path = self.data_dir.join(file_name);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut items = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(item) => items.push(item),
                // A torn tail line from a crash is skipped, not fatal.
                Err(err) => warn!(file = file_name, error = %err, "skipping unreadable log line"),
            }
        }
        Ok(items)
    }

    async fn read_quotas(&self) -> Result<HashMap<String, QuotaRecord>, StoreError> {
        let path = self.data_dir.join(QUOTA_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl GatewayStore for JsonFileStore {
    async fn append_usage(&self, entries: &[UsageLogEntry]) -> Result<(), StoreError> {
        self.append_lines(USAGE_LOG_FILE, entries).await
    }

    async fn usage_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<UsageLogEntry>, StoreError> {
        let entries: Vec<UsageLogEntry> = self.read_lines(USAGE_LOG_FILE).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.created_at >= cutoff)
            .collect())
    }

    async fn quota_record(&self, user_id: &str) -> Result<Option<QuotaRecord>, StoreError> {
        Ok(self.read_quotas().await?.remove(user_id))
    }

    async fn put_quota_record(&self, record: &QuotaRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut quotas = self.read_quotas().await?;
        quotas.insert(record.user_id.clone(), record.clone());

        let path = self.data_dir.join(QUOTA_FILE);
        let tmp_path = self.data_dir.join(format!("{QUOTA_FILE}.tmp"));
        let serialized = serde_json::to_vec_pretty(&quotas)?;
        tokio::fs::write(&tmp_path, &serialized).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn append_interaction(&self, entry: &InteractionLogEntry) -> Result<(), StoreError> {
        self.append_lines(INTERACTION_LOG_FILE, std::slice::from_ref(entry))
            .await
    }

    async fn interactions_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<InteractionLogEntry>, StoreError> {
        let entries: Vec<InteractionLogEntry> = self.read_lines(INTERACTION_LOG_FILE).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.created_at >= cutoff)
            .collect())
    }
}
