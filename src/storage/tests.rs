use super::{GatewayStore, JsonFileStore, MemoryStore};
use crate::gateway::types::{InteractionLogEntry, OperationType, QuotaRecord, UsageLogEntry};
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

fn usage_entry(user: &str, hours_ago: i64) -> UsageLogEntry {
    UsageLogEntry {
        id: Uuid::new_v4(),
        user_id: Some(user.to_string()),
        operation: OperationType::Categorize,
        prompt_tokens: 100,
        completion_tokens: 20,
        total_tokens: 120,
        model: "gpt-4o-mini".to_string(),
        cost: 0.000027,
        cache_hit: false,
        created_at: Utc::now() - Duration::hours(hours_ago),
    }
}

fn interaction_entry(user: &str) -> InteractionLogEntry {
    InteractionLogEntry {
        id: Uuid::new_v4(),
        user_id: user.to_string(),
        operation: OperationType::Search,
        metadata: json!({ "cache_hit": false }),
        created_at: Utc::now(),
    }
}

fn quota_record(user: &str, consumed: u32) -> QuotaRecord {
    QuotaRecord {
        user_id: user.to_string(),
        daily_limit: 250,
        consumed_today: consumed,
        last_reset_at: Utc::now(),
    }
}

#[tokio::test]
async fn memory_store_filters_usage_by_cutoff() {
    let store = MemoryStore::new();
    store
        .append_usage(&[usage_entry("1", 0), usage_entry("1", 48)])
        .await
        .unwrap();

    let recent = store.usage_since(Utc::now() - Duration::hours(1)).await.unwrap();
    assert_eq!(recent.len(), 1);

    let all = store.usage_since(Utc::now() - Duration::days(7)).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn memory_store_quota_round_trip() {
    let store = MemoryStore::new();
    assert!(store.quota_record("42").await.unwrap().is_none());

    store.put_quota_record(&quota_record("42", 7)).await.unwrap();
    let record = store.quota_record("42").await.unwrap().unwrap();
    assert_eq!(record.consumed_today, 7);

    // Writing again replaces the record, not duplicates it.
    store.put_quota_record(&quota_record("42", 8)).await.unwrap();
    let record = store.quota_record("42").await.unwrap().unwrap();
    assert_eq!(record.consumed_today, 8);
}

#[tokio::test]
async fn json_file_store_persists_usage_across_instances() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = JsonFileStore::new(dir.path()).await.unwrap();
        store
            .append_usage(&[usage_entry("1", 0), usage_entry("2", 0)])
            .await
            .unwrap();
    }

    // A fresh instance over the same directory sees the entries.
    let store = JsonFileStore::new(dir.path()).await.unwrap();
    let entries = store.usage_since(Utc::now() - Duration::hours(1)).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].total_tokens, 120);
}

#[tokio::test]
async fn json_file_store_quota_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path()).await.unwrap();

    assert!(store.quota_record("42").await.unwrap().is_none());
    store.put_quota_record(&quota_record("42", 3)).await.unwrap();
    store.put_quota_record(&quota_record("99", 1)).await.unwrap();

    let record = store.quota_record("42").await.unwrap().unwrap();
    assert_eq!(record.consumed_today, 3);
    assert_eq!(record.daily_limit, 250);

    // No stray temp file is left behind by the write-then-rename.
    assert!(!dir.path().join("quotas.json.tmp").exists());
}

#[tokio::test]
async fn json_file_store_appends_interactions() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path()).await.unwrap();

    store.append_interaction(&interaction_entry("42")).await.unwrap();
    store.append_interaction(&interaction_entry("42")).await.unwrap();

    let entries = store
        .interactions_since(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].user_id, "42");
}

#[tokio::test]
async fn json_file_store_skips_torn_log_lines() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path()).await.unwrap();
    store.append_usage(&[usage_entry("1", 0)]).await.unwrap();

    // Simulate a crash mid-append: a truncated JSON line at the tail.
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(dir.path().join("usage.jsonl"))
        .unwrap();
    writeln!(file, "{{\"id\":\"not a complete ent").unwrap();

    let entries = store.usage_since(Utc::now() - Duration::hours(1)).await.unwrap();
    assert_eq!(entries.len(), 1);

    // Appending afterwards still works and both good lines survive.
    store.append_usage(&[usage_entry("2", 0)]).await.unwrap();
    let entries = store.usage_since(Utc::now() - Duration::hours(1)).await.unwrap();
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn json_file_store_reads_empty_when_files_missing() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path()).await.unwrap();

    assert!(store.usage_since(Utc::now()).await.unwrap().is_empty());
    assert!(store.interactions_since(Utc::now()).await.unwrap().is_empty());
    assert!(store.quota_record("nadie").await.unwrap().is_none());
}
