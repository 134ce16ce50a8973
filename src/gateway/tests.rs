use super::cache::{CacheOptions, CacheOutcome, ResponseCache};
use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::parse;
use super::quota::QuotaManager;
use super::rate_limiter::RateLimiter;
use super::types::*;
use super::usage_tracker::{UsageTracker, canonical_user_id};
use crate::storage::{GatewayStore, MemoryStore};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn transport_err() -> GatewayError {
    GatewayError::Transport("connection refused".to_string())
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_grants_burst_immediately() {
    let limiter = RateLimiter::new(RateLimiterConfig {
        burst_capacity: 3,
        refill_interval: Duration::from_secs(1),
        permits_per_refill: 1,
    });

    let start = tokio::time::Instant::now();
    for _ in 0..3 {
        limiter.acquire().await;
    }
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_makes_excess_callers_wait_for_refill() {
    let limiter = RateLimiter::new(RateLimiterConfig {
        burst_capacity: 2,
        refill_interval: Duration::from_secs(1),
        permits_per_refill: 1,
    });

    limiter.acquire().await;
    limiter.acquire().await;

    let start = tokio::time::Instant::now();
    limiter.acquire().await;
    assert!(start.elapsed() >= Duration::from_millis(999));
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_never_double_grants_a_permit() {
    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        burst_capacity: 3,
        refill_interval: Duration::from_secs(1),
        permits_per_refill: 1,
    }));
    let granted = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let limiter = Arc::clone(&limiter);
        let granted = Arc::clone(&granted);
        handles.push(tokio::spawn(async move {
            limiter.acquire().await;
            granted.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Let every task run up to its suspension point without advancing time:
    // only the burst may have been granted.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(granted.load(Ordering::SeqCst), 3);

    // Advancing past three refill ticks releases the rest, one per tick.
    tokio::time::sleep(Duration::from_secs(4)).await;
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(granted.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_serves_waiters_in_arrival_order() {
    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        burst_capacity: 1,
        refill_interval: Duration::from_secs(1),
        permits_per_refill: 1,
    }));
    limiter.acquire().await;

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..4 {
        let limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            limiter.acquire().await;
            order.lock().unwrap().push(i);
        }));
        // Let the task reach its wait point so arrival order is fixed.
        tokio::task::yield_now().await;
    }

    // One permit per tick: under a sleep-and-race scheme any waiter could
    // win each tick, here the grant order must match arrival order.
    tokio::time::sleep(Duration::from_secs(5)).await;
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn circuit_opens_after_threshold_and_short_circuits() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        cooldown: Duration::from_secs(30),
    });
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let result: Result<(), _> = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transport_err())
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.status().await.state, CircuitState::Open);

    // Short-circuited: the upstream closure must not run.
    let result: Result<(), _> = breaker
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(GatewayError::CircuitOpen)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn circuit_recovers_through_successful_trial() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        cooldown: Duration::from_secs(10),
    });

    let failed: Result<(), _> = breaker.execute(|| async { Err(transport_err()) }).await;
    assert!(failed.is_err());
    assert_eq!(breaker.status().await.state, CircuitState::Open);

    tokio::time::sleep(Duration::from_secs(11)).await;

    breaker.execute(|| async { Ok(()) }).await.unwrap();
    let status = breaker.status().await;
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.consecutive_failures, 0);

    // Subsequent calls are not short-circuited.
    breaker.execute(|| async { Ok(()) }).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn circuit_reopens_when_trial_fails() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        cooldown: Duration::from_secs(10),
    });

    let _: Result<(), _> = breaker.execute(|| async { Err(transport_err()) }).await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    let trial: Result<(), _> = breaker.execute(|| async { Err(transport_err()) }).await;
    assert!(trial.is_err());
    assert_eq!(breaker.status().await.state, CircuitState::Open);

    // Cool-down restarted: still short-circuited right away.
    let result: Result<(), _> = breaker.execute(|| async { Ok(()) }).await;
    assert!(matches!(result, Err(GatewayError::CircuitOpen)));
}

#[tokio::test(start_paused = true)]
async fn half_open_allows_exactly_one_trial() {
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        cooldown: Duration::from_secs(10),
    }));

    let _: Result<(), _> = breaker.execute(|| async { Err(transport_err()) }).await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let trial = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .execute(|| async {
                    let _ = rx.await;
                    Ok(())
                })
                .await
        })
    };

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // While the trial is in flight, other callers stay short-circuited.
    let second: Result<(), _> = breaker.execute(|| async { Ok(()) }).await;
    assert!(matches!(second, Err(GatewayError::CircuitOpen)));

    tx.send(()).unwrap();
    trial.await.unwrap().unwrap();
    assert_eq!(breaker.status().await.state, CircuitState::Closed);
}

#[tokio::test]
async fn cache_calls_produce_at_most_once_per_key() {
    let cache = ResponseCache::new(CacheConfig::default());
    let produced = AtomicUsize::new(0);

    // Same content modulo whitespace: both normalize to one key.
    let first = OperationPayload::article("  Mundial de fútbol  ", "La selección ganó...");
    let second = OperationPayload::article("Mundial de fútbol", "La selección ganó...");

    let miss = cache
        .execute_with_optimization(
            OperationType::Categorize,
            first,
            CacheOptions::default(),
            |_| async {
                produced.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"category": "deportes"}))
            },
        )
        .await
        .unwrap();
    assert_eq!(miss.outcome, CacheOutcome::Miss);

    let hit = cache
        .execute_with_optimization(
            OperationType::Categorize,
            second,
            CacheOptions::default(),
            |_| async {
                produced.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"category": "deportes"}))
            },
        )
        .await
        .unwrap();
    assert_eq!(hit.outcome, CacheOutcome::Hit);
    assert_eq!(hit.value, miss.value);
    assert_eq!(produced.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_keys_separate_operation_types() {
    let cache = ResponseCache::new(CacheConfig::default());
    let produced = AtomicUsize::new(0);
    let payload = OperationPayload::article("Título", "Contenido");

    for operation in [OperationType::Categorize, OperationType::Rewrite] {
        let result = cache
            .execute_with_optimization(operation, payload.clone(), CacheOptions::default(), |_| async {
                produced.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"ok": true}))
            })
            .await
            .unwrap();
        assert_eq!(result.outcome, CacheOutcome::Miss);
    }
    assert_eq!(produced.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cache_entries_expire_after_ttl() {
    let cache = ResponseCache::new(CacheConfig {
        ttl: Duration::from_secs(60),
        ..CacheConfig::default()
    });
    let produced = AtomicUsize::new(0);
    let payload = OperationPayload::query("economía nacional");

    for expected in [CacheOutcome::Miss, CacheOutcome::Hit] {
        let result = cache
            .execute_with_optimization(
                OperationType::Search,
                payload.clone(),
                CacheOptions::default(),
                |_| async {
                    produced.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"answer": "estable"}))
                },
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, expected);
    }

    tokio::time::sleep(Duration::from_secs(61)).await;

    let result = cache
        .execute_with_optimization(
            OperationType::Search,
            payload,
            CacheOptions::default(),
            |_| async {
                produced.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"answer": "estable"}))
            },
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, CacheOutcome::Miss);
    assert_eq!(produced.load(Ordering::SeqCst), 2);
    assert_eq!(cache.cleanup(), 0);
}

#[tokio::test]
async fn cache_fallback_is_returned_but_never_stored() {
    let cache = ResponseCache::new(CacheConfig::default());
    let produced = AtomicUsize::new(0);
    let payload = OperationPayload::article("Título", "Contenido");
    let options = || CacheOptions {
        fallback: Some(json!({"category": "general", "fallback": true})),
        ..CacheOptions::default()
    };

    for _ in 0..2 {
        let result = cache
            .execute_with_optimization(
                OperationType::Categorize,
                payload.clone(),
                options(),
                |_| async {
                    produced.fetch_add(1, Ordering::SeqCst);
                    Err(transport_err())
                },
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, CacheOutcome::Fallback);
        assert_eq!(result.value["fallback"], json!(true));
    }
    // Both calls reached produce: the fallback was not cached.
    assert_eq!(produced.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cache_error_propagates_without_fallback() {
    let cache = ResponseCache::new(CacheConfig::default());
    let result = cache
        .execute_with_optimization(
            OperationType::Search,
            OperationPayload::query("qué pasó hoy"),
            CacheOptions::default(),
            |_| async { Err::<serde_json::Value, _>(transport_err()) },
        )
        .await;
    assert!(matches!(result, Err(GatewayError::Transport(_))));
}

#[test]
fn prompt_optimizer_budgets_by_operation() {
    let cache = ResponseCache::new(CacheConfig {
        max_prompt_length: 20,
        ..CacheConfig::default()
    });

    let plan = cache.optimize_prompt("  un prompt de sistema demasiado largo para el límite  ", OperationType::Categorize);
    assert_eq!(plan.max_tokens, 150);
    assert_eq!(plan.system_prompt.chars().count(), 20);

    let generate = cache.optimize_prompt("corto", OperationType::GenerateText);
    assert_eq!(generate.max_tokens, 800);
    assert_eq!(generate.system_prompt, "corto");
}

#[test]
fn parser_handles_fenced_json_block() {
    let body = "here's your json: ```json\n{\"category\":\"deportes\",\"region\":null,\"confidence\":0.8}\n```";
    let parsed = parse::parse_categorization(body);
    assert_eq!(parsed.category, "deportes");
    assert_eq!(parsed.region, None);
    assert!((parsed.confidence - 0.8).abs() < f64::EPSILON);
    assert!(!parsed.fallback);
}

#[test]
fn parser_handles_direct_and_embedded_json() {
    let direct = parse::parse_categorization(r#"{"category":"economia","region":"norte","confidence":0.9}"#);
    assert_eq!(direct.category, "economia");
    assert_eq!(direct.region.as_deref(), Some("norte"));

    let embedded = parse::parse_categorization(
        "Claro, aquí está el resultado: {\"category\": \"política\", \"confidence\": 0.7} ¡Saludos!",
    );
    assert_eq!(embedded.category, "politica");
}

#[test]
fn parser_recovers_fields_without_braces() {
    let body = "\"category\": \"deportes\", \"confidence\": 0.9";
    let parsed = parse::parse_categorization(body);
    assert_eq!(parsed.category, "deportes");
    assert!((parsed.confidence - 0.9).abs() < f64::EPSILON);
}

#[test]
fn parser_defaults_when_no_json_present() {
    let parsed = parse::parse_categorization("Lo siento, no puedo clasificar este artículo.");
    assert_eq!(parsed.category, "general");
    assert_eq!(parsed.region, None);
    assert!((parsed.confidence - 0.3).abs() < f64::EPSILON);
}

#[test]
fn category_normalization_strips_accents_and_rejects_unknowns() {
    assert_eq!(parse::normalize_category("  Política "), "politica");
    assert_eq!(parse::normalize_category("ECONOMÍA"), "economia");
    assert_eq!(parse::normalize_category("astrología"), "general");
}

#[test]
fn rewrite_parser_keeps_original_title_when_missing() {
    let parsed = parse::parse_rewrite(r#"{"content":"Texto reescrito."}"#, "Título original");
    assert_eq!(parsed.title, "Título original");
    assert_eq!(parsed.content, "Texto reescrito.");

    let plain = parse::parse_rewrite("Texto sin JSON alguno.", "Título original");
    assert_eq!(plain.content, "Texto sin JSON alguno.");
}

#[test]
fn title_summary_parser_splits_plain_text() {
    let parsed = parse::parse_title_summary("Un titular\nY el resto es el resumen.");
    assert_eq!(parsed.title, "Un titular");
    assert_eq!(parsed.summary, "Y el resto es el resumen.");
}

#[test]
fn cost_calculation_uses_pricing_table_and_default_row() {
    let tracker = UsageTracker::new(UsageConfig::default(), Arc::new(MemoryStore::new()));

    // One million prompt tokens costs exactly the model's prompt price.
    let known = tracker.calculate_cost("gpt-4o-mini", 1_000_000, 0);
    assert!((known - 0.15).abs() < 1e-9);

    let unknown = tracker.calculate_cost("model-nobody-heard-of", 1_000_000, 0);
    assert!((unknown - 0.50).abs() < 1e-9);

    let mixed = tracker.calculate_cost("gpt-4o", 1_000_000, 1_000_000);
    assert!((mixed - 12.50).abs() < 1e-9);
}

#[test]
fn user_ids_normalize_to_one_canonical_form() {
    assert_eq!(canonical_user_id("  42 "), "42");
    assert_eq!(
        canonical_user_id("A8098C1A-F86E-11DA-BD1A-00112444BE1E"),
        "a8098c1a-f86e-11da-bd1a-00112444be1e"
    );
}

#[tokio::test]
async fn usage_tracker_buffers_and_flushes() {
    let store = Arc::new(MemoryStore::new());
    let tracker = UsageTracker::new(
        UsageConfig {
            flush_threshold: 100,
            ..UsageConfig::default()
        },
        Arc::clone(&store) as Arc<dyn GatewayStore>,
    );

    let usage = TokenUsage {
        prompt_tokens: 100,
        completion_tokens: 20,
        total_tokens: 120,
    };
    tracker
        .track_usage(Some("User-7"), OperationType::Categorize, usage, "gpt-4o-mini", false)
        .await
        .unwrap();
    tracker
        .track_usage(Some(" user-7 "), OperationType::Search, usage, "gpt-4o-mini", true)
        .await
        .unwrap();
    assert_eq!(tracker.buffered_entries().await, 2);

    let flushed = tracker.flush_logs().await.unwrap();
    assert_eq!(flushed, 2);
    assert_eq!(tracker.buffered_entries().await, 0);

    let entries = store
        .usage_since(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.user_id.as_deref() == Some("user-7")));
}

#[tokio::test]
async fn today_stats_aggregate_by_operation() {
    let store = Arc::new(MemoryStore::new());
    let tracker = UsageTracker::new(UsageConfig::default(), Arc::clone(&store) as Arc<dyn GatewayStore>);
    let usage = TokenUsage {
        prompt_tokens: 50,
        completion_tokens: 10,
        total_tokens: 60,
    };

    tracker
        .track_usage(Some("1"), OperationType::Categorize, usage, "gpt-4o-mini", false)
        .await
        .unwrap();
    tracker
        .track_usage(Some("1"), OperationType::Categorize, TokenUsage::default(), "gpt-4o-mini", true)
        .await
        .unwrap();
    tracker
        .track_usage(Some("2"), OperationType::Rewrite, usage, "gpt-4o-mini", false)
        .await
        .unwrap();

    let stats = tracker.today_stats().await.unwrap();
    assert_eq!(stats.operations, 3);
    assert_eq!(stats.total_tokens, 120);
    assert_eq!(stats.cache_hits, 1);
    assert!((stats.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.by_operation["categorize"].operations, 2);
    assert_eq!(stats.by_operation["rewrite"].operations, 1);
}

#[tokio::test]
async fn quota_deduction_creates_record_lazily() {
    let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
    let quota = QuotaManager::new(QuotaConfig::default(), Arc::clone(&store));

    let balance = quota
        .deduct_interaction("42", OperationType::Categorize, json!({}))
        .await
        .unwrap();
    assert_eq!(balance.consumed_today, 1);
    assert_eq!(balance.available, 249);
    assert_eq!(balance.daily_limit, 250);

    let interactions = store
        .interactions_since(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].user_id, "42");
}

#[tokio::test]
async fn quota_resets_lazily_on_new_day() {
    let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
    store
        .put_quota_record(&QuotaRecord {
            user_id: "42".to_string(),
            daily_limit: 250,
            consumed_today: 187,
            last_reset_at: Utc::now() - chrono::Duration::days(2),
        })
        .await
        .unwrap();

    let quota = QuotaManager::new(QuotaConfig::default(), Arc::clone(&store));
    let balance = quota
        .deduct_interaction("42", OperationType::Search, json!({}))
        .await
        .unwrap();

    // Reset-then-deduct is atomic from the caller's point of view.
    assert_eq!(balance.consumed_today, 1);
    assert_eq!(balance.available, 249);
}

#[tokio::test]
async fn quota_keeps_counting_past_the_limit() {
    let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
    store
        .put_quota_record(&QuotaRecord {
            user_id: "heavy".to_string(),
            daily_limit: 2,
            consumed_today: 2,
            last_reset_at: Utc::now(),
        })
        .await
        .unwrap();

    let quota = QuotaManager::new(QuotaConfig::default(), Arc::clone(&store));
    let balance = quota
        .deduct_interaction("heavy", OperationType::Rewrite, json!({}))
        .await
        .unwrap();

    // Soft quota: the call already happened, the overage is only reported.
    assert_eq!(balance.consumed_today, 3);
    assert_eq!(balance.available, 0);
}

#[tokio::test]
async fn stale_balance_presents_current_day_reset_time() {
    let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
    let stale_reset = Utc::now() - chrono::Duration::days(2);
    store
        .put_quota_record(&QuotaRecord {
            user_id: "42".to_string(),
            daily_limit: 250,
            consumed_today: 187,
            last_reset_at: stale_reset,
        })
        .await
        .unwrap();

    let quota = QuotaManager::new(QuotaConfig::default(), store);
    let balance = quota.balance("42").await.unwrap();
    assert_eq!(balance.consumed_today, 0);
    assert_eq!(balance.available, 250);

    // The virtual reset is reported at the current day boundary, not with
    // the record's two-day-old timestamp.
    let day_start = Utc::now()
        .date_naive()
        .and_time(chrono::NaiveTime::MIN)
        .and_utc();
    assert_eq!(balance.last_reset, Some(day_start));
}

#[tokio::test]
async fn quota_check_reports_exhaustion_without_blocking() {
    let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
    store
        .put_quota_record(&QuotaRecord {
            user_id: "heavy".to_string(),
            daily_limit: 2,
            consumed_today: 2,
            last_reset_at: Utc::now(),
        })
        .await
        .unwrap();

    let quota = QuotaManager::new(QuotaConfig::default(), Arc::clone(&store));
    let err = quota.check_quota("heavy").await.unwrap_err();
    assert!(matches!(err, GatewayError::QuotaExceeded { ref user_id } if user_id == "heavy"));

    // Advisory only: the deduction still lands afterwards.
    let balance = quota
        .deduct_interaction("heavy", OperationType::Search, json!({}))
        .await
        .unwrap();
    assert_eq!(balance.consumed_today, 3);
}

#[tokio::test]
async fn quota_check_passes_while_allowance_remains() {
    let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
    let quota = QuotaManager::new(QuotaConfig::default(), store);

    let balance = quota.check_quota("fresca").await.unwrap();
    assert_eq!(balance.available, 250);
}

#[tokio::test]
async fn quota_balance_defaults_for_unknown_user() {
    let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
    let quota = QuotaManager::new(QuotaConfig::default(), store);

    let balance = quota.balance("nunca-visto").await.unwrap();
    assert_eq!(balance.available, 250);
    assert_eq!(balance.consumed_today, 0);
    assert!(balance.last_reset.is_none());
}

#[tokio::test]
async fn quota_limit_override_sticks() {
    let store: Arc<dyn GatewayStore> = Arc::new(MemoryStore::new());
    let quota = QuotaManager::new(QuotaConfig::default(), store);

    quota.set_daily_limit("premium", 1000).await.unwrap();
    let balance = quota.balance("premium").await.unwrap();
    assert_eq!(balance.daily_limit, 1000);
    assert_eq!(balance.available, 1000);
}
