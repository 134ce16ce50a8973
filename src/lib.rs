//! # Prensa AI Usage Gateway
//!
//! The layer that mediates every call from the prensa news platform to the
//! external LLM API. It coordinates concurrent callers against one shared,
//! metered, unreliable upstream while enforcing fairness and cost ceilings:
//!
//! - **[`gateway::RateLimiter`]**: process-wide token bucket bounding the
//!   outbound request rate.
//! - **[`gateway::CircuitBreaker`]**: opens after repeated upstream failures
//!   and short-circuits callers while open.
//! - **[`gateway::ResponseCache`]**: content-addressed response cache plus
//!   per-operation prompt/budget optimization.
//! - **[`gateway::UsageTracker`]**: per-model token and cost accounting with
//!   daily aggregation for the metrics dashboards.
//! - **[`gateway::QuotaManager`]**: per-user daily interaction ledger with
//!   lazy midnight reset.
//! - **[`gateway::AIGateway`]**: the façade composing all of the above
//!   around a single chat-completions HTTP call, with bounded retry,
//!   layered JSON extraction and graceful degradation.
//!
//! HTTP route handlers, scraping and persistence schemas live elsewhere;
//! this crate only needs a payload, an optional user id and a
//! [`storage::GatewayStore`] to write usage and quota state into.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use prensa_gateway::gateway::{AIGateway, GatewayConfig, HttpUpstream};
//! use prensa_gateway::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::default();
//!     let upstream = Arc::new(HttpUpstream::new(config.upstream.clone())?);
//!     let gateway = AIGateway::new(config, upstream, Arc::new(MemoryStore::new()));
//!
//!     let result = gateway
//!         .categorize("Título", "Contenido del artículo...", "https://example.com", Some("42"))
//!         .await?;
//!     println!("categoría: {} ({:.2})", result.category, result.confidence);
//!
//!     gateway.shutdown().await?;
//!     Ok(())
//! }
//! ```

/// Gateway components: rate limiter, circuit breaker, response cache, usage
/// tracker, quota manager and the `AIGateway` façade.
pub mod gateway;

/// Persistence seam for usage logs, interaction logs and quota records.
pub mod storage;

/// Command-line interface: argument parsing and configuration discovery.
pub mod cli;

pub use gateway::{AIGateway, GatewayConfig, GatewayError, OperationType};
pub use storage::{GatewayStore, JsonFileStore, MemoryStore};
