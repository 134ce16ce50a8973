pub mod types;
pub mod rate_limiter;
pub mod circuit_breaker;
pub mod cache;
pub mod usage_tracker;
pub mod quota;
pub mod upstream;
pub mod parse;
pub mod facade;

#[cfg(test)]
pub mod tests;

pub use types::*;
pub use cache::{CacheOptions, CacheOutcome, CacheStats, ResponseCache};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use facade::{AIGateway, GatewayStatus};
pub use quota::QuotaManager;
pub use rate_limiter::RateLimiter;
pub use upstream::{ChatMessage, ChatRequest, ChatResponse, HttpUpstream, UpstreamClient};
pub use usage_tracker::{DailyStats, UsageMetrics, UsageTracker};
