//! Circuit breaker guarding the upstream chat-completions API.
//!
//! One breaker instance is shared by every caller in the process. Repeated
//! failures open the circuit; while open, calls fail fast with
//! [`GatewayError::CircuitOpen`] without touching the upstream. After the
//! cool-down a single trial call is let through: success closes the circuit,
//! failure re-opens it and restarts the cool-down.

use crate::gateway::types::{CircuitBreakerConfig, GatewayError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            })),
        }
    }

    /// Runs `call` under the breaker. Returns the call's result, counting
    /// failures; while open, returns [`GatewayError::CircuitOpen`] without
    /// invoking `call`.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.before_call().await?;

        match call().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(err)
            }
        }
    }

    async fn before_call(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    info!("circuit breaker cool-down elapsed, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(GatewayError::CircuitOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            info!("circuit breaker closed after successful trial call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.trial_in_flight = false;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                warn!("trial call failed, re-opening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    pub async fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock().await;
        CircuitBreakerStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}
