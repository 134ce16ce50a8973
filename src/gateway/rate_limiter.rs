//! Process-wide token bucket bounding the outbound call rate.
//!
//! Every caller in the process shares one bucket per upstream target, so the
//! aggregate request rate stays under the provider's limit no matter how many
//! logical operations are in flight. `acquire` suspends the caller until a
//! permit is available. Permits are granted strictly in arrival order: each
//! caller passes through a fair turnstile mutex and holds it while waiting
//! for the next refill tick, so a late arrival can never take the permit an
//! earlier waiter is sleeping on.

use crate::gateway::types::RateLimiterConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    /// FIFO turnstile. `tokio::sync::Mutex` queues contenders in lock order,
    /// and the head waiter keeps holding it across its refill sleep.
    turnstile: Mutex<()>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    available: u32,
    last_refill: Instant,
}

/// Proof that a permit was consumed. The id ties debug log lines to one
/// specific grant.
#[derive(Debug, Clone)]
pub struct RatePermit {
    pub granted_at: DateTime<Utc>,
    pub permit_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStatus {
    pub available_permits: u32,
    pub burst_capacity: u32,
    pub refill_interval: Duration,
    pub permits_per_refill: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let state = BucketState {
            available: config.burst_capacity,
            last_refill: Instant::now(),
        };
        Self {
            config,
            turnstile: Mutex::new(()),
            state: Mutex::new(state),
        }
    }

    /// Waits until a permit is available and consumes it. Never fails; the
    /// only way out without a permit is task cancellation. Callers are served
    /// in arrival order.
    pub async fn acquire(&self) -> RatePermit {
        let _turn = self.turnstile.lock().await;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.available > 0 {
                    state.available -= 1;
                    return RatePermit {
                        granted_at: Utc::now(),
                        permit_id: Uuid::new_v4(),
                    };
                }
                // Empty bucket: sleep until the tick that refills it, still
                // holding the turnstile.
                self.config
                    .refill_interval
                    .saturating_sub(state.last_refill.elapsed())
            };

            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let interval = self.config.refill_interval;
        if interval.is_zero() {
            state.available = self.config.burst_capacity;
            return;
        }

        let elapsed = state.last_refill.elapsed();
        let ticks = (elapsed.as_nanos() / interval.as_nanos()) as u32;
        if ticks == 0 {
            return;
        }

        let refilled = ticks.saturating_mul(self.config.permits_per_refill);
        state.available = state
            .available
            .saturating_add(refilled)
            .min(self.config.burst_capacity);
        state.last_refill += interval * ticks;
    }

    pub async fn status(&self) -> RateLimiterStatus {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        RateLimiterStatus {
            available_permits: state.available,
            burst_capacity: self.config.burst_capacity,
            refill_interval: self.config.refill_interval,
            permits_per_refill: self.config.permits_per_refill,
        }
    }
}
