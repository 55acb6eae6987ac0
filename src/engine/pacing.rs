//! Minimum-gap pacing toward the recognition service.
//!
//! Every caller atomically reserves the next free slot on the clock for its
//! scope and then sleeps until that slot. Reservations are handed out in
//! arrival order, so calls are never dropped or reordered.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const GLOBAL_SCOPE: &str = "*";

/// Which calls share one clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// One budget pooled across every credential.
    Global,
    /// Each credential has its own budget.
    PerCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub min_gap: Duration,
    pub scope: RateLimitScope,
}

impl PacingPolicy {
    pub fn fixed_gap(min_gap: Duration, scope: RateLimitScope) -> Self {
        Self { min_gap, scope }
    }

    /// `max_requests` calls per rolling `period`, spread evenly.
    pub fn per_window(max_requests: u32, period: Duration, scope: RateLimitScope) -> Self {
        Self {
            min_gap: period / max_requests.max(1),
            scope,
        }
    }

    pub fn unpaced() -> Self {
        Self::fixed_gap(Duration::ZERO, RateLimitScope::Global)
    }
}

pub struct Pacer {
    policy: PacingPolicy,
    next_free: Mutex<HashMap<String, Instant>>,
}

impl Pacer {
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            policy,
            next_free: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a call for `credential_id` may be issued. Returns how long
    /// the caller waited.
    pub async fn reserve_slot(&self, credential_id: &str) -> Duration {
        if self.policy.min_gap.is_zero() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let slot = self.claim(credential_id, now);
        if slot > now {
            tracing::debug!(
                credential = credential_id,
                wait_ms = (slot - now).as_millis() as u64,
                "Pacing recognition call"
            );
            tokio::time::sleep_until(slot).await;
        }
        slot.saturating_duration_since(now)
    }

    fn claim(&self, credential_id: &str, now: Instant) -> Instant {
        let key = match self.policy.scope {
            RateLimitScope::Global => GLOBAL_SCOPE,
            RateLimitScope::PerCredential => credential_id,
        };

        let mut next_free = self
            .next_free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = match next_free.get(key) {
            Some(free) if *free > now => *free,
            _ => now,
        };
        next_free.insert(key.to_string(), slot + self.policy.min_gap);
        slot
    }
}
