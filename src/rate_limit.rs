//! Token-bucket rate limiting
//!
//! Buckets are keyed `(agent, channel, tier)` and live in shared concurrent
//! maps; there is no serialization through a single task. Token counts are
//! stored scaled ×1000 so refill arithmetic stays in integers; one request
//! costs 1000 scaled units. The refill/deduct core is a pure function over
//! `(bucket, now_ms)` so it can be tested without sleeping.

use crate::domain_types::AgentId;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Scaled cost of one request.
const COST_SCALED: u64 = 1000;

/// Remaining fraction of capacity below which an allow becomes a warn.
const WARN_FRACTION: u64 = 5; // 1/5 = 20 %

/// Violations further apart than this reset the consecutive count.
const QUIET_WINDOW_MS: u64 = 60_000;

/// Progressive back-off: 1 s, 2 s, 5 s, 10 s, then 30 s forever.
const BACKOFF_MS: [u64; 5] = [1_000, 2_000, 5_000, 10_000, 30_000];

/// Which transport the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitChannel {
    Ws,
    Http,
}

/// Cost class of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitTier {
    Light,
    Normal,
    Heavy,
}

/// Capacity and refill rate for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimit {
    /// Bucket capacity in whole tokens.
    pub capacity: u32,
    /// Refill rate in tokens per second.
    pub refill_per_sec: f64,
}

impl TierLimit {
    fn capacity_scaled(self) -> u64 {
        u64::from(self.capacity) * COST_SCALED
    }

    /// Scaled units per millisecond. One token/second is exactly one scaled
    /// unit per millisecond, so the rate passes through numerically.
    fn rate_scaled_per_ms(self) -> f64 {
        self.refill_per_sec
    }
}

/// Per-agent limits across the three tiers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    pub light: TierLimit,
    pub normal: TierLimit,
    pub heavy: TierLimit,
}

impl RateLimits {
    fn tier(&self, tier: LimitTier) -> TierLimit {
        match tier {
            LimitTier::Light => self.light,
            LimitTier::Normal => self.normal,
            LimitTier::Heavy => self.heavy,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            light: TierLimit {
                capacity: 60,
                refill_per_sec: 1.0,
            },
            normal: TierLimit {
                capacity: 30,
                refill_per_sec: 0.5,
            },
            heavy: TierLimit {
                capacity: 10,
                refill_per_sec: 0.1,
            },
        }
    }
}

/// Outcome of a limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitDecision {
    Allow { remaining: f64 },
    Warn { remaining: f64 },
    Deny { retry_after_ms: u64 },
    /// Whitelisted agent; never limited.
    Exempt,
}

impl LimitDecision {
    /// True unless the request must be rejected.
    #[must_use]
    pub fn allowed(&self) -> bool {
        !matches!(self, Self::Deny { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens_scaled: u64,
    last_refill_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Violation {
    consecutive: u32,
    last_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey(AgentId, LimitChannel, LimitTier);

enum RawVerdict {
    Allowed { remaining_scaled: u64 },
    Denied { retry_after_ms: u64 },
}

/// Refills and, when possible, deducts one request from the bucket. Pure:
/// all time flows in through `now_ms`.
fn check_bucket(bucket: &mut Bucket, now_ms: u64, limit: TierLimit) -> RawVerdict {
    let cap = limit.capacity_scaled();
    let rate = limit.rate_scaled_per_ms();
    let elapsed = now_ms.saturating_sub(bucket.last_refill_ms);
    let refill = (elapsed as f64 * rate) as u64;
    let refilled = cap.min(bucket.tokens_scaled.saturating_add(refill));
    bucket.last_refill_ms = now_ms;
    if refilled >= COST_SCALED {
        bucket.tokens_scaled = refilled - COST_SCALED;
        RawVerdict::Allowed {
            remaining_scaled: bucket.tokens_scaled,
        }
    } else {
        bucket.tokens_scaled = refilled;
        let deficit = (COST_SCALED - refilled) as f64;
        let retry_ms = if rate > 0.0 {
            (deficit / rate).ceil() as u64
        } else {
            u64::MAX / 2
        };
        // Round up to the next whole second.
        RawVerdict::Denied {
            retry_after_ms: retry_ms.div_ceil(1000) * 1000,
        }
    }
}

fn allow_or_warn(remaining_scaled: u64, limit: TierLimit) -> LimitDecision {
    let remaining = remaining_scaled as f64 / COST_SCALED as f64;
    if remaining_scaled < limit.capacity_scaled() / WARN_FRACTION {
        LimitDecision::Warn { remaining }
    } else {
        LimitDecision::Allow { remaining }
    }
}

/// Shared rate limiter guarding both the WebSocket and HTTP channels.
pub struct RateLimiter {
    epoch: Instant,
    defaults: RateLimits,
    whitelist: DashSet<AgentId>,
    overrides: DashMap<AgentId, RateLimits>,
    buckets: DashMap<BucketKey, Bucket>,
    violations: DashMap<AgentId, Violation>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(defaults: RateLimits) -> Self {
        Self {
            epoch: Instant::now(),
            defaults,
            whitelist: DashSet::new(),
            overrides: DashMap::new(),
            buckets: DashMap::new(),
            violations: DashMap::new(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn limits_for(&self, agent: &AgentId) -> RateLimits {
        self.overrides
            .get(agent)
            .map(|r| *r.value())
            .unwrap_or(self.defaults)
    }

    /// Checks and consumes one request from the agent's bucket.
    pub fn check(&self, agent: &AgentId, channel: LimitChannel, tier: LimitTier) -> LimitDecision {
        if self.whitelist.contains(agent) {
            debug!(target: "telemetry", agent_id = %agent, "rate limit exempt");
            return LimitDecision::Exempt;
        }
        let limit = self.limits_for(agent).tier(tier);
        let now = self.now_ms();
        self.check_at(agent, channel, tier, limit, now)
    }

    fn check_at(
        &self,
        agent: &AgentId,
        channel: LimitChannel,
        tier: LimitTier,
        limit: TierLimit,
        now_ms: u64,
    ) -> LimitDecision {
        let key = BucketKey(agent.clone(), channel, tier);
        match self.buckets.entry(key) {
            Entry::Vacant(slot) => {
                let tokens = limit.capacity_scaled().saturating_sub(COST_SCALED);
                slot.insert(Bucket {
                    tokens_scaled: tokens,
                    last_refill_ms: now_ms,
                });
                allow_or_warn(tokens, limit)
            }
            Entry::Occupied(mut slot) => match check_bucket(slot.get_mut(), now_ms, limit)
            {
                RawVerdict::Allowed { remaining_scaled } => allow_or_warn(remaining_scaled, limit),
                RawVerdict::Denied { retry_after_ms } => LimitDecision::Deny { retry_after_ms },
            },
        }
    }

    /// Records a denied request, returning the back-off the client should
    /// wait. Consecutive violations within the quiet window escalate along
    /// the curve; after a quiet minute the count starts over.
    pub fn record_violation(&self, agent: &AgentId) -> u64 {
        let now = self.now_ms();
        let mut entry = self.violations.entry(agent.clone()).or_insert(Violation {
            consecutive: 0,
            last_ms: now,
        });
        if entry.consecutive > 0 && now.saturating_sub(entry.last_ms) > QUIET_WINDOW_MS {
            entry.consecutive = 0;
        }
        entry.consecutive += 1;
        entry.last_ms = now;
        let idx = (entry.consecutive as usize).min(BACKOFF_MS.len()) - 1;
        BACKOFF_MS[idx]
    }

    /// True while the agent has an active violation streak inside the quiet
    /// window.
    pub fn is_rate_limited(&self, agent: &AgentId) -> bool {
        let now = self.now_ms();
        self.violations
            .get(agent)
            .is_some_and(|v| v.consecutive > 0 && now.saturating_sub(v.last_ms) <= QUIET_WINDOW_MS)
    }

    /// Exempts (or re-subjects) an agent from limiting.
    pub fn set_whitelisted(&self, agent: AgentId, exempt: bool) {
        if exempt {
            self.whitelist.insert(agent);
        } else {
            self.whitelist.remove(&agent);
        }
    }

    /// Installs per-agent limits. Existing buckets for the agent are dropped
    /// so the next check reinitializes from the new limits.
    pub fn set_override(&self, agent: AgentId, limits: RateLimits) {
        self.overrides.insert(agent.clone(), limits);
        self.invalidate(&agent);
    }

    /// Removes per-agent limits, falling back to the defaults.
    pub fn clear_override(&self, agent: &AgentId) {
        self.overrides.remove(agent);
        self.invalidate(agent);
    }

    fn invalidate(&self, agent: &AgentId) {
        self.buckets.retain(|key, _| &key.0 != agent);
    }
}
