//! Task routing decision engine
//!
//! Resolves a task's complexity tier to an execution target: the local
//! sidecar for trivial work, the least-loaded healthy inference endpoint for
//! standard work, or the premium external model for complex work. When no
//! healthy endpoint exists for the standard tier the engine reports a
//! fallback instead of a target; the scheduler decides what to do with it.

use crate::domain_types::{Tier, now_ms};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Reported health of an inference endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Healthy,
    Degraded,
    Unreachable,
}

/// Host load metrics reported alongside an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    /// CPU utilization percentage, 0..100.
    #[serde(default)]
    pub cpu_pct: f64,
    /// Memory utilization percentage, 0..100.
    #[serde(default)]
    pub mem_pct: f64,
    /// Free GPU memory in MiB.
    #[serde(default)]
    pub gpu_mem_free_mb: u64,
    /// Requests currently queued at the endpoint.
    #[serde(default)]
    pub queue_depth: u32,
}

/// An external inference endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub status: EndpointStatus,
    pub models: Vec<String>,
    #[serde(default)]
    pub metrics: HostMetrics,
    pub last_reported_at: u64,
}

impl Endpoint {
    fn is_candidate(&self) -> bool {
        self.status == EndpointStatus::Healthy && !self.models.is_empty()
    }

    /// Load score; lower is better. Queue depth dominates, free GPU memory
    /// earns a discount.
    fn load_score(&self) -> f64 {
        self.metrics.cpu_pct + self.metrics.mem_pct + f64::from(self.metrics.queue_depth) * 10.0
            - self.metrics.gpu_mem_free_mb as f64 / 1024.0
    }
}

/// What kind of executor a decision targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Local sidecar process; free.
    Sidecar,
    /// A nearby inference endpoint.
    Endpoint,
    /// The premium external model.
    PremiumModel,
}

/// Rough cost class of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Free,
    Local,
    Api,
}

/// Full routing decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub effective_tier: Tier,
    pub target_kind: TargetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_from_tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub candidate_count: usize,
    pub classification_reason: String,
    pub estimated_cost_tier: CostTier,
    pub decided_at: u64,
}

/// Reason slug used when the standard tier has nowhere to go.
pub const NO_HEALTHY_ENDPOINTS: &str = "no_healthy_ollama_endpoints";

/// Tier resolution outcome.
#[derive(Debug, Clone)]
pub enum Decision {
    Route(RouteDecision),
    /// No target for this tier; the scheduler may retry another tier.
    Fallback { tier: Tier, reason: &'static str },
}

/// A tier with the `unknown` case already defaulted away, so the routing
/// match below covers exactly the reachable targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedTier {
    Trivial,
    Standard,
    Complex,
}

impl ResolvedTier {
    fn as_tier(self) -> Tier {
        match self {
            Self::Trivial => Tier::Trivial,
            Self::Standard => Tier::Standard,
            Self::Complex => Tier::Complex,
        }
    }
}

fn resolve_tier(tier: Tier) -> (ResolvedTier, String) {
    match tier {
        Tier::Trivial => (ResolvedTier::Trivial, "classified trivial".to_string()),
        Tier::Standard => (ResolvedTier::Standard, "classified standard".to_string()),
        Tier::Complex => (ResolvedTier::Complex, "classified complex".to_string()),
        Tier::Unknown => (
            ResolvedTier::Standard,
            "unknown complexity defaulted to standard".to_string(),
        ),
    }
}

/// Resolves a tier against the current endpoint set.
#[must_use]
pub fn decide(tier: Tier, endpoints: &[Endpoint], premium_model: &str) -> Decision {
    let (effective, reason) = resolve_tier(tier);
    match effective {
        ResolvedTier::Trivial => Decision::Route(RouteDecision {
            effective_tier: effective.as_tier(),
            target_kind: TargetKind::Sidecar,
            selected_endpoint: None,
            selected_model: None,
            fallback_used: false,
            fallback_from_tier: None,
            fallback_reason: None,
            candidate_count: 0,
            classification_reason: reason,
            estimated_cost_tier: CostTier::Free,
            decided_at: now_ms(),
        }),
        ResolvedTier::Standard => {
            let candidates: Vec<&Endpoint> =
                endpoints.iter().filter(|e| e.is_candidate()).collect();
            if candidates.is_empty() {
                debug!(tier = %effective.as_tier(), "no healthy endpoints, reporting fallback");
                return Decision::Fallback {
                    tier: effective.as_tier(),
                    reason: NO_HEALTHY_ENDPOINTS,
                };
            }
            let best = candidates
                .iter()
                .min_by(|a, b| {
                    a.load_score()
                        .partial_cmp(&b.load_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()
                .unwrap_or(candidates[0]);
            Decision::Route(RouteDecision {
                effective_tier: effective.as_tier(),
                target_kind: TargetKind::Endpoint,
                selected_endpoint: Some(best.id.clone()),
                selected_model: best.models.first().cloned(),
                fallback_used: false,
                fallback_from_tier: None,
                fallback_reason: None,
                candidate_count: candidates.len(),
                classification_reason: reason,
                estimated_cost_tier: CostTier::Local,
                decided_at: now_ms(),
            })
        }
        ResolvedTier::Complex => Decision::Route(RouteDecision {
            effective_tier: Tier::Complex,
            target_kind: TargetKind::PremiumModel,
            selected_endpoint: None,
            selected_model: Some(premium_model.to_string()),
            fallback_used: false,
            fallback_from_tier: None,
            fallback_reason: None,
            candidate_count: 0,
            classification_reason: reason,
            estimated_cost_tier: CostTier::Api,
            decided_at: now_ms(),
        }),
    }
}

/// Like [`decide`], but when the standard tier has no endpoint the decision
/// escalates to the premium model with the fallback recorded. Used where an
/// assignment must proceed now rather than wait for a scheduler retry.
#[must_use]
pub fn decide_with_escalation(
    tier: Tier,
    endpoints: &[Endpoint],
    premium_model: &str,
) -> RouteDecision {
    match decide(tier, endpoints, premium_model) {
        Decision::Route(decision) => decision,
        Decision::Fallback { tier, reason } => {
            info!(from_tier = %tier, reason, "escalating to premium model");
            RouteDecision {
                effective_tier: tier,
                target_kind: TargetKind::PremiumModel,
                selected_endpoint: None,
                selected_model: Some(premium_model.to_string()),
                fallback_used: true,
                fallback_from_tier: Some(tier),
                fallback_reason: Some(reason.to_string()),
                candidate_count: 0,
                classification_reason: format!("fallback from {tier}"),
                estimated_cost_tier: CostTier::Api,
                decided_at: now_ms(),
            }
        }
    }
}

/// Live registry of reported endpoints.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<String, Endpoint>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts an endpoint report.
    pub fn report(&self, mut endpoint: Endpoint) {
        endpoint.last_reported_at = now_ms();
        self.endpoints.insert(endpoint.id.clone(), endpoint);
    }

    /// Snapshot of all known endpoints.
    pub fn list(&self) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = self.endpoints.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Marks endpoints silent past `stale_ms` as unreachable. Returns how
    /// many flipped.
    pub fn mark_stale(&self, now: u64, stale_ms: u64) -> usize {
        let mut flipped = 0;
        for mut entry in self.endpoints.iter_mut() {
            if entry.status != EndpointStatus::Unreachable
                && now.saturating_sub(entry.last_reported_at) > stale_ms
            {
                entry.status = EndpointStatus::Unreachable;
                flipped += 1;
            }
        }
        flipped
    }
}
