//! Static plan table.
//!
//! Every per-plan number lives here. Decision logic asks the table for a
//! plan's grace allowance instead of matching on plan names, so adding a
//! tier only means adding a row.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::record::{CapMode, PlanType};

/// Grace percentage that behaves like a hard cap.
pub const NO_GRACE_PERCENT: u64 = 100;

/// Defaults and allowances for one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLimits {
    pub daily_requests: u64,
    pub daily_tokens: u64,
    /// Admission ceiling in soft mode, as a percentage of the limit.
    pub soft_grace_percent: u64,
    /// Cap mode assigned when a record is provisioned.
    pub default_cap_mode: CapMode,
    pub models: &'static [&'static str],
    pub features: &'static [&'static str],
}

static PLAN_TABLE: Lazy<HashMap<PlanType, PlanLimits>> = Lazy::new(|| {
    HashMap::from([
        (
            PlanType::Free,
            PlanLimits {
                daily_requests: 10,
                daily_tokens: 50_000,
                soft_grace_percent: NO_GRACE_PERCENT,
                default_cap_mode: CapMode::Hard,
                models: &["standard"],
                features: &["completion"],
            },
        ),
        (
            PlanType::Basic,
            PlanLimits {
                daily_requests: 15,
                daily_tokens: 75_000,
                soft_grace_percent: NO_GRACE_PERCENT,
                default_cap_mode: CapMode::Hard,
                models: &["standard"],
                features: &["completion", "summarize"],
            },
        ),
        (
            PlanType::Pro,
            PlanLimits {
                daily_requests: 20,
                daily_tokens: 100_000,
                soft_grace_percent: 110,
                default_cap_mode: CapMode::Hard,
                models: &["standard", "advanced"],
                features: &["completion", "summarize", "insights"],
            },
        ),
        (
            PlanType::Enterprise,
            PlanLimits {
                daily_requests: 100,
                daily_tokens: 500_000,
                soft_grace_percent: 110,
                default_cap_mode: CapMode::Soft,
                models: &["standard", "advanced", "premium"],
                features: &["completion", "summarize", "insights", "bulk"],
            },
        ),
    ])
});

/// Look up the table row for a plan.
pub fn plan_limits(plan: PlanType) -> &'static PlanLimits {
    // Every variant is inserted above; the table test guards this.
    &PLAN_TABLE[&plan]
}

/// Effective admission ceiling (percent of limit) for a plan and mode.
pub fn grace_percent(plan: PlanType, cap_mode: CapMode) -> u64 {
    match cap_mode {
        CapMode::Hard => NO_GRACE_PERCENT,
        CapMode::Soft => plan_limits(plan).soft_grace_percent,
    }
}
