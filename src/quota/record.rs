//! Per-user quota record and its enumerations.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl PlanType {
    pub const ALL: [PlanType; 4] = [
        PlanType::Free,
        PlanType::Basic,
        PlanType::Pro,
        PlanType::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "free",
            PlanType::Basic => "basic",
            PlanType::Pro => "pro",
            PlanType::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanType::Free),
            "basic" => Ok(PlanType::Basic),
            "pro" => Ok(PlanType::Pro),
            "enterprise" => Ok(PlanType::Enterprise),
            other => Err(QuotaError::Validation(format!(
                "unknown plan type '{other}' (expected free, basic, pro, enterprise)"
            ))),
        }
    }
}

/// Billing state of the user's plan. Only `Active` admits requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    #[default]
    Active,
    Cancelled,
    Suspended,
}

/// How strictly the daily limit is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CapMode {
    /// Block at 100% of the limit.
    #[default]
    Hard,
    /// Allow the plan's grace overage before blocking.
    Soft,
}

impl CapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapMode::Hard => "hard",
            CapMode::Soft => "soft",
        }
    }
}

impl fmt::Display for CapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapMode {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hard" => Ok(CapMode::Hard),
            "soft" => Ok(CapMode::Soft),
            other => Err(QuotaError::Validation(format!(
                "invalid cap mode '{other}' (expected hard or soft)"
            ))),
        }
    }
}

/// Budget and usage state for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub user_id: String,
    pub plan_type: PlanType,
    pub ai_enabled: bool,
    #[serde(default)]
    pub plan_status: PlanStatus,
    #[serde(default)]
    pub cap_mode: CapMode,
    pub daily_request_limit: u64,
    pub daily_token_limit: u64,
    #[serde(default)]
    pub daily_requests_used: u64,
    #[serde(default)]
    pub daily_tokens_used: u64,
    /// Exclusive end of the current accounting period.
    pub quota_reset_at: DateTime<Utc>,
    #[serde(default)]
    pub allowed_models: BTreeSet<String>,
    #[serde(default)]
    pub allowed_features: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// Whether the current period has ended and the record awaits a reset.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.quota_reset_at <= now
    }

    /// Whether any usage has been recorded in the current period.
    pub fn has_usage(&self) -> bool {
        self.daily_requests_used > 0 || self.daily_tokens_used > 0
    }
}
