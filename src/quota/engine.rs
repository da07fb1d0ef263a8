//! Quota decision engine.
//!
//! [`evaluate`] is a pure function of a [`QuotaRecord`]: it computes usage
//! percentages, applies the cap mode's grace allowance, and decides
//! admission. [`DecisionEngine::check`] fetches the record and evaluates it.
//!
//! # Example
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//! use quotagate::quota::{DecisionEngine, PlanType, Provisioner};
//! use quotagate::quota::period::PeriodPolicy;
//! use quotagate::store::LocalRecordStore;
//!
//! let store = Arc::new(LocalRecordStore::new_in_memory());
//! Provisioner::new(store.clone(), PeriodPolicy::default())
//!     .provision("alice", PlanType::Free)
//!     .await
//!     .unwrap();
//!
//! let status = DecisionEngine::new(store).check("alice").await.unwrap();
//! assert!(status.allowed);
//! assert!(!status.warning);
//! # });
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::plans::grace_percent;
use super::record::{CapMode, PlanStatus, PlanType, QuotaRecord};
use crate::error::Result;
use crate::health::QuotaMetrics;
use crate::store::QuotaRecordStore;

/// Usage percentage at or above which a warning is raised.
pub const WARNING_THRESHOLD_PERCENT: f64 = 80.0;

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    AiDisabled,
    PlanInactive,
    RequestsExhausted,
    TokensExhausted,
}

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub user_id: String,
    pub allowed: bool,
    pub warning: bool,
    pub deny_reason: Option<DenyReason>,
    pub requests_used: u64,
    pub requests_remaining: u64,
    /// Exact percentage, uncapped above 100.
    pub requests_percentage: f64,
    /// Percentage clamped to 0-100 for display.
    pub requests_percentage_display: f64,
    pub tokens_used: u64,
    pub tokens_remaining: u64,
    pub tokens_percentage: f64,
    pub tokens_percentage_display: f64,
    pub cap_mode: CapMode,
    pub plan_type: PlanType,
    pub daily_request_limit: u64,
    pub daily_token_limit: u64,
    pub quota_reset_at: DateTime<Utc>,
}

/// Percentage of `limit` consumed by `used`. A zero limit counts as fully spent.
fn usage_percentage(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    (used as f64 / limit as f64 * 100.0).max(0.0)
}

/// `used < limit * grace / 100` in exact integer arithmetic.
fn within_ceiling(used: u64, limit: u64, grace_percent: u64) -> bool {
    u128::from(used) * 100 < u128::from(limit) * u128::from(grace_percent)
}

/// Evaluate a record. Pure: no I/O, no clock.
pub fn evaluate(record: &QuotaRecord) -> QuotaStatus {
    let requests_percentage =
        usage_percentage(record.daily_requests_used, record.daily_request_limit);
    let tokens_percentage = usage_percentage(record.daily_tokens_used, record.daily_token_limit);
    let grace = grace_percent(record.plan_type, record.cap_mode);

    let deny_reason = if !record.ai_enabled {
        Some(DenyReason::AiDisabled)
    } else if record.plan_status != PlanStatus::Active {
        Some(DenyReason::PlanInactive)
    } else if !within_ceiling(
        record.daily_requests_used,
        record.daily_request_limit,
        grace,
    ) {
        Some(DenyReason::RequestsExhausted)
    } else if !within_ceiling(record.daily_tokens_used, record.daily_token_limit, grace) {
        Some(DenyReason::TokensExhausted)
    } else {
        None
    };

    QuotaStatus {
        user_id: record.user_id.clone(),
        allowed: deny_reason.is_none(),
        warning: requests_percentage >= WARNING_THRESHOLD_PERCENT
            || tokens_percentage >= WARNING_THRESHOLD_PERCENT,
        deny_reason,
        requests_used: record.daily_requests_used,
        requests_remaining: record
            .daily_request_limit
            .saturating_sub(record.daily_requests_used),
        requests_percentage,
        requests_percentage_display: requests_percentage.clamp(0.0, 100.0),
        tokens_used: record.daily_tokens_used,
        tokens_remaining: record
            .daily_token_limit
            .saturating_sub(record.daily_tokens_used),
        tokens_percentage,
        tokens_percentage_display: tokens_percentage.clamp(0.0, 100.0),
        cap_mode: record.cap_mode,
        plan_type: record.plan_type,
        daily_request_limit: record.daily_request_limit,
        daily_token_limit: record.daily_token_limit,
        quota_reset_at: record.quota_reset_at,
    }
}

/// Store-backed admission check.
#[derive(Clone)]
pub struct DecisionEngine {
    store: Arc<dyn QuotaRecordStore>,
    metrics: Option<Arc<QuotaMetrics>>,
}

impl DecisionEngine {
    pub fn new(store: Arc<dyn QuotaRecordStore>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decide whether `user_id` may consume the gated feature now.
    ///
    /// Fails with `NotFound` when the user has no record. A denial is a
    /// normal result (`allowed == false`), not an error.
    pub async fn check(&self, user_id: &str) -> Result<QuotaStatus> {
        let record = self.store.get(user_id).await?;
        let status = evaluate(&record);

        if let Some(ref m) = self.metrics {
            m.record_check(status.allowed, status.warning);
        }
        if let Some(reason) = status.deny_reason {
            debug!(user_id, reason = ?reason, "quota check denied");
        } else if status.warning {
            debug!(
                user_id,
                requests_pct = %format!("{:.0}%", status.requests_percentage),
                tokens_pct = %format!("{:.0}%", status.tokens_percentage),
                "quota warning: approaching limit"
            );
        }
        Ok(status)
    }
}
