//! Admin overrides of limits, cap mode, and the current period.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::audit::{AuditEntry, AuditLog};
use super::engine::{evaluate, QuotaStatus};
use super::period::PeriodPolicy;
use super::record::CapMode;
use crate::error::{QuotaError, Result};
use crate::health::QuotaMetrics;
use crate::store::{QuotaRecordStore, RecordPatch};

/// Partial update requested by an operator.
///
/// Fields are kept in their wire form (signed integers, free-form mode
/// string) so that malformed payloads reach [`validate`](Self::validate) and
/// are rejected with a message instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaAdjustment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_now: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cap_mode: Option<String>,
}

/// A checked adjustment, ready to become a [`RecordPatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitUpdate {
    pub daily_request_limit: Option<u64>,
    pub daily_token_limit: Option<u64>,
    pub cap_mode: Option<CapMode>,
    pub reset_now: bool,
}

fn non_negative(field: &str, value: Option<i64>) -> Result<Option<u64>> {
    value
        .map(|v| {
            u64::try_from(v).map_err(|_| {
                QuotaError::Validation(format!("{field} must be non-negative, got {v}"))
            })
        })
        .transpose()
}

impl QuotaAdjustment {
    pub fn validate(&self) -> Result<LimitUpdate> {
        Ok(LimitUpdate {
            daily_request_limit: non_negative("requests", self.requests)?,
            daily_token_limit: non_negative("tokens", self.tokens)?,
            cap_mode: self
                .cap_mode
                .as_deref()
                .map(str::parse::<CapMode>)
                .transpose()?,
            reset_now: self.reset_now.unwrap_or(false),
        })
    }
}

/// Applies operator overrides and records them in the audit log.
///
/// Authorization happens before this point; `admin_id` is recorded for the
/// audit trail, not checked.
#[derive(Clone)]
pub struct AdminOverrides {
    store: Arc<dyn QuotaRecordStore>,
    audit: Arc<dyn AuditLog>,
    period: PeriodPolicy,
    metrics: Option<Arc<QuotaMetrics>>,
}

impl AdminOverrides {
    pub fn new(
        store: Arc<dyn QuotaRecordStore>,
        audit: Arc<dyn AuditLog>,
        period: PeriodPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            period,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply `adjustment` to the user's record and return the new status.
    ///
    /// With `reset_now`, usage is zeroed and the period restarts from now.
    /// All changes land in a single store update. An audit write failure is
    /// logged but does not roll the adjustment back.
    pub async fn adjust_quota(
        &self,
        user_id: &str,
        adjustment: &QuotaAdjustment,
        admin_id: &str,
    ) -> Result<QuotaStatus> {
        if admin_id.trim().is_empty() {
            return Err(QuotaError::Validation("admin_id is required".into()));
        }
        let update = adjustment.validate()?;

        let patch = RecordPatch {
            daily_request_limit: update.daily_request_limit,
            daily_token_limit: update.daily_token_limit,
            cap_mode: update.cap_mode,
            restart_period_until: update
                .reset_now
                .then(|| self.period.from_now(Utc::now())),
        };
        let record = self.store.apply_patch(user_id, &patch).await?;

        info!(
            user_id,
            admin_id,
            requests = ?update.daily_request_limit,
            tokens = ?update.daily_token_limit,
            cap_mode = ?update.cap_mode,
            reset_now = update.reset_now,
            "quota adjusted by admin"
        );
        if let Some(ref m) = self.metrics {
            m.record_adjustment();
        }

        let entry = AuditEntry::new(user_id, admin_id, adjustment);
        if let Err(e) = self.audit.append(&entry).await {
            error!(
                user_id,
                admin_id,
                audit_id = %entry.id,
                error = %e,
                "failed to write audit entry for quota adjustment"
            );
        }

        Ok(evaluate(&record))
    }
}
