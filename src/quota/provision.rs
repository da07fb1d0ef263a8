//! Record creation from the plan table.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::period::PeriodPolicy;
use super::plans::plan_limits;
use super::record::{PlanStatus, PlanType, QuotaRecord};
use crate::error::{QuotaError, Result};
use crate::store::QuotaRecordStore;

/// Creates a user's quota record when they first become entitled.
#[derive(Clone)]
pub struct Provisioner {
    store: Arc<dyn QuotaRecordStore>,
    period: PeriodPolicy,
}

impl Provisioner {
    pub fn new(store: Arc<dyn QuotaRecordStore>, period: PeriodPolicy) -> Self {
        Self { store, period }
    }

    /// Build a fresh record for `plan` without storing it.
    pub fn build_record(&self, user_id: &str, plan: PlanType) -> QuotaRecord {
        let limits = plan_limits(plan);
        let now = Utc::now();
        QuotaRecord {
            user_id: user_id.to_string(),
            plan_type: plan,
            ai_enabled: true,
            plan_status: PlanStatus::Active,
            cap_mode: limits.default_cap_mode,
            daily_request_limit: limits.daily_requests,
            daily_token_limit: limits.daily_tokens,
            daily_requests_used: 0,
            daily_tokens_used: 0,
            quota_reset_at: self.period.initial_reset_at(now),
            allowed_models: limits.models.iter().map(|m| m.to_string()).collect(),
            allowed_features: limits.features.iter().map(|f| f.to_string()).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create and store a record. Fails with `AlreadyExists` on a second call.
    pub async fn provision(&self, user_id: &str, plan: PlanType) -> Result<QuotaRecord> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(QuotaError::Validation("user_id must not be empty".into()));
        }
        let record = self.build_record(user_id, plan);
        self.store.insert(record.clone()).await?;
        info!(user_id, plan = %plan, reset_at = %record.quota_reset_at, "quota record provisioned");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::record::CapMode;
    use crate::store::LocalRecordStore;

    fn provisioner() -> (Provisioner, Arc<LocalRecordStore>) {
        let store = Arc::new(LocalRecordStore::new_in_memory());
        (
            Provisioner::new(store.clone(), PeriodPolicy::default()),
            store,
        )
    }

    #[tokio::test]
    async fn test_provision_uses_plan_table() {
        let (prov, store) = provisioner();
        let rec = prov.provision("alice", PlanType::Pro).await.unwrap();
        assert_eq!(rec.daily_request_limit, 20);
        assert_eq!(rec.daily_token_limit, 100_000);
        assert_eq!(rec.cap_mode, CapMode::Hard);
        assert!(rec.allowed_models.contains("advanced"));
        assert!(rec.quota_reset_at > Utc::now());
        assert_eq!(store.get("alice").await.unwrap(), rec);
    }

    #[tokio::test]
    async fn test_enterprise_is_provisioned_soft() {
        let (prov, _store) = provisioner();
        let rec = prov.provision("corp", PlanType::Enterprise).await.unwrap();
        assert_eq!(rec.cap_mode, CapMode::Soft);
    }

    #[tokio::test]
    async fn test_provision_twice_is_already_exists() {
        let (prov, _store) = provisioner();
        prov.provision("bob", PlanType::Free).await.unwrap();
        assert!(matches!(
            prov.provision("bob", PlanType::Basic).await,
            Err(QuotaError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_provision_blank_user_is_rejected() {
        let (prov, _store) = provisioner();
        assert!(matches!(
            prov.provision("   ", PlanType::Free).await,
            Err(QuotaError::Validation(_))
        ));
    }
}
