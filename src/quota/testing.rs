//! Record builders shared by unit tests.

use chrono::{Duration, Utc};

use super::record::{CapMode, PlanStatus, PlanType, QuotaRecord};

/// Free/hard record with a 10/50 000 budget, no usage, resetting in an hour.
pub(crate) fn record(user_id: &str) -> QuotaRecord {
    let mut rec = record_with(PlanType::Free, CapMode::Hard, (10, 50_000), (0, 0));
    rec.user_id = user_id.to_string();
    rec
}

/// Record with explicit plan, mode, `(requests, tokens)` limits and usage.
pub(crate) fn record_with(
    plan_type: PlanType,
    cap_mode: CapMode,
    limits: (u64, u64),
    used: (u64, u64),
) -> QuotaRecord {
    let now = Utc::now();
    QuotaRecord {
        user_id: "test-user".to_string(),
        plan_type,
        ai_enabled: true,
        plan_status: PlanStatus::Active,
        cap_mode,
        daily_request_limit: limits.0,
        daily_token_limit: limits.1,
        daily_requests_used: used.0,
        daily_tokens_used: used.1,
        quota_reset_at: now + Duration::hours(1),
        allowed_models: Default::default(),
        allowed_features: Default::default(),
        created_at: now,
        updated_at: now,
    }
}
