//! Quota decisions, usage accounting, admin overrides, and rollups.
//!
//! The pure admission logic lives in [`engine::evaluate`]. Every other type
//! here wraps a [`QuotaRecordStore`](crate::store::QuotaRecordStore) and
//! performs at most one store round trip per call.

pub mod accountant;
pub mod admin;
pub mod audit;
pub mod engine;
pub mod period;
pub mod plans;
pub mod provision;
pub mod record;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use accountant::UsageAccountant;
pub use admin::{AdminOverrides, LimitUpdate, QuotaAdjustment};
pub use audit::{AuditEntry, AuditLog, JsonlAuditLog, MemoryAuditLog};
pub use engine::{evaluate, DecisionEngine, DenyReason, QuotaStatus};
pub use period::PeriodPolicy;
pub use plans::{plan_limits, PlanLimits};
pub use provision::Provisioner;
pub use record::{CapMode, PlanStatus, PlanType, QuotaRecord};
pub use stats::{GlobalStats, StatsAggregator};
