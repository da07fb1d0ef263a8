//! quotagate: admission control and usage accounting for metered AI features.
//!
//! Each user has one [`QuotaRecord`] holding plan limits, per-period usage and
//! the next reset boundary. [`DecisionEngine::check`] answers whether a call is
//! allowed, [`UsageAccountant::increment`] charges it afterwards, and the
//! [`ResetScheduler`] starts a fresh period for every due record.

pub mod config;
pub mod error;
pub mod health;
pub mod quota;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use error::{QuotaError, Result};
pub use health::{HealthRegistry, QuotaMetrics};
pub use quota::{
    AdminOverrides, CapMode, DecisionEngine, DenyReason, GlobalStats, PlanType, Provisioner,
    QuotaAdjustment, QuotaRecord, QuotaStatus, StatsAggregator, UsageAccountant,
};
pub use scheduler::{AlertNotifier, AlertPolicy, JobConfig, JobSummary, ResetScheduler};
pub use store::{FileRecordStore, LocalRecordStore, QuotaRecordStore};
