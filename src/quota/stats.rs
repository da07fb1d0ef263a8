//! Cross-user rollups for operational dashboards.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::engine::evaluate;
use super::record::{PlanType, QuotaRecord};
use crate::error::Result;
use crate::store::QuotaRecordStore;

/// Aggregate usage over every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_users: usize,
    /// Records with any usage since their last reset.
    pub active_today: usize,
    /// Records currently failing the admission predicate.
    pub quota_exceeded: usize,
    pub avg_requests_used: f64,
    pub due_for_reset: usize,
    pub by_plan: BTreeMap<PlanType, usize>,
}

impl GlobalStats {
    /// Fold a record set into totals. `now` only decides `due_for_reset`.
    pub fn from_records(records: &[QuotaRecord], now: DateTime<Utc>) -> Self {
        let total_users = records.len();
        let mut by_plan = BTreeMap::new();
        let mut active_today = 0;
        let mut quota_exceeded = 0;
        let mut due_for_reset = 0;
        let mut requests_sum: u128 = 0;

        for record in records {
            *by_plan.entry(record.plan_type).or_insert(0) += 1;
            if record.has_usage() {
                active_today += 1;
            }
            if !evaluate(record).allowed {
                quota_exceeded += 1;
            }
            if record.is_due(now) {
                due_for_reset += 1;
            }
            requests_sum += u128::from(record.daily_requests_used);
        }

        let avg_requests_used = if total_users == 0 {
            0.0
        } else {
            requests_sum as f64 / total_users as f64
        };

        Self {
            total_users,
            active_today,
            quota_exceeded,
            avg_requests_used,
            due_for_reset,
            by_plan,
        }
    }
}

/// Read-only aggregation over the record store.
#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn QuotaRecordStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn QuotaRecordStore>) -> Self {
        Self { store }
    }

    /// Full-scan rollup of the current record set.
    pub async fn global_stats(&self) -> Result<GlobalStats> {
        let records = self.store.all_records().await?;
        Ok(GlobalStats::from_records(&records, Utc::now()))
    }
}
