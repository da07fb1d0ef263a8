//! Quota record storage.
//!
//! [`QuotaRecordStore`] is the seam to whatever durable store holds the
//! records. Every mutating method is a single atomic operation on one record
//! (delta add, patch, or compare-and-set), so callers never perform a
//! read-modify-write of their own.

pub mod file;
pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::quota::{CapMode, QuotaRecord};

pub use file::FileRecordStore;
pub use local::LocalRecordStore;

/// Field overwrites applied atomically by an admin override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub daily_request_limit: Option<u64>,
    pub daily_token_limit: Option<u64>,
    pub cap_mode: Option<CapMode>,
    /// When set, zero both usage counters and end the period at this instant.
    pub restart_period_until: Option<DateTime<Utc>>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.daily_request_limit.is_none()
            && self.daily_token_limit.is_none()
            && self.cap_mode.is_none()
            && self.restart_period_until.is_none()
    }

    /// Apply the patch to a record in place.
    pub fn apply_to(&self, record: &mut QuotaRecord) {
        if let Some(limit) = self.daily_request_limit {
            record.daily_request_limit = limit;
        }
        if let Some(limit) = self.daily_token_limit {
            record.daily_token_limit = limit;
        }
        if let Some(mode) = self.cap_mode {
            record.cap_mode = mode;
        }
        if let Some(until) = self.restart_period_until {
            record.daily_requests_used = 0;
            record.daily_tokens_used = 0;
            record.quota_reset_at = until;
        }
    }
}

/// Result of a compare-and-set period reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Counters were zeroed and the boundary moved.
    Reset,
    /// The boundary no longer matched the expected value; nothing changed.
    BoundaryMoved { current: DateTime<Utc> },
}

/// Durable storage for quota records, keyed by user id.
#[async_trait]
pub trait QuotaRecordStore: Send + Sync {
    /// Fetch a record. Fails with `NotFound` when absent.
    async fn get(&self, user_id: &str) -> Result<QuotaRecord>;

    /// Create a record. Fails with `AlreadyExists` when the key is taken.
    async fn insert(&self, record: QuotaRecord) -> Result<()>;

    /// Atomically add to both usage counters and return the updated record.
    async fn add_usage(&self, user_id: &str, requests: u64, tokens: u64) -> Result<QuotaRecord>;

    /// Atomically apply an admin patch and return the updated record.
    async fn apply_patch(&self, user_id: &str, patch: &RecordPatch) -> Result<QuotaRecord>;

    /// Zero the counters and move the boundary to `next_reset_at`, but only if
    /// the stored boundary still equals `expected_reset_at`.
    async fn reset_period(
        &self,
        user_id: &str,
        expected_reset_at: DateTime<Utc>,
        next_reset_at: DateTime<Utc>,
    ) -> Result<ResetOutcome>;

    /// All records whose period ended at or before `now`, ordered by user id.
    async fn due_records(&self, now: DateTime<Utc>) -> Result<Vec<QuotaRecord>>;

    /// Every record, ordered by user id.
    async fn all_records(&self) -> Result<Vec<QuotaRecord>>;
}
