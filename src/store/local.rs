//! In-process record store.
//!
//! Records live in a sharded [`DashMap`]. Each mutation holds only the entry
//! guard for its own user, so writers to different users never contend and
//! nothing on the hot path blocks. Contents are lost when the process exits;
//! [`super::FileRecordStore`] is the durable, multi-process store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{QuotaRecordStore, RecordPatch, ResetOutcome};
use crate::error::{QuotaError, Result};
use crate::quota::QuotaRecord;

/// Local quota record store.
///
/// Clone is cheap; all clones share the same map.
#[derive(Clone, Default)]
pub struct LocalRecordStore {
    records: Arc<DashMap<String, QuotaRecord>>,
}

impl LocalRecordStore {
    /// Create an empty store.
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn sorted(&self) -> Vec<QuotaRecord> {
        let mut all: Vec<QuotaRecord> = self.records.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        all
    }

    fn not_found(user_id: &str) -> QuotaError {
        QuotaError::NotFound(user_id.to_string())
    }
}

#[async_trait]
impl QuotaRecordStore for LocalRecordStore {
    async fn get(&self, user_id: &str) -> Result<QuotaRecord> {
        self.records
            .get(user_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Self::not_found(user_id))
    }

    async fn insert(&self, record: QuotaRecord) -> Result<()> {
        match self.records.entry(record.user_id.clone()) {
            Entry::Occupied(_) => return Err(QuotaError::AlreadyExists(record.user_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        Ok(())
    }

    async fn add_usage(&self, user_id: &str, requests: u64, tokens: u64) -> Result<QuotaRecord> {
        let mut entry = self
            .records
            .get_mut(user_id)
            .ok_or_else(|| Self::not_found(user_id))?;
        let record = entry.value_mut();
        record.daily_requests_used = record.daily_requests_used.saturating_add(requests);
        record.daily_tokens_used = record.daily_tokens_used.saturating_add(tokens);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn apply_patch(&self, user_id: &str, patch: &RecordPatch) -> Result<QuotaRecord> {
        let mut entry = self
            .records
            .get_mut(user_id)
            .ok_or_else(|| Self::not_found(user_id))?;
        let record = entry.value_mut();
        patch.apply_to(record);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn reset_period(
        &self,
        user_id: &str,
        expected_reset_at: DateTime<Utc>,
        next_reset_at: DateTime<Utc>,
    ) -> Result<ResetOutcome> {
        let mut entry = self
            .records
            .get_mut(user_id)
            .ok_or_else(|| Self::not_found(user_id))?;
        let record = entry.value_mut();
        if record.quota_reset_at != expected_reset_at {
            return Ok(ResetOutcome::BoundaryMoved {
                current: record.quota_reset_at,
            });
        }
        record.daily_requests_used = 0;
        record.daily_tokens_used = 0;
        record.quota_reset_at = next_reset_at;
        record.updated_at = Utc::now();
        Ok(ResetOutcome::Reset)
    }

    async fn due_records(&self, now: DateTime<Utc>) -> Result<Vec<QuotaRecord>> {
        let mut due: Vec<QuotaRecord> = self
            .records
            .iter()
            .filter(|e| e.value().is_due(now))
            .map(|e| e.value().clone())
            .collect();
        due.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(due)
    }

    async fn all_records(&self) -> Result<Vec<QuotaRecord>> {
        Ok(self.sorted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::testing::record;
    use chrono::Duration;

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = LocalRecordStore::new_in_memory();
        match store.get("ghost").await {
            Err(QuotaError::NotFound(user)) => assert_eq!(user, "ghost"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_insert_twice_is_already_exists() {
        let store = LocalRecordStore::new_in_memory();
        store.insert(record("u1")).await.unwrap();
        assert!(matches!(
            store.insert(record("u1")).await,
            Err(QuotaError::AlreadyExists(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_add_usage_loses_no_updates() {
        let store = LocalRecordStore::new_in_memory();
        store.insert(record("u1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.add_usage("u1", 1, 100).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let rec = store.get("u1").await.unwrap();
        assert_eq!(rec.daily_requests_used, 64);
        assert_eq!(rec.daily_tokens_used, 6_400);
    }

    #[tokio::test]
    async fn test_add_usage_saturates() {
        let store = LocalRecordStore::new_in_memory();
        let mut rec = record("u1");
        rec.daily_tokens_used = u64::MAX - 1;
        store.insert(rec).await.unwrap();
        let updated = store.add_usage("u1", 1, 10).await.unwrap();
        assert_eq!(updated.daily_tokens_used, u64::MAX);
    }

    #[tokio::test]
    async fn test_reset_period_compare_and_set() {
        let store = LocalRecordStore::new_in_memory();
        let mut rec = record("u1");
        rec.daily_requests_used = 7;
        rec.daily_tokens_used = 7_000;
        let boundary = rec.quota_reset_at;
        store.insert(rec).await.unwrap();

        let next = boundary + Duration::hours(24);
        let stale = boundary - Duration::hours(24);

        // Stale expectation: nothing changes.
        let outcome = store.reset_period("u1", stale, next).await.unwrap();
        assert_eq!(outcome, ResetOutcome::BoundaryMoved { current: boundary });
        assert_eq!(store.get("u1").await.unwrap().daily_requests_used, 7);

        // Matching expectation: counters zeroed, boundary moved.
        let outcome = store.reset_period("u1", boundary, next).await.unwrap();
        assert_eq!(outcome, ResetOutcome::Reset);
        let after = store.get("u1").await.unwrap();
        assert_eq!(after.daily_requests_used, 0);
        assert_eq!(after.daily_tokens_used, 0);
        assert_eq!(after.quota_reset_at, next);
    }

    #[tokio::test]
    async fn test_due_records_filters_and_sorts() {
        let store = LocalRecordStore::new_in_memory();
        let now = Utc::now();
        for (id, offset) in [("c", -1), ("a", -5), ("b", 3), ("d", 0)] {
            let mut rec = record(id);
            rec.quota_reset_at = now + Duration::hours(offset);
            store.insert(rec).await.unwrap();
        }
        let due: Vec<String> = store
            .due_records(now)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(due, vec!["a", "c", "d"]);
    }
}
