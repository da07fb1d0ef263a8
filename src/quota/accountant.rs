//! Post-call usage accounting.

use std::sync::Arc;

use tracing::debug;

use crate::error::{QuotaError, Result};
use crate::health::QuotaMetrics;
use crate::store::QuotaRecordStore;

/// Records consumption after a gated call has executed.
///
/// This is a ledger, not a gate: it never refuses an increment because the
/// user is over budget. Admission happens earlier in
/// [`DecisionEngine::check`](super::DecisionEngine::check), and concurrent
/// callers may push usage slightly past the limit between check and
/// increment.
#[derive(Clone)]
pub struct UsageAccountant {
    store: Arc<dyn QuotaRecordStore>,
    metrics: Option<Arc<QuotaMetrics>>,
}

impl UsageAccountant {
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

    /// Count one request and `tokens_used` tokens against the user's budget.
    pub async fn increment(&self, user_id: &str, tokens_used: i64) -> Result<()> {
        let tokens = u64::try_from(tokens_used).map_err(|_| {
            QuotaError::Validation(format!(
                "tokens_used must be non-negative, got {tokens_used}"
            ))
        })?;

        let updated = self.store.add_usage(user_id, 1, tokens).await?;

        if let Some(ref m) = self.metrics {
            m.record_increment(tokens);
        }
        debug!(
            user_id,
            tokens,
            requests_used = updated.daily_requests_used,
            tokens_used = updated.daily_tokens_used,
            "usage recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::testing::record;
    use crate::store::LocalRecordStore;

    async fn accountant_with(user: &str) -> (UsageAccountant, Arc<LocalRecordStore>) {
        let store = Arc::new(LocalRecordStore::new_in_memory());
        store.insert(record(user)).await.unwrap();
        (UsageAccountant::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_increment_adds_one_request_and_tokens() {
        let (accountant, store) = accountant_with("u1").await;
        accountant.increment("u1", 1_200).await.unwrap();
        accountant.increment("u1", 0).await.unwrap();

        let rec = store.get("u1").await.unwrap();
        assert_eq!(rec.daily_requests_used, 2);
        assert_eq!(rec.daily_tokens_used, 1_200);
    }

    #[tokio::test]
    async fn test_increment_negative_tokens_is_validation_error() {
        let (accountant, store) = accountant_with("u1").await;
        match accountant.increment("u1", -5).await {
            Err(QuotaError::Validation(msg)) => assert!(msg.contains("-5"), "{msg}"),
            other => panic!("expected Validation, got {other:?}"),
        }
        // Nothing was written.
        assert_eq!(store.get("u1").await.unwrap().daily_requests_used, 0);
    }

    #[tokio::test]
    async fn test_increment_missing_user_is_not_found() {
        let (accountant, _store) = accountant_with("u1").await;
        assert!(matches!(
            accountant.increment("ghost", 10).await,
            Err(QuotaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_increment_does_not_refuse_overage() {
        let (accountant, store) = accountant_with("u1").await;
        for _ in 0..15 {
            accountant.increment("u1", 10_000).await.unwrap();
        }
        let rec = store.get("u1").await.unwrap();
        assert_eq!(rec.daily_requests_used, 15);
        assert_eq!(rec.daily_tokens_used, 150_000);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_all_counted() {
        let (accountant, store) = accountant_with("u1").await;
        let metrics = Arc::new(QuotaMetrics::new());
        let accountant = accountant.with_metrics(Arc::clone(&metrics));

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let accountant = accountant.clone();
                tokio::spawn(async move { accountant.increment("u1", 25).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let rec = store.get("u1").await.unwrap();
        assert_eq!(rec.daily_requests_used, 40);
        assert_eq!(rec.daily_tokens_used, 1_000);
        assert_eq!(metrics.snapshot().increments, 40);
        assert_eq!(metrics.snapshot().tokens_recorded, 1_000);
    }
}
