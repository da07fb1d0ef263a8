//! Batch reset job.
//!
//! Sweeps every due record, resets it with a compare-and-set on its period
//! boundary, and reports a [`JobSummary`]. A single user's failure never
//! aborts the batch or the job; the job always completes, possibly with
//! failures or early because its wall-clock budget ran out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{QuotaError, Result};
use crate::health::{HealthRegistry, HealthStatus, QuotaMetrics, SCHEDULER_CHECK};
use crate::quota::{PeriodPolicy, QuotaRecord};
use crate::store::{QuotaRecordStore, ResetOutcome};

/// Tuning for one reset run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Users per batch.
    pub batch_size: usize,
    /// Pause between batches, in milliseconds.
    pub delay_ms: u64,
    /// Total attempts per user, including the first.
    pub max_retries: u32,
    /// First retry delay; doubles on each further attempt.
    pub base_backoff_ms: u64,
    /// Resets in flight at once within a batch.
    pub concurrency: usize,
    /// Wall-clock budget for the whole run. `None` means unbounded.
    pub budget_secs: Option<u64>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            delay_ms: 2_000,
            max_retries: 3,
            base_backoff_ms: 5_000,
            concurrency: 5,
            budget_secs: None,
        }
    }
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(QuotaError::Config("batch_size must be greater than 0".into()));
        }
        if self.concurrency == 0 {
            return Err(QuotaError::Config("concurrency must be greater than 0".into()));
        }
        if self.max_retries == 0 {
            return Err(QuotaError::Config("max_retries must be at least 1".into()));
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1` (`attempt` starts at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }
}

/// Lifecycle of the scheduler's most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    CompletedWithFailures,
}

/// A user whose reset did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetFailure {
    pub user_id: String,
    pub error: String,
    pub attempts: u32,
}

/// Outcome of one reset run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: uuid::Uuid,
    /// `Completed` or `CompletedWithFailures`.
    pub status: JobState,
    pub success: usize,
    pub failed: usize,
    /// Due users never attempted because the run stopped early.
    pub skipped: usize,
    pub total_users: usize,
    pub duration_ms: u64,
    pub budget_exceeded: bool,
    pub errors: Vec<ResetFailure>,
    /// Set when the due-record query itself could not be answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobSummary {
    /// `failed / total_users`, or 0 for an empty run.
    pub fn failure_rate(&self) -> f64 {
        if self.total_users == 0 {
            0.0
        } else {
            self.failed as f64 / self.total_users as f64
        }
    }
}

/// Clears the running flag when a run ends, even by panic.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Periodic sweeper that starts a fresh accounting period for due records.
pub struct ResetScheduler {
    store: Arc<dyn QuotaRecordStore>,
    period: PeriodPolicy,
    running: AtomicBool,
    state: RwLock<JobState>,
    last_summary: RwLock<Option<JobSummary>>,
    summaries: Option<mpsc::Sender<JobSummary>>,
    metrics: Option<Arc<QuotaMetrics>>,
    health: Option<HealthRegistry>,
    shutdown: CancellationToken,
}

impl ResetScheduler {
    pub fn new(store: Arc<dyn QuotaRecordStore>, period: PeriodPolicy) -> Self {
        Self {
            store,
            period,
            running: AtomicBool::new(false),
            state: RwLock::new(JobState::Idle),
            last_summary: RwLock::new(None),
            summaries: None,
            metrics: None,
            health: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Publish every finished run's summary on `tx`.
    pub fn with_summary_channel(mut self, tx: mpsc::Sender<JobSummary>) -> Self {
        self.summaries = Some(tx);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Stop starting new batches once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn state(&self) -> JobState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_summary(&self) -> Option<JobSummary> {
        self.last_summary
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, state: JobState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Force a fresh period for one user.
    ///
    /// Same step as the scheduler: zero the usage and move the boundary to
    /// the first whole period past it that lies in the future. Fails with
    /// `Conflict` if the boundary moved between read and write.
    pub async fn reset_user(&self, user_id: &str) -> Result<()> {
        let record = self.store.get(user_id).await?;
        match self.reset_step(&record).await? {
            ResetOutcome::Reset => {
                info!(user_id, "quota reset on request");
                Ok(())
            }
            ResetOutcome::BoundaryMoved { current } => Err(QuotaError::Conflict(format!(
                "reset boundary for '{user_id}' changed to {current} during reset"
            ))),
        }
    }

    /// Compare-and-set from the record's boundary to the next future one.
    async fn reset_step(&self, record: &QuotaRecord) -> Result<ResetOutcome> {
        let next = self
            .period
            .next_boundary(record.quota_reset_at, Utc::now());
        let outcome = self
            .store
            .reset_period(&record.user_id, record.quota_reset_at, next)
            .await?;
        if outcome == ResetOutcome::Reset {
            debug!(user_id = %record.user_id, next_reset_at = %next, "quota reset");
        }
        Ok(outcome)
    }

    /// Scheduled reset of one due record. A moved boundary counts as done.
    async fn reset_due_record(&self, record: &QuotaRecord) -> Result<()> {
        if let ResetOutcome::BoundaryMoved { current } = self.reset_step(record).await? {
            // Someone else (an admin reset or an earlier attempt whose
            // response was lost) already started a fresh period.
            debug!(
                user_id = %record.user_id,
                expected = %record.quota_reset_at,
                current = %current,
                "reset boundary already moved; leaving record as is"
            );
        }
        Ok(())
    }

    async fn reset_with_retry(
        &self,
        record: QuotaRecord,
        config: &JobConfig,
    ) -> std::result::Result<(), ResetFailure> {
        let mut attempt = 1;
        loop {
            match self.reset_due_record(&record).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < config.max_retries => {
                    let delay = config.backoff(attempt);
                    warn!(
                        user_id = %record.user_id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "quota reset failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        user_id = %record.user_id,
                        attempts = attempt,
                        error = %e,
                        "quota reset failed"
                    );
                    return Err(ResetFailure {
                        user_id: record.user_id,
                        error: e.to_string(),
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// Due records, retried like a per-user reset when the store is flaky.
    async fn load_due(&self, config: &JobConfig) -> Result<Vec<QuotaRecord>> {
        let mut attempt = 1;
        loop {
            match self.store.due_records(Utc::now()).await {
                Ok(records) => return Ok(records),
                Err(e) if e.is_transient() && attempt < config.max_retries => {
                    warn!(attempt, error = %e, "due-record query failed, retrying");
                    tokio::time::sleep(config.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one full sweep.
    ///
    /// Fails only with `JobAlreadyRunning`; every other problem is reported
    /// in the returned summary.
    pub async fn run_reset_job(&self, config: &JobConfig) -> Result<JobSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QuotaError::JobAlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let job_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("reset_job", %job_id);
        let summary = self.run_inner(job_id, config).instrument(span).await;

        self.set_state(summary.status);
        *self.last_summary.write().unwrap_or_else(|e| e.into_inner()) = Some(summary.clone());
        self.publish(&summary).await;
        Ok(summary)
    }

    async fn run_inner(&self, job_id: uuid::Uuid, config: &JobConfig) -> JobSummary {
        self.set_state(JobState::Running);
        let started = Instant::now();
        let started_at = Utc::now();
        let budget = config.budget_secs.map(Duration::from_secs);
        let batch_size = config.batch_size.max(1);
        let concurrency = config.concurrency.max(1);

        let mut summary = JobSummary {
            job_id,
            status: JobState::Completed,
            success: 0,
            failed: 0,
            skipped: 0,
            total_users: 0,
            duration_ms: 0,
            budget_exceeded: false,
            errors: Vec::new(),
            query_error: None,
            started_at,
            finished_at: started_at,
        };

        let due = match self.load_due(config).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "could not list due quota records");
                summary.query_error = Some(e.to_string());
                return self.finish(summary, started);
            }
        };
        summary.total_users = due.len();
        info!(
            total_users = due.len(),
            batch_size,
            concurrency,
            "quota reset job started"
        );

        let batches: Vec<Vec<QuotaRecord>> =
            due.chunks(batch_size).map(<[QuotaRecord]>::to_vec).collect();
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 && config.delay_ms > 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(config.delay_ms)) => {}
                }
            }

            let out_of_budget = budget.is_some_and(|b| started.elapsed() >= b);
            if out_of_budget || self.shutdown.is_cancelled() {
                let attempted = summary.success + summary.failed;
                summary.skipped = summary.total_users - attempted;
                summary.budget_exceeded = out_of_budget;
                warn!(
                    skipped = summary.skipped,
                    budget_exceeded = out_of_budget,
                    "quota reset job stopping early"
                );
                break;
            }

            let results: Vec<_> = stream::iter(batch)
                .map(|record| self.reset_with_retry(record, config))
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for result in results {
                match result {
                    Ok(()) => summary.success += 1,
                    Err(failure) => {
                        summary.failed += 1;
                        summary.errors.push(failure);
                    }
                }
            }
            debug!(
                batch = index + 1,
                batches = batch_count,
                success = summary.success,
                failed = summary.failed,
                "reset batch finished"
            );
        }

        summary.errors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        self.finish(summary, started)
    }

    fn finish(&self, mut summary: JobSummary, started: Instant) -> JobSummary {
        summary.duration_ms = started.elapsed().as_millis() as u64;
        summary.finished_at = Utc::now();
        summary.status = if summary.failed > 0
            || summary.budget_exceeded
            || summary.skipped > 0
            || summary.query_error.is_some()
        {
            JobState::CompletedWithFailures
        } else {
            JobState::Completed
        };

        info!(
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            total_users = summary.total_users,
            duration_ms = summary.duration_ms,
            failure_rate = %format!("{:.1}%", summary.failure_rate() * 100.0),
            "quota reset job finished"
        );
        summary
    }

    async fn publish(&self, summary: &JobSummary) {
        if let Some(ref m) = self.metrics {
            m.record_reset_job(summary.success as u64, summary.failed as u64);
        }
        if let Some(ref health) = self.health {
            match summary.status {
                JobState::Completed => health.update(
                    SCHEDULER_CHECK,
                    HealthStatus::Ok,
                    Some(format!("last run reset {} users", summary.success)),
                ),
                _ => health.update(
                    SCHEDULER_CHECK,
                    HealthStatus::Degraded,
                    Some(format!(
                        "last run: {} failed, {} skipped of {}",
                        summary.failed, summary.skipped, summary.total_users
                    )),
                ),
            }
        }
        if let Some(ref tx) = self.summaries {
            if tx.send(summary.clone()).await.is_err() {
                warn!("reset summary receiver dropped; alerting disabled");
            }
        }
    }
}
