//! Failure alerting for reset runs.
//!
//! The scheduler publishes each [`JobSummary`] on a channel; the
//! [`AlertNotifier`] consumes it, applies the [`AlertPolicy`] and hands any
//! resulting [`Alert`] to an [`AlertChannel`]. Delivery problems are logged
//! and never reach the job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::job::{JobSummary, ResetFailure};
use crate::error::{QuotaError, Result};

/// When a finished run is worth paging someone about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertPolicy {
    /// Alert when `failed / total_users` is strictly above this fraction.
    pub failure_threshold: f64,
    /// How many failures to include in the alert body.
    pub sample_size: usize,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 0.10,
            sample_size: 5,
        }
    }
}

impl AlertPolicy {
    pub fn evaluate(&self, summary: &JobSummary) -> Option<Alert> {
        let rate = summary.failure_rate();
        let query_failed = summary.query_error.is_some();
        if rate <= self.failure_threshold && !query_failed {
            return None;
        }

        let message = match summary.query_error {
            Some(ref err) => format!("quota reset job could not list due users: {err}"),
            None => format!(
                "quota reset job {}: {} of {} users failed ({:.1}%)",
                summary.job_id,
                summary.failed,
                summary.total_users,
                rate * 100.0
            ),
        };
        Some(Alert {
            job_id: summary.job_id,
            message,
            failure_rate: rate,
            failed: summary.failed,
            total_users: summary.total_users,
            budget_exceeded: summary.budget_exceeded,
            sample: summary
                .errors
                .iter()
                .take(self.sample_size)
                .cloned()
                .collect(),
        })
    }
}

/// Operator-facing notice about a bad run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub job_id: uuid::Uuid,
    pub message: String,
    pub failure_rate: f64,
    pub failed: usize,
    pub total_users: usize,
    pub budget_exceeded: bool,
    pub sample: Vec<ResetFailure>,
}

/// Somewhere alerts can be delivered.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the error log.
#[derive(Debug, Default, Clone)]
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let sample: Vec<&str> = alert.sample.iter().map(|f| f.user_id.as_str()).collect();
        error!(
            job_id = %alert.job_id,
            failed = alert.failed,
            total_users = alert.total_users,
            sample = ?sample,
            "{}",
            alert.message
        );
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlertChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertChannel {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| QuotaError::Alert(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| QuotaError::Alert(format!("webhook request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(QuotaError::Alert(format!("webhook returned HTTP {status}")));
        }
        Ok(())
    }
}

/// Consumes run summaries and fires alerts.
pub struct AlertNotifier {
    policy: AlertPolicy,
    channel: Arc<dyn AlertChannel>,
}

impl AlertNotifier {
    pub fn new(policy: AlertPolicy, channel: Arc<dyn AlertChannel>) -> Self {
        Self { policy, channel }
    }

    /// Evaluate one summary and deliver an alert if needed.
    ///
    /// Returns the alert that was raised, whether or not delivery worked.
    pub async fn handle(&self, summary: &JobSummary) -> Option<Alert> {
        let alert = self.policy.evaluate(summary)?;
        match self.channel.send(&alert).await {
            Ok(()) => info!(job_id = %alert.job_id, "reset failure alert sent"),
            Err(e) => warn!(
                job_id = %alert.job_id,
                error = %e,
                "failed to deliver reset failure alert"
            ),
        }
        Some(alert)
    }

    /// Handle summaries until every sender is dropped.
    pub fn spawn(self, mut rx: mpsc::Receiver<JobSummary>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(summary) = rx.recv().await {
                self.handle(&summary).await;
            }
        })
    }
}
