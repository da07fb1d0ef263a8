//! Background period resets and failure alerting.

pub mod job;
pub mod notifier;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::QuotaError;

pub use job::{JobConfig, JobState, JobSummary, ResetFailure, ResetScheduler};
pub use notifier::{
    Alert, AlertChannel, AlertNotifier, AlertPolicy, LogAlertChannel, WebhookAlertChannel,
};

/// Run the reset job every `interval` until `shutdown` is cancelled.
///
/// The first run starts immediately so records that fell due while the
/// process was down are caught up at startup.
pub fn spawn_reset_loop(
    scheduler: Arc<ResetScheduler>,
    config: JobConfig,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "reset scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reset scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match scheduler.run_reset_job(&config).await {
                        Ok(_) => {}
                        Err(QuotaError::JobAlreadyRunning) => {
                            warn!("previous reset run still in progress; skipping tick");
                        }
                        Err(e) => warn!(error = %e, "reset run failed to start"),
                    }
                }
            }
        }
    })
}
