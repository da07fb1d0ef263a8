//! Long-running service: periodic resets, alerting, and the health probe.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quotagate::config::Config;
use quotagate::health::{
    start_health_server, start_periodic_metrics_flush, HealthCheck, HealthRegistry, QuotaMetrics,
    SCHEDULER_CHECK, STORE_CHECK,
};
use quotagate::scheduler::{spawn_reset_loop, AlertNotifier, ResetScheduler};
use quotagate::store::QuotaRecordStore;

use super::{alert_channel, open_store};

/// Summaries buffered between the scheduler and the notifier.
const SUMMARY_CHANNEL_CAPACITY: usize = 16;

pub(crate) async fn cmd_serve(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let metrics = Arc::new(QuotaMetrics::new());
    let health = HealthRegistry::new().with_metrics(Arc::clone(&metrics));
    health.register(HealthCheck::ok(STORE_CHECK));
    health.register(HealthCheck::ok(SCHEDULER_CHECK));

    match store.all_records().await {
        Ok(records) => info!(
            records = records.len(),
            path = %config.store_path().display(),
            "record store loaded"
        ),
        Err(e) => health.set_error(STORE_CHECK, &e.to_string()),
    }

    let shutdown = CancellationToken::new();

    let (summary_tx, summary_rx) = mpsc::channel(SUMMARY_CHANNEL_CAPACITY);
    let notifier = AlertNotifier::new(config.alerts.policy(), alert_channel(&config)?);
    let notifier_handle = notifier.spawn(summary_rx);

    let scheduler = Arc::new(
        ResetScheduler::new(store, config.period.clone())
            .with_summary_channel(summary_tx)
            .with_metrics(Arc::clone(&metrics))
            .with_health(health.clone())
            .with_shutdown(shutdown.clone()),
    );
    let reset_handle = spawn_reset_loop(
        Arc::clone(&scheduler),
        config.scheduler.job_config(),
        config.scheduler.interval(),
        shutdown.clone(),
    );

    let health_handle = if config.health.enabled {
        let (addr, handle) = start_health_server(
            &config.health.host,
            config.health.port,
            health.clone(),
            shutdown.clone(),
        )
        .await
        .with_context(|| {
            format!(
                "failed to bind health server on {}:{}",
                config.health.host, config.health.port
            )
        })?;
        info!(addr = %addr, "health probe ready");
        Some(handle)
    } else {
        None
    };
    let flush_handle = start_periodic_metrics_flush(Arc::clone(&metrics), shutdown.clone());

    info!(
        interval_secs = config.scheduler.interval_secs,
        batch_size = config.scheduler.batch_size,
        "quotagate serving; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");
    shutdown.cancel();

    if let Err(e) = reset_handle.await {
        warn!(error = %e, "reset loop ended abnormally");
    }
    // Last sender goes with the scheduler, which lets the notifier drain and exit.
    drop(scheduler);
    if let Err(e) = notifier_handle.await {
        warn!(error = %e, "alert notifier ended abnormally");
    }
    if let Some(handle) = health_handle {
        let _ = handle.await;
    }
    let _ = flush_handle.await;
    info!("quotagate stopped");
    Ok(())
}
