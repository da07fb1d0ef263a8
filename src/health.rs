//! Health probes and lock-free quota counters.
//!
//! - [`HealthRegistry`]: named component checks that drive `/ready`
//! - [`QuotaMetrics`]: per-operation counters shared by the engine,
//!   accountant, admin overrides, and reset scheduler
//! - [`start_health_server`]: raw-TCP probe server (`/health`, `/ready`)
//! - [`start_periodic_metrics_flush`]: periodic structured metrics log line

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const METRICS_FLUSH_INTERVAL_SECS: u64 = 60;

/// Name of the store health check.
pub const STORE_CHECK: &str = "store";
/// Name of the reset scheduler health check.
pub const SCHEDULER_CHECK: &str = "reset_scheduler";

// ============================================================================
// HealthStatus / HealthCheck
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    /// Working, but the last run reported failures.
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthCheck {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Ok,
            message: None,
            last_error: None,
        }
    }
}

// ============================================================================
// HealthRegistry
// ============================================================================

/// Registry of named component checks.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HealthRegistry {
    checks: Arc<RwLock<BTreeMap<String, HealthCheck>>>,
    start_time: Instant,
    metrics: Option<Arc<QuotaMetrics>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            checks: Arc::new(RwLock::new(BTreeMap::new())),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Include `metrics` in `/health` responses.
    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a check, replacing any existing one with the same name.
    pub fn register(&self, check: HealthCheck) {
        self.write().insert(check.name.clone(), check);
    }

    /// Update a registered check. No-op for unknown names.
    pub fn update(&self, name: &str, status: HealthStatus, message: Option<String>) {
        if let Some(check) = self.write().get_mut(name) {
            check.status = status;
            check.message = message;
        }
    }

    /// Mark a check Down and remember the error. No-op for unknown names.
    pub fn set_error(&self, name: &str, error: &str) {
        if let Some(check) = self.write().get_mut(name) {
            check.status = HealthStatus::Down;
            check.last_error = Some(error.to_string());
        }
    }

    /// Ready unless some check is Down. An empty registry is ready.
    pub fn is_ready(&self) -> bool {
        self.read()
            .values()
            .all(|c| c.status != HealthStatus::Down)
    }

    pub fn status_of(&self, name: &str) -> Option<HealthStatus> {
        self.read().get(name).map(|c| c.status)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// JSON body for `GET /health`.
    pub fn render_health_json(&self) -> serde_json::Value {
        let checks = self.read().clone();
        let degraded = checks.values().any(|c| c.status != HealthStatus::Ok);
        let mut body = json!({
            "status": if !self.is_ready() { "down" } else if degraded { "degraded" } else { "ok" },
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.uptime().as_secs(),
            "checks": checks,
        });
        if let Some(ref m) = self.metrics {
            body["metrics"] = json!(m.snapshot());
        }
        body
    }

    // Poisoning only happens if a writer panicked mid-update; the map is
    // still structurally valid, so keep serving it.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, HealthCheck>> {
        self.checks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, HealthCheck>> {
        self.checks.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// QuotaMetrics
// ============================================================================

/// Lock-free counters for quota operations.
#[derive(Debug, Default)]
pub struct QuotaMetrics {
    checks: AtomicU64,
    denials: AtomicU64,
    warnings: AtomicU64,
    increments: AtomicU64,
    tokens_recorded: AtomicU64,
    adjustments: AtomicU64,
    resets_succeeded: AtomicU64,
    resets_failed: AtomicU64,
    reset_jobs: AtomicU64,
}

/// Point-in-time copy of [`QuotaMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub checks: u64,
    pub denials: u64,
    pub warnings: u64,
    pub increments: u64,
    pub tokens_recorded: u64,
    pub adjustments: u64,
    pub resets_succeeded: u64,
    pub resets_failed: u64,
    pub reset_jobs: u64,
}

impl QuotaMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&self, allowed: bool, warning: bool) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        if !allowed {
            self.denials.fetch_add(1, Ordering::Relaxed);
        }
        if warning {
            self.warnings.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_increment(&self, tokens: u64) {
        self.increments.fetch_add(1, Ordering::Relaxed);
        self.tokens_recorded.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn record_adjustment(&self) {
        self.adjustments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset_job(&self, succeeded: u64, failed: u64) {
        self.reset_jobs.fetch_add(1, Ordering::Relaxed);
        self.resets_succeeded.fetch_add(succeeded, Ordering::Relaxed);
        self.resets_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            increments: self.increments.load(Ordering::Relaxed),
            tokens_recorded: self.tokens_recorded.load(Ordering::Relaxed),
            adjustments: self.adjustments.load(Ordering::Relaxed),
            resets_succeeded: self.resets_succeeded.load(Ordering::Relaxed),
            resets_failed: self.resets_failed.load(Ordering::Relaxed),
            reset_jobs: self.reset_jobs.load(Ordering::Relaxed),
        }
    }

    /// Emit the counters as one structured log line.
    pub fn emit(&self, reason: &str) {
        let s = self.snapshot();
        info!(
            event = "quota_metrics",
            reason,
            checks = s.checks,
            denials = s.denials,
            warnings = s.warnings,
            increments = s.increments,
            tokens_recorded = s.tokens_recorded,
            adjustments = s.adjustments,
            resets_succeeded = s.resets_succeeded,
            resets_failed = s.resets_failed,
            reset_jobs = s.reset_jobs,
            "Quota metrics"
        );
    }
}

// ============================================================================
// Probe server (raw TCP, no web framework)
// ============================================================================

fn route(registry: &HealthRegistry, method: &str, path: &str) -> (&'static str, String) {
    match (method, path) {
        ("GET", "/health") | ("GET", "/healthz") => {
            ("200 OK", registry.render_health_json().to_string())
        }
        ("GET", "/ready") | ("GET", "/readyz") => {
            if registry.is_ready() {
                ("200 OK", json!({"status": "ready"}).to_string())
            } else {
                (
                    "503 Service Unavailable",
                    json!({"status": "not_ready"}).to_string(),
                )
            }
        }
        _ => ("404 Not Found", json!({"error": "not_found"}).to_string()),
    }
}

/// Start the probe server on `host:port`.
///
/// Serves `GET /health` (JSON status, version, uptime, checks, metrics) and
/// `GET /ready` (200 when no check is Down, 503 otherwise) until `shutdown`
/// is cancelled.
pub async fn start_health_server(
    host: &str,
    port: u16,
    registry: HealthRegistry,
    shutdown: CancellationToken,
) -> std::io::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Health server listening");

    let handle = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Health server shutting down");
                    return;
                }
                accepted = listener.accept() => accepted,
            };
            let mut stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Health server accept error");
                    continue;
                }
            };
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                let n = match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                    .await
                {
                    Ok(Ok(n)) => n,
                    _ => return,
                };
                let request = String::from_utf8_lossy(&buf[..n]);
                let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
                let method = parts.next().unwrap_or_default();
                let raw_path = parts.next().unwrap_or_default();
                let path = raw_path.split('?').next().unwrap_or(raw_path);

                let (status_line, body) = route(&registry, method, path);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    Ok((addr, handle))
}

// ============================================================================
// Periodic metrics flush
// ============================================================================

/// Emit metrics every 60 seconds, plus a final `shutdown` line on cancel.
pub fn start_periodic_metrics_flush(
    metrics: Arc<QuotaMetrics>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(METRICS_FLUSH_INTERVAL_SECS));
        interval.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = interval.tick() => metrics.emit("periodic"),
                _ = shutdown.cancelled() => {
                    metrics.emit("shutdown");
                    break;
                }
            }
        }
    })
}
