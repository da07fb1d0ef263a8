//! Runtime configuration.
//!
//! Loaded from `~/.quotagate/config.json`, then overridden by `QUOTAGATE_*`
//! environment variables. Every section is `#[serde(default)]`, so a partial
//! file (or no file at all) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{QuotaError, Result};
use crate::quota::{JsonlAuditLog, PeriodPolicy};
use crate::scheduler::{AlertPolicy, JobConfig};
use crate::store::FileRecordStore;

const ENV_PREFIX: &str = "QUOTAGATE_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub period: PeriodPolicy,
    pub scheduler: SchedulerConfig,
    pub alerts: AlertsConfig,
    pub audit: AuditConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

/// Record directory (one file per user). `None` means `~/.quotagate/records`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub delay_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub concurrency: usize,
    pub budget_secs: Option<u64>,
    /// Seconds between runs of the periodic reset loop.
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let job = JobConfig::default();
        Self {
            batch_size: job.batch_size,
            delay_ms: job.delay_ms,
            max_retries: job.max_retries,
            base_backoff_ms: job.base_backoff_ms,
            concurrency: job.concurrency,
            budget_secs: job.budget_secs,
            interval_secs: 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            batch_size: self.batch_size,
            delay_ms: self.delay_ms,
            max_retries: self.max_retries,
            base_backoff_ms: self.base_backoff_ms,
            concurrency: self.concurrency,
            budget_secs: self.budget_secs,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub failure_threshold: f64,
    pub sample_size: usize,
    /// POST alerts here. Without it alerts only go to the log.
    pub webhook_url: Option<String>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        let policy = AlertPolicy::default();
        Self {
            failure_threshold: policy.failure_threshold,
            sample_size: policy.sample_size,
            webhook_url: None,
        }
    }
}

impl AlertsConfig {
    pub fn policy(&self) -> AlertPolicy {
        AlertPolicy {
            failure_threshold: self.failure_threshold,
            sample_size: self.sample_size,
        }
    }
}

/// Admin audit trail location. `None` means `~/.quotagate/audit.jsonl`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Directory holding config, records, and the audit log.
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".quotagate")
    }

    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default path and apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load from `path` and apply environment overrides. A missing file is
    /// not an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&content).map_err(|e| {
                QuotaError::Config(format!("failed to parse {}: {e}", path.display()))
            })?
        } else {
            Config::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `QUOTAGATE_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("STORE_PATH") {
            self.store.path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("AUDIT_PATH") {
            self.audit.path = Some(PathBuf::from(v));
        }
        override_parsed(&var, "PERIOD_LENGTH_HOURS", &mut self.period.length_hours);
        override_parsed(&var, "PERIOD_ANCHOR_HOUR_UTC", &mut self.period.anchor_hour_utc);
        override_parsed(&var, "SCHEDULER_BATCH_SIZE", &mut self.scheduler.batch_size);
        override_parsed(&var, "SCHEDULER_DELAY_MS", &mut self.scheduler.delay_ms);
        override_parsed(&var, "SCHEDULER_MAX_RETRIES", &mut self.scheduler.max_retries);
        override_parsed(
            &var,
            "SCHEDULER_BASE_BACKOFF_MS",
            &mut self.scheduler.base_backoff_ms,
        );
        override_parsed(&var, "SCHEDULER_CONCURRENCY", &mut self.scheduler.concurrency);
        override_parsed(&var, "SCHEDULER_INTERVAL_SECS", &mut self.scheduler.interval_secs);
        if let Some(v) = var("SCHEDULER_BUDGET_SECS") {
            match v.parse() {
                Ok(secs) => self.scheduler.budget_secs = Some(secs),
                Err(_) => warn!(value = %v, "ignoring invalid QUOTAGATE_SCHEDULER_BUDGET_SECS"),
            }
        }
        override_parsed(
            &var,
            "ALERTS_FAILURE_THRESHOLD",
            &mut self.alerts.failure_threshold,
        );
        override_parsed(&var, "ALERTS_SAMPLE_SIZE", &mut self.alerts.sample_size);
        if let Some(v) = var("ALERTS_WEBHOOK_URL") {
            self.alerts.webhook_url = (!v.trim().is_empty()).then_some(v);
        }
        override_parsed(&var, "HEALTH_ENABLED", &mut self.health.enabled);
        if let Some(v) = var("HEALTH_HOST") {
            self.health.host = v;
        }
        override_parsed(&var, "HEALTH_PORT", &mut self.health.port);
        if let Some(v) = var("LOG_FORMAT") {
            match v.to_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "pretty" => self.logging.format = LogFormat::Pretty,
                other => warn!(value = other, "ignoring unknown QUOTAGATE_LOG_FORMAT"),
            }
        }
        if let Some(v) = var("LOG_FILTER") {
            self.logging.filter = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.period.validate()?;
        self.scheduler.job_config().validate()?;
        let threshold = self.alerts.failure_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(QuotaError::Config(format!(
                "alerts.failure_threshold must be between 0 and 1, got {threshold}"
            )));
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(FileRecordStore::default_path)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.audit
            .path
            .clone()
            .unwrap_or_else(JsonlAuditLog::default_path)
    }
}

fn override_parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(raw) = var(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(
                var = %format!("{ENV_PREFIX}{name}"),
                value = %raw,
                "ignoring unparsable override"
            ),
        }
    }
}
