//! Command-line interface.

mod quota;
mod serve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use quotagate::config::Config;
use quotagate::quota::PlanType;
use quotagate::scheduler::{AlertChannel, LogAlertChannel, WebhookAlertChannel};
use quotagate::store::FileRecordStore;

#[derive(Parser)]
#[command(name = "quotagate", version, about = "Admission control and usage quotas for AI features")]
pub(crate) struct Cli {
    /// Config file (default: ~/.quotagate/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Create a quota record for a newly entitled user
    Provision {
        user_id: String,
        /// free, basic, pro, or enterprise
        #[arg(long, default_value = "free")]
        plan: PlanType,
    },
    /// Ask whether the user may make an AI call right now
    Check {
        user_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Charge one completed AI call to the user
    Record {
        user_id: String,
        /// Tokens consumed by the call
        #[arg(long, allow_negative_numbers = true)]
        tokens: i64,
    },
    /// Override a user's limits or restart their period
    Adjust {
        user_id: String,
        /// Operator performing the change (recorded in the audit log)
        #[arg(long)]
        admin: String,
        #[arg(long, allow_negative_numbers = true)]
        requests: Option<i64>,
        #[arg(long, allow_negative_numbers = true)]
        tokens: Option<i64>,
        /// hard or soft
        #[arg(long)]
        cap_mode: Option<String>,
        /// Zero usage and start a fresh period now
        #[arg(long)]
        reset_now: bool,
        #[arg(long)]
        json: bool,
    },
    /// Force a fresh period for one user
    Reset { user_id: String },
    /// List recorded admin overrides, oldest first
    Audit {
        /// Only show overrides for this user
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show usage rolled up over every user
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Reset every due user once, then exit
    RunResetJob {
        /// Stop starting new batches after this many seconds
        #[arg(long)]
        budget_secs: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Run the periodic reset loop and health probe until Ctrl-C
    Serve,
}

/// Read the config file named on the command line, or the default one.
pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load config"),
    }
}

/// Run `f` under a temporary warn-level logger.
///
/// Config loading happens before the configured subscriber exists, so its
/// warnings (bad `QUOTAGATE_*` values) would otherwise go nowhere.
pub(crate) fn with_startup_logging<W, T>(make_writer: W, f: impl FnOnce() -> T) -> T
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

pub(crate) fn open_store(config: &Config) -> Result<Arc<FileRecordStore>> {
    let path = config.store_path();
    let store = FileRecordStore::open(&path)
        .with_context(|| format!("failed to open record store at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Webhook delivery when a URL is configured, the error log otherwise.
pub(crate) fn alert_channel(config: &Config) -> Result<Arc<dyn AlertChannel>> {
    match config.alerts.webhook_url {
        Some(ref url) => {
            let channel = WebhookAlertChannel::new(url.as_str())
                .context("failed to set up webhook alert channel")?;
            Ok(Arc::new(channel))
        }
        None => Ok(Arc::new(LogAlertChannel)),
    }
}

pub(crate) async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Provision { user_id, plan } => {
            quota::cmd_provision(&config, &user_id, plan).await
        }
        Commands::Check { user_id, json } => quota::cmd_check(&config, &user_id, json).await,
        Commands::Record { user_id, tokens } => {
            quota::cmd_record(&config, &user_id, tokens).await
        }
        Commands::Adjust {
            user_id,
            admin,
            requests,
            tokens,
            cap_mode,
            reset_now,
            json,
        } => {
            let adjustment = quotagate::quota::QuotaAdjustment {
                requests,
                tokens,
                reset_now: reset_now.then_some(true),
                cap_mode,
            };
            quota::cmd_adjust(&config, &user_id, &adjustment, &admin, json).await
        }
        Commands::Reset { user_id } => quota::cmd_reset(&config, &user_id).await,
        Commands::Audit { user, json } => quota::cmd_audit(&config, user.as_deref(), json).await,
        Commands::Stats { json } => quota::cmd_stats(&config, json).await,
        Commands::RunResetJob { budget_secs, json } => {
            quota::cmd_run_reset_job(&config, budget_secs, json).await
        }
        Commands::Serve => serve::cmd_serve(config).await,
    }
}
