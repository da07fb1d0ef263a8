//! Quota command handlers.

use std::sync::Arc;

use anyhow::{Context, Result};

use quotagate::config::Config;
use quotagate::error::QuotaError;
use quotagate::quota::{
    AdminOverrides, AuditEntry, DecisionEngine, GlobalStats, JsonlAuditLog, PlanType,
    Provisioner, QuotaAdjustment, QuotaStatus, StatsAggregator, UsageAccountant,
};
use quotagate::scheduler::{AlertNotifier, JobSummary, ResetScheduler};

use super::{alert_channel, open_store};

/// Map a missing record to the "no entitlement" message the CLI promises.
fn user_error(err: QuotaError, user_id: &str) -> anyhow::Error {
    match err {
        QuotaError::NotFound(_) => {
            anyhow::anyhow!("no entitlement: user '{}' has no AI quota record", user_id)
        }
        other => anyhow::Error::new(other),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One-line verdict used by `check` and `adjust`.
fn verdict(status: &QuotaStatus) -> String {
    match (status.allowed, status.deny_reason) {
        (true, _) if status.warning => "allowed (approaching limit)".to_string(),
        (true, _) => "allowed".to_string(),
        (false, Some(reason)) => format!(
            "quota exceeded ({})",
            serde_json::to_value(reason)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        ),
        (false, None) => "quota exceeded".to_string(),
    }
}

fn print_status(status: &QuotaStatus) {
    println!("User:      {}", status.user_id);
    println!("Decision:  {}", verdict(status));
    println!("Plan:      {} ({} cap)", status.plan_type, status.cap_mode);
    println!(
        "Requests:  {}/{} ({:.0}%)",
        status.requests_used, status.daily_request_limit, status.requests_percentage_display
    );
    println!(
        "Tokens:    {}/{} ({:.0}%)",
        status.tokens_used, status.daily_token_limit, status.tokens_percentage_display
    );
    println!("Resets at: {}", status.quota_reset_at.to_rfc3339());
}

fn print_stats(stats: &GlobalStats) {
    println!("{:<20} {}", "Total users", stats.total_users);
    println!("{:<20} {}", "Active this period", stats.active_today);
    println!("{:<20} {}", "Quota exceeded", stats.quota_exceeded);
    println!("{:<20} {:.2}", "Avg requests used", stats.avg_requests_used);
    println!("{:<20} {}", "Due for reset", stats.due_for_reset);
    if !stats.by_plan.is_empty() {
        println!();
        println!("{:<12} {}", "Plan", "Users");
        println!("{}", "-".repeat(20));
        for plan in PlanType::ALL {
            if let Some(count) = stats.by_plan.get(&plan) {
                println!("{:<12} {}", plan.as_str(), count);
            }
        }
    }
}

fn print_summary(summary: &JobSummary) {
    println!("Job:         {}", summary.job_id);
    println!(
        "Reset:       {} of {} ({} failed, {} skipped)",
        summary.success, summary.total_users, summary.failed, summary.skipped
    );
    println!("Duration:    {} ms", summary.duration_ms);
    if summary.budget_exceeded {
        println!("Budget:      exceeded, remaining users left for the next run");
    }
    if let Some(ref err) = summary.query_error {
        println!("Query error: {}", err);
    }
    if !summary.errors.is_empty() {
        println!();
        println!("{:<24} {:<9} {}", "User", "Attempts", "Error");
        println!("{}", "-".repeat(60));
        for failure in &summary.errors {
            println!(
                "{:<24} {:<9} {}",
                failure.user_id, failure.attempts, failure.error
            );
        }
    }
}

/// Compact `field=value` list of what an override changed.
fn describe_adjustment(adjustment: &QuotaAdjustment) -> String {
    let mut parts = Vec::new();
    if let Some(requests) = adjustment.requests {
        parts.push(format!("requests={requests}"));
    }
    if let Some(tokens) = adjustment.tokens {
        parts.push(format!("tokens={tokens}"));
    }
    if let Some(ref mode) = adjustment.cap_mode {
        parts.push(format!("cap_mode={mode}"));
    }
    if adjustment.reset_now == Some(true) {
        parts.push("reset_now".to_string());
    }
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(" ")
    }
}

fn print_audit(entries: &[AuditEntry]) {
    if entries.is_empty() {
        println!("No admin overrides recorded.");
        return;
    }
    println!("{:<26} {:<16} {:<24} {}", "Time", "Admin", "User", "Changes");
    println!("{}", "-".repeat(80));
    for entry in entries {
        println!(
            "{:<26} {:<16} {:<24} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.admin_id,
            entry.user_id,
            describe_adjustment(&entry.adjustment)
        );
    }
}

pub(crate) async fn cmd_provision(config: &Config, user_id: &str, plan: PlanType) -> Result<()> {
    let store = open_store(config)?;
    let record = Provisioner::new(store, config.period.clone())
        .provision(user_id, plan)
        .await
        .with_context(|| format!("failed to provision '{}'", user_id))?;
    println!(
        "Provisioned {} on {} ({} requests, {} tokens per period, first reset {})",
        record.user_id,
        record.plan_type,
        record.daily_request_limit,
        record.daily_token_limit,
        record.quota_reset_at.to_rfc3339()
    );
    Ok(())
}

pub(crate) async fn cmd_check(config: &Config, user_id: &str, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let status = DecisionEngine::new(store)
        .check(user_id)
        .await
        .map_err(|e| user_error(e, user_id))?;
    if json {
        print_json(&status)
    } else {
        print_status(&status);
        Ok(())
    }
}

pub(crate) async fn cmd_record(config: &Config, user_id: &str, tokens: i64) -> Result<()> {
    let store = open_store(config)?;
    UsageAccountant::new(store)
        .increment(user_id, tokens)
        .await
        .map_err(|e| user_error(e, user_id))?;
    println!("Recorded 1 request and {} tokens for {}", tokens, user_id);
    Ok(())
}

pub(crate) async fn cmd_adjust(
    config: &Config,
    user_id: &str,
    adjustment: &QuotaAdjustment,
    admin_id: &str,
    json: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let audit = Arc::new(JsonlAuditLog::new(config.audit_path()));
    let status = AdminOverrides::new(store, audit, config.period.clone())
        .adjust_quota(user_id, adjustment, admin_id)
        .await
        .map_err(|e| user_error(e, user_id))?;
    if json {
        print_json(&status)
    } else {
        print_status(&status);
        Ok(())
    }
}

pub(crate) async fn cmd_reset(config: &Config, user_id: &str) -> Result<()> {
    let store = open_store(config)?;
    ResetScheduler::new(store, config.period.clone())
        .reset_user(user_id)
        .await
        .map_err(|e| user_error(e, user_id))?;
    println!("Reset quota usage for: {}", user_id);
    Ok(())
}

pub(crate) async fn cmd_stats(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let stats = StatsAggregator::new(store)
        .global_stats()
        .await
        .context("failed to aggregate quota stats")?;
    if json {
        print_json(&stats)
    } else {
        print_stats(&stats);
        Ok(())
    }
}

pub(crate) async fn cmd_audit(config: &Config, user_id: Option<&str>, json: bool) -> Result<()> {
    let path = config.audit_path();
    let mut entries = JsonlAuditLog::new(path.clone())
        .read_all()
        .await
        .with_context(|| format!("failed to read audit log at {}", path.display()))?;
    if let Some(user_id) = user_id {
        entries.retain(|entry| entry.user_id == user_id);
    }
    if json {
        print_json(&entries)
    } else {
        print_audit(&entries);
        Ok(())
    }
}

pub(crate) async fn cmd_run_reset_job(
    config: &Config,
    budget_secs: Option<u64>,
    json: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let mut job = config.scheduler.job_config();
    if budget_secs.is_some() {
        job.budget_secs = budget_secs;
    }
    let summary = ResetScheduler::new(store, config.period.clone())
        .run_reset_job(&job)
        .await?;
    AlertNotifier::new(config.alerts.policy(), alert_channel(config)?)
        .handle(&summary)
        .await;
    if json {
        print_json(&summary)
    } else {
        print_summary(&summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotagate::quota::DenyReason;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.store.path = Some(dir.path().join("records"));
        config.audit.path = Some(dir.path().join("audit.jsonl"));
        config
    }

    #[test]
    fn test_missing_record_reads_as_no_entitlement() {
        let err = user_error(QuotaError::NotFound("ghost".into()), "ghost");
        assert!(err.to_string().starts_with("no entitlement"));
        let err = user_error(QuotaError::Validation("bad".into()), "ghost");
        assert!(!err.to_string().contains("entitlement"));
    }

    #[tokio::test]
    async fn test_commands_share_on_disk_store() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        cmd_provision(&config, "alice", PlanType::Free).await.unwrap();
        cmd_record(&config, "alice", 1_200).await.unwrap();

        let status = DecisionEngine::new(open_store(&config).unwrap())
            .check("alice")
            .await
            .unwrap();
        assert_eq!(status.requests_used, 1);
        assert_eq!(status.tokens_used, 1_200);

        let adjustment = QuotaAdjustment {
            requests: Some(0),
            ..Default::default()
        };
        cmd_adjust(&config, "alice", &adjustment, "ops", true)
            .await
            .unwrap();
        let status = DecisionEngine::new(open_store(&config).unwrap())
            .check("alice")
            .await
            .unwrap();
        assert_eq!(status.deny_reason, Some(DenyReason::RequestsExhausted));

        let audit = JsonlAuditLog::new(config.audit_path()).read_all().await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].admin_id, "ops");
    }

    #[tokio::test]
    async fn test_concurrent_record_commands_keep_every_call() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        cmd_provision(&config, "alice", PlanType::Pro).await.unwrap();

        // Each command opens its own store handle, like separate processes.
        let (first, second) = tokio::join!(
            cmd_record(&config, "alice", 100),
            cmd_record(&config, "alice", 100)
        );
        first.unwrap();
        second.unwrap();

        let status = DecisionEngine::new(open_store(&config).unwrap())
            .check("alice")
            .await
            .unwrap();
        assert_eq!(status.requests_used, 2);
        assert_eq!(status.tokens_used, 200);
    }

    #[tokio::test]
    async fn test_audit_lists_overrides_per_user() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        cmd_audit(&config, None, false).await.unwrap();

        for user in ["alice", "bob"] {
            cmd_provision(&config, user, PlanType::Basic).await.unwrap();
            let adjustment = QuotaAdjustment {
                tokens: Some(90_000),
                ..Default::default()
            };
            cmd_adjust(&config, user, &adjustment, "ops", true)
                .await
                .unwrap();
        }
        cmd_audit(&config, Some("bob"), true).await.unwrap();

        let entries = JsonlAuditLog::new(config.audit_path()).read_all().await.unwrap();
        let users: Vec<&str> = entries.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(users, vec!["alice", "bob"]);
    }

    #[test]
    fn test_describe_adjustment() {
        let adjustment = QuotaAdjustment {
            requests: Some(40),
            reset_now: Some(true),
            cap_mode: Some("soft".into()),
            ..Default::default()
        };
        assert_eq!(
            describe_adjustment(&adjustment),
            "requests=40 cap_mode=soft reset_now"
        );
        assert_eq!(describe_adjustment(&QuotaAdjustment::default()), "-");
    }

    #[tokio::test]
    async fn test_check_unknown_user_fails_with_entitlement_message() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let err = cmd_check(&config, "nobody", false).await.unwrap_err();
        assert!(err.to_string().contains("no entitlement"));
    }

    #[test]
    fn test_verdict_text() {
        let mut status = QuotaStatus {
            user_id: "u".into(),
            allowed: false,
            warning: false,
            deny_reason: Some(DenyReason::TokensExhausted),
            requests_used: 1,
            requests_remaining: 9,
            requests_percentage: 10.0,
            requests_percentage_display: 10.0,
            tokens_used: 50_000,
            tokens_remaining: 0,
            tokens_percentage: 100.0,
            tokens_percentage_display: 100.0,
            cap_mode: quotagate::quota::CapMode::Hard,
            plan_type: PlanType::Free,
            daily_request_limit: 10,
            daily_token_limit: 50_000,
            quota_reset_at: chrono::Utc::now(),
        };
        assert_eq!(verdict(&status), "quota exceeded (tokens_exhausted)");
        status.allowed = true;
        status.deny_reason = None;
        status.warning = true;
        assert_eq!(verdict(&status), "allowed (approaching limit)");
    }
}
