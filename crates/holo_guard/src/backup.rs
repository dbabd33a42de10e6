//! Backup tool port, retry loop, and the barman-cloud adapter.
//!
//! The monitors only interpret success/failure and completion timestamps;
//! upload mechanics belong to the tool.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{is_cancelled, sleep_or_cancel, with_cancel, BackupRetriesExhausted, Cancelled};
use crate::metrics::GuardMetrics;

/// Options for one full backup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupParams {
    /// Request an immediate checkpoint instead of waiting for a spread one.
    pub immediate_checkpoint: bool,
    pub name: Option<String>,
}

/// Result of a successful backup invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupMetadata {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Tool output, kept for logs.
    pub output: String,
}

/// One completed backup as listed by the tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupInfo {
    pub backup_id: String,
    pub name: Option<String>,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Opaque backup service.
#[async_trait]
pub trait BackupTool: Send + Sync {
    async fn backup(&self, params: &BackupParams) -> Result<BackupMetadata>;
    async fn list_completed_backups(&self) -> Result<Vec<BackupInfo>>;
    /// Applies the retention policy to stored backups and WAL.
    async fn prune_archive(&self) -> Result<()>;
}

/// Bounded fixed-delay retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(30),
        }
    }
}

/// Most recent completion time among `backups`.
pub fn last_completed(backups: &[BackupInfo]) -> Option<DateTime<Utc>> {
    backups.iter().filter_map(|b| b.finished_at).max()
}

/// Signed time until the next full backup is due.
///
/// With no completed backup the result is negative, so the very first
/// evaluation triggers an immediate backup.
pub fn calculate_next_backup_time(
    last_completed: Option<DateTime<Utc>>,
    frequency: Duration,
    now: DateTime<Utc>,
) -> TimeDelta {
    let Some(last) = last_completed else {
        return TimeDelta::seconds(-1);
    };
    let frequency = TimeDelta::from_std(frequency).unwrap_or(TimeDelta::MAX);
    match last.checked_add_signed(frequency) {
        Some(due) => due.signed_duration_since(now),
        None => TimeDelta::MAX,
    }
}

/// Runs one full backup with bounded retry. Only cancellation or attempt
/// exhaustion stops the loop.
pub async fn perform_backup(
    tool: &dyn BackupTool,
    params: &BackupParams,
    policy: RetryPolicy,
    metrics: &GuardMetrics,
    cancel: &CancellationToken,
) -> Result<BackupMetadata> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        attempt += 1;
        match with_cancel(cancel, tool.backup(params)).await {
            Ok(meta) => {
                tracing::info!(
                    attempt,
                    finished_at = %meta.finished_at,
                    "full backup completed"
                );
                return Ok(meta);
            }
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                metrics.record_backup_attempt_failed();
                if attempt >= max_attempts {
                    return Err(BackupRetriesExhausted {
                        attempts: attempt,
                        last_error: format!("{err:#}"),
                    }
                    .into());
                }
                tracing::warn!(
                    attempt,
                    max_attempts,
                    retry_in = ?policy.delay,
                    error = ?err,
                    "full backup failed; retrying"
                );
                sleep_or_cancel(cancel, policy.delay).await?;
            }
        }
    }
}

/// barman-cloud invocation settings.
#[derive(Clone, Debug)]
pub struct BarmanConfig {
    /// Directory holding the `barman-cloud-*` executables; `None` uses `PATH`.
    pub bin_dir: Option<PathBuf>,
    /// Object store URL, e.g. `s3://bucket/prefix`.
    pub destination: String,
    pub server_name: String,
    pub endpoint_url: Option<String>,
    /// Retention window, e.g. `7 DAYS`.
    pub recovery_window: String,
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_user: String,
}

/// Drives the barman-cloud CLI.
#[derive(Clone, Debug)]
pub struct BarmanCloud {
    config: BarmanConfig,
}

impl BarmanCloud {
    pub fn new(config: BarmanConfig) -> Self {
        Self { config }
    }

    fn command(&self, program: &str) -> Command {
        let path = match &self.config.bin_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        };
        let mut cmd = Command::new(path);
        cmd.kill_on_drop(true);
        if let Some(endpoint) = &self.config.endpoint_url {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        cmd
    }

    fn target_args(&self, cmd: &mut Command) {
        cmd.arg(&self.config.destination).arg(&self.config.server_name);
    }

    pub fn backup_args(&self, params: &BackupParams) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.config.pg_host.clone(),
            "--port".to_string(),
            self.config.pg_port.to_string(),
            "--user".to_string(),
            self.config.pg_user.clone(),
        ];
        if params.immediate_checkpoint {
            args.push("--immediate-checkpoint".to_string());
        }
        if let Some(name) = &params.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        args
    }
}

async fn run_checked(mut cmd: Command, what: &str) -> Result<String> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("spawn {what}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "{what} exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }
    Ok(stdout)
}

#[async_trait]
impl BackupTool for BarmanCloud {
    async fn backup(&self, params: &BackupParams) -> Result<BackupMetadata> {
        let started_at = Utc::now();
        let mut cmd = self.command("barman-cloud-backup");
        cmd.args(self.backup_args(params));
        self.target_args(&mut cmd);
        let output = run_checked(cmd, "barman-cloud-backup").await?;
        Ok(BackupMetadata {
            started_at,
            finished_at: Utc::now(),
            output,
        })
    }

    async fn list_completed_backups(&self) -> Result<Vec<BackupInfo>> {
        let mut cmd = self.command("barman-cloud-backup-list");
        cmd.arg("--format").arg("json");
        self.target_args(&mut cmd);
        let output = run_checked(cmd, "barman-cloud-backup-list").await?;
        parse_backup_list(&output)
    }

    async fn prune_archive(&self) -> Result<()> {
        let mut cmd = self.command("barman-cloud-backup-delete");
        cmd.arg("--retention-policy")
            .arg(format!("RECOVERY WINDOW OF {}", self.config.recovery_window));
        self.target_args(&mut cmd);
        run_checked(cmd, "barman-cloud-backup-delete").await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct BarmanBackupList {
    #[serde(default)]
    backups_list: Vec<BarmanBackupEntry>,
}

#[derive(Debug, Deserialize)]
struct BarmanBackupEntry {
    backup_id: String,
    #[serde(default)]
    backup_name: Option<String>,
    status: String,
    #[serde(default)]
    begin_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
}

/// Parses `barman-cloud-backup-list --format json`, keeping `DONE` backups.
pub fn parse_backup_list(raw: &str) -> Result<Vec<BackupInfo>> {
    let parsed: BarmanBackupList =
        serde_json::from_str(raw).context("parse barman backup list json")?;
    parsed
        .backups_list
        .into_iter()
        .filter(|entry| entry.status == "DONE")
        .map(|entry| {
            Ok(BackupInfo {
                started_at: entry.begin_time.as_deref().map(parse_barman_time).transpose()?,
                finished_at: entry.end_time.as_deref().map(parse_barman_time).transpose()?,
                backup_id: entry.backup_id,
                name: entry.backup_name,
                status: entry.status,
            })
        })
        .collect()
}

/// Barman prints ctime-style UTC timestamps, e.g. `Sat Jul  1 03:00:00 2023`.
pub fn parse_barman_time(raw: &str) -> Result<DateTime<Utc>> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let naive = NaiveDateTime::parse_from_str(&normalized, "%a %b %d %H:%M:%S %Y")
        .with_context(|| format!("parse barman timestamp '{raw}'"))?;
    Ok(naive.and_utc())
}
