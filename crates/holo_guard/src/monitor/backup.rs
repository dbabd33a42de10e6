//! Full-backup cadence and archive retention, primary only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backup::{
    calculate_next_backup_time, last_completed, perform_backup, BackupParams, BackupTool,
    RetryPolicy,
};
use crate::error::{is_cancelled, with_cancel};
use crate::monitor::Monitor;
use crate::node::NodeState;

/// Wait used when the node is not primary or the backup list is unavailable.
pub const DEFAULT_RECHECK: Duration = Duration::from_secs(5 * 60);

/// Re-evaluates on a dynamic timer: the delay until the next full backup is
/// due, woken early when the configured frequency changes.
pub struct BackupScheduler {
    node: Arc<NodeState>,
    tool: Arc<dyn BackupTool>,
    frequency: watch::Receiver<Duration>,
    retry: RetryPolicy,
    recheck: Duration,
}

impl BackupScheduler {
    pub fn new(
        node: Arc<NodeState>,
        tool: Arc<dyn BackupTool>,
        frequency: watch::Receiver<Duration>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            node,
            tool,
            frequency,
            retry,
            recheck: DEFAULT_RECHECK,
        }
    }

    /// One evaluation; returns how long to wait before the next one.
    ///
    /// Exhausted retries are logged and the schedule advances by one full
    /// frequency, so a broken tool is not hammered.
    pub async fn evaluate(&self, cancel: &CancellationToken) -> Result<Duration> {
        let node = &self.node;
        if !with_cancel(cancel, node.local_role()).await?.is_primary() {
            return Ok(self.recheck);
        }

        let frequency = *self.frequency.borrow();
        let backups = match with_cancel(cancel, self.tool.list_completed_backups()).await {
            Ok(backups) => backups,
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                tracing::warn!(error = ?err, "failed to list completed backups; rechecking later");
                return Ok(self.recheck);
            }
        };

        let now = Utc::now();
        let next_due = calculate_next_backup_time(last_completed(&backups), frequency, now);
        if next_due > chrono::TimeDelta::zero() {
            return Ok(next_due.to_std().unwrap_or(frequency));
        }

        tracing::info!(overdue_by = %(-next_due), "full backup due");
        let params = BackupParams {
            immediate_checkpoint: backups.is_empty(),
            name: Some(format!("scheduled-{}", now.format("%Y%m%dT%H%M%S"))),
        };
        match perform_backup(self.tool.as_ref(), &params, self.retry, &node.metrics, cancel).await
        {
            Ok(_) => node.metrics.record_backup(true),
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                node.metrics.record_backup(false);
                tracing::error!(error = %err, "full backup abandoned until next scheduled run");
            }
        }
        Ok(frequency)
    }

    /// Runs until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(frequency = ?*self.frequency.borrow(), "backup scheduler started");
        let mut frequency_live = true;
        loop {
            let wait = match with_cancel(&cancel, self.evaluate(&cancel)).await {
                Ok(wait) => wait,
                Err(err) if is_cancelled(&err) => break,
                Err(err) => {
                    tracing::warn!(error = ?err, "backup scheduler evaluation failed");
                    self.recheck
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = self.frequency.changed(), if frequency_live => {
                    match changed {
                        Ok(()) => tracing::info!("full backup frequency changed"),
                        // Sender gone: keep the last value and stop watching.
                        Err(_) => frequency_live = false,
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!("backup scheduler stopped");
        Ok(())
    }
}

/// Applies the archive retention policy on a fixed interval.
pub struct RetentionMonitor {
    node: Arc<NodeState>,
    tool: Arc<dyn BackupTool>,
    interval: Duration,
}

impl RetentionMonitor {
    pub fn new(node: Arc<NodeState>, tool: Arc<dyn BackupTool>, interval: Duration) -> Self {
        Self {
            node,
            tool,
            interval,
        }
    }

    /// Returns whether pruning ran.
    pub async fn prune(&self, cancel: &CancellationToken) -> Result<bool> {
        if !with_cancel(cancel, self.node.local_role()).await?.is_primary() {
            return Ok(false);
        }
        with_cancel(cancel, self.tool.prune_archive()).await?;
        self.node.metrics.record_retention_run();
        tracing::info!("backup retention policy applied");
        Ok(true)
    }
}

#[async_trait]
impl Monitor for RetentionMonitor {
    fn name(&self) -> &'static str {
        "backup_retention"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.prune(cancel).await.map(|_| ())
    }
}
