//! Long-lived supervision loops.
//!
//! Each monitor owns its bookkeeping and is driven by its own ticker. Ticks
//! never overlap: a slow tick delays the next one instead of being skipped.
//! A failed tick is logged and counted; the next tick is the retry. A tick
//! still in flight when cancellation fires is dropped at its next await.

pub mod backup;
pub mod cluster_state;
pub mod dead_members;
pub mod readonly_mirror;
pub mod replication_slots;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{is_cancelled, with_cancel};
use crate::metrics::GuardMetrics;

pub use backup::{BackupScheduler, RetentionMonitor};
pub use cluster_state::ClusterStateMonitor;
pub use dead_members::DeadMemberReaper;
pub use readonly_mirror::ReadonlyMirror;
pub use replication_slots::ReplicationSlotReaper;

/// A fixed-interval monitor.
#[async_trait]
pub trait Monitor: Send {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;
    /// One evaluation. Errors abandon this tick only.
    async fn tick(&mut self, cancel: &CancellationToken) -> Result<()>;
}

/// Drives `monitor` until `cancel` fires. The first tick runs immediately.
pub async fn run_monitor<M>(
    mut monitor: M,
    metrics: Arc<GuardMetrics>,
    cancel: CancellationToken,
) -> Result<()>
where
    M: Monitor,
{
    let name = monitor.name();
    let mut ticker = tokio::time::interval(monitor.interval().max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(monitor = name, interval = ?monitor.interval(), "monitor started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match with_cancel(&cancel, monitor.tick(&cancel)).await {
            Ok(()) => metrics.record_tick(true),
            Err(err) if is_cancelled(&err) => break,
            Err(err) => {
                metrics.record_tick(false);
                tracing::warn!(monitor = name, error = ?err, "monitor tick failed");
            }
        }
    }
    tracing::info!(monitor = name, "monitor stopped");
    Ok(())
}
