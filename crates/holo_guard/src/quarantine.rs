//! Fencing a suspect primary, and lifting the fence once diagnosis is clean.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::error::{is_cancelled, with_cancel};
use crate::node::NodeState;
use crate::readonly::{broadcast_readonly, set_local_readonly, verify_local_readonly, BroadcastReport};
use crate::sql::SqlSession;

/// What a quarantine pass did.
#[derive(Debug, Default)]
pub struct QuarantineReport {
    /// Upstream the pooler was pointed at, if any.
    pub redirected_to: Option<String>,
    /// Pooler reconfiguration error; does not abort quarantine.
    pub pooler_error: Option<String>,
    /// Databases forced read-only and verified.
    pub databases: Vec<String>,
    pub broadcast: BroadcastReport,
}

/// Fences this node. `discovered_primary` may be empty when diagnosis was
/// undecided. Idempotent: running it every tick while fenced is expected.
pub async fn quarantine(
    node: &NodeState,
    session: &dyn SqlSession,
    discovered_primary: &str,
    cancel: &CancellationToken,
) -> Result<QuarantineReport> {
    let mut report = QuarantineReport::default();

    let discovered = discovered_primary.trim();
    if !discovered.is_empty() && discovered != node.hostname {
        match with_cancel(cancel, node.pooler.set_upstream(discovered)).await {
            Ok(()) => report.redirected_to = Some(discovered.to_string()),
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                node.metrics.record_pooler_failure();
                tracing::warn!(
                    upstream = %discovered,
                    error = ?err,
                    "failed to redirect pooler toward discovered primary"
                );
                report.pooler_error = Some(format!("{err:#}"));
            }
        }
    }

    node.fence.write_zombie_lock(discovered)?;

    report.databases = with_cancel(cancel, set_local_readonly(session, true))
        .await
        .context("force user databases read-only")?;
    report.broadcast = broadcast_readonly(node, session, true, cancel).await?;
    with_cancel(cancel, verify_local_readonly(session, &report.databases)).await?;

    node.metrics.record_quarantine();
    tracing::warn!(
        deferred_to = %discovered,
        databases = report.databases.len(),
        "node quarantined as suspect primary"
    );
    Ok(report)
}

/// Removes the zombie lock and, if nothing else holds the node read-only,
/// re-enables writes locally and on peers. Returns whether writes came back.
pub async fn clear_quarantine(
    node: &NodeState,
    session: &dyn SqlSession,
    cancel: &CancellationToken,
) -> Result<bool> {
    node.fence.remove_zombie_lock()?;
    node.metrics.record_quarantine_cleared();

    let state = node.fence.state()?;
    if !state.allows_writes() {
        tracing::info!(state = ?state, "zombie lock cleared; readonly lock still held");
        return Ok(false);
    }

    with_cancel(cancel, set_local_readonly(session, false))
        .await
        .context("release user databases from read-only")?;
    broadcast_readonly(node, session, false, cancel).await?;
    tracing::info!("quarantine cleared; diagnosis confirmed this node as primary");
    Ok(true)
}
