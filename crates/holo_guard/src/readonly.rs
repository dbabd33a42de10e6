//! Readonly engagement on the local node and its propagation to peers.
//!
//! The primary's readonly lock is ground truth. It is engaged either by
//! quarantine or by the disk watchdog calling [`enable_readonly`]. Peers are
//! told immediately through [`broadcast_readonly`], and standbys also poll the
//! primary (see `monitor::readonly_mirror`), so a missed push converges within
//! one poll interval.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::directory::fetch_topology;
use crate::error::{is_cancelled, with_cancel, ReadonlyVerificationFailed};
use crate::node::NodeState;
use crate::sql::SqlSession;

/// Databases that stay writable regardless of fencing.
pub const SYSTEM_DATABASES: &[&str] = &["postgres", "repmgr"];

pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES.contains(&name)
}

/// Non-system databases on the session's node.
pub async fn user_databases(session: &dyn SqlSession) -> Result<Vec<String>> {
    Ok(session
        .databases()
        .await?
        .into_iter()
        .filter(|db| !is_system_database(db))
        .collect())
}

/// Sets the readonly default on every user database; returns the databases touched.
pub async fn set_local_readonly(session: &dyn SqlSession, enabled: bool) -> Result<Vec<String>> {
    let databases = user_databases(session).await?;
    for db in &databases {
        session.set_database_readonly(db, enabled).await?;
    }
    Ok(databases)
}

/// `true` only if every user database defaults to read-only.
pub async fn local_readonly_state(session: &dyn SqlSession) -> Result<bool> {
    for db in user_databases(session).await? {
        if !session.database_readonly(&db).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Reads the readonly default back and fails hard on any writable database.
pub async fn verify_local_readonly(session: &dyn SqlSession, databases: &[String]) -> Result<()> {
    for db in databases {
        if !session.database_readonly(db).await? {
            return Err(ReadonlyVerificationFailed {
                database: db.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Peers notified and peers that could not be reached.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub notified: Vec<String>,
    pub failed: Vec<String>,
}

/// Pushes the readonly flag to every other registered member.
///
/// Per-peer failures are logged and counted; the pollers on the standbys are
/// the fallback path.
pub async fn broadcast_readonly(
    node: &NodeState,
    session: &dyn SqlSession,
    enabled: bool,
    cancel: &CancellationToken,
) -> Result<BroadcastReport> {
    let topology = with_cancel(cancel, fetch_topology(session)).await?;
    let mut report = BroadcastReport::default();
    for peer in topology.peers_of(&node.hostname) {
        match with_cancel(cancel, node.peers.set_readonly(&peer.hostname, enabled)).await {
            Ok(()) => report.notified.push(peer.hostname.clone()),
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                node.metrics.record_broadcast_failure();
                tracing::warn!(
                    peer = %peer.hostname,
                    enabled,
                    error = ?err,
                    "readonly broadcast to peer failed"
                );
                report.failed.push(peer.hostname.clone());
            }
        }
    }
    Ok(report)
}

/// Engages readonly: lock file, local databases, then peers.
pub async fn enable_readonly(node: &NodeState, cancel: &CancellationToken) -> Result<BroadcastReport> {
    node.fence.write_readonly_lock()?;
    let session = with_cancel(cancel, node.local_session()).await?;
    let databases = with_cancel(cancel, set_local_readonly(session.as_ref(), true)).await?;
    with_cancel(cancel, verify_local_readonly(session.as_ref(), &databases)).await?;
    tracing::info!(databases = databases.len(), "readonly engaged");
    broadcast_readonly(node, session.as_ref(), true, cancel).await
}

/// Releases the readonly lock. Databases stay read-only while a zombie lock
/// remains; returns whether writes were actually re-enabled.
pub async fn disable_readonly(node: &NodeState, cancel: &CancellationToken) -> Result<bool> {
    node.fence.remove_readonly_lock()?;
    if !node.fence.state()?.allows_writes() {
        tracing::info!("readonly lock removed but zombie lock still held; staying read-only");
        return Ok(false);
    }
    let session = with_cancel(cancel, node.local_session()).await?;
    with_cancel(cancel, set_local_readonly(session.as_ref(), false)).await?;
    tracing::info!("readonly released");
    broadcast_readonly(node, session.as_ref(), false, cancel).await?;
    Ok(true)
}
