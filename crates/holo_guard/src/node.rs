//! Shared, read-only node context handed to every monitor.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::directory::{fetch_topology, Topology};
use crate::fence::{FenceLedger, FenceState};
use crate::member::Role;
use crate::metrics::GuardMetrics;
use crate::peer::PeerClient;
use crate::pooler::PoolerControl;
use crate::sql::{SqlConnector, SqlSession};

/// Identity plus the collaborators the monitors call out to.
///
/// Nothing in here is mutated by the monitors except through the fence ledger
/// (which is persisted) and the metrics counters.
pub struct NodeState {
    /// Catalog hostname of this node.
    pub hostname: String,
    pub connector: Arc<dyn SqlConnector>,
    pub peers: Arc<dyn PeerClient>,
    pub pooler: Arc<dyn PoolerControl>,
    pub fence: FenceLedger,
    pub metrics: Arc<GuardMetrics>,
}

impl NodeState {
    /// Opens a session against this node.
    pub async fn local_session(&self) -> Result<Box<dyn SqlSession>> {
        self.connector
            .connect(&self.hostname)
            .await
            .with_context(|| format!("connect to local node {}", self.hostname))
    }

    /// Re-reads the catalog and returns this node's current role.
    pub async fn local_role(&self) -> Result<Role> {
        let session = self.local_session().await?;
        let topology = fetch_topology(session.as_ref()).await?;
        Ok(topology.role_of(&self.hostname))
    }

    /// Fresh topology plus the session it was read through.
    pub async fn local_topology(&self) -> Result<(Box<dyn SqlSession>, Topology)> {
        let session = self.local_session().await?;
        let topology = fetch_topology(session.as_ref()).await?;
        Ok((session, topology))
    }
}

/// Issues the registration certificate once this node shows up in the catalog.
///
/// Returns `true` when the node is (now) known to be registered.
pub async fn ensure_registration(node: &NodeState) -> Result<bool> {
    if node.fence.is_registered()? {
        return Ok(true);
    }
    let (_session, topology) = node.local_topology().await?;
    if topology.member(&node.hostname).is_none() {
        tracing::info!(hostname = %node.hostname, "node not yet registered in replication catalog");
        return Ok(false);
    }
    node.fence.issue_registration_certificate(&node.hostname)?;
    tracing::info!(hostname = %node.hostname, "registration certificate issued");
    Ok(true)
}

/// Logs any fencing state carried over from a previous run.
pub fn report_startup_fence(node: &NodeState) -> Result<FenceState> {
    let state = node.fence.state()?;
    match &state {
        FenceState::Unfenced => {}
        FenceState::ReadOnly => {
            tracing::warn!("readonly lock present at startup; user databases stay read-only");
        }
        FenceState::Zombie { deferred_to } => {
            tracing::warn!(
                deferred_to = deferred_to.as_deref().unwrap_or(""),
                "zombie lock present at startup; node remains quarantined until diagnosis confirms it"
            );
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{member, FakeCluster};

    #[tokio::test]
    async fn registration_certificate_is_issued_once_registered() {
        let cluster = FakeCluster::new(vec![member(2, "host-2", Role::Standby)]);
        let node = cluster.node("host-1");

        assert!(!ensure_registration(&node).await.unwrap());
        assert!(!node.fence.is_registered().unwrap());

        cluster.add_member(member(1, "host-1", Role::Primary));
        assert!(ensure_registration(&node).await.unwrap());
        assert!(node.fence.is_registered().unwrap());

        // Certificate short-circuits even when the catalog is unreachable.
        cluster.set_unreachable("host-1");
        assert!(ensure_registration(&node).await.unwrap());
    }

    #[tokio::test]
    async fn local_role_rereads_catalog() {
        let cluster = FakeCluster::new(vec![member(1, "host-1", Role::Primary)]);
        let node = cluster.node("host-1");
        assert_eq!(node.local_role().await.unwrap(), Role::Primary);
        cluster.set_role("host-1", Role::Standby);
        assert_eq!(node.local_role().await.unwrap(), Role::Standby);
    }

    #[test]
    fn startup_report_returns_current_state() {
        let cluster = FakeCluster::new(Vec::new());
        let node = cluster.node("host-1");
        node.fence.write_zombie_lock("host-2").unwrap();
        assert_eq!(
            report_startup_fence(&node).unwrap(),
            FenceState::Zombie {
                deferred_to: Some("host-2".to_string())
            }
        );
    }
}
