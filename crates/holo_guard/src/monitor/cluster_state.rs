//! Primary self-diagnosis loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::diagnosis::{diagnose, take_dna_sample, Diagnosis, Outcome};
use crate::error::with_cancel;
use crate::member::Member;
use crate::monitor::Monitor;
use crate::node::NodeState;
use crate::quarantine::{clear_quarantine, quarantine};

pub struct ClusterStateMonitor {
    node: Arc<NodeState>,
    interval: Duration,
}

impl ClusterStateMonitor {
    pub fn new(node: Arc<NodeState>, interval: Duration) -> Self {
        Self { node, interval }
    }

    /// One evaluation; `None` when this node is not the primary.
    pub async fn evaluate(&self, cancel: &CancellationToken) -> Result<Option<Diagnosis>> {
        let node = &self.node;
        let (session, topology) = with_cancel(cancel, node.local_topology()).await?;
        let local = topology.local(&node.hostname)?;
        if !local.is_primary() {
            return Ok(None);
        }

        let standbys: Vec<Member> = topology.standbys().cloned().collect();
        let sample = with_cancel(
            cancel,
            take_dna_sample(node.connector.as_ref(), &node.hostname, &standbys),
        )
        .await?;
        let diagnosis = diagnose(&sample);
        node.metrics.record_diagnosis(diagnosis.outcome);
        tracing::debug!(
            members = sample.total_members,
            active = sample.total_active,
            conflicts = sample.total_conflicts,
            outcome = ?diagnosis.outcome,
            "cluster state sampled"
        );

        match diagnosis.outcome {
            Outcome::Confirmed => {
                if node.fence.is_zombie()? {
                    clear_quarantine(node, session.as_ref(), cancel).await?;
                }
            }
            Outcome::Undecided | Outcome::DiscoveredOther => {
                if !node.fence.is_zombie()? {
                    tracing::warn!(
                        outcome = ?diagnosis.outcome,
                        discovered = %diagnosis.primary,
                        active = sample.total_active,
                        quorum = sample.quorum(),
                        "primary could not confirm itself against quorum"
                    );
                }
                quarantine(node, session.as_ref(), &diagnosis.primary, cancel).await?;
            }
        }
        Ok(Some(diagnosis))
    }
}

#[async_trait]
impl Monitor for ClusterStateMonitor {
    fn name(&self) -> &'static str {
        "cluster_state"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.evaluate(cancel).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::FenceState;
    use crate::member::Role;
    use crate::testing::{member, FakeCluster};

    fn three_node_cluster() -> FakeCluster {
        let cluster = FakeCluster::new(vec![
            member(1, "host-1", Role::Primary),
            member(2, "host-2", Role::Standby),
            member(3, "host-3", Role::Standby),
        ]);
        cluster.set_databases(&["postgres", "repmgr", "app"]);
        cluster
    }

    fn monitor(cluster: &FakeCluster, host: &str) -> ClusterStateMonitor {
        ClusterStateMonitor::new(Arc::new(cluster.node(host)), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn standby_does_not_diagnose() {
        let cluster = three_node_cluster();
        let monitor = monitor(&cluster, "host-2");
        let verdict = monitor.evaluate(&CancellationToken::new()).await.unwrap();
        assert!(verdict.is_none());
        assert!(cluster.peers().pushes().is_empty());
    }

    #[tokio::test]
    async fn healthy_primary_is_confirmed_and_left_alone() {
        let cluster = three_node_cluster();
        let monitor = monitor(&cluster, "host-1");
        let verdict = monitor
            .evaluate(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verdict.outcome, Outcome::Confirmed);
        assert_eq!(monitor.node.fence.state().unwrap(), FenceState::Unfenced);
        assert!(!cluster.is_readonly("host-1", "app"));
    }

    #[tokio::test]
    async fn partitioned_primary_quarantines_then_recovers() {
        let cluster = three_node_cluster();
        let monitor = monitor(&cluster, "host-1");
        let cancel = CancellationToken::new();

        cluster.set_unreachable("host-2");
        cluster.set_unreachable("host-3");
        let verdict = monitor.evaluate(&cancel).await.unwrap().unwrap();
        assert_eq!(verdict.outcome, Outcome::Undecided);
        assert!(monitor.node.fence.is_zombie().unwrap());
        assert!(cluster.is_readonly("host-1", "app"));

        cluster.set_reachable("host-2");
        cluster.set_reachable("host-3");
        let verdict = monitor.evaluate(&cancel).await.unwrap().unwrap();
        assert_eq!(verdict.outcome, Outcome::Confirmed);
        assert!(!monitor.node.fence.is_zombie().unwrap());
        assert!(!cluster.is_readonly("host-1", "app"));
        let snap = monitor.node.metrics.snapshot();
        assert_eq!(snap.quarantines, 1);
        assert_eq!(snap.quarantine_clears, 1);
    }

    #[tokio::test]
    async fn majority_elsewhere_redirects_pooler() {
        let cluster = three_node_cluster();
        cluster.set_primary_view("host-2", Some("host-3"));
        cluster.set_primary_view("host-3", Some("host-3"));
        let monitor = monitor(&cluster, "host-1");

        let verdict = monitor
            .evaluate(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verdict.outcome, Outcome::DiscoveredOther);
        assert_eq!(verdict.primary, "host-3");
        assert_eq!(cluster.pooler().upstreams(), vec!["host-3".to_string()]);
        assert_eq!(
            monitor.node.fence.deferred_primary().unwrap().as_deref(),
            Some("host-3")
        );
    }

    #[tokio::test]
    async fn catalog_with_two_active_primaries_still_samples() {
        let cluster = three_node_cluster();
        cluster.add_member(member(4, "host-4", Role::Primary));
        let monitor = monitor(&cluster, "host-1");
        let cancel = CancellationToken::new();

        let verdict = monitor.evaluate(&cancel).await.unwrap().unwrap();
        assert_eq!(verdict.outcome, Outcome::Confirmed);

        cluster.set_primary_view("host-2", Some("host-4"));
        cluster.set_primary_view("host-3", Some("host-4"));
        let verdict = monitor.evaluate(&cancel).await.unwrap().unwrap();
        assert_eq!(verdict.outcome, Outcome::DiscoveredOther);
        assert_eq!(verdict.primary, "host-4");
        assert!(monitor.node.fence.is_zombie().unwrap());
    }

    #[tokio::test]
    async fn sample_failure_skips_the_tick() {
        let cluster = three_node_cluster();
        cluster.fail_primary_view("host-2");
        let mut monitor = monitor(&cluster, "host-1");

        assert!(monitor.tick(&CancellationToken::new()).await.is_err());
        assert_eq!(monitor.node.fence.state().unwrap(), FenceState::Unfenced);
    }
}
