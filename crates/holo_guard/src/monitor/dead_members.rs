//! Unregisters standbys that have been unreachable past a grace period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{is_cancelled, with_cancel};
use crate::monitor::Monitor;
use crate::node::NodeState;

pub struct DeadMemberReaper {
    node: Arc<NodeState>,
    interval: Duration,
    removal_threshold: Duration,
    /// Last time each standby (by member id) was seen reachable, or first
    /// seen unreachable.
    seen_at: HashMap<i32, Instant>,
}

impl DeadMemberReaper {
    pub fn new(node: Arc<NodeState>, interval: Duration, removal_threshold: Duration) -> Self {
        Self {
            node,
            interval,
            removal_threshold,
            seen_at: HashMap::new(),
        }
    }

    /// One pass at `now`; returns the ids unregistered.
    pub async fn reap(&mut self, now: Instant, cancel: &CancellationToken) -> Result<Vec<i32>> {
        let node = &self.node;
        let (session, topology) = with_cancel(cancel, node.local_topology()).await?;
        if !topology.local(&node.hostname)?.is_primary() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for standby in topology.standbys() {
            match with_cancel(cancel, node.connector.connect(&standby.hostname)).await {
                Ok(_probe) => {
                    self.seen_at.insert(standby.id, now);
                }
                Err(err) if is_cancelled(&err) => return Err(err),
                Err(err) => {
                    let since = *self.seen_at.entry(standby.id).or_insert(now);
                    let elapsed = now.saturating_duration_since(since);
                    if elapsed < self.removal_threshold {
                        tracing::info!(
                            member = %standby.hostname,
                            id = standby.id,
                            unreachable_for = ?elapsed,
                            error = %err,
                            "standby unreachable; within grace period"
                        );
                        continue;
                    }
                    match with_cancel(cancel, session.unregister_member(standby)).await {
                        Ok(()) => {}
                        Err(err) if is_cancelled(&err) => return Err(err),
                        Err(err) => {
                            // Clock is kept; the next pass retries.
                            tracing::warn!(
                                member = %standby.hostname,
                                id = standby.id,
                                error = ?err,
                                "failed to unregister dead standby"
                            );
                            continue;
                        }
                    }
                    self.seen_at.remove(&standby.id);
                    node.metrics.record_member_reaped();
                    tracing::warn!(
                        member = %standby.hostname,
                        id = standby.id,
                        unreachable_for = ?elapsed,
                        "unregistered dead standby"
                    );
                    removed.push(standby.id);
                }
            }
        }

        // Forget members removed from the catalog by someone else.
        self.seen_at
            .retain(|id, _| topology.members.iter().any(|m| m.id == *id));
        Ok(removed)
    }
}

#[async_trait]
impl Monitor for DeadMemberReaper {
    fn name(&self) -> &'static str {
        "dead_members"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.reap(Instant::now(), cancel).await.map(|_| ())
    }
}
