//! Drops replication slots that retain WAL for members that are gone or idle.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{is_cancelled, with_cancel};
use crate::monitor::Monitor;
use crate::node::NodeState;
use crate::sql::SqlSession;

#[derive(Clone, Copy, Debug)]
pub struct SlotReaperSettings {
    pub interval: Duration,
    /// How long a registered member's slot may stay inactive before it is dropped.
    pub inactive_removal_threshold: Duration,
    /// Inactive slots retaining more WAL than this are logged.
    pub wal_warn_mb: u64,
}

/// Slots dropped by one pass, by reason.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SlotReapReport {
    pub orphaned: Vec<String>,
    pub expired: Vec<String>,
}

pub struct ReplicationSlotReaper {
    node: Arc<NodeState>,
    settings: SlotReaperSettings,
    /// First time each registered member's slot was seen inactive.
    inactive_since: HashMap<i32, Instant>,
}

impl ReplicationSlotReaper {
    pub fn new(node: Arc<NodeState>, settings: SlotReaperSettings) -> Self {
        Self {
            node,
            settings,
            inactive_since: HashMap::new(),
        }
    }

    /// One pass at `now`. Only slots named after a member id are managed.
    pub async fn reap(&mut self, now: Instant, cancel: &CancellationToken) -> Result<SlotReapReport> {
        let node = &self.node;
        let (session, topology) = with_cancel(cancel, node.local_topology()).await?;
        if !topology.local(&node.hostname)?.is_primary() {
            return Ok(SlotReapReport::default());
        }

        let standby_ids: BTreeSet<i32> = topology.standbys().map(|m| m.id).collect();
        let slots = with_cancel(cancel, session.replication_slots())
            .await
            .context("list replication slots")?;

        let mut report = SlotReapReport::default();
        let mut still_inactive = BTreeSet::new();
        for slot in &slots {
            let Some(member_id) = slot.member_id() else {
                continue;
            };
            if slot.active {
                continue;
            }

            if !standby_ids.contains(&member_id) {
                if let Err(err) = drop_slot(session.as_ref(), &slot.name, cancel).await {
                    if is_cancelled(&err) {
                        return Err(err);
                    }
                    tracing::warn!(slot = %slot.name, error = ?err, "failed to drop orphaned slot");
                    continue;
                }
                node.metrics.record_slot_dropped();
                tracing::info!(
                    slot = %slot.name,
                    member_id,
                    retained_wal_mb = slot.retained_wal_mb(),
                    "dropped orphaned replication slot"
                );
                report.orphaned.push(slot.name.clone());
                continue;
            }

            if slot.retained_wal_mb() > self.settings.wal_warn_mb {
                tracing::warn!(
                    slot = %slot.name,
                    member_id,
                    retained_wal_mb = slot.retained_wal_mb(),
                    "inactive replication slot is retaining WAL"
                );
            }

            let since = *self.inactive_since.entry(member_id).or_insert(now);
            let idle = now.saturating_duration_since(since);
            if idle > self.settings.inactive_removal_threshold {
                if let Err(err) = drop_slot(session.as_ref(), &slot.name, cancel).await {
                    if is_cancelled(&err) {
                        return Err(err);
                    }
                    tracing::warn!(slot = %slot.name, error = ?err, "failed to drop inactive slot");
                    still_inactive.insert(member_id);
                    continue;
                }
                self.inactive_since.remove(&member_id);
                node.metrics.record_slot_dropped();
                tracing::info!(
                    slot = %slot.name,
                    member_id,
                    inactive_for = ?idle,
                    "dropped long-inactive replication slot"
                );
                report.expired.push(slot.name.clone());
            } else {
                still_inactive.insert(member_id);
            }
        }

        // Active again, or gone: restart the clock next time.
        self.inactive_since
            .retain(|id, _| still_inactive.contains(id));
        Ok(report)
    }
}

async fn drop_slot(session: &dyn SqlSession, name: &str, cancel: &CancellationToken) -> Result<()> {
    with_cancel(cancel, session.drop_replication_slot(name))
        .await
        .with_context(|| format!("drop replication slot {name}"))
}

#[async_trait]
impl Monitor for ReplicationSlotReaper {
    fn name(&self) -> &'static str {
        "replication_slots"
    }

    fn interval(&self) -> Duration {
        self.settings.interval
    }

    async fn tick(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.reap(Instant::now(), cancel).await.map(|_| ())
    }
}
