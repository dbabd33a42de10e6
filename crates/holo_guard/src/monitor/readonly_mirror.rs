//! Standby side of the readonly broadcast: mirror the primary's flag.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::with_cancel;
use crate::monitor::Monitor;
use crate::node::NodeState;
use crate::readonly::{local_readonly_state, set_local_readonly, user_databases};

pub struct ReadonlyMirror {
    node: Arc<NodeState>,
    interval: Duration,
}

impl ReadonlyMirror {
    pub fn new(node: Arc<NodeState>, interval: Duration) -> Self {
        Self { node, interval }
    }

    /// Returns the local readonly state after the pass, or `None` on a primary.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<Option<bool>> {
        let node = &self.node;
        let (session, topology) = with_cancel(cancel, node.local_topology()).await?;
        if !topology.local(&node.hostname)?.is_standby() {
            return Ok(None);
        }
        let primary = topology
            .primary()
            .ok_or_else(|| anyhow!("no active primary registered"))?;

        let wanted = with_cancel(cancel, node.peers.readonly_state(&primary.hostname))
            .await
            .with_context(|| format!("poll readonly state of primary {}", primary.hostname))?;
        if with_cancel(cancel, user_databases(session.as_ref())).await?.is_empty() {
            return Ok(Some(wanted));
        }
        let current = with_cancel(cancel, local_readonly_state(session.as_ref())).await?;
        if wanted == current {
            return Ok(Some(current));
        }

        if !wanted && node.fence.is_zombie()? {
            tracing::debug!(
                primary = %primary.hostname,
                "primary is writable but local zombie lock holds readonly"
            );
            return Ok(Some(current));
        }

        with_cancel(cancel, set_local_readonly(session.as_ref(), wanted)).await?;
        node.metrics.record_readonly_mirror_change();
        tracing::info!(
            primary = %primary.hostname,
            readonly = wanted,
            "mirrored primary readonly state"
        );
        Ok(Some(wanted))
    }
}

#[async_trait]
impl Monitor for ReadonlyMirror {
    fn name(&self) -> &'static str {
        "readonly_mirror"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.sync(cancel).await.map(|_| ())
    }
}
