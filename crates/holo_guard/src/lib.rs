//! Cluster health supervision for a replicated Postgres cluster.
//!
//! A `holo_guard` process runs next to every member and hosts:
//! - primary self-diagnosis against a quorum of standbys, with quarantine
//!   (pooler redirect, zombie lock, forced readonly) when it cannot confirm
//!   itself,
//! - the readonly broadcast (push to peers, standby-side mirroring),
//! - garbage collection of dead members and stale replication slots,
//! - full-backup scheduling and archive retention.
//!
//! [`diagnose`] is the pure decision function; [`start_monitors`] and
//! [`run_with_shutdown`] are the runtime entry points.

pub mod backup;
pub mod config;
pub mod diagnosis;
pub mod directory;
pub mod error;
pub mod fence;
pub mod member;
pub mod metrics;
pub mod monitor;
pub mod node;
pub mod peer;
pub mod pooler;
pub mod quarantine;
pub mod readonly;
pub mod sql;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use config::{GuardArgs, GuardConfig, MonitorSettings};
pub use diagnosis::{diagnose, take_dna_sample, Diagnosis, DnaSample, Outcome};
pub use error::{is_cancelled, BackupRetriesExhausted, Cancelled, ReadonlyVerificationFailed};
pub use fence::{FenceLedger, FenceState, FileMarkerStore, MarkerStore, MemoryMarkerStore};
pub use metrics::GuardMetrics;
pub use node::NodeState;
pub use supervisor::TaskGroup;

use backup::{BackupTool, BarmanCloud, RetryPolicy};
use monitor::{
    run_monitor, BackupScheduler, ClusterStateMonitor, DeadMemberReaper, ReadonlyMirror,
    ReplicationSlotReaper, RetentionMonitor,
};
use node::{ensure_registration, report_startup_fence};
use peer::HttpPeerClient;
use pooler::PgBouncerUpstream;
use sql::PgConnector;

/// Backup collaborators for [`start_monitors`].
pub struct BackupRuntime {
    pub tool: Arc<dyn BackupTool>,
    /// Full-backup frequency; updates take effect without a restart.
    pub frequency: watch::Receiver<Duration>,
    pub retention_interval: Duration,
    pub retry: RetryPolicy,
}

/// Spawns every monitor into one group sharing `cancel`.
///
/// Role is re-checked inside each tick, so the same set runs on primaries
/// and standbys.
pub fn start_monitors(
    node: Arc<NodeState>,
    settings: &MonitorSettings,
    backups: Option<BackupRuntime>,
    cancel: CancellationToken,
) -> TaskGroup {
    let mut group = TaskGroup::new(cancel);
    let metrics = node.metrics.clone();

    group.spawn(
        "cluster_state",
        run_monitor(
            ClusterStateMonitor::new(node.clone(), settings.cluster_state_interval),
            metrics.clone(),
            group.cancel_token(),
        ),
    );
    group.spawn(
        "dead_members",
        run_monitor(
            DeadMemberReaper::new(
                node.clone(),
                settings.dead_member_interval,
                settings.dead_member_removal_threshold,
            ),
            metrics.clone(),
            group.cancel_token(),
        ),
    );
    group.spawn(
        "replication_slots",
        run_monitor(
            ReplicationSlotReaper::new(node.clone(), settings.slots),
            metrics.clone(),
            group.cancel_token(),
        ),
    );
    group.spawn(
        "readonly_mirror",
        run_monitor(
            ReadonlyMirror::new(node.clone(), settings.readonly_poll_interval),
            metrics.clone(),
            group.cancel_token(),
        ),
    );

    if let Some(backups) = backups {
        group.spawn(
            "backup_scheduler",
            BackupScheduler::new(
                node.clone(),
                backups.tool.clone(),
                backups.frequency,
                backups.retry,
            )
            .run(group.cancel_token()),
        );
        group.spawn(
            "backup_retention",
            run_monitor(
                RetentionMonitor::new(node, backups.tool, backups.retention_interval),
                metrics,
                group.cancel_token(),
            ),
        );
    }
    group
}

/// Runs until Ctrl-C is received.
pub async fn run(config: GuardConfig) -> Result<()> {
    run_with_shutdown(config, tokio::signal::ctrl_c()).await
}

/// Wires the Postgres, HTTP, PgBouncer, and barman adapters and supervises
/// the monitors until `shutdown` resolves or a monitor fails.
///
/// Shutdown cancels every monitor and leaves the fence markers as they are.
pub async fn run_with_shutdown<F>(config: GuardConfig, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    config.validate()?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

    let peers = HttpPeerClient::new(config.admin_port, config.http_timeout)?;
    let node = Arc::new(NodeState {
        hostname: config.hostname.clone(),
        connector: Arc::new(PgConnector::new(config.postgres.clone())),
        peers: Arc::new(peers),
        pooler: Arc::new(PgBouncerUpstream::new(config.pgbouncer.clone())),
        fence: FenceLedger::new(Arc::new(FileMarkerStore::new(config.data_dir.clone()))),
        metrics: Arc::new(GuardMetrics::default()),
    });

    report_startup_fence(&node).context("read fence markers")?;
    if let Err(err) = ensure_registration(&node).await {
        tracing::warn!(error = ?err, "registration check failed; retrying on next start");
    }

    // The sender stays alive for the whole run so the scheduler keeps
    // watching for frequency updates.
    let (frequency_tx, backups) = match &config.backups {
        Some(settings) => {
            let (tx, rx) = watch::channel(settings.full_backup_frequency);
            let tool: Arc<dyn BackupTool> = Arc::new(BarmanCloud::new(settings.barman.clone()));
            let runtime = BackupRuntime {
                tool,
                frequency: rx,
                retention_interval: settings.retention_interval,
                retry: settings.retry,
            };
            (Some(tx), Some(runtime))
        }
        None => (None, None),
    };

    let cancel = CancellationToken::new();
    let group = start_monitors(node.clone(), &config.monitors, backups, cancel.clone());
    tracing::info!(
        hostname = %node.hostname,
        monitors = group.len(),
        backups = config.backups.is_some(),
        "supervision started"
    );

    tokio::select! {
        signal = shutdown => {
            if let Err(err) = signal {
                tracing::warn!(error = %err, "shutdown signal listener failed");
            }
            tracing::info!("shutdown requested; stopping monitors");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
    let result = group.join().await;
    drop(frequency_tx);

    tracing::info!(metrics = %node.metrics.render_text(), "supervision stopped");
    result
}
