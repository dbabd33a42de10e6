//! Command-line / environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use crate::backup::{BarmanConfig, RetryPolicy};
use crate::monitor::replication_slots::SlotReaperSettings;
use crate::pooler::PgBouncerConfig;
use crate::sql::PgConnectionConfig;

/// Flags for the `holo-guard` binary. Every flag can also be set through
/// its `HOLO_GUARD_*` environment variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "holo-guard", version, about = "Cluster health supervision for replicated Postgres")]
pub struct GuardArgs {
    /// Hostname this node is registered under in the replication catalog.
    #[arg(long, env = "HOLO_GUARD_HOSTNAME")]
    pub hostname: String,

    /// Directory holding the readonly, zombie, and registration markers.
    #[arg(long, env = "HOLO_GUARD_DATA_DIR", default_value = "/data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "HOLO_GUARD_PG_PORT", default_value_t = 5433)]
    pub pg_port: u16,

    #[arg(long, env = "HOLO_GUARD_PG_USER", default_value = "repmgr")]
    pub pg_user: String,

    #[arg(long, env = "HOLO_GUARD_PG_PASSWORD", default_value = "", hide_env_values = true)]
    pub pg_password: String,

    #[arg(long, env = "HOLO_GUARD_PG_DATABASE", default_value = "repmgr")]
    pub pg_database: String,

    #[arg(long, env = "HOLO_GUARD_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Server-side `statement_timeout` for every guard session.
    #[arg(long, env = "HOLO_GUARD_STATEMENT_TIMEOUT_SECS", default_value_t = 30)]
    pub statement_timeout_secs: u64,

    /// Port of the admin HTTP endpoint on every member.
    #[arg(long, env = "HOLO_GUARD_ADMIN_PORT", default_value_t = 5500)]
    pub admin_port: u16,

    #[arg(long, env = "HOLO_GUARD_HTTP_TIMEOUT_SECS", default_value_t = 5)]
    pub http_timeout_secs: u64,

    #[arg(long, env = "HOLO_GUARD_CLUSTER_STATE_INTERVAL_SECS", default_value_t = 60)]
    pub cluster_state_interval_secs: u64,

    #[arg(long, env = "HOLO_GUARD_DEAD_MEMBER_INTERVAL_SECS", default_value_t = 3600)]
    pub dead_member_interval_secs: u64,

    /// How long a standby may stay unreachable before it is unregistered.
    #[arg(
        long,
        env = "HOLO_GUARD_DEAD_MEMBER_REMOVAL_THRESHOLD_SECS",
        default_value_t = 86_400
    )]
    pub dead_member_removal_threshold_secs: u64,

    #[arg(long, env = "HOLO_GUARD_SLOT_MONITOR_INTERVAL_SECS", default_value_t = 3600)]
    pub slot_monitor_interval_secs: u64,

    #[arg(
        long,
        env = "HOLO_GUARD_INACTIVE_SLOT_REMOVAL_THRESHOLD_SECS",
        default_value_t = 43_200
    )]
    pub inactive_slot_removal_threshold_secs: u64,

    #[arg(long, env = "HOLO_GUARD_SLOT_WAL_WARN_MB", default_value_t = 50)]
    pub slot_wal_warn_mb: u64,

    #[arg(long, env = "HOLO_GUARD_READONLY_POLL_INTERVAL_SECS", default_value_t = 15)]
    pub readonly_poll_interval_secs: u64,

    #[arg(long, env = "HOLO_GUARD_BACKUPS_ENABLED", default_value_t = false)]
    pub backups_enabled: bool,

    #[arg(long, env = "HOLO_GUARD_FULL_BACKUP_FREQUENCY_SECS", default_value_t = 86_400)]
    pub full_backup_frequency_secs: u64,

    #[arg(long, env = "HOLO_GUARD_BACKUP_RETENTION_INTERVAL_SECS", default_value_t = 3600)]
    pub backup_retention_interval_secs: u64,

    #[arg(long, env = "HOLO_GUARD_BACKUP_MAX_ATTEMPTS", default_value_t = 10)]
    pub backup_max_attempts: u32,

    #[arg(long, env = "HOLO_GUARD_BACKUP_RETRY_DELAY_SECS", default_value_t = 30)]
    pub backup_retry_delay_secs: u64,

    /// Directory holding the `barman-cloud-*` executables. Unset uses `PATH`.
    #[arg(long, env = "HOLO_GUARD_BARMAN_BIN_DIR")]
    pub barman_bin_dir: Option<PathBuf>,

    #[arg(long, env = "HOLO_GUARD_BARMAN_DESTINATION", default_value = "")]
    pub barman_destination: String,

    #[arg(long, env = "HOLO_GUARD_BARMAN_SERVER_NAME", default_value = "holo")]
    pub barman_server_name: String,

    #[arg(long, env = "HOLO_GUARD_BARMAN_ENDPOINT_URL")]
    pub barman_endpoint_url: Option<String>,

    #[arg(long, env = "HOLO_GUARD_BARMAN_RECOVERY_WINDOW", default_value = "7 DAYS")]
    pub barman_recovery_window: String,

    /// Admin console port of the local PgBouncer.
    #[arg(long, env = "HOLO_GUARD_PGBOUNCER_PORT", default_value_t = 6432)]
    pub pgbouncer_port: u16,

    #[arg(
        long,
        env = "HOLO_GUARD_PGBOUNCER_DATABASES_INI",
        default_value = "/data/pgbouncer.databases.ini"
    )]
    pub pgbouncer_databases_ini: PathBuf,
}

/// Per-monitor cadence and thresholds.
#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub cluster_state_interval: Duration,
    pub dead_member_interval: Duration,
    pub dead_member_removal_threshold: Duration,
    pub slots: SlotReaperSettings,
    pub readonly_poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct BackupSettings {
    pub full_backup_frequency: Duration,
    pub retention_interval: Duration,
    pub retry: RetryPolicy,
    pub barman: BarmanConfig,
}

/// Validated runtime configuration.
#[derive(Clone, Debug)]
pub struct GuardConfig {
    pub hostname: String,
    pub data_dir: PathBuf,
    pub postgres: PgConnectionConfig,
    pub admin_port: u16,
    pub http_timeout: Duration,
    pub monitors: MonitorSettings,
    /// `None` leaves the backup scheduler and retention monitor off.
    pub backups: Option<BackupSettings>,
    pub pgbouncer: PgBouncerConfig,
}

impl GuardArgs {
    pub fn into_config(self) -> Result<GuardConfig> {
        let secs = Duration::from_secs;
        let hostname = self.hostname.trim().to_string();
        let connect_timeout = secs(self.connect_timeout_secs);
        let backups = self.backups_enabled.then(|| BackupSettings {
            full_backup_frequency: secs(self.full_backup_frequency_secs),
            retention_interval: secs(self.backup_retention_interval_secs),
            retry: RetryPolicy {
                max_attempts: self.backup_max_attempts,
                delay: secs(self.backup_retry_delay_secs),
            },
            barman: BarmanConfig {
                bin_dir: self.barman_bin_dir.clone(),
                destination: self.barman_destination.clone(),
                server_name: self.barman_server_name.clone(),
                endpoint_url: self.barman_endpoint_url.clone(),
                recovery_window: self.barman_recovery_window.clone(),
                pg_host: hostname.clone(),
                pg_port: self.pg_port,
                pg_user: self.pg_user.clone(),
            },
        });
        let config = GuardConfig {
            data_dir: self.data_dir,
            postgres: PgConnectionConfig {
                port: self.pg_port,
                user: self.pg_user.clone(),
                password: self.pg_password.clone(),
                database: self.pg_database,
                connect_timeout,
                statement_timeout: secs(self.statement_timeout_secs),
            },
            admin_port: self.admin_port,
            http_timeout: secs(self.http_timeout_secs),
            monitors: MonitorSettings {
                cluster_state_interval: secs(self.cluster_state_interval_secs),
                dead_member_interval: secs(self.dead_member_interval_secs),
                dead_member_removal_threshold: secs(self.dead_member_removal_threshold_secs),
                slots: SlotReaperSettings {
                    interval: secs(self.slot_monitor_interval_secs),
                    inactive_removal_threshold: secs(self.inactive_slot_removal_threshold_secs),
                    wal_warn_mb: self.slot_wal_warn_mb,
                },
                readonly_poll_interval: secs(self.readonly_poll_interval_secs),
            },
            backups,
            pgbouncer: PgBouncerConfig {
                databases_ini: self.pgbouncer_databases_ini,
                upstream_port: self.pg_port,
                admin_port: self.pgbouncer_port,
                admin_user: self.pg_user,
                admin_password: self.pg_password,
                connect_timeout,
            },
            hostname,
        };
        config.validate()?;
        Ok(config)
    }
}

impl GuardConfig {
    /// Setup errors that must stop the process before any monitor starts.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            bail!("hostname must not be empty");
        }
        let m = &self.monitors;
        let mut intervals = vec![
            ("cluster-state-interval", m.cluster_state_interval),
            ("dead-member-interval", m.dead_member_interval),
            ("slot-monitor-interval", m.slots.interval),
            ("readonly-poll-interval", m.readonly_poll_interval),
            ("connect-timeout", self.postgres.connect_timeout),
            ("statement-timeout", self.postgres.statement_timeout),
            ("http-timeout", self.http_timeout),
        ];
        if let Some(backups) = &self.backups {
            intervals.push(("full-backup-frequency", backups.full_backup_frequency));
            intervals.push(("backup-retention-interval", backups.retention_interval));
            if backups.retry.max_attempts == 0 {
                bail!("backup-max-attempts must be at least 1");
            }
            if backups.barman.destination.is_empty() {
                bail!("barman-destination is required when backups are enabled");
            }
        }
        for (name, value) in intervals {
            if value.is_zero() {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<GuardConfig> {
        let mut argv = vec!["holo-guard", "--hostname", "host-1"];
        argv.extend_from_slice(extra);
        GuardArgs::try_parse_from(argv)?.into_config()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.postgres.port, 5433);
        assert_eq!(config.admin_port, 5500);
        assert_eq!(config.postgres.statement_timeout, Duration::from_secs(30));
        assert_eq!(config.monitors.cluster_state_interval, Duration::from_secs(60));
        assert_eq!(
            config.monitors.dead_member_removal_threshold,
            Duration::from_secs(24 * 60 * 60)
        );
        assert_eq!(
            config.monitors.slots.inactive_removal_threshold,
            Duration::from_secs(12 * 60 * 60)
        );
        assert_eq!(config.monitors.slots.wal_warn_mb, 50);
        assert_eq!(config.monitors.readonly_poll_interval, Duration::from_secs(15));
        assert_eq!(config.pgbouncer.admin_port, 6432);
        assert_eq!(config.pgbouncer.upstream_port, 5433);
        assert!(config.backups.is_none());
    }

    #[test]
    fn barman_bin_dir_is_optional() {
        let config = parse(&["--backups-enabled", "--barman-destination", "s3://b/p"]).unwrap();
        assert_eq!(config.backups.unwrap().barman.bin_dir, None);

        let config = parse(&[
            "--backups-enabled",
            "--barman-destination",
            "s3://b/p",
            "--barman-bin-dir",
            "/opt/barman/bin",
        ])
        .unwrap();
        assert_eq!(
            config.backups.unwrap().barman.bin_dir,
            Some(PathBuf::from("/opt/barman/bin"))
        );
    }

    #[test]
    fn hostname_is_trimmed_everywhere() {
        let config = GuardArgs::try_parse_from([
            "holo-guard",
            "--hostname",
            " host-2 ",
            "--backups-enabled",
            "--barman-destination",
            "s3://b/p",
        ])
        .unwrap()
        .into_config()
        .unwrap();
        assert_eq!(config.hostname, "host-2");
        assert_eq!(config.backups.unwrap().barman.pg_host, "host-2");
    }

    #[test]
    fn backups_require_a_destination() {
        assert!(parse(&["--backups-enabled"]).is_err());
        let config = parse(&[
            "--backups-enabled",
            "--barman-destination",
            "s3://bucket/holo",
        ])
        .unwrap();
        let backups = config.backups.unwrap();
        assert_eq!(backups.retry, RetryPolicy::default());
        assert_eq!(backups.barman.pg_host, "host-1");
    }

    #[test]
    fn zero_intervals_and_blank_hostname_are_rejected() {
        let err = parse(&["--cluster-state-interval-secs", "0"]).unwrap_err();
        assert!(err.to_string().contains("cluster-state-interval"));

        let err = GuardArgs::try_parse_from(["holo-guard", "--hostname", "  "])
            .unwrap()
            .into_config()
            .unwrap_err();
        assert!(err.to_string().contains("hostname"));
    }
}
