//! SQL ports used by the monitors, and the `tokio-postgres` adapter behind them.
//!
//! Every monitor opens a session at the start of a tick and drops it at the
//! end; no connection outlives a tick.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};

use crate::member::{Member, ReplicationSlot, Role};

/// Narrow read port over the replication catalog's member list.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn list_members(&self) -> Result<Vec<Member>>;
}

/// One short-lived SQL session against a single node.
#[async_trait]
pub trait SqlSession: PeerDirectory {
    /// This node's view of the current primary, if it knows one.
    async fn primary_member(&self) -> Result<Option<Member>>;
    /// Removes a standby from the replication catalog.
    async fn unregister_member(&self, member: &Member) -> Result<()>;
    /// Physical replication slots on this node.
    async fn replication_slots(&self) -> Result<Vec<ReplicationSlot>>;
    async fn drop_replication_slot(&self, name: &str) -> Result<()>;
    /// All non-template databases, system databases included.
    async fn databases(&self) -> Result<Vec<String>>;
    /// Sets the per-database `default_transaction_read_only` default.
    async fn set_database_readonly(&self, database: &str, enabled: bool) -> Result<()>;
    /// Reads the per-database `default_transaction_read_only` default back.
    async fn database_readonly(&self, database: &str) -> Result<bool>;
}

/// Opens SQL sessions against cluster members.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(&self, hostname: &str) -> Result<Box<dyn SqlSession>>;
}

/// Connection settings shared by every member of the cluster.
#[derive(Clone, Debug)]
pub struct PgConnectionConfig {
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub connect_timeout: Duration,
    /// Server-side cap on any single statement.
    pub statement_timeout: Duration,
}

/// `tokio-postgres` backed connector.
#[derive(Clone, Debug)]
pub struct PgConnector {
    config: PgConnectionConfig,
}

impl PgConnector {
    pub fn new(config: PgConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SqlConnector for PgConnector {
    async fn connect(&self, hostname: &str) -> Result<Box<dyn SqlSession>> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(hostname)
            .port(self.config.port)
            .user(&self.config.user)
            .dbname(&self.config.database)
            .application_name("holo-guard")
            .options(&statement_timeout_option(self.config.statement_timeout))
            .connect_timeout(self.config.connect_timeout);
        if !self.config.password.is_empty() {
            pg.password(&self.config.password);
        }

        let (client, connection) =
            tokio::time::timeout(self.config.connect_timeout, pg.connect(NoTls))
                .await
                .map_err(|_| {
                    anyhow!(
                        "connect to {hostname}:{} timed out after {:?}",
                        self.config.port,
                        self.config.connect_timeout
                    )
                })?
                .with_context(|| format!("connect to {hostname}:{}", self.config.port))?;

        let host = hostname.to_string();
        let task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, host = %host, "postgres connection closed with error");
            }
        });

        Ok(Box::new(PgSession { client, task }))
    }
}

/// A live `tokio-postgres` client plus the task driving its socket.
struct PgSession {
    client: Client,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for PgSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn statement_timeout_option(timeout: Duration) -> String {
    format!("-c statement_timeout={}", timeout.as_millis())
}

const MEMBER_COLUMNS: &str = "n.node_id, n.node_name, n.location, n.active, n.type";

fn member_from_row(row: &tokio_postgres::Row) -> Result<Member> {
    let role: String = row.try_get(4).context("decode member type")?;
    Ok(Member {
        id: row.try_get(0).context("decode member id")?,
        hostname: row.try_get(1).context("decode member name")?,
        region: row
            .try_get::<_, Option<String>>(2)
            .context("decode member location")?
            .unwrap_or_default(),
        active: row.try_get(3).context("decode member active flag")?,
        role: Role::parse(&role),
    })
}

fn primary_member_query() -> String {
    format!(
        "SELECT {MEMBER_COLUMNS} FROM repmgr.nodes n \
         WHERE n.type = 'primary' AND n.active = true ORDER BY n.node_id LIMIT 1"
    )
}

#[async_trait]
impl PeerDirectory for PgSession {
    async fn list_members(&self) -> Result<Vec<Member>> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM repmgr.nodes n ORDER BY n.node_id");
        let rows = self
            .client
            .query(sql.as_str(), &[])
            .await
            .context("query repmgr.nodes")?;
        rows.iter().map(member_from_row).collect()
    }
}

#[async_trait]
impl SqlSession for PgSession {
    async fn primary_member(&self) -> Result<Option<Member>> {
        // Several active primaries can coexist during a split brain.
        let rows = self
            .client
            .query(primary_member_query().as_str(), &[])
            .await
            .context("query primary member")?;
        rows.first().map(member_from_row).transpose()
    }

    async fn unregister_member(&self, member: &Member) -> Result<()> {
        self.client
            .execute("DELETE FROM repmgr.nodes WHERE node_id = $1", &[&member.id])
            .await
            .with_context(|| format!("unregister member {} ({})", member.id, member.hostname))?;
        Ok(())
    }

    async fn replication_slots(&self) -> Result<Vec<ReplicationSlot>> {
        let rows = self
            .client
            .query(
                "SELECT slot_name::text, active, \
                 COALESCE(pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn), 0)::bigint \
                 FROM pg_replication_slots WHERE slot_type = 'physical'",
                &[],
            )
            .await
            .context("query pg_replication_slots")?;
        rows.iter()
            .map(|row| {
                let retained: i64 = row.try_get(2).context("decode retained wal")?;
                Ok(ReplicationSlot {
                    name: row.try_get(0).context("decode slot name")?,
                    active: row.try_get(1).context("decode slot active flag")?,
                    retained_wal_bytes: u64::try_from(retained).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn drop_replication_slot(&self, name: &str) -> Result<()> {
        self.client
            .execute("SELECT pg_drop_replication_slot($1)", &[&name])
            .await
            .with_context(|| format!("drop replication slot {name}"))?;
        Ok(())
    }

    async fn databases(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT datname::text FROM pg_database WHERE datistemplate = false ORDER BY datname",
                &[],
            )
            .await
            .context("query pg_database")?;
        rows.iter()
            .map(|row| row.try_get(0).context("decode database name"))
            .collect()
    }

    async fn set_database_readonly(&self, database: &str, enabled: bool) -> Result<()> {
        let value = if enabled { "on" } else { "off" };
        let sql = format!(
            "ALTER DATABASE {} SET default_transaction_read_only = {value}",
            quote_ident(database)
        );
        self.client
            .batch_execute(sql.as_str())
            .await
            .with_context(|| format!("set default_transaction_read_only={value} on {database}"))?;
        Ok(())
    }

    async fn database_readonly(&self, database: &str) -> Result<bool> {
        let rows = self
            .client
            .query(
                "SELECT unnest(s.setconfig) FROM pg_db_role_setting s \
                 JOIN pg_database d ON d.oid = s.setdatabase \
                 WHERE d.datname = $1 AND s.setrole = 0",
                &[&database],
            )
            .await
            .with_context(|| format!("read database settings for {database}"))?;
        let mut readonly = false;
        for row in &rows {
            let setting: String = row.try_get(0).context("decode database setting")?;
            if let Some(value) = setting.strip_prefix("default_transaction_read_only=") {
                readonly = parse_pg_bool(value);
            }
        }
        Ok(readonly)
    }
}

/// Quotes one SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Postgres accepts several spellings for boolean GUC values.
fn parse_pg_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "on" | "true" | "yes" | "1" | "t"
    )
}
