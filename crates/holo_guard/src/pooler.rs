//! Connection pooler upstream control.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_postgres::NoTls;

/// Points the pooler at a different upstream primary.
#[async_trait]
pub trait PoolerControl: Send + Sync {
    async fn set_upstream(&self, address: &str) -> Result<()>;
}

/// PgBouncer settings for upstream switching.
#[derive(Clone, Debug)]
pub struct PgBouncerConfig {
    /// Ini fragment included by pgbouncer.ini under `[databases]`.
    pub databases_ini: PathBuf,
    /// Postgres port on the upstream primary.
    pub upstream_port: u16,
    /// Admin console port on the local PgBouncer.
    pub admin_port: u16,
    pub admin_user: String,
    pub admin_password: String,
    pub connect_timeout: Duration,
}

/// Rewrites the databases fragment, then issues `RELOAD` on the admin console.
#[derive(Clone, Debug)]
pub struct PgBouncerUpstream {
    config: PgBouncerConfig,
}

impl PgBouncerUpstream {
    pub fn new(config: PgBouncerConfig) -> Self {
        Self { config }
    }

    fn write_databases_ini(&self, address: &str) -> Result<()> {
        let path = &self.config.databases_ini;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create pgbouncer config dir {}", parent.display()))?;
        }
        let body = render_databases_ini(address, self.config.upstream_port);
        let tmp_path = path.with_extension("ini.tmp");
        fs::write(&tmp_path, body)
            .with_context(|| format!("write pgbouncer databases temp {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("replace pgbouncer databases {}", path.display()))?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let mut pg = tokio_postgres::Config::new();
        pg.host("127.0.0.1")
            .port(self.config.admin_port)
            .user(&self.config.admin_user)
            .dbname("pgbouncer")
            .connect_timeout(self.config.connect_timeout);
        if !self.config.admin_password.is_empty() {
            pg.password(&self.config.admin_password);
        }
        let (client, connection) = tokio::time::timeout(self.config.connect_timeout, pg.connect(NoTls))
            .await
            .map_err(|_| anyhow!("pgbouncer admin connect timed out"))?
            .context("connect to pgbouncer admin console")?;
        let driver = tokio::spawn(connection);
        let res = client
            .simple_query("RELOAD")
            .await
            .context("pgbouncer RELOAD");
        drop(client);
        driver.abort();
        res.map(|_| ())
    }
}

/// Routes every database to `address`.
pub fn render_databases_ini(address: &str, port: u16) -> String {
    format!("[databases]\n* = host={address} port={port}\n")
}

#[async_trait]
impl PoolerControl for PgBouncerUpstream {
    async fn set_upstream(&self, address: &str) -> Result<()> {
        self.write_databases_ini(address)?;
        self.reload().await?;
        tracing::info!(upstream = %address, "pgbouncer upstream reconfigured");
        Ok(())
    }
}
