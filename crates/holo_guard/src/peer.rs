//! HTTP calls to a peer's admin endpoint.

use std::net::Ipv6Addr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// Path serving the primary's authoritative readonly flag.
pub const READONLY_STATE_PATH: &str = "/admin/readonly/state";

/// Admin calls the monitors make against other members.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// The readonly flag `hostname` reports for itself.
    async fn readonly_state(&self, hostname: &str) -> Result<bool>;
    /// Asks `hostname` to engage or release readonly.
    async fn set_readonly(&self, hostname: &str, enabled: bool) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ReadonlyStateResponse {
    #[serde(rename = "Result")]
    result: bool,
}

/// `reqwest` backed peer client.
#[derive(Clone, Debug)]
pub struct HttpPeerClient {
    client: reqwest::Client,
    port: u16,
}

impl HttpPeerClient {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build admin http client")?;
        Ok(Self { client, port })
    }

    fn url(&self, hostname: &str, path: &str) -> String {
        peer_url(hostname, self.port, path)
    }
}

/// IPv6 literals are bracketed, names and IPv4 addresses are not.
pub fn peer_url(hostname: &str, port: u16, path: &str) -> String {
    if hostname.parse::<Ipv6Addr>().is_ok() {
        format!("http://[{hostname}]:{port}{path}")
    } else {
        format!("http://{hostname}:{port}{path}")
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn readonly_state(&self, hostname: &str) -> Result<bool> {
        let url = self.url(hostname, READONLY_STATE_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if !response.status().is_success() {
            return Err(anyhow!("GET {url} returned status {}", response.status()));
        }
        let body: ReadonlyStateResponse = response
            .json()
            .await
            .with_context(|| format!("decode readonly state from {url}"))?;
        Ok(body.result)
    }

    async fn set_readonly(&self, hostname: &str, enabled: bool) -> Result<()> {
        let action = if enabled { "enable" } else { "disable" };
        let url = self.url(hostname, &format!("/commands/admin/readonly/{action}"));
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        if !response.status().is_success() {
            return Err(anyhow!("POST {url} returned status {}", response.status()));
        }
        Ok(())
    }
}
