//! Point-in-time view of cluster membership.
//!
//! A `Topology` is fetched fresh at the start of each tick and dropped at the
//! end of it, so role changes made by a concurrent failover are picked up on
//! the next evaluation.

use anyhow::{anyhow, Context, Result};

use crate::member::{Member, Role};
use crate::sql::PeerDirectory;

/// Members as listed by the replication catalog at fetch time.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    pub members: Vec<Member>,
}

/// Reads the member list through `directory`.
pub async fn fetch_topology<D>(directory: &D) -> Result<Topology>
where
    D: PeerDirectory + ?Sized,
{
    let members = directory
        .list_members()
        .await
        .context("list replication members")?;
    Ok(Topology { members })
}

impl Topology {
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    pub fn member(&self, hostname: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.hostname == hostname)
    }

    /// The local member record; a node that is not registered has no role to act on.
    pub fn local(&self, hostname: &str) -> Result<&Member> {
        self.member(hostname)
            .ok_or_else(|| anyhow!("{hostname} is not registered in the replication catalog"))
    }

    /// Role of `hostname`, `Unknown` when unregistered.
    pub fn role_of(&self, hostname: &str) -> Role {
        self.member(hostname)
            .map(|m| m.role)
            .unwrap_or(Role::Unknown)
    }

    pub fn standbys(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.is_standby())
    }

    /// First active primary in catalog order.
    pub fn primary(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.is_primary() && m.active)
    }

    /// Every member other than `hostname`.
    pub fn peers_of<'a>(&'a self, hostname: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.members.iter().filter(move |m| m.hostname != hostname)
    }
}
