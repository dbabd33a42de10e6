//! In-memory fakes for the SQL, HTTP, pooler, and backup ports.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::backup::{BackupInfo, BackupMetadata, BackupParams, BackupTool};
use crate::fence::FenceLedger;
use crate::member::{Member, ReplicationSlot, Role};
use crate::metrics::GuardMetrics;
use crate::node::NodeState;
use crate::peer::PeerClient;
use crate::pooler::PoolerControl;
use crate::sql::{PeerDirectory, SqlConnector, SqlSession};

pub fn member(id: i32, hostname: &str, role: Role) -> Member {
    Member {
        id,
        hostname: hostname.to_string(),
        region: "iad".to_string(),
        active: true,
        role,
    }
}

pub fn slot(name: &str, active: bool, retained_wal_bytes: u64) -> ReplicationSlot {
    ReplicationSlot {
        name: name.to_string(),
        active,
        retained_wal_bytes,
    }
}

#[derive(Default)]
struct ClusterInner {
    members: Vec<Member>,
    unreachable: HashSet<String>,
    primary_views: HashMap<String, Option<String>>,
    failing_primary_views: HashSet<String>,
    slots: Vec<ReplicationSlot>,
    dropped_slots: Vec<String>,
    unregistered: Vec<i32>,
    databases: Vec<String>,
    readonly: HashMap<(String, String), bool>,
    ignore_readonly: HashSet<String>,
    hang_slot_listing: bool,
    failing_unregisters: HashSet<i32>,
    failing_slot_drops: HashSet<String>,
}

/// Shared catalog visible from every fake host.
#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<ClusterInner>>,
    peers: FakePeers,
    pooler: FakePooler,
}

impl FakeCluster {
    pub fn new(members: Vec<Member>) -> Self {
        let cluster = Self::default();
        cluster.lock().members = members;
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, ClusterInner> {
        self.inner.lock().unwrap()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            cluster: self.clone(),
        }
    }

    pub fn node(&self, hostname: &str) -> NodeState {
        NodeState {
            hostname: hostname.to_string(),
            connector: Arc::new(self.connector()),
            peers: Arc::new(self.peers.clone()),
            pooler: Arc::new(self.pooler.clone()),
            fence: FenceLedger::in_memory(),
            metrics: Arc::new(GuardMetrics::default()),
        }
    }

    pub fn peers(&self) -> FakePeers {
        self.peers.clone()
    }

    pub fn pooler(&self) -> FakePooler {
        self.pooler.clone()
    }

    pub fn add_member(&self, member: Member) {
        self.lock().members.push(member);
    }

    pub fn set_role(&self, hostname: &str, role: Role) {
        for m in self.lock().members.iter_mut() {
            if m.hostname == hostname {
                m.role = role;
            }
        }
    }

    pub fn set_unreachable(&self, hostname: &str) {
        self.lock().unreachable.insert(hostname.to_string());
    }

    pub fn set_reachable(&self, hostname: &str) {
        self.lock().unreachable.remove(hostname);
    }

    /// Overrides which primary `hostname` reports.
    pub fn set_primary_view(&self, hostname: &str, primary: Option<&str>) {
        self.lock()
            .primary_views
            .insert(hostname.to_string(), primary.map(str::to_string));
    }

    pub fn fail_primary_view(&self, hostname: &str) {
        self.lock().failing_primary_views.insert(hostname.to_string());
    }

    pub fn set_slots(&self, slots: Vec<ReplicationSlot>) {
        self.lock().slots = slots;
    }

    /// Slot listing never completes, as if the query hung server-side.
    pub fn hang_slot_listing(&self) {
        self.lock().hang_slot_listing = true;
    }

    pub fn fail_unregister(&self, id: i32) {
        self.lock().failing_unregisters.insert(id);
    }

    pub fn fail_slot_drop(&self, name: &str) {
        self.lock().failing_slot_drops.insert(name.to_string());
    }

    pub fn slot_names(&self) -> Vec<String> {
        self.lock().slots.iter().map(|s| s.name.clone()).collect()
    }

    pub fn dropped_slots(&self) -> Vec<String> {
        self.lock().dropped_slots.clone()
    }

    pub fn unregistered(&self) -> Vec<i32> {
        self.lock().unregistered.clone()
    }

    pub fn set_databases(&self, names: &[&str]) {
        self.lock().databases = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn is_readonly(&self, hostname: &str, database: &str) -> bool {
        self.lock()
            .readonly
            .get(&(hostname.to_string(), database.to_string()))
            .copied()
            .unwrap_or(false)
    }

    /// `ALTER DATABASE` on `hostname` silently has no effect.
    pub fn ignore_readonly_writes(&self, hostname: &str) {
        self.lock().ignore_readonly.insert(hostname.to_string());
    }
}

pub struct FakeConnector {
    cluster: FakeCluster,
}

#[async_trait]
impl SqlConnector for FakeConnector {
    async fn connect(&self, hostname: &str) -> Result<Box<dyn SqlSession>> {
        if self.cluster.lock().unreachable.contains(hostname) {
            return Err(anyhow!("connection refused: {hostname}"));
        }
        Ok(Box::new(FakeSession {
            hostname: hostname.to_string(),
            cluster: self.cluster.clone(),
        }))
    }
}

pub struct FakeSession {
    hostname: String,
    cluster: FakeCluster,
}

#[async_trait]
impl PeerDirectory for FakeSession {
    async fn list_members(&self) -> Result<Vec<Member>> {
        Ok(self.cluster.lock().members.clone())
    }
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn primary_member(&self) -> Result<Option<Member>> {
        let inner = self.cluster.lock();
        if inner.failing_primary_views.contains(&self.hostname) {
            return Err(anyhow!("primary view query failed on {}", self.hostname));
        }
        if let Some(view) = inner.primary_views.get(&self.hostname) {
            return Ok(view.as_ref().map(|host| Member {
                id: 0,
                hostname: host.clone(),
                region: String::new(),
                active: true,
                role: Role::Primary,
            }));
        }
        // Lowest id first, like the catalog query.
        Ok(inner
            .members
            .iter()
            .filter(|m| m.is_primary() && m.active)
            .min_by_key(|m| m.id)
            .cloned())
    }

    async fn unregister_member(&self, member: &Member) -> Result<()> {
        let mut inner = self.cluster.lock();
        if inner.failing_unregisters.contains(&member.id) {
            return Err(anyhow!("delete from repmgr.nodes failed for {}", member.id));
        }
        inner.members.retain(|m| m.id != member.id);
        inner.unregistered.push(member.id);
        Ok(())
    }

    async fn replication_slots(&self) -> Result<Vec<ReplicationSlot>> {
        let hang = self.cluster.lock().hang_slot_listing;
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(self.cluster.lock().slots.clone())
    }

    async fn drop_replication_slot(&self, name: &str) -> Result<()> {
        let mut inner = self.cluster.lock();
        if inner.failing_slot_drops.contains(name) {
            return Err(anyhow!("slot {name} is in use"));
        }
        inner.slots.retain(|s| s.name != name);
        inner.dropped_slots.push(name.to_string());
        Ok(())
    }

    async fn databases(&self) -> Result<Vec<String>> {
        Ok(self.cluster.lock().databases.clone())
    }

    async fn set_database_readonly(&self, database: &str, enabled: bool) -> Result<()> {
        let mut inner = self.cluster.lock();
        if inner.ignore_readonly.contains(&self.hostname) {
            return Ok(());
        }
        inner
            .readonly
            .insert((self.hostname.clone(), database.to_string()), enabled);
        Ok(())
    }

    async fn database_readonly(&self, database: &str) -> Result<bool> {
        Ok(self.cluster.is_readonly(&self.hostname, database))
    }
}

#[derive(Default)]
struct PeersInner {
    failing: HashSet<String>,
    pushes: Vec<(String, bool)>,
    states: HashMap<String, bool>,
}

#[derive(Clone, Default)]
pub struct FakePeers {
    inner: Arc<Mutex<PeersInner>>,
}

impl FakePeers {
    pub fn fail_host(&self, hostname: &str) {
        self.inner.lock().unwrap().failing.insert(hostname.to_string());
    }

    /// Successful readonly pushes in call order.
    pub fn pushes(&self) -> Vec<(String, bool)> {
        self.inner.lock().unwrap().pushes.clone()
    }

    pub fn set_state(&self, hostname: &str, readonly: bool) {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(hostname.to_string(), readonly);
    }
}

#[async_trait]
impl PeerClient for FakePeers {
    async fn readonly_state(&self, hostname: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        if inner.failing.contains(hostname) {
            return Err(anyhow!("peer {hostname} unreachable"));
        }
        Ok(inner.states.get(hostname).copied().unwrap_or(false))
    }

    async fn set_readonly(&self, hostname: &str, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(hostname) {
            return Err(anyhow!("peer {hostname} unreachable"));
        }
        inner.pushes.push((hostname.to_string(), enabled));
        Ok(())
    }
}

#[derive(Default)]
struct PoolerInner {
    upstreams: Vec<String>,
    fail_next: bool,
}

#[derive(Clone, Default)]
pub struct FakePooler {
    inner: Arc<Mutex<PoolerInner>>,
}

impl FakePooler {
    pub fn fail_next(&self) {
        self.inner.lock().unwrap().fail_next = true;
    }

    pub fn upstreams(&self) -> Vec<String> {
        self.inner.lock().unwrap().upstreams.clone()
    }
}

#[async_trait]
impl PoolerControl for FakePooler {
    async fn set_upstream(&self, address: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if std::mem::take(&mut inner.fail_next) {
            return Err(anyhow!("pgbouncer admin console unavailable"));
        }
        inner.upstreams.push(address.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct BackupInner {
    fail_remaining: u32,
    backup_calls: u32,
    params: Vec<BackupParams>,
    completed: Vec<BackupInfo>,
    list_fails: bool,
    prune_calls: u32,
    prune_fails: bool,
}

/// Records backups; a successful backup shows up in the completed list.
#[derive(Clone, Default)]
pub struct FakeBackupTool {
    inner: Arc<Mutex<BackupInner>>,
}

impl FakeBackupTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, attempts: u32) {
        self.inner.lock().unwrap().fail_remaining = attempts;
    }

    pub fn backup_calls(&self) -> u32 {
        self.inner.lock().unwrap().backup_calls
    }

    pub fn params(&self) -> Vec<BackupParams> {
        self.inner.lock().unwrap().params.clone()
    }

    pub fn push_completed(&self, info: BackupInfo) {
        self.inner.lock().unwrap().completed.push(info);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.inner.lock().unwrap().list_fails = fail;
    }

    pub fn fail_prune(&self, fail: bool) {
        self.inner.lock().unwrap().prune_fails = fail;
    }

    pub fn prune_calls(&self) -> u32 {
        self.inner.lock().unwrap().prune_calls
    }
}

#[async_trait]
impl BackupTool for FakeBackupTool {
    async fn backup(&self, params: &BackupParams) -> Result<BackupMetadata> {
        let mut inner = self.inner.lock().unwrap();
        inner.backup_calls += 1;
        inner.params.push(params.clone());
        if inner.fail_remaining > 0 {
            inner.fail_remaining -= 1;
            return Err(anyhow!("upload to object store failed"));
        }
        let now = Utc::now();
        let id = format!("backup-{}", inner.backup_calls);
        inner.completed.push(BackupInfo {
            backup_id: id,
            name: params.name.clone(),
            status: "DONE".to_string(),
            started_at: Some(now),
            finished_at: Some(now),
        });
        Ok(BackupMetadata {
            started_at: now,
            finished_at: now,
            output: String::new(),
        })
    }

    async fn list_completed_backups(&self) -> Result<Vec<BackupInfo>> {
        let inner = self.inner.lock().unwrap();
        if inner.list_fails {
            return Err(anyhow!("list backups failed"));
        }
        Ok(inner.completed.clone())
    }

    async fn prune_archive(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.prune_calls += 1;
        if inner.prune_fails {
            return Err(anyhow!("retention policy run failed"));
        }
        Ok(())
    }
}
