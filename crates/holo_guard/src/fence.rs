//! Persistent fencing state.
//!
//! Three marker files live in the data directory. Their existence is the
//! signal; only the zombie lock carries meaningful content (the hostname the
//! node deferred to, possibly blank). A missing marker always reads as "not
//! set", never as an error, and every write/remove is idempotent.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};

/// Markers owned by the fence ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Marker {
    /// All non-system databases must reject writes.
    ReadonlyLock,
    /// The node self-fenced as a suspect primary.
    ZombieLock,
    /// The node registered itself in the replication catalog at least once.
    RegistrationCertificate,
}

impl Marker {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::ReadonlyLock => "readonly.lock",
            Self::ZombieLock => "zombie.lock",
            Self::RegistrationCertificate => ".registration-cert",
        }
    }
}

/// Durable key/value backend for markers.
pub trait MarkerStore: Send + Sync {
    /// Marker contents, `None` when absent.
    fn read(&self, marker: Marker) -> Result<Option<String>>;
    fn write(&self, marker: Marker, contents: &str) -> Result<()>;
    fn remove(&self, marker: Marker) -> Result<()>;

    fn exists(&self, marker: Marker) -> Result<bool> {
        Ok(self.read(marker)?.is_some())
    }
}

/// Flat marker files under a data directory.
#[derive(Clone, Debug)]
pub struct FileMarkerStore {
    dir: PathBuf,
}

impl FileMarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, marker: Marker) -> PathBuf {
        self.dir.join(marker.file_name())
    }
}

impl MarkerStore for FileMarkerStore {
    fn read(&self, marker: Marker) -> Result<Option<String>> {
        let path = self.path(marker);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read marker {}", path.display())),
        }
    }

    fn write(&self, marker: Marker, contents: &str) -> Result<()> {
        let path = self.path(marker);
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create marker dir {}", self.dir.display()))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, contents)
            .with_context(|| format!("write marker temp {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "replace marker {} -> {}",
                tmp_path.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    fn remove(&self, marker: Marker) -> Result<()> {
        let path = self.path(marker);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove marker {}", path.display())),
        }
    }
}

/// In-process marker store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    markers: Mutex<BTreeMap<Marker, String>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Marker, String>>> {
        self.markers
            .lock()
            .map_err(|_| anyhow!("marker store mutex poisoned"))
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn read(&self, marker: Marker) -> Result<Option<String>> {
        Ok(self.guard()?.get(&marker).cloned())
    }

    fn write(&self, marker: Marker, contents: &str) -> Result<()> {
        self.guard()?.insert(marker, contents.to_string());
        Ok(())
    }

    fn remove(&self, marker: Marker) -> Result<()> {
        self.guard()?.remove(&marker);
        Ok(())
    }
}

/// Effective write posture of this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FenceState {
    Unfenced,
    /// Readonly lock held (disk watchdog or operator), no zombie lock.
    ReadOnly,
    /// Self-fenced suspect primary. `deferred_to` is the primary it yielded to.
    Zombie { deferred_to: Option<String> },
}

impl FenceState {
    pub fn allows_writes(&self) -> bool {
        matches!(self, Self::Unfenced)
    }
}

/// Single owner of the fencing markers.
#[derive(Clone)]
pub struct FenceLedger {
    store: Arc<dyn MarkerStore>,
}

impl FenceLedger {
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryMarkerStore::new()))
    }

    /// The zombie lock dominates the readonly lock.
    pub fn state(&self) -> Result<FenceState> {
        if let Some(contents) = self.store.read(Marker::ZombieLock)? {
            return Ok(FenceState::Zombie {
                deferred_to: non_blank(&contents),
            });
        }
        if self.store.exists(Marker::ReadonlyLock)? {
            return Ok(FenceState::ReadOnly);
        }
        Ok(FenceState::Unfenced)
    }

    pub fn is_zombie(&self) -> Result<bool> {
        self.store.exists(Marker::ZombieLock)
    }

    /// Hostname recorded in the zombie lock, `None` when absent or blank.
    pub fn deferred_primary(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .read(Marker::ZombieLock)?
            .as_deref()
            .and_then(non_blank))
    }

    pub fn write_zombie_lock(&self, deferred_to: &str) -> Result<()> {
        self.store
            .write(Marker::ZombieLock, deferred_to.trim())
            .context("write zombie lock")
    }

    pub fn remove_zombie_lock(&self) -> Result<()> {
        self.store
            .remove(Marker::ZombieLock)
            .context("remove zombie lock")
    }

    pub fn is_readonly_locked(&self) -> Result<bool> {
        self.store.exists(Marker::ReadonlyLock)
    }

    pub fn write_readonly_lock(&self) -> Result<()> {
        self.store
            .write(Marker::ReadonlyLock, "")
            .context("write readonly lock")
    }

    pub fn remove_readonly_lock(&self) -> Result<()> {
        self.store
            .remove(Marker::ReadonlyLock)
            .context("remove readonly lock")
    }

    pub fn is_registered(&self) -> Result<bool> {
        self.store.exists(Marker::RegistrationCertificate)
    }

    pub fn issue_registration_certificate(&self, hostname: &str) -> Result<()> {
        self.store
            .write(Marker::RegistrationCertificate, hostname)
            .context("write registration certificate")
    }

    pub fn revoke_registration_certificate(&self) -> Result<()> {
        self.store
            .remove(Marker::RegistrationCertificate)
            .context("remove registration certificate")
    }
}

fn non_blank(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
