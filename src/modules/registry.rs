//! The daemon's registry of active mounts.
//!
//! A `MountRegistry` is created at startup, shared by every component that
//! needs to enumerate or change the set of mounts, handed to the takeover
//! coordinator during a restart and torn down at commit or shutdown. It
//! owns each mount's kernel session handle.

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::RegistryError;

/// The kernel bridge a mount is presented through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// A `/dev/fuse` connection
    Fuse,
    /// A loopback NFS server socket
    Nfs,
}

impl SessionKind {
    /// Every kind this build knows how to serve.
    pub const ALL: [SessionKind; 2] = [SessionKind::Fuse, SessionKind::Nfs];
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Fuse => write!(f, "fuse"),
            SessionKind::Nfs => write!(f, "nfs"),
        }
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fuse" => Ok(SessionKind::Fuse),
            "nfs" => Ok(SessionKind::Nfs),
            other => Err(format!("unknown session kind: {}", other)),
        }
    }
}

/// Serializable part of a mount entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountMetadata {
    /// Absolute, normalized mount path
    pub mount_path: PathBuf,
    /// Kernel bridge in use
    pub kind: SessionKind,
    /// High-water inode number handed out so far
    pub inode_counter: u64,
    /// Inode layer state, passed through untouched
    pub state: Vec<u8>,
    /// Bind mounts layered inside this mount
    #[serde(default)]
    pub bind_mounts: Vec<PathBuf>,
}

/// One active mount together with its owned session handle.
#[derive(Debug)]
pub struct MountInfo {
    /// Everything but the handle
    pub metadata: MountMetadata,
    /// The kernel session handle; exactly one process owns it
    pub handle: OwnedFd,
}

impl MountInfo {
    /// Creates an entry for a freshly mounted session with empty inode state.
    pub fn new(mount_path: PathBuf, kind: SessionKind, handle: OwnedFd) -> Self {
        Self {
            metadata: MountMetadata {
                mount_path,
                kind,
                inode_counter: 0,
                state: Vec::new(),
                bind_mounts: Vec::new(),
            },
            handle,
        }
    }

    /// Mount path of this entry.
    pub fn path(&self) -> &Path {
        &self.metadata.mount_path
    }

    /// Session kind of this entry.
    pub fn kind(&self) -> SessionKind {
        self.metadata.kind
    }

    /// Borrows the session handle.
    pub fn handle(&self) -> BorrowedFd<'_> {
        self.handle.as_fd()
    }
}

/// Registry of active mounts keyed by mount path.
///
/// Cloning is cheap; all clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MountRegistry {
    mounts: Arc<Mutex<BTreeMap<PathBuf, MountInfo>>>,
}

impl MountRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mount. Fails if the path is already present.
    pub fn insert(&self, info: MountInfo) -> Result<(), RegistryError> {
        let mut mounts = self.mounts.lock();
        let path = info.path().to_path_buf();
        if mounts.contains_key(&path) {
            return Err(RegistryError::DuplicatePath(path));
        }
        debug!("registering mount {:?} ({})", path, info.kind());
        mounts.insert(path, info);
        Ok(())
    }

    /// Registers several mounts atomically: either all are added or none.
    pub fn insert_all(&self, infos: Vec<MountInfo>) -> Result<(), RegistryError> {
        let mut mounts = self.mounts.lock();
        let mut seen = std::collections::BTreeSet::new();
        for info in &infos {
            let path = info.path();
            if mounts.contains_key(path) || !seen.insert(path.to_path_buf()) {
                return Err(RegistryError::DuplicatePath(path.to_path_buf()));
            }
        }
        for info in infos {
            mounts.insert(info.path().to_path_buf(), info);
        }
        Ok(())
    }

    /// Removes and returns a mount.
    pub fn remove(&self, path: &Path) -> Result<MountInfo, RegistryError> {
        self.mounts
            .lock()
            .remove(path)
            .ok_or_else(|| RegistryError::NotFound(path.to_path_buf()))
    }

    /// Removes every mount, in path order.
    pub fn take_all(&self) -> Vec<MountInfo> {
        let mut mounts = self.mounts.lock();
        std::mem::take(&mut *mounts).into_values().collect()
    }

    /// Whether a mount is registered at `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.mounts.lock().contains_key(path)
    }

    /// Number of registered mounts.
    pub fn len(&self) -> usize {
        self.mounts.lock().len()
    }

    /// Whether no mounts are registered.
    pub fn is_empty(&self) -> bool {
        self.mounts.lock().is_empty()
    }

    /// Registered mount paths, in path order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.mounts.lock().keys().cloned().collect()
    }

    /// Registered mounts with their session kinds.
    pub fn kinds(&self) -> Vec<(PathBuf, SessionKind)> {
        self.mounts
            .lock()
            .values()
            .map(|info| (info.path().to_path_buf(), info.kind()))
            .collect()
    }

    /// Snapshot of every entry's metadata.
    pub fn metadata(&self) -> Vec<MountMetadata> {
        self.mounts
            .lock()
            .values()
            .map(|info| info.metadata.clone())
            .collect()
    }

    /// Runs `f` against the entry at `path`, if any.
    pub fn with_mount<R>(&self, path: &Path, f: impl FnOnce(&mut MountInfo) -> R) -> Option<R> {
        self.mounts.lock().get_mut(path).map(f)
    }
}
