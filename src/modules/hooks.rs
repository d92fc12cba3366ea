//! Narrow interfaces to the daemon's service and inode layers.
//!
//! The takeover coordinator never looks inside inode state or filesystem
//! requests; it only calls these hooks at fixed protocol steps.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::info;
use parking_lot::Mutex;

use super::registry::{MountInfo, MountRegistry, SessionKind};

/// Inode layer state detached from a mount for handoff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// High-water inode number
    pub inode_counter: u64,
    /// Opaque state blob
    pub blob: Vec<u8>,
}

/// Hooks exposed by the RPC/service layer.
pub trait ServiceControl: Send + Sync {
    /// Stops accepting new top-level filesystem operations.
    fn pause_new_operations(&self) -> Result<()>;

    /// Starts accepting new top-level filesystem operations again.
    fn resume_new_operations(&self) -> Result<()>;

    /// Mounts currently being served, with their session kinds.
    fn active_mounts(&self) -> Vec<(PathBuf, SessionKind)>;
}

/// Hooks exposed by the inode/session layer.
pub trait SessionLayer: Send + Sync {
    /// Stops dispatching requests for `path` and returns its state.
    fn detach_session(&self, path: &Path) -> Result<SessionState>;

    /// Starts dispatching requests for `mount` from its session handle.
    fn attach_session(&self, mount: &MountInfo) -> Result<()>;
}

/// A `ServiceControl` backed directly by the mount registry.
///
/// Used when no RPC layer is wired in: pausing only flips a flag that
/// callers can poll through [`RegistryService::is_paused`].
#[derive(Debug, Clone)]
pub struct RegistryService {
    registry: MountRegistry,
    paused: Arc<AtomicBool>,
}

impl RegistryService {
    pub fn new(registry: MountRegistry) -> Self {
        Self {
            registry,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl ServiceControl for RegistryService {
    fn pause_new_operations(&self) -> Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        info!("paused new filesystem operations");
        Ok(())
    }

    fn resume_new_operations(&self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        info!("resumed new filesystem operations");
        Ok(())
    }

    fn active_mounts(&self) -> Vec<(PathBuf, SessionKind)> {
        self.registry.kinds()
    }
}

/// A `SessionLayer` that keeps each mount's state in memory and records
/// which mounts are attached.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionLayer {
    states: Arc<Mutex<HashMap<PathBuf, SessionState>>>,
    attached: Arc<Mutex<Vec<PathBuf>>>,
}

impl MemorySessionLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state `detach_session` will return for `path`.
    pub fn set_state(&self, path: &Path, state: SessionState) {
        self.states.lock().insert(path.to_path_buf(), state);
    }

    /// Paths currently attached, in attach order.
    pub fn attached(&self) -> Vec<PathBuf> {
        self.attached.lock().clone()
    }
}

impl SessionLayer for MemorySessionLayer {
    fn detach_session(&self, path: &Path) -> Result<SessionState> {
        let mut attached = self.attached.lock();
        attached.retain(|p| p != path);
        Ok(self.states.lock().get(path).cloned().unwrap_or_default())
    }

    fn attach_session(&self, mount: &MountInfo) -> Result<()> {
        let mut attached = self.attached.lock();
        if attached.iter().any(|p| p == mount.path()) {
            return Err(anyhow!("{:?} is already attached", mount.path()));
        }
        attached.push(mount.path().to_path_buf());
        self.states.lock().insert(
            mount.path().to_path_buf(),
            SessionState {
                inode_counter: mount.metadata.inode_counter,
                blob: mount.metadata.state.clone(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::OwnedFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_memory_layer_round_trips_state() -> Result<()> {
        let layer = MemorySessionLayer::new();
        let (handle, _peer) = UnixStream::pair()?;
        let mut info = MountInfo::new(PathBuf::from("/a"), SessionKind::Fuse, OwnedFd::from(handle));
        info.metadata.inode_counter = 42;
        info.metadata.state = b"tree".to_vec();

        layer.attach_session(&info)?;
        assert!(layer.attach_session(&info).is_err());
        assert_eq!(layer.attached(), vec![PathBuf::from("/a")]);

        let state = layer.detach_session(Path::new("/a"))?;
        assert_eq!(state.inode_counter, 42);
        assert_eq!(state.blob, b"tree");
        assert!(layer.attached().is_empty());
        Ok(())
    }

    #[test]
    fn test_registry_service_pause_flag() -> Result<()> {
        let service = RegistryService::new(MountRegistry::new());
        assert!(!service.is_paused());
        service.pause_new_operations()?;
        assert!(service.is_paused());
        service.resume_new_operations()?;
        assert!(!service.is_paused());
        assert!(service.active_mounts().is_empty());
        Ok(())
    }
}
