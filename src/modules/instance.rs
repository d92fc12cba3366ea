//! Bookkeeping for running daemon instances.
//!
//! Each instance owns a directory `<runtime_dir>/leapfrog/<name>/` holding
//! its takeover socket, a `pid` file and an `instance.json` record. The
//! `restart` and `instances` commands find running daemons through these
//! records.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::constants::{INSTANCE_RECORD_NAME, PID_FILE_NAME, RUNTIME_SUBDIR, TAKEOVER_SOCKET_NAME};
use super::registry::SessionKind;

/// What a running daemon publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance name
    pub name: String,
    /// Unique id of this daemon process; changes on every takeover
    pub generation_id: Uuid,
    /// How many takeovers led to this process
    #[serde(default)]
    pub generation: u32,
    /// Process id of the daemon
    pub pid: i32,
    /// Seconds since the epoch
    pub started_at: u64,
    /// Where a successor should connect
    pub takeover_socket: PathBuf,
    /// Arguments a successor is started with
    #[serde(default)]
    pub args: Vec<String>,
    /// Mounts being served
    #[serde(default)]
    pub mounts: Vec<(PathBuf, SessionKind)>,
}

impl InstanceRecord {
    /// A record for the current process.
    pub fn for_current_process(name: &str, takeover_socket: PathBuf, generation: u32) -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            name: name.to_string(),
            generation_id: Uuid::new_v4(),
            generation,
            pid: std::process::id() as i32,
            started_at,
            takeover_socket,
            args: Vec::new(),
            mounts: Vec::new(),
        }
    }

    /// Whether the recorded process still exists.
    pub fn is_running(&self) -> bool {
        process_exists(self.pid)
    }
}

/// Whether `pid` names a live process we could signal.
pub fn process_exists(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// Reads and writes instance records under one runtime directory.
pub struct InstanceManager {
    root: PathBuf,
}

impl InstanceManager {
    /// Opens `<runtime_dir>/leapfrog`, creating it if needed.
    pub fn new(runtime_dir: &Path) -> Result<Self> {
        let root = runtime_dir.join(RUNTIME_SUBDIR);
        fs::create_dir_all(&root).with_context(|| format!("creating {:?}", root))?;
        Ok(Self { root })
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn takeover_socket(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(TAKEOVER_SOCKET_NAME)
    }

    /// Writes the record and pid file, replacing any previous generation's.
    pub fn register(&self, record: &InstanceRecord) -> Result<()> {
        let dir = self.instance_dir(&record.name);
        fs::create_dir_all(&dir)?;

        // Write-then-rename so readers never see a half-written record.
        let tmp = dir.join(format!(".{}.{}", INSTANCE_RECORD_NAME, record.pid));
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, dir.join(INSTANCE_RECORD_NAME))?;

        let mut pid_file = fs::File::create(dir.join(PID_FILE_NAME))?;
        writeln!(pid_file, "{}", record.pid)?;
        info!(
            "registered instance {} (pid {}, generation {})",
            record.name, record.pid, record.generation
        );
        Ok(())
    }

    /// Replaces the published mount list of `name`.
    pub fn update_mounts(&self, name: &str, mounts: Vec<(PathBuf, SessionKind)>) -> Result<()> {
        let mut record = self
            .get(name)?
            .ok_or_else(|| anyhow!("instance {} is not registered", name))?;
        record.mounts = mounts;
        self.register(&record)
    }

    pub fn get(&self, name: &str) -> Result<Option<InstanceRecord>> {
        let path = self.instance_dir(name).join(INSTANCE_RECORD_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("parsing instance record {:?}", path))?;
        Ok(Some(record))
    }

    /// All readable records, running or not, sorted by name.
    pub fn list(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.get(&name) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable instance {}: {:#}", name, e),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Sends SIGTERM to a running instance. Its daemon unmounts and removes
    /// its own record on the way out.
    pub fn kill(&self, name: &str) -> Result<()> {
        let record = self
            .get(name)?
            .ok_or_else(|| anyhow!("instance not found: {}", name))?;
        if !record.is_running() {
            self.remove(name)?;
            return Err(anyhow!("instance {} was not running; record removed", name));
        }
        signal::kill(Pid::from_raw(record.pid), Signal::SIGTERM)?;
        info!("sent SIGTERM to instance {} (pid {})", name, record.pid);
        Ok(())
    }

    /// Removes records whose process is gone. Returns how many.
    pub fn purge(&self) -> Result<usize> {
        let mut removed = 0;
        for record in self.list()? {
            if record.is_running() {
                continue;
            }
            match self.remove(&record.name) {
                Ok(()) => removed += 1,
                Err(e) => error!("failed to remove stale instance {}: {}", record.name, e),
            }
        }
        info!("purged {} stale instances", removed);
        Ok(removed)
    }

    /// Deletes the instance directory.
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.instance_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("removing {:?}", dir))?;
        }
        Ok(())
    }

    /// Deletes the record only if it still names `pid`; after a takeover
    /// the successor owns the directory.
    pub fn remove_if_owner(&self, name: &str, pid: i32) -> Result<bool> {
        match self.get(name)? {
            Some(record) if record.pid == pid => {
                self.remove(name)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_register_and_read_back() -> Result<()> {
        let dir = tempdir()?;
        let manager = InstanceManager::new(dir.path())?;
        let mut record =
            InstanceRecord::for_current_process("main", manager.takeover_socket("main"), 0);
        record.args = vec!["daemon".into(), "--instance".into(), "main".into()];
        manager.register(&record)?;

        assert_eq!(manager.get("main")?, Some(record.clone()));
        assert!(record.is_running());
        let pid = fs::read_to_string(manager.instance_dir("main").join(PID_FILE_NAME))?;
        assert_eq!(pid.trim(), record.pid.to_string());

        manager.update_mounts("main", vec![(PathBuf::from("/data/x"), SessionKind::Fuse)])?;
        assert_eq!(manager.get("main")?.unwrap().mounts.len(), 1);
        Ok(())
    }

    #[test]
    fn test_purge_removes_only_dead_instances() -> Result<()> {
        let dir = tempdir()?;
        let manager = InstanceManager::new(dir.path())?;

        let alive = InstanceRecord::for_current_process("alive", manager.takeover_socket("alive"), 0);
        let mut dead = InstanceRecord::for_current_process("dead", manager.takeover_socket("dead"), 3);
        // Far above any default pid_max.
        dead.pid = 999_999_999;
        manager.register(&alive)?;
        manager.register(&dead)?;

        assert_eq!(manager.list()?.len(), 2);
        assert_eq!(manager.purge()?, 1);
        let names: Vec<String> = manager.list()?.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alive".to_string()]);
        Ok(())
    }

    #[test]
    fn test_remove_if_owner_respects_successor() -> Result<()> {
        let dir = tempdir()?;
        let manager = InstanceManager::new(dir.path())?;
        let mut successor =
            InstanceRecord::for_current_process("main", manager.takeover_socket("main"), 1);
        successor.pid += 1;
        manager.register(&successor)?;

        let me = std::process::id() as i32;
        assert!(!manager.remove_if_owner("main", me)?);
        assert!(manager.get("main")?.is_some());
        assert!(manager.remove_if_owner("main", successor.pid)?);
        assert!(manager.get("main")?.is_none());
        Ok(())
    }

    #[test]
    fn test_kill_unknown_instance() -> Result<()> {
        let dir = tempdir()?;
        let manager = InstanceManager::new(dir.path())?;
        assert!(manager.kill("nope").is_err());
        Ok(())
    }
}
