//! Mount-table effects performed by the helper.
//!
//! `HelperServer` decides *whether* an operation may happen; a
//! `PrivilegedBackend` performs it. `SystemMounter` is the real backend.

use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};

use super::protocol::{MountOptions, PrivilegedFailure};
use crate::modules::registry::SessionKind;

/// How hard an unmount should try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    /// Plain unmount; fails when busy.
    Normal,
    /// Forced unmount (`MNT_FORCE`).
    Force,
    /// Lazy detach (`MNT_DETACH`); always succeeds on a mount point.
    Detach,
}

/// A path the server has checked, and how system calls should reach it.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    /// The path as requested, normalized
    pub path: &'a Path,
    /// A `/proc/self/fd/...` path anchored on a handle the server holds
    /// open for the duration of the call; `None` if the path does not exist
    pub via: Option<&'a Path>,
}

impl<'a> Target<'a> {
    /// The pinned path, or `InvalidPath` when nothing exists there.
    pub fn existing(&self) -> Result<&'a Path, PrivilegedFailure> {
        self.via
            .ok_or_else(|| PrivilegedFailure::InvalidPath(format!("{:?} does not exist", self.path)))
    }
}

/// Everything the backend needs to mount a session.
#[derive(Debug, Clone)]
pub struct MountSpec<'a> {
    pub target: Target<'a>,
    pub kind: SessionKind,
    pub options: &'a MountOptions,
    pub daemon_timeout: Option<Duration>,
}

/// Kernel-facing operations requiring privilege.
pub trait PrivilegedBackend {
    /// Mounts a session. FUSE mounts return the session handle; NFS
    /// mounts return `None` since the daemon already owns its server socket.
    fn mount(&mut self, spec: &MountSpec<'_>) -> Result<Option<OwnedFd>, PrivilegedFailure>;

    /// Unmounts `target`. Returns `Ok(false)` if nothing was mounted there.
    /// `target.via` resolves the parent only; the last component is never
    /// followed.
    fn unmount(&mut self, target: Target<'_>, mode: UnmountMode) -> Result<bool, PrivilegedFailure>;

    /// Bind-mounts `source` onto `target`.
    fn bind_mount(&mut self, source: Target<'_>, target: Target<'_>) -> Result<(), PrivilegedFailure>;

    /// Redirects the helper's log output to `file`.
    fn redirect_log(&mut self, file: OwnedFd) -> Result<(), PrivilegedFailure>;
}

/// Backend that calls the kernel directly.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    /// Owner of new FUSE mounts
    uid: u32,
    gid: u32,
}

impl SystemMounter {
    /// `uid`/`gid` identify the unprivileged daemon that will serve the mounts.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    #[cfg(target_os = "linux")]
    fn fuse_data(&self, fd: i32, options: &MountOptions) -> String {
        use crate::modules::constants::FUSE_ROOT_MODE;

        let mut data = format!(
            "fd={},rootmode={:o},user_id={},group_id={},default_permissions",
            fd, FUSE_ROOT_MODE, self.uid, self.gid
        );
        if options.allow_other {
            data.push_str(",allow_other");
        }
        data
    }
}

#[cfg(target_os = "linux")]
impl PrivilegedBackend for SystemMounter {
    fn mount(&mut self, spec: &MountSpec<'_>) -> Result<Option<OwnedFd>, PrivilegedFailure> {
        use crate::modules::constants::{FUSE_DEVICE, FUSE_FS_NAME};
        use nix::mount::{mount, MsFlags};
        use std::fs::OpenOptions;
        use std::os::unix::io::AsRawFd;

        let target = spec.target.existing()?;
        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        if spec.options.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        if spec.daemon_timeout.is_some() {
            debug!("daemon timeout has no Linux mount option; ignoring");
        }

        match spec.kind {
            SessionKind::Fuse => {
                let device = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(FUSE_DEVICE)
                    .map_err(|e| PrivilegedFailure::Os {
                        operation: format!("open {}", FUSE_DEVICE),
                        errno: e.raw_os_error().unwrap_or(libc::EIO),
                        message: e.to_string(),
                    })?;
                let data = self.fuse_data(device.as_raw_fd(), spec.options);
                let fstype = format!("fuse.{}", FUSE_FS_NAME);
                mount(
                    Some(FUSE_FS_NAME),
                    target,
                    Some(fstype.as_str()),
                    flags,
                    Some(data.as_str()),
                )
                .map_err(|e| PrivilegedFailure::from_errno("mount", spec.target.path, e))?;
                Ok(Some(OwnedFd::from(device)))
            }
            SessionKind::Nfs => {
                let server = spec.options.nfs_server.as_ref().ok_or_else(|| {
                    PrivilegedFailure::InvalidRequest("nfs mounts need a server address".into())
                })?;
                let data = format!(
                    "addr={},port={},mountport={},vers=3,proto=tcp,mountproto=tcp,nolock,soft,timeo=10,retrans=0",
                    server.addr, server.nfsd_port, server.mountd_port
                );
                let source = format!("{}:{}", server.addr, spec.target.path.display());
                mount(
                    Some(source.as_str()),
                    target,
                    Some("nfs"),
                    flags,
                    Some(data.as_str()),
                )
                .map_err(|e| PrivilegedFailure::from_errno("mount", spec.target.path, e))?;
                Ok(None)
            }
        }
    }

    fn unmount(&mut self, target: Target<'_>, mode: UnmountMode) -> Result<bool, PrivilegedFailure> {
        use nix::mount::{umount2, MntFlags};

        let Some(via) = target.via else {
            return Ok(false);
        };
        let flags = MntFlags::UMOUNT_NOFOLLOW
            | match mode {
                UnmountMode::Normal => MntFlags::empty(),
                UnmountMode::Force => MntFlags::MNT_FORCE,
                UnmountMode::Detach => MntFlags::MNT_DETACH,
            };
        match umount2(via, flags) {
            Ok(()) => Ok(true),
            // Not a mount point, or already gone.
            Err(nix::Error::EINVAL) | Err(nix::Error::ENOENT) => Ok(false),
            Err(e) => Err(PrivilegedFailure::from_errno("umount", target.path, e)),
        }
    }

    fn bind_mount(&mut self, source: Target<'_>, target: Target<'_>) -> Result<(), PrivilegedFailure> {
        use nix::mount::{mount, MsFlags};

        mount(
            Some(source.existing()?),
            target.existing()?,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| PrivilegedFailure::from_errno("bind mount", target.path, e))
    }

    fn redirect_log(&mut self, file: OwnedFd) -> Result<(), PrivilegedFailure> {
        redirect_stderr(file)
    }
}

#[cfg(not(target_os = "linux"))]
impl PrivilegedBackend for SystemMounter {
    fn mount(&mut self, spec: &MountSpec<'_>) -> Result<Option<OwnedFd>, PrivilegedFailure> {
        Err(PrivilegedFailure::Unsupported(format!(
            "{} mounts on this platform",
            spec.kind
        )))
    }

    fn unmount(&mut self, target: Target<'_>, mode: UnmountMode) -> Result<bool, PrivilegedFailure> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path = target.path;
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| PrivilegedFailure::InvalidPath(format!("{:?}", path)))?;
        let flags = match mode {
            UnmountMode::Normal => 0,
            UnmountMode::Force | UnmountMode::Detach => libc::MNT_FORCE,
        };
        if unsafe { libc::unmount(c_path.as_ptr(), flags) } == 0 {
            return Ok(true);
        }
        match nix::Error::last() {
            nix::Error::EINVAL | nix::Error::ENOENT => Ok(false),
            e => Err(PrivilegedFailure::from_errno("unmount", path, e)),
        }
    }

    fn bind_mount(&mut self, _source: Target<'_>, _target: Target<'_>) -> Result<(), PrivilegedFailure> {
        Err(PrivilegedFailure::Unsupported(
            "bind mounts on this platform".into(),
        ))
    }

    fn redirect_log(&mut self, file: OwnedFd) -> Result<(), PrivilegedFailure> {
        redirect_stderr(file)
    }
}

fn redirect_stderr(file: OwnedFd) -> Result<(), PrivilegedFailure> {
    use std::os::unix::io::AsRawFd;

    nix::unistd::dup2(file.as_raw_fd(), libc::STDERR_FILENO).map_err(|e| {
        warn!("failed to redirect log output: {}", e);
        PrivilegedFailure::Os {
            operation: "dup2".to_string(),
            errno: e as i32,
            message: e.desc().to_string(),
        }
    })?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory backend standing in for the kernel mount table.

    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Kernel-side view shared between a test and the backend it hands to
    /// a server.
    #[derive(Debug, Default)]
    pub struct FakeKernel {
        /// Mounted paths and the kernel end of their session
        pub mounts: BTreeMap<PathBuf, Option<UnixStream>>,
        pub binds: BTreeSet<PathBuf>,
        /// Paths whose normal unmount reports busy
        pub busy: BTreeSet<PathBuf>,
        /// Every mount call, in order
        pub mount_calls: Vec<PathBuf>,
        /// Paths mounted again while already mounted, leaving the first
        /// mount buried underneath
        pub shadowed: Vec<PathBuf>,
        /// Abort the serving thread right after this many mount calls,
        /// as if the helper died before it could reply
        pub crash_after_mounts: Option<usize>,
        pub log_files: usize,
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeBackend {
        pub kernel: Arc<Mutex<FakeKernel>>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn is_mounted(&self, path: &str) -> bool {
            self.kernel.lock().mounts.contains_key(Path::new(path))
        }

        /// Takes the kernel end of a mount's session, for live-handle checks.
        pub fn kernel_end(&self, path: &str) -> Option<UnixStream> {
            self.kernel
                .lock()
                .mounts
                .get_mut(Path::new(path))
                .and_then(|end| end.take())
        }
    }

    impl PrivilegedBackend for FakeBackend {
        fn mount(&mut self, spec: &MountSpec<'_>) -> Result<Option<OwnedFd>, PrivilegedFailure> {
            let path = spec.target.path.to_path_buf();
            let mut kernel = self.kernel.lock();
            kernel.mount_calls.push(path.clone());
            if kernel.mounts.contains_key(&path) {
                kernel.shadowed.push(path.clone());
            }
            let handle = match spec.kind {
                SessionKind::Fuse => {
                    let (daemon_end, kernel_end) = UnixStream::pair().map_err(|e| {
                        PrivilegedFailure::Os {
                            operation: "socketpair".into(),
                            errno: e.raw_os_error().unwrap_or(0),
                            message: e.to_string(),
                        }
                    })?;
                    kernel.mounts.insert(path, Some(kernel_end));
                    Some(OwnedFd::from(daemon_end))
                }
                SessionKind::Nfs => {
                    if spec.options.nfs_server.is_none() {
                        return Err(PrivilegedFailure::InvalidRequest(
                            "nfs mounts need a server address".into(),
                        ));
                    }
                    kernel.mounts.insert(path, None);
                    None
                }
            };
            if kernel.crash_after_mounts == Some(kernel.mount_calls.len()) {
                drop(kernel);
                panic!("helper died after mounting");
            }
            Ok(handle)
        }

        fn unmount(&mut self, target: Target<'_>, mode: UnmountMode) -> Result<bool, PrivilegedFailure> {
            let path = target.path;
            let mut kernel = self.kernel.lock();
            if kernel.binds.remove(path) {
                return Ok(true);
            }
            if !kernel.mounts.contains_key(path) {
                return Ok(false);
            }
            if mode == UnmountMode::Normal && kernel.busy.contains(path) {
                return Err(PrivilegedFailure::Busy {
                    path: path.to_path_buf(),
                });
            }
            kernel.mounts.remove(path);
            Ok(true)
        }

        fn bind_mount(&mut self, _source: Target<'_>, target: Target<'_>) -> Result<(), PrivilegedFailure> {
            self.kernel.lock().binds.insert(target.path.to_path_buf());
            Ok(())
        }

        fn redirect_log(&mut self, _file: OwnedFd) -> Result<(), PrivilegedFailure> {
            self.kernel.lock().log_files += 1;
            Ok(())
        }
    }
}
