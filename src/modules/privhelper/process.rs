//! Starting and reaching the privileged helper process.
//!
//! Two deployments are supported:
//!
//! - **Forked**: the daemon starts as root, forks the helper over a socket
//!   pair, then drops its own privileges. [`ForkedConnector`] hands out that
//!   pre-forked channel once; after privileges are dropped a lost helper
//!   cannot be restarted from the daemon.
//! - **Standalone**: `lpf helper --socket PATH` runs as a separately
//!   supervised root process. [`SocketConnector`] reconnects to it as often
//!   as needed, and [`HelperListener`] only serves peers whose uid is
//!   allowed.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{error, info, warn};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, fork, ForkResult, Gid, Pid, Uid};

use super::client::HelperConnector;
use super::mounter::SystemMounter;
use super::server::{HelperPolicy, HelperServer};
use crate::modules::channel::Channel;
use crate::modules::error::ChannelError;

/// Identity the daemon runs as once privileges are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// The user who invoked us: `SUDO_UID`/`SUDO_GID` when run through sudo,
    /// otherwise the real ids of this process.
    pub fn invoking_user() -> Self {
        let from_env = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u32>().ok());
        Self {
            uid: from_env("SUDO_UID").unwrap_or_else(|| unistd::getuid().as_raw()),
            gid: from_env("SUDO_GID").unwrap_or_else(|| unistd::getgid().as_raw()),
        }
    }
}

/// A forked helper child.
#[derive(Debug)]
pub struct HelperProcess {
    pid: Pid,
}

impl HelperProcess {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Whether the child is still running. Reaps it if it has exited.
    pub fn is_alive(&self) -> bool {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                warn!("privileged helper {} exited: {:?}", self.pid, status);
                false
            }
            Err(_) => false,
        }
    }

    /// Waits for the child to exit and returns its exit code.
    pub fn wait(&self) -> Result<i32> {
        match waitpid(self.pid, None)? {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
            other => {
                warn!("unexpected helper wait status: {:?}", other);
                Ok(1)
            }
        }
    }
}

/// Forks a privileged helper serving `policy` for a daemon that will run as
/// `owner`. Returns the child and the daemon's end of its channel.
///
/// Must be called before the process starts any threads.
pub fn spawn_helper(policy: HelperPolicy, owner: Credentials) -> Result<(HelperProcess, Channel)> {
    let (daemon_end, helper_end) = UnixStream::pair().context("creating helper socket pair")?;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(helper_end);
            info!("started privileged helper (pid {})", child);
            Ok((HelperProcess { pid: child }, Channel::new(daemon_end)))
        }
        Ok(ForkResult::Child) => {
            drop(daemon_end);
            let code = match run_forked_helper(helper_end, policy, owner) {
                Ok(()) => 0,
                Err(e) => {
                    error!("privileged helper failed: {:#}", e);
                    1
                }
            };
            std::process::exit(code);
        }
        Err(err) => {
            error!("forking privileged helper failed: {}", err);
            Err(err.into())
        }
    }
}

fn run_forked_helper(stream: UnixStream, policy: HelperPolicy, owner: Credentials) -> Result<()> {
    restrict_helper()?;
    let server = HelperServer::new(
        Channel::new(stream),
        SystemMounter::new(owner.uid, owner.gid),
        policy,
    );
    server.serve()?;
    Ok(())
}

/// Narrows the helper to what mounting needs. On Linux a root helper
/// keeps `CAP_SYS_ADMIN` and nothing else, loses its supplementary groups
/// and can never regain privileges through exec.
///
/// Capabilities are per thread: call this before starting any.
pub fn restrict_helper() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
            return Err(std::io::Error::last_os_error()).context("PR_SET_NO_NEW_PRIVS");
        }
        if unistd::geteuid().is_root() {
            unistd::setgroups(&[]).context("clearing supplementary groups")?;
            capabilities::keep_only(&[capabilities::CAP_SYS_ADMIN])?;
        }
    }
    unistd::chdir("/").context("chdir to /")?;
    umask(Mode::from_bits_truncate(0o022));
    Ok(())
}

#[cfg(target_os = "linux")]
mod capabilities {
    //! Raw `capset(2)`; libc has the syscall number but not its structs.

    use anyhow::{Context, Result};
    use log::info;

    pub const CAP_SYS_ADMIN: u32 = 21;
    const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
    /// Version 3 describes each set as two 32-bit words.
    const CAP_WORDS: usize = 2;

    #[repr(C)]
    struct Header {
        version: u32,
        pid: libc::c_int,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub(super) struct Sets {
        pub(super) effective: u32,
        pub(super) permitted: u32,
        pub(super) inheritable: u32,
    }

    /// Effective and permitted sets holding exactly `keep`; nothing inheritable.
    pub(super) fn sets_for(keep: &[u32]) -> [Sets; CAP_WORDS] {
        let mut sets = [Sets::default(); CAP_WORDS];
        for &cap in keep {
            if let Some(word) = sets.get_mut((cap / 32) as usize) {
                let bit = 1u32 << (cap % 32);
                word.effective |= bit;
                word.permitted |= bit;
            }
        }
        sets
    }

    /// Drops every capability not in `keep` from the calling thread's
    /// bounding, permitted, effective and inheritable sets.
    pub(super) fn keep_only(keep: &[u32]) -> Result<()> {
        for cap in 0..(CAP_WORDS as u32 * 32) {
            if keep.contains(&cap) {
                continue;
            }
            if unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) } != 0 {
                let err = std::io::Error::last_os_error();
                // Past the highest capability this kernel knows.
                if err.raw_os_error() == Some(libc::EINVAL) {
                    break;
                }
                return Err(err)
                    .with_context(|| format!("dropping capability {} from the bounding set", cap));
            }
        }

        let mut header = Header {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let sets = sets_for(keep);
        let rc = unsafe {
            libc::syscall(
                libc::SYS_capset,
                &mut header as *mut Header,
                sets.as_ptr(),
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("capset");
        }
        info!("helper capabilities limited to {:?}", keep);
        Ok(())
    }
}

/// Permanently switches the calling process to `creds`. A no-op when the
/// process is not running as root.
pub fn drop_privileges(creds: Credentials) -> Result<()> {
    if !unistd::geteuid().is_root() {
        return Ok(());
    }
    let gid = Gid::from_raw(creds.gid);
    #[cfg(target_os = "linux")]
    unistd::setgroups(&[gid]).context("setting supplementary groups")?;
    unistd::setgid(gid).context("setgid")?;
    unistd::setuid(Uid::from_raw(creds.uid)).context("setuid")?;
    info!("dropped privileges to uid {} gid {}", creds.uid, creds.gid);
    Ok(())
}

/// Connector for a helper forked at startup.
pub struct ForkedConnector {
    channel: Option<Channel>,
    process: HelperProcess,
}

impl ForkedConnector {
    pub fn new(process: HelperProcess, channel: Channel) -> Self {
        Self {
            channel: Some(channel),
            process,
        }
    }

    pub fn process(&self) -> &HelperProcess {
        &self.process
    }
}

impl HelperConnector for ForkedConnector {
    fn connect(&mut self) -> Result<Channel, ChannelError> {
        match self.channel.take() {
            Some(channel) => Ok(channel),
            None => {
                if !self.process.is_alive() {
                    warn!("forked helper is gone and cannot be restarted without privileges");
                }
                Err(ChannelError::Disconnected)
            }
        }
    }

    fn describe(&self) -> String {
        format!("forked helper pid {}", self.process.pid)
    }
}

/// Connector for a standalone helper listening on a Unix socket.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    path: PathBuf,
}

impl SocketConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HelperConnector for SocketConnector {
    fn connect(&mut self) -> Result<Channel, ChannelError> {
        let channel = Channel::connect(&self.path)?;
        #[cfg(target_os = "linux")]
        {
            let peer = peer_uid(channel.as_raw_fd())?;
            if peer != 0 && peer != unistd::geteuid().as_raw() {
                warn!("helper socket {:?} is owned by uid {}; refusing", self.path, peer);
                return Err(ChannelError::Disconnected);
            }
        }
        Ok(channel)
    }

    fn describe(&self) -> String {
        format!("{}", self.path.display())
    }
}

#[cfg(target_os = "linux")]
fn peer_uid(fd: std::os::unix::io::RawFd) -> Result<u32, ChannelError> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    Ok(getsockopt(fd, PeerCredentials)?.uid())
}

/// Accepts daemon connections for a standalone helper.
pub struct HelperListener {
    listener: UnixListener,
    path: PathBuf,
    policy: HelperPolicy,
    allowed_uids: Vec<u32>,
}

impl HelperListener {
    /// Binds `path`, replacing a stale socket file.
    pub fn bind(path: &Path, policy: HelperPolicy, allowed_uids: Vec<u32>) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("removing stale socket {:?}", path))?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let listener =
            UnixListener::bind(path).with_context(|| format!("binding helper socket {:?}", path))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;
        info!("privileged helper listening on {:?}", path);
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            policy,
            allowed_uids,
        })
    }

    /// Serves one daemon connection at a time, forever.
    pub fn serve_forever(&self) -> Result<()> {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("accept on {:?} failed: {}", self.path, e);
                    continue;
                }
            };
            if let Err(e) = self.serve_one(stream) {
                warn!("helper connection ended with error: {:#}", e);
            }
        }
        Ok(())
    }

    fn serve_one(&self, stream: UnixStream) -> Result<()> {
        let owner = self.authorize(&stream)?;
        let server = HelperServer::new(
            Channel::new(stream),
            SystemMounter::new(owner.uid, owner.gid),
            self.policy.clone(),
        );
        server.serve()?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn authorize(&self, stream: &UnixStream) -> Result<Credentials> {
        use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

        let creds = getsockopt(stream.as_raw_fd(), PeerCredentials)?;
        if creds.uid() != 0 && !self.allowed_uids.contains(&creds.uid()) {
            anyhow::bail!("uid {} may not use this helper", creds.uid());
        }
        info!("accepted daemon pid {} (uid {})", creds.pid(), creds.uid());
        Ok(Credentials {
            uid: creds.uid(),
            gid: creds.gid(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn authorize(&self, stream: &UnixStream) -> Result<Credentials> {
        let (uid, gid) = unistd::getpeereid(stream.as_raw_fd())?;
        if !uid.is_root() && !self.allowed_uids.contains(&uid.as_raw()) {
            anyhow::bail!("uid {} may not use this helper", uid);
        }
        Ok(Credentials {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
        })
    }
}

impl Drop for HelperListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::constants::HELPER_PROTOCOL_VERSION;
    use crate::modules::privhelper::protocol::{
        HelperEnvelope, HelperReply, HelperResponse, PrivilegedRequest,
    };
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_invoking_user_prefers_sudo_ids() {
        std::env::set_var("SUDO_UID", "1234");
        std::env::set_var("SUDO_GID", "5678");
        let creds = Credentials::invoking_user();
        std::env::remove_var("SUDO_UID");
        std::env::remove_var("SUDO_GID");
        assert_eq!(creds, Credentials { uid: 1234, gid: 5678 });
    }

    #[test]
    fn test_socket_helper_serves_own_uid() -> Result<()> {
        let dir = tempdir()?;
        let socket = dir.path().join("helper.sock");
        let me = unistd::geteuid().as_raw();
        let listener = HelperListener::bind(&socket, HelperPolicy::new(["/data"]), vec![me])?;
        thread::spawn(move || listener.serve_forever());

        let mut connector = SocketConnector::new(&socket);
        let mut channel = connector.connect()?;
        channel.send(
            &HelperEnvelope {
                xid: 1,
                body: PrivilegedRequest::Handshake {
                    version: HELPER_PROTOCOL_VERSION,
                },
            },
            Vec::new(),
        )?;
        let (response, _): (HelperEnvelope<HelperResponse>, _) = channel.recv()?;
        assert_eq!(
            response.body,
            Ok(HelperReply::HandshakeAccepted {
                version: HELPER_PROTOCOL_VERSION
            })
        );
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_capability_sets_keep_only_sys_admin() {
        use super::capabilities::{sets_for, Sets, CAP_SYS_ADMIN};

        let sets = sets_for(&[CAP_SYS_ADMIN]);
        assert_eq!(
            sets[0],
            Sets {
                effective: 1 << 21,
                permitted: 1 << 21,
                inheritable: 0,
            }
        );
        assert_eq!(sets[1], Sets::default());

        // CAP_CHECKPOINT_RESTORE lives in the second word.
        let sets = sets_for(&[40]);
        assert_eq!(sets[0], Sets::default());
        assert_eq!(sets[1].permitted, 1 << 8);
        assert_eq!(sets_for(&[]), [Sets::default(); 2]);
    }

    #[test]
    fn test_forked_connector_hands_out_channel_once() -> Result<()> {
        let (daemon, _helper) = Channel::pair()?;
        let process = HelperProcess {
            pid: unistd::getpid(),
        };
        let mut connector = ForkedConnector::new(process, daemon);
        assert!(connector.connect().is_ok());
        assert!(matches!(connector.connect(), Err(ChannelError::Disconnected)));
        Ok(())
    }
}
