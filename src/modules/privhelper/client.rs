//! Daemon-side access to the privileged helper.
//!
//! `HelperClient` is the only writer to the helper channel. When the channel
//! breaks it reconnects through its [`HelperConnector`], replays the
//! handshake, re-registers every mount it knows about and then resends the
//! request that failed. A mount is registered before its request goes out,
//! so a helper that mounted but died before replying is told about the
//! mount on reconnect, and the resent request replaces it rather than
//! stacking a second mount on top. Other requests are safe to resend as is.

use std::collections::BTreeMap;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::protocol::{
    HelperEnvelope, HelperReply, HelperResponse, MountOptions, PrivilegedRequest,
};
use crate::modules::channel::Channel;
use crate::modules::constants::{DEFAULT_HELPER_TIMEOUT, HELPER_PROTOCOL_VERSION};
use crate::modules::error::{ChannelError, HelperError};
use crate::modules::paths;
use crate::modules::registry::SessionKind;
use crate::modules::supervisor::Backoff;

/// Produces fresh channels to a privileged helper.
pub trait HelperConnector: Send {
    /// Opens a new, not yet handshaken channel.
    fn connect(&mut self) -> Result<Channel, ChannelError>;

    /// Human-readable target for log messages.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
struct Registration {
    kind: SessionKind,
    bind_mounts: Vec<PathBuf>,
}

struct ClientState {
    connector: Box<dyn HelperConnector>,
    channel: Option<Channel>,
    next_xid: u32,
    registered: BTreeMap<PathBuf, Registration>,
    daemon_timeout: Option<Duration>,
}

impl ClientState {
    fn xid(&mut self) -> u32 {
        self.next_xid = self.next_xid.wrapping_add(1);
        self.next_xid
    }

    /// Connects, handshakes and replays the registered mounts.
    fn establish(&mut self, timeout: Duration) -> Result<Channel, HelperError> {
        let mut channel = self.connector.connect()?;
        channel.set_timeout(Some(timeout))?;

        let xid = self.xid();
        let handshake = PrivilegedRequest::Handshake {
            version: HELPER_PROTOCOL_VERSION,
        };
        match roundtrip(&mut channel, xid, &handshake, Vec::new())?.0? {
            HelperReply::HandshakeAccepted { .. } => {}
            other => return Err(HelperError::UnexpectedReply(format!("{:?}", other))),
        }

        if let Some(timeout) = self.daemon_timeout {
            let xid = self.xid();
            roundtrip(
                &mut channel,
                xid,
                &PrivilegedRequest::SetDaemonTimeout { timeout },
                Vec::new(),
            )?
            .0?;
        }

        let registered: Vec<(PathBuf, Registration)> = self
            .registered
            .iter()
            .map(|(path, reg)| (path.clone(), reg.clone()))
            .collect();
        for (path, reg) in &registered {
            let xid = self.xid();
            let request = PrivilegedRequest::TakeoverMount {
                path: path.clone(),
                kind: reg.kind,
                bind_mounts: reg.bind_mounts.clone(),
            };
            if let Err(failure) = roundtrip(&mut channel, xid, &request, Vec::new())?.0 {
                warn!("helper refused to re-register {:?}: {}", path, failure);
            }
        }

        info!(
            "connected to privileged helper at {} ({} mounts registered)",
            self.connector.describe(),
            registered.len()
        );
        Ok(channel)
    }

    /// One attempt: (re)connect if needed, send, and wait for the matching
    /// response. The channel is dropped on any channel-level error.
    fn exchange(
        &mut self,
        request: &PrivilegedRequest,
        handles: &[OwnedFd],
        timeout: Duration,
    ) -> Result<(HelperReply, Vec<OwnedFd>), HelperError> {
        let mut channel = match self.channel.take() {
            Some(channel) => channel,
            None => self.establish(timeout)?,
        };

        let copies = handles
            .iter()
            .map(|h| h.try_clone())
            .collect::<Result<Vec<_>, _>>()
            .map_err(ChannelError::from)?;
        let xid = self.xid();
        let (response, received) = roundtrip(&mut channel, xid, request, copies)?;
        self.channel = Some(channel);
        Ok((response?, received))
    }
}

/// Sends one request and reads until the response with the same `xid`.
/// Responses to earlier, abandoned requests are discarded.
fn roundtrip(
    channel: &mut Channel,
    xid: u32,
    request: &PrivilegedRequest,
    handles: Vec<OwnedFd>,
) -> Result<(HelperResponse, Vec<OwnedFd>), ChannelError> {
    channel.send(
        &HelperEnvelope {
            xid,
            body: request,
        },
        handles,
    )?;
    loop {
        let (response, handles): (HelperEnvelope<HelperResponse>, _) = channel.recv()?;
        if response.xid == xid {
            return Ok((response.body, handles));
        }
        debug!("discarding stale helper response xid={}", response.xid);
    }
}

/// Client for the privileged helper.
pub struct HelperClient {
    state: Mutex<ClientState>,
    backoff: Backoff,
    timeout: Duration,
}

impl HelperClient {
    /// Connects to a helper, retrying per `backoff`. Exhaustion is reported
    /// as [`HelperError::Unavailable`].
    pub fn connect(
        connector: Box<dyn HelperConnector>,
        backoff: Backoff,
        timeout: Duration,
    ) -> Result<Self, HelperError> {
        let client = Self {
            state: Mutex::new(ClientState {
                connector,
                channel: None,
                next_xid: 0,
                registered: BTreeMap::new(),
                daemon_timeout: None,
            }),
            backoff,
            timeout,
        };
        client.ping()?;
        Ok(client)
    }

    /// Connects with the default retry policy and timeout.
    pub fn with_defaults(connector: Box<dyn HelperConnector>) -> Result<Self, HelperError> {
        Self::connect(connector, Backoff::default(), DEFAULT_HELPER_TIMEOUT)
    }

    fn call(
        &self,
        state: &mut ClientState,
        request: PrivilegedRequest,
        handles: &[OwnedFd],
    ) -> Result<(HelperReply, Vec<OwnedFd>), HelperError> {
        let mut delays = self.backoff.delays();
        let mut attempt = 1;
        loop {
            match state.exchange(&request, handles, self.timeout) {
                Err(HelperError::Channel(e)) => {
                    warn!(
                        "helper channel failed during {} (attempt {}/{}): {}",
                        request.name(),
                        attempt,
                        self.backoff.attempts,
                        e
                    );
                    match delays.next() {
                        Some(delay) => {
                            thread::sleep(delay);
                            attempt += 1;
                        }
                        None => {
                            return Err(HelperError::Unavailable {
                                attempts: attempt,
                                last: e.to_string(),
                            })
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// Liveness check; also establishes the connection if needed.
    pub fn ping(&self) -> Result<(), HelperError> {
        let mut state = self.state.lock();
        match self.call(&mut state, PrivilegedRequest::Ping, &[])?.0 {
            HelperReply::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Mounts a new session and returns its handle (FUSE) or `None` (NFS).
    pub fn mount(
        &self,
        path: &Path,
        kind: SessionKind,
        options: MountOptions,
    ) -> Result<Option<OwnedFd>, HelperError> {
        let mut state = self.state.lock();
        let pending = match paths::normalize(path) {
            Ok(normalized) if !state.registered.contains_key(&normalized) => {
                state.registered.insert(
                    normalized.clone(),
                    Registration {
                        kind,
                        bind_mounts: Vec::new(),
                    },
                );
                Some(normalized)
            }
            _ => None,
        };

        let request = PrivilegedRequest::Mount {
            path: path.to_path_buf(),
            kind,
            options,
        };
        let (reply, mut handles) = match self.call(&mut state, request, &[]) {
            Ok(answer) => answer,
            Err(e) => {
                // A typed failure means nothing was mounted. Otherwise the
                // mount may exist, and the next reconnect re-registers it.
                if let (HelperError::Failed(_), Some(pending)) = (&e, &pending) {
                    state.registered.remove(pending);
                }
                return Err(e);
            }
        };
        let (path, handle_attached) = match reply {
            HelperReply::Mounted {
                path,
                handle_attached,
            } => (path, handle_attached),
            other => return Err(unexpected(other)),
        };

        let handle = if handle_attached || kind == SessionKind::Fuse {
            if handles.is_empty() {
                return Err(HelperError::MissingHandle);
            }
            Some(handles.remove(0))
        } else {
            None
        };
        state.registered.insert(
            path,
            Registration {
                kind,
                bind_mounts: Vec::new(),
            },
        );
        Ok(handle)
    }

    /// Unmounts `path`. Returns whether anything was mounted.
    pub fn unmount(&self, path: &Path, force: bool) -> Result<bool, HelperError> {
        let mut state = self.state.lock();
        let request = PrivilegedRequest::Unmount {
            path: path.to_path_buf(),
            force,
        };
        match self.call(&mut state, request, &[])?.0 {
            HelperReply::Unmounted { path, was_mounted } => {
                state.registered.remove(&path);
                Ok(was_mounted)
            }
            other => Err(unexpected(other)),
        }
    }

    pub fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), HelperError> {
        let mut state = self.state.lock();
        let request = PrivilegedRequest::BindMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        };
        match self.call(&mut state, request, &[])?.0 {
            HelperReply::BindMounted { target } => {
                let owner = state
                    .registered
                    .iter_mut()
                    .filter(|(mount, _)| target.starts_with(mount))
                    .max_by_key(|(mount, _)| mount.components().count());
                if let Some((_, reg)) = owner {
                    if !reg.bind_mounts.contains(&target) {
                        reg.bind_mounts.push(target);
                    }
                }
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    pub fn bind_unmount(&self, target: &Path) -> Result<bool, HelperError> {
        let mut state = self.state.lock();
        let request = PrivilegedRequest::BindUnmount {
            target: target.to_path_buf(),
        };
        match self.call(&mut state, request, &[])?.0 {
            HelperReply::BindUnmounted {
                target,
                was_mounted,
            } => {
                for reg in state.registered.values_mut() {
                    reg.bind_mounts.retain(|bind| *bind != target);
                }
                Ok(was_mounted)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Registers a mount inherited from a previous daemon generation.
    pub fn takeover_mount(
        &self,
        path: &Path,
        kind: SessionKind,
        bind_mounts: Vec<PathBuf>,
    ) -> Result<(), HelperError> {
        let mut state = self.state.lock();
        let request = PrivilegedRequest::TakeoverMount {
            path: path.to_path_buf(),
            kind,
            bind_mounts: bind_mounts.clone(),
        };
        match self.call(&mut state, request, &[])?.0 {
            HelperReply::TakenOver { path } => {
                state.registered.insert(path, Registration { kind, bind_mounts });
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Stops the helper from tracking a mount handed to the next generation.
    pub fn takeover_unmount(&self, path: &Path) -> Result<bool, HelperError> {
        let mut state = self.state.lock();
        let request = PrivilegedRequest::TakeoverUnmount {
            path: path.to_path_buf(),
        };
        match self.call(&mut state, request, &[])?.0 {
            HelperReply::Released {
                path,
                was_registered,
            } => {
                state.registered.remove(&path);
                Ok(was_registered)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Sends the helper a file to log into. The caller keeps its copy.
    pub fn set_log_file(&self, file: &OwnedFd) -> Result<(), HelperError> {
        let mut state = self.state.lock();
        match self
            .call(&mut state, PrivilegedRequest::SetLogFile, std::slice::from_ref(file))?
            .0
        {
            HelperReply::LogFileSet => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_daemon_timeout(&self, timeout: Duration) -> Result<(), HelperError> {
        let mut state = self.state.lock();
        match self
            .call(&mut state, PrivilegedRequest::SetDaemonTimeout { timeout }, &[])?
            .0
        {
            HelperReply::DaemonTimeoutSet { .. } => {
                state.daemon_timeout = Some(timeout);
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Mounts the helper currently tracks on this daemon's behalf.
    pub fn registered_mounts(&self) -> Vec<PathBuf> {
        self.state.lock().registered.keys().cloned().collect()
    }

    /// Closes the channel. The helper keeps whatever it has mounted.
    pub fn disconnect(&self) {
        if let Some(channel) = self.state.lock().channel.take() {
            if let Err(e) = channel.shutdown() {
                debug!("helper channel shutdown: {}", e);
            }
        }
    }
}

fn unexpected(reply: HelperReply) -> HelperError {
    HelperError::UnexpectedReply(format!("{:?}", reply))
}

#[cfg(test)]
pub(crate) mod testing {
    //! A connector that starts an in-process helper per connection, all
    //! sharing one fake kernel.

    use super::*;
    use crate::modules::privhelper::mounter::fake::FakeBackend;
    use crate::modules::privhelper::server::{HelperPolicy, HelperServer};
    use std::net::Shutdown;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    #[derive(Default)]
    pub struct Links {
        /// Helper-side sockets, one per connection made
        pub helper_ends: Vec<UnixStream>,
        /// Remaining connects that fail before one succeeds
        pub refuse: usize,
    }

    impl Links {
        /// Cuts the most recent connection as if the helper died.
        pub fn sever(&mut self) {
            if let Some(end) = self.helper_ends.last() {
                let _ = end.shutdown(Shutdown::Both);
            }
        }
    }

    pub struct ThreadConnector {
        pub backend: FakeBackend,
        pub links: Arc<Mutex<Links>>,
    }

    impl ThreadConnector {
        pub fn new(backend: FakeBackend) -> (Self, Arc<Mutex<Links>>) {
            let links = Arc::new(Mutex::new(Links::default()));
            (
                Self {
                    backend,
                    links: links.clone(),
                },
                links,
            )
        }
    }

    impl HelperConnector for ThreadConnector {
        fn connect(&mut self) -> Result<Channel, ChannelError> {
            let mut links = self.links.lock();
            if links.refuse > 0 {
                links.refuse -= 1;
                return Err(ChannelError::Disconnected);
            }
            let (daemon, helper) = UnixStream::pair()?;
            links.helper_ends.push(helper.try_clone()?);
            let server = HelperServer::new(
                Channel::new(helper),
                self.backend.clone(),
                HelperPolicy::new(["/data"]),
            );
            thread::spawn(move || server.serve());
            Ok(Channel::new(daemon))
        }

        fn describe(&self) -> String {
            "in-process helper".to_string()
        }
    }

    pub fn fast_backoff() -> Backoff {
        Backoff::new(4, Duration::from_millis(1), Duration::from_millis(5))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::modules::privhelper::mounter::fake::FakeBackend;
    use crate::modules::privhelper::protocol::PrivilegedFailure;
    use anyhow::Result;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    fn client(backend: &FakeBackend) -> Result<(HelperClient, Arc<Mutex<Links>>)> {
        let (connector, links) = ThreadConnector::new(backend.clone());
        let client =
            HelperClient::connect(Box::new(connector), fast_backoff(), Duration::from_secs(5))?;
        Ok((client, links))
    }

    #[test]
    fn test_mount_returns_live_handle() -> Result<()> {
        let backend = FakeBackend::new();
        let (client, _links) = client(&backend)?;

        let handle = client
            .mount(Path::new("/data/x"), SessionKind::Fuse, MountOptions::default())?
            .expect("fuse mounts carry a handle");
        let mut session = UnixStream::from(handle);
        let mut kernel = backend.kernel_end("/data/x").expect("kernel end");
        kernel.write_all(b"req")?;
        let mut buf = [0u8; 3];
        session.read_exact(&mut buf)?;
        assert_eq!(&buf, b"req");

        assert_eq!(client.registered_mounts(), vec![PathBuf::from("/data/x")]);
        assert!(client.unmount(Path::new("/data/x"), false)?);
        assert!(client.registered_mounts().is_empty());
        Ok(())
    }

    #[test]
    fn test_typed_failure_is_not_retried() -> Result<()> {
        let backend = FakeBackend::new();
        let (client, links) = client(&backend)?;

        let err = client
            .mount(Path::new("/etc"), SessionKind::Fuse, MountOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            HelperError::Failed(PrivilegedFailure::OutsideAllowList { .. })
        ));
        assert_eq!(links.lock().helper_ends.len(), 1);
        assert!(client.registered_mounts().is_empty());
        client.ping()?;
        Ok(())
    }

    #[test]
    fn test_reconnect_reregisters_mounts() -> Result<()> {
        let backend = FakeBackend::new();
        let (client, links) = client(&backend)?;
        client.mount(Path::new("/data/x"), SessionKind::Fuse, MountOptions::default())?;

        links.lock().sever();
        client.ping()?;
        assert_eq!(links.lock().helper_ends.len(), 2);

        // The new helper knows /data/x as a FUSE mount, so a conflicting
        // kind is refused instead of silently remounting.
        let err = client
            .mount(Path::new("/data/x"), SessionKind::Nfs, MountOptions::default())
            .unwrap_err();
        assert!(matches!(err, HelperError::Failed(PrivilegedFailure::Busy { .. })));
        assert!(backend.is_mounted("/data/x"));
        assert_eq!(client.registered_mounts(), vec![PathBuf::from("/data/x")]);
        Ok(())
    }

    #[test]
    fn test_mount_reply_lost_with_helper() -> Result<()> {
        let backend = FakeBackend::new();
        let (connector, links) = ThreadConnector::new(backend.clone());
        let client =
            HelperClient::connect(Box::new(connector), fast_backoff(), Duration::from_millis(500))?;

        // The first helper mounts, then dies before its reply goes out.
        backend.kernel.lock().crash_after_mounts = Some(1);
        let handle = client
            .mount(Path::new("/data/x"), SessionKind::Fuse, MountOptions::default())?
            .expect("fuse mounts carry a handle");
        assert_eq!(links.lock().helper_ends.len(), 2);

        // The new helper replaced the orphaned mount instead of burying it.
        {
            let kernel = backend.kernel.lock();
            assert_eq!(kernel.mount_calls, vec![PathBuf::from("/data/x"); 2]);
            assert!(kernel.shadowed.is_empty());
            assert_eq!(kernel.mounts.len(), 1);
        }
        let mut session = UnixStream::from(handle);
        let mut kernel = backend.kernel_end("/data/x").expect("kernel end");
        kernel.write_all(b"req")?;
        let mut buf = [0u8; 3];
        session.read_exact(&mut buf)?;
        assert_eq!(&buf, b"req");
        assert_eq!(client.registered_mounts(), vec![PathBuf::from("/data/x")]);
        Ok(())
    }

    #[test]
    fn test_retried_handle_request_survives_reconnect() -> Result<()> {
        let backend = FakeBackend::new();
        let (client, links) = client(&backend)?;
        let log = OwnedFd::from(tempfile::tempfile()?);

        links.lock().sever();
        client.set_log_file(&log)?;
        assert_eq!(backend.kernel.lock().log_files, 1);
        Ok(())
    }

    #[test]
    fn test_unreachable_helper_is_unavailable() {
        let (connector, links) = ThreadConnector::new(FakeBackend::new());
        links.lock().refuse = usize::MAX;

        let err = HelperClient::connect(Box::new(connector), fast_backoff(), Duration::from_secs(1))
            .err()
            .expect("connect must fail");
        assert!(matches!(err, HelperError::Unavailable { attempts: 4, .. }));
    }

    #[test]
    fn test_transient_refusals_are_retried() -> Result<()> {
        let (connector, links) = ThreadConnector::new(FakeBackend::new());
        links.lock().refuse = 2;

        let client =
            HelperClient::connect(Box::new(connector), fast_backoff(), Duration::from_secs(5))?;
        client.ping()?;
        assert_eq!(links.lock().helper_ends.len(), 1);
        Ok(())
    }

    #[test]
    fn test_takeover_bookkeeping() -> Result<()> {
        let backend = FakeBackend::new();
        let (client, _links) = client(&backend)?;

        client.takeover_mount(Path::new("/data/y"), SessionKind::Nfs, Vec::new())?;
        assert_eq!(client.registered_mounts(), vec![PathBuf::from("/data/y")]);
        assert!(client.takeover_unmount(Path::new("/data/y"))?);
        assert!(!client.takeover_unmount(Path::new("/data/y"))?);
        assert!(client.registered_mounts().is_empty());
        Ok(())
    }
}
