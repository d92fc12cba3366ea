//! The privileged side of the helper channel.
//!
//! A `HelperServer` reads one request, performs it to completion, writes one
//! response, and only then reads the next. It never interprets filesystem
//! content; it validates paths, keeps bookkeeping of the mounts it is
//! responsible for, and delegates the kernel effects to a
//! [`PrivilegedBackend`].
//!
//! Paths are checked twice: lexically against the allow-list, then by
//! opening them beneath their root without following symlinks. The kernel
//! call goes through the opened handle, so a link swapped in after the
//! check cannot redirect it.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};

use super::mounter::{MountSpec, PrivilegedBackend, Target, UnmountMode};
use super::protocol::{
    HelperEnvelope, HelperReply, HelperResponse, MountOptions, PrivilegedFailure,
    PrivilegedRequest,
};
use crate::modules::channel::{Channel, Frame};
use crate::modules::constants::HELPER_PROTOCOL_VERSION;
use crate::modules::error::ChannelError;
use crate::modules::paths::{self, Expect, PinnedPath, ResolveError, Resolved};
use crate::modules::registry::SessionKind;

/// Which paths the helper may touch.
#[derive(Debug, Clone)]
pub struct HelperPolicy {
    /// Normalized roots; every path argument must lie under one of them
    pub allowed_roots: Vec<PathBuf>,
}

impl HelperPolicy {
    /// Builds a policy, normalizing each root. Invalid roots are dropped with
    /// a warning so a typo cannot widen the allow-list.
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let allowed_roots = roots
            .into_iter()
            .filter_map(|root| match paths::normalize(root.as_ref()) {
                Ok(root) => Some(root),
                Err(e) => {
                    warn!("ignoring mount root: {}", e);
                    None
                }
            })
            .collect();
        Self { allowed_roots }
    }

    /// Normalizes `path` and checks it against the allow-list.
    pub fn check(&self, path: &Path) -> Result<PathBuf, PrivilegedFailure> {
        let normalized =
            paths::normalize(path).map_err(|e| PrivilegedFailure::InvalidPath(e.to_string()))?;
        if !paths::is_within(&normalized, &self.allowed_roots) {
            return Err(PrivilegedFailure::OutsideAllowList { path: normalized });
        }
        Ok(normalized)
    }

    /// The most specific allowed root containing `path`.
    pub fn root_for(&self, path: &Path) -> Option<&Path> {
        self.allowed_roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .map(PathBuf::as_path)
    }

    /// Checks `path` and opens it beneath its root for a mount or bind.
    pub(crate) fn open(&self, path: &Path, expect: Expect) -> Result<Checked, PrivilegedFailure> {
        let path = self.check(path)?;
        let pin = self.resolve(&path, &path, expect)?;
        let via = pin.as_ref().map(PinnedPath::proc_path);
        Ok(Checked {
            path,
            _pin: pin,
            via,
        })
    }

    /// Checks `path` and opens its parent for an unmount. A handle on the
    /// mount point itself would keep the mount busy.
    pub(crate) fn open_parent(&self, path: &Path) -> Result<Checked, PrivilegedFailure> {
        let path = self.check(path)?;
        let is_root = self
            .root_for(&path)
            .map_or(true, |root| root == path.as_path());
        let parent = path.parent().filter(|_| !is_root).map(Path::to_path_buf);
        let Some(parent) = parent else {
            // The root itself is configuration, not daemon input.
            return Ok(Checked {
                via: Some(path.clone()),
                path,
                _pin: None,
            });
        };
        let pin = self.resolve(&path, &parent, Expect::Directory)?;
        let via = match (&pin, path.file_name()) {
            (Some(pin), Some(name)) => Some(pin.proc_path().join(name)),
            _ => None,
        };
        Ok(Checked {
            path,
            _pin: pin,
            via,
        })
    }

    fn resolve(
        &self,
        requested: &Path,
        path: &Path,
        expect: Expect,
    ) -> Result<Option<PinnedPath>, PrivilegedFailure> {
        let outside = || PrivilegedFailure::OutsideAllowList {
            path: requested.to_path_buf(),
        };
        let root = self.root_for(path).ok_or_else(outside)?;
        match paths::resolve_beneath(root, path, expect) {
            Ok(Resolved::Pinned(pin)) => Ok(Some(pin)),
            Ok(Resolved::Missing) => Ok(None),
            Err(ResolveError::Symlink(link)) => {
                warn!("refusing {:?}: {:?} is a symbolic link", requested, link);
                Err(outside())
            }
            Err(ResolveError::NotBeneath { .. }) => Err(outside()),
            Err(e @ ResolveError::NotDirectory(_)) => {
                Err(PrivilegedFailure::InvalidPath(e.to_string()))
            }
            Err(ResolveError::Io { path, source }) => {
                Err(PrivilegedFailure::from_errno("resolve", &path, source))
            }
        }
    }
}

/// A path that passed the policy, held open while the kernel acts on it.
#[derive(Debug)]
pub(crate) struct Checked {
    path: PathBuf,
    /// Keeps `via` valid
    _pin: Option<PinnedPath>,
    via: Option<PathBuf>,
}

impl Checked {
    fn target(&self) -> Target<'_> {
        Target {
            path: &self.path,
            via: self.via.as_deref(),
        }
    }
}

/// Helper-side record of one mount.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedMount {
    kind: SessionKind,
    bind_mounts: BTreeSet<PathBuf>,
}

/// Why [`HelperServer::serve`] returned.
#[derive(Debug, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The daemon closed the channel.
    Disconnected,
}

/// Serves privileged requests arriving on one channel.
pub struct HelperServer<B: PrivilegedBackend> {
    channel: Channel,
    backend: B,
    policy: HelperPolicy,
    mounts: BTreeMap<PathBuf, TrackedMount>,
    daemon_timeout: Option<Duration>,
    handshake_done: bool,
}

impl<B: PrivilegedBackend> HelperServer<B> {
    pub fn new(channel: Channel, backend: B, policy: HelperPolicy) -> Self {
        Self {
            channel,
            backend,
            policy,
            mounts: BTreeMap::new(),
            daemon_timeout: None,
            handshake_done: false,
        }
    }

    /// Mount paths this helper is currently responsible for.
    pub fn tracked_mounts(&self) -> Vec<PathBuf> {
        self.mounts.keys().cloned().collect()
    }

    /// Runs the request loop until the daemon disconnects.
    ///
    /// Only channel-level failures end the loop; every request-level
    /// problem becomes a typed response.
    pub fn serve(mut self) -> Result<ServeOutcome, ChannelError> {
        info!("privileged helper serving (roots: {:?})", self.policy.allowed_roots);
        loop {
            let frame = match self.channel.recv_frame() {
                Ok(frame) => frame,
                Err(ChannelError::Disconnected) => {
                    self.log_remaining();
                    return Ok(ServeOutcome::Disconnected);
                }
                Err(e) => {
                    error!("helper channel failed: {}", e);
                    return Err(e);
                }
            };

            let (response, handles) = self.handle_frame(frame);
            self.channel.send(&response, handles)?;
        }
    }

    fn log_remaining(&self) {
        if self.mounts.is_empty() {
            info!("daemon disconnected; no mounts outstanding");
        } else {
            warn!(
                "daemon disconnected with {} mounts outstanding: {:?}",
                self.mounts.len(),
                self.mounts.keys().collect::<Vec<_>>()
            );
        }
    }

    /// Decodes and handles one frame, producing the response to send.
    pub fn handle_frame(&mut self, frame: Frame) -> (HelperEnvelope<HelperResponse>, Vec<OwnedFd>) {
        let envelope: HelperEnvelope<PrivilegedRequest> = match frame.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                let xid = salvage_xid(&frame.body);
                warn!("malformed helper request (xid {}): {}", xid, e);
                let failure = PrivilegedFailure::InvalidRequest(e.to_string());
                return (HelperEnvelope { xid, body: Err(failure) }, Vec::new());
            }
        };

        let xid = envelope.xid;
        let name = envelope.body.name();
        debug!("helper request {} xid={}", name, xid);
        match self.dispatch(envelope.body, frame.handles) {
            Ok((reply, handles)) => (HelperEnvelope { xid, body: Ok(reply) }, handles),
            Err(failure) => {
                info!("helper request {} xid={} failed: {}", name, xid, failure);
                (HelperEnvelope { xid, body: Err(failure) }, Vec::new())
            }
        }
    }

    fn dispatch(
        &mut self,
        request: PrivilegedRequest,
        mut handles: Vec<OwnedFd>,
    ) -> Result<(HelperReply, Vec<OwnedFd>), PrivilegedFailure> {
        if let PrivilegedRequest::Handshake { version } = request {
            return self.handshake(version).map(|reply| (reply, Vec::new()));
        }
        if !self.handshake_done {
            return Err(PrivilegedFailure::InvalidRequest(
                "handshake required before other requests".into(),
            ));
        }

        let reply = match request {
            PrivilegedRequest::Handshake { .. } => unreachable!("handled above"),
            PrivilegedRequest::Ping => HelperReply::Pong,
            PrivilegedRequest::Mount {
                path,
                kind,
                options,
            } => {
                let (reply, handle) = self.mount(&path, kind, &options)?;
                return Ok((reply, handle.into_iter().collect()));
            }
            PrivilegedRequest::Unmount { path, force } => self.unmount(&path, force)?,
            PrivilegedRequest::BindMount { source, target } => self.bind_mount(&source, &target)?,
            PrivilegedRequest::BindUnmount { target } => self.bind_unmount(&target)?,
            PrivilegedRequest::TakeoverMount {
                path,
                kind,
                bind_mounts,
            } => self.takeover_mount(&path, kind, bind_mounts)?,
            PrivilegedRequest::TakeoverUnmount { path } => self.takeover_unmount(&path)?,
            PrivilegedRequest::SetLogFile => {
                if handles.len() != 1 {
                    return Err(PrivilegedFailure::InvalidRequest(format!(
                        "set-log-file expects one handle, got {}",
                        handles.len()
                    )));
                }
                self.backend.redirect_log(handles.remove(0))?;
                info!("log output redirected");
                HelperReply::LogFileSet
            }
            PrivilegedRequest::SetDaemonTimeout { timeout } => {
                self.daemon_timeout = Some(timeout);
                HelperReply::DaemonTimeoutSet { timeout }
            }
        };
        Ok((reply, Vec::new()))
    }

    fn handshake(&mut self, version: u32) -> Result<HelperReply, PrivilegedFailure> {
        if version != HELPER_PROTOCOL_VERSION {
            return Err(PrivilegedFailure::VersionMismatch {
                daemon: version,
                helper: HELPER_PROTOCOL_VERSION,
            });
        }
        self.handshake_done = true;
        Ok(HelperReply::HandshakeAccepted { version })
    }

    fn mount(
        &mut self,
        path: &Path,
        kind: SessionKind,
        options: &MountOptions,
    ) -> Result<(HelperReply, Option<OwnedFd>), PrivilegedFailure> {
        let path = self.policy.check(path)?;

        if let Some(existing) = self.mounts.get(&path) {
            if existing.kind != kind {
                return Err(PrivilegedFailure::Busy { path });
            }
            // A retried mount whose first reply never reached the daemon:
            // the old session's handle is lost, so replace the mount.
            info!("replacing stale {} mount at {:?}", kind, path);
            self.release_binds(&path)?;
            self.kernel_unmount(&path, UnmountMode::Detach)?;
            self.mounts.remove(&path);
        }

        // Pinned only now: a handle taken before the detach would point
        // into the stale mount.
        let target = self.policy.open(&path, Expect::Directory)?;
        let handle = self.backend.mount(&MountSpec {
            target: target.target(),
            kind,
            options,
            daemon_timeout: self.daemon_timeout,
        })?;
        info!("mounted {} session at {:?}", kind, path);
        self.mounts.insert(
            path.clone(),
            TrackedMount {
                kind,
                bind_mounts: BTreeSet::new(),
            },
        );

        let handle_attached = handle.is_some();
        Ok((
            HelperReply::Mounted {
                path,
                handle_attached,
            },
            handle,
        ))
    }

    fn unmount(&mut self, path: &Path, force: bool) -> Result<HelperReply, PrivilegedFailure> {
        let path = self.policy.check(path)?;
        self.release_binds(&path)?;

        let was_mounted = match self.kernel_unmount(&path, UnmountMode::Normal) {
            Ok(was_mounted) => was_mounted,
            Err(PrivilegedFailure::Busy { .. }) if force => self.force_unmount(&path)?,
            Err(e) => return Err(e),
        };
        self.mounts.remove(&path);
        info!("unmounted {:?} (was mounted: {})", path, was_mounted);
        Ok(HelperReply::Unmounted { path, was_mounted })
    }

    fn force_unmount(&mut self, path: &Path) -> Result<bool, PrivilegedFailure> {
        warn!("{:?} is busy; forcing unmount", path);
        match self.kernel_unmount(path, UnmountMode::Force) {
            Ok(was_mounted) => Ok(was_mounted),
            Err(PrivilegedFailure::Busy { .. }) => {
                warn!("{:?} still busy; detaching lazily", path);
                self.kernel_unmount(path, UnmountMode::Detach)
            }
            Err(e) => Err(e),
        }
    }

    /// Unmounts every bind mount recorded under `path`.
    fn release_binds(&mut self, path: &Path) -> Result<(), PrivilegedFailure> {
        let binds: Vec<PathBuf> = match self.mounts.get(path) {
            Some(tracked) => tracked.bind_mounts.iter().cloned().collect(),
            None => return Ok(()),
        };
        for bind in binds {
            self.kernel_unmount(&bind, UnmountMode::Detach)?;
            if let Some(tracked) = self.mounts.get_mut(path) {
                tracked.bind_mounts.remove(&bind);
            }
        }
        Ok(())
    }

    /// Unmounts through a handle on the parent directory.
    fn kernel_unmount(&mut self, path: &Path, mode: UnmountMode) -> Result<bool, PrivilegedFailure> {
        let target = self.policy.open_parent(path)?;
        self.backend.unmount(target.target(), mode)
    }

    /// Bind targets must lie strictly inside a mount this helper tracks.
    fn bind_mount(&mut self, source: &Path, target: &Path) -> Result<HelperReply, PrivilegedFailure> {
        let source = self.policy.open(source, Expect::Any)?;
        let target = self.policy.open(target, Expect::Any)?;

        let owner = self.bind_owner(&target.path)?;
        if self.mounts[&owner].bind_mounts.contains(&target.path) {
            debug!("bind mount at {:?} already present", target.path);
            return Ok(HelperReply::BindMounted {
                target: target.path,
            });
        }

        self.backend.bind_mount(source.target(), target.target())?;
        info!("bind mounted {:?} onto {:?}", source.path, target.path);
        if let Some(tracked) = self.mounts.get_mut(&owner) {
            tracked.bind_mounts.insert(target.path.clone());
        }
        Ok(HelperReply::BindMounted {
            target: target.path,
        })
    }

    /// Only removes bind mounts this helper recorded; primary mounts go
    /// through `Unmount`.
    fn bind_unmount(&mut self, target: &Path) -> Result<HelperReply, PrivilegedFailure> {
        let target = self.policy.check(target)?;
        let owner = self.bind_owner(&target)?;
        if !self.mounts[&owner].bind_mounts.contains(&target) {
            return Err(PrivilegedFailure::InvalidRequest(format!(
                "{:?} is not a bind mount inside {:?}",
                target, owner
            )));
        }

        let was_mounted = self.kernel_unmount(&target, UnmountMode::Normal)?;
        if let Some(tracked) = self.mounts.get_mut(&owner) {
            tracked.bind_mounts.remove(&target);
        }
        info!("removed bind mount {:?}", target);
        Ok(HelperReply::BindUnmounted {
            target,
            was_mounted,
        })
    }

    /// The tracked mount strictly containing a bind `target`.
    fn bind_owner(&self, target: &Path) -> Result<PathBuf, PrivilegedFailure> {
        if self.mounts.contains_key(target) {
            return Err(PrivilegedFailure::InvalidRequest(format!(
                "{:?} is a mount point, not a bind mount",
                target
            )));
        }
        self.owning_mount(target).ok_or_else(|| {
            PrivilegedFailure::InvalidRequest(format!("{:?} is not inside a helper mount", target))
        })
    }

    fn takeover_mount(
        &mut self,
        path: &Path,
        kind: SessionKind,
        bind_mounts: Vec<PathBuf>,
    ) -> Result<HelperReply, PrivilegedFailure> {
        let path = self.policy.check(path)?;
        let mut binds = BTreeSet::new();
        for bind in bind_mounts {
            binds.insert(self.policy.check(&bind)?);
        }

        if let Some(existing) = self.mounts.get(&path) {
            if existing.kind != kind {
                return Err(PrivilegedFailure::Busy { path });
            }
        }
        info!("adopted {} mount at {:?}", kind, path);
        self.mounts.insert(
            path.clone(),
            TrackedMount {
                kind,
                bind_mounts: binds,
            },
        );
        Ok(HelperReply::TakenOver { path })
    }

    fn takeover_unmount(&mut self, path: &Path) -> Result<HelperReply, PrivilegedFailure> {
        let path = self.policy.check(path)?;
        let was_registered = self.mounts.remove(&path).is_some();
        info!("released {:?} to the next daemon generation", path);
        Ok(HelperReply::Released {
            path,
            was_registered,
        })
    }

    /// The tracked mount containing `path`, if any.
    fn owning_mount(&self, path: &Path) -> Option<PathBuf> {
        self.mounts
            .keys()
            .filter(|mount| path.starts_with(mount))
            .max_by_key(|mount| mount.components().count())
            .cloned()
    }
}

/// Best-effort recovery of the `xid` from an undecodable request so the
/// error response can still be matched by the daemon.
fn salvage_xid(body: &[u8]) -> u32 {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("xid").and_then(|xid| xid.as_u64()))
        .map(|xid| xid as u32)
        .unwrap_or(0)
}
