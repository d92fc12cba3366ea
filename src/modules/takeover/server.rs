//! Outgoing side of a takeover.
//!
//! The outgoing daemon keeps serving until a successor has confirmed every
//! entry with `Ready`. Until then each handle it sent is a duplicate and the
//! original waits in a [`HandleEscrow`]; any failure returns the originals to
//! the registry and resumes service as if nothing happened.

use std::fs;
use std::io;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::data::TakeoverHeader;
use super::escrow::HandleEscrow;
use super::protocol::{negotiate_version, Capability, RefusalReason, TakeoverMessage};
use super::state::OutgoingState;
use crate::modules::channel::Channel;
use crate::modules::constants::{
    ACCEPT_POLL_INTERVAL, DEFAULT_ACK_TIMEOUT, SUPPORTED_TAKEOVER_VERSIONS,
    TAKEOVER_VERSION_PER_ENTRY,
};
use crate::modules::error::{ChannelError, TakeoverError};
use crate::modules::hooks::{ServiceControl, SessionLayer};
use crate::modules::privhelper::HelperClient;
use crate::modules::registry::MountRegistry;

/// Result of a committed takeover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    /// Protocol version used
    pub version: u32,
    /// Mounts now owned by the successor
    pub mounts: Vec<PathBuf>,
}

struct Negotiated {
    version: u32,
    capabilities: Vec<Capability>,
}

/// Hands this daemon's mounts to a successor.
pub struct TakeoverServer {
    registry: MountRegistry,
    service: Arc<dyn ServiceControl>,
    sessions: Arc<dyn SessionLayer>,
    helper: Option<Arc<HelperClient>>,
    ack_timeout: Duration,
    versions: Vec<u32>,
    in_flight: AtomicBool,
    state: Mutex<OutgoingState>,
}

impl TakeoverServer {
    pub fn new(
        registry: MountRegistry,
        service: Arc<dyn ServiceControl>,
        sessions: Arc<dyn SessionLayer>,
    ) -> Self {
        Self {
            registry,
            service,
            sessions,
            helper: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            versions: SUPPORTED_TAKEOVER_VERSIONS.to_vec(),
            in_flight: AtomicBool::new(false),
            state: Mutex::new(OutgoingState::Idle),
        }
    }

    /// After commit, tells `helper` to forget the handed-off mounts.
    pub fn with_helper(mut self, helper: Arc<HelperClient>) -> Self {
        self.helper = Some(helper);
        self
    }

    /// Bounds every wait for the successor.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_versions(mut self, versions: Vec<u32>) -> Self {
        self.versions = versions;
        self
    }

    pub fn state(&self) -> OutgoingState {
        *self.state.lock()
    }

    fn set_state(&self, next: OutgoingState) {
        let mut state = self.state.lock();
        debug!("takeover (outgoing): {} -> {}", *state, next);
        *state = next;
    }

    /// Claims the single attempt slot. Fails while another attempt runs or
    /// after a commit.
    pub fn try_begin(&self) -> bool {
        let state = self.state.lock();
        if !state.accepts_attempt() {
            debug!("takeover attempt refused in state {}", *state);
            return false;
        }
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Runs a full attempt on `channel`, refusing it if another is running.
    pub fn accept(&self, channel: Channel) -> Result<Handoff, TakeoverError> {
        if !self.try_begin() {
            refuse(channel, RefusalReason::AlreadyInProgress);
            return Err(TakeoverError::Refused(RefusalReason::AlreadyInProgress));
        }
        self.run_claimed(channel)
    }

    /// Runs an attempt whose slot was claimed with [`try_begin`](Self::try_begin).
    /// The slot stays claimed after a commit.
    pub fn run_claimed(&self, channel: Channel) -> Result<Handoff, TakeoverError> {
        let result = self.run_attempt(channel);
        if result.is_err() {
            self.in_flight.store(false, Ordering::SeqCst);
        }
        result
    }

    fn run_attempt(&self, mut channel: Channel) -> Result<Handoff, TakeoverError> {
        self.set_state(OutgoingState::AwaitingSuccessor);
        let negotiated = match self.negotiate(&mut channel) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!("takeover declined before transfer: {}", e);
                self.settle_aborted();
                return Err(e);
            }
        };

        if let Err(e) = self.service.pause_new_operations() {
            let e = TakeoverError::collaborator(e);
            send_abort(&mut channel, &e);
            self.settle_aborted();
            return Err(e);
        }
        self.set_state(OutgoingState::Transferring);

        let mut escrow = HandleEscrow::new(self.registry.take_all());
        match self.transfer(&mut channel, &negotiated, &mut escrow) {
            Ok(()) => Ok(self.commit(channel, negotiated.version, escrow)),
            Err(e) => {
                self.abort(&mut channel, escrow, &e);
                Err(e)
            }
        }
    }

    fn negotiate(&self, channel: &mut Channel) -> Result<Negotiated, TakeoverError> {
        channel.set_timeout(Some(self.ack_timeout))?;
        let (offered, capabilities, kinds) = match channel.recv::<TakeoverMessage>()?.0 {
            TakeoverMessage::Hello {
                versions,
                capabilities,
                kinds,
            } => (versions, capabilities, kinds),
            other => return Err(unexpected("hello", &other)),
        };
        self.set_state(OutgoingState::Negotiating);

        let version = match negotiate_version(&offered, &self.versions) {
            Some(version) => version,
            None => {
                let reason = RefusalReason::VersionMismatch {
                    offered,
                    supported: self.versions.clone(),
                };
                return Err(refuse_on(channel, reason));
            }
        };
        for (path, kind) in self.service.active_mounts() {
            if !kinds.contains(&kind) {
                return Err(refuse_on(channel, RefusalReason::UnsupportedKind { path, kind }));
            }
        }

        if version >= TAKEOVER_VERSION_PER_ENTRY {
            channel.send(&TakeoverMessage::Ping, Vec::new())?;
            match channel.recv::<TakeoverMessage>()?.0 {
                TakeoverMessage::Pong => {}
                other => return Err(unexpected("pong", &other)),
            }
        }

        let capabilities = capabilities
            .into_iter()
            .filter(|c| Capability::ALL.contains(c))
            .collect();
        info!("successor accepted at protocol version {}", version);
        Ok(Negotiated {
            version,
            capabilities,
        })
    }

    fn transfer(
        &self,
        channel: &mut Channel,
        negotiated: &Negotiated,
        escrow: &mut HandleEscrow,
    ) -> Result<(), TakeoverError> {
        for entry in escrow.entries_mut() {
            let state = self
                .sessions
                .detach_session(entry.path())
                .map_err(TakeoverError::collaborator)?;
            entry.metadata.inode_counter = state.inode_counter;
            entry.metadata.state = state.blob;
        }

        channel.send(
            &TakeoverMessage::Accepted {
                version: negotiated.version,
                mount_count: escrow.len(),
            },
            Vec::new(),
        )?;

        if negotiated.version >= TAKEOVER_VERSION_PER_ENTRY {
            for index in 0..escrow.len() {
                let metadata = escrow
                    .metadata_at(index)
                    .cloned()
                    .ok_or_else(|| TakeoverError::Protocol(format!("missing entry {}", index)))?;
                let handle = escrow.duplicate(index).map_err(ChannelError::from)?;
                debug!("sending entry {} ({:?})", index, metadata.mount_path);
                channel.send(&TakeoverMessage::Entry { index, metadata }, vec![handle])?;

                match channel.recv::<TakeoverMessage>()?.0 {
                    TakeoverMessage::EntryAck { index: acked } if acked == index => {
                        escrow.acknowledge(index);
                    }
                    other => return Err(unexpected("entry-ack", &other)),
                }
            }
        } else {
            let header = TakeoverHeader {
                version: negotiated.version,
                capabilities: negotiated.capabilities.clone(),
                mounts: escrow.metadata(),
            };
            let handles = escrow.duplicate_all().map_err(ChannelError::from)?;
            channel.send(&TakeoverMessage::Batch { data: header }, handles)?;
        }

        match channel.recv::<TakeoverMessage>()?.0 {
            TakeoverMessage::Ready { count } if count == escrow.len() => {
                escrow.acknowledge_all();
                Ok(())
            }
            TakeoverMessage::Ready { count } => Err(TakeoverError::Protocol(format!(
                "successor confirmed {} of {} entries",
                count,
                escrow.len()
            ))),
            other => Err(unexpected("ready", &other)),
        }
    }

    /// Past this point the mounts belong to the successor.
    fn commit(&self, mut channel: Channel, version: u32, escrow: HandleEscrow) -> Handoff {
        self.set_state(OutgoingState::Committed);
        let count = escrow.len();
        if let Err(e) = channel.send(&TakeoverMessage::Commit, Vec::new()) {
            warn!("commit message not delivered: {}", e);
        }

        let mounts = escrow.release();
        info!("handed {} mounts to the successor", count);
        if let Some(helper) = &self.helper {
            for path in &mounts {
                if let Err(e) = helper.takeover_unmount(path) {
                    warn!("helper did not release {:?}: {}", path, e);
                }
            }
        }

        self.linger(&mut channel);
        Handoff { version, mounts }
    }

    /// Answers repeated `Ready` messages until the successor hangs up.
    fn linger(&self, channel: &mut Channel) {
        loop {
            match channel.recv::<TakeoverMessage>() {
                Ok((TakeoverMessage::Ready { .. }, _)) => {
                    debug!("repeated ready; confirming commit again");
                    if channel.send(&TakeoverMessage::Commit, Vec::new()).is_err() {
                        return;
                    }
                }
                Ok((other, _)) => debug!("ignoring {} after commit", other.name()),
                Err(_) => return,
            }
        }
    }

    fn abort(&self, channel: &mut Channel, escrow: HandleEscrow, err: &TakeoverError) {
        warn!(
            "takeover aborted: {}; unconfirmed entries: {:?}",
            err,
            escrow.unconfirmed()
        );
        send_abort(channel, err);

        let mounts = escrow.restore();
        let paths: Vec<PathBuf> = mounts.iter().map(|m| m.path().to_path_buf()).collect();
        for info in mounts {
            if let Err(e) = self.registry.insert(info) {
                error!("could not restore mount: {}", e);
            }
        }
        for path in &paths {
            if let Some(Err(e)) = self
                .registry
                .with_mount(path, |info| self.sessions.attach_session(info))
            {
                error!("could not reattach {:?}: {:#}", path, e);
            }
        }
        self.settle_aborted();
    }

    fn settle_aborted(&self) {
        if let Err(e) = self.service.resume_new_operations() {
            error!("could not resume operations: {:#}", e);
        }
        self.set_state(OutgoingState::Aborted);
        self.set_state(OutgoingState::Idle);
    }
}

fn unexpected(expected: &str, got: &TakeoverMessage) -> TakeoverError {
    match got {
        TakeoverMessage::Abort { reason } => {
            TakeoverError::Protocol(format!("successor aborted: {}", reason))
        }
        other => TakeoverError::Protocol(format!("expected {}, got {}", expected, other.name())),
    }
}

fn send_abort(channel: &mut Channel, err: &TakeoverError) {
    let abort = TakeoverMessage::Abort {
        reason: err.to_string(),
    };
    if let Err(e) = channel.send(&abort, Vec::new()) {
        debug!("abort not delivered: {}", e);
    }
}

fn refuse_on(channel: &mut Channel, reason: RefusalReason) -> TakeoverError {
    info!("refusing takeover: {}", reason);
    let refused = TakeoverMessage::Refused {
        reason: reason.clone(),
    };
    if let Err(e) = channel.send(&refused, Vec::new()) {
        debug!("refusal not delivered: {}", e);
    }
    TakeoverError::Refused(reason)
}

/// Sends `Refused` on a connection that will not be served.
pub fn refuse(mut channel: Channel, reason: RefusalReason) {
    refuse_on(&mut channel, reason);
}

/// Accepts successors on the instance's takeover socket.
pub struct TakeoverListener {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TakeoverListener {
    /// Binds `path` and starts accepting. `on_commit` runs on the attempt's
    /// thread once a successor owns the mounts.
    pub fn spawn<F>(path: &Path, server: Arc<TakeoverServer>, on_commit: F) -> anyhow::Result<Self>
    where
        F: Fn(Handoff) + Send + Sync + 'static,
    {
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("removing stale socket {:?}", path))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding takeover socket {:?}", path))?;
        listener.set_nonblocking(true)?;
        info!("takeover socket listening on {:?}", path);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let on_commit = Arc::new(on_commit);
        let thread = thread::Builder::new()
            .name("takeover-accept".into())
            .spawn(move || accept_loop(listener, server, flag, on_commit))?;

        Ok(Self {
            path: path.to_path_buf(),
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting. The socket file is left for a successor to replace.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("takeover accept thread panicked");
            }
        }
    }
}

impl Drop for TakeoverListener {
    fn drop(&mut self) {
        self.halt();
    }
}

fn accept_loop<F>(
    listener: UnixListener,
    server: Arc<TakeoverServer>,
    shutdown: Arc<AtomicBool>,
    on_commit: Arc<F>,
) where
    F: Fn(Handoff) + Send + Sync + 'static,
{
    while !shutdown.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                warn!("takeover accept failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
        };
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("dropping takeover connection: {}", e);
            continue;
        }
        let channel = Channel::new(stream);

        if !server.try_begin() {
            thread::spawn(move || refuse(channel, RefusalReason::AlreadyInProgress));
            continue;
        }
        info!("successor connected");
        let server = server.clone();
        let on_commit = on_commit.clone();
        thread::spawn(move || match server.run_claimed(channel) {
            Ok(handoff) => on_commit(handoff),
            Err(e) => warn!("takeover attempt failed: {}", e),
        });
    }
    debug!("takeover accept loop stopped");
}
