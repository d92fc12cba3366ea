//! Incoming side of a takeover.
//!
//! A freshly started daemon connects to its predecessor, receives every
//! mount with its session handle, confirms with `Ready` and, only after the
//! predecessor answers `Commit`, registers and serves them. Any failure
//! before `Ready` leaves the predecessor serving and this process holding
//! nothing. Once `Ready` is out, silence or a hang-up counts as a commit:
//! the predecessor aborts only by saying so.

use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::data::{check_unique, TakeoverData};
use super::protocol::{Capability, TakeoverMessage};
use super::state::IncomingState;
use crate::modules::channel::Channel;
use crate::modules::constants::{
    DEFAULT_TAKEOVER_TIMEOUT, READY_RESEND_INTERVAL, SUPPORTED_TAKEOVER_VERSIONS,
    TAKEOVER_VERSION_PER_ENTRY,
};
use crate::modules::error::{ChannelError, TakeoverError};
use crate::modules::hooks::{ServiceControl, SessionLayer};
use crate::modules::privhelper::HelperClient;
use crate::modules::registry::{MountInfo, MountRegistry, SessionKind};
use crate::modules::supervisor::Deadline;

/// Receives mounts from a predecessor.
pub struct TakeoverClient {
    registry: MountRegistry,
    service: Arc<dyn ServiceControl>,
    sessions: Arc<dyn SessionLayer>,
    helper: Option<Arc<HelperClient>>,
    timeout: Duration,
    versions: Vec<u32>,
    kinds: Vec<SessionKind>,
    state: Mutex<IncomingState>,
}

impl TakeoverClient {
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
            timeout: DEFAULT_TAKEOVER_TIMEOUT,
            versions: SUPPORTED_TAKEOVER_VERSIONS.to_vec(),
            kinds: SessionKind::ALL.to_vec(),
            state: Mutex::new(IncomingState::Idle),
        }
    }

    /// Registers inherited mounts with `helper` on activation.
    pub fn with_helper(mut self, helper: Arc<HelperClient>) -> Self {
        self.helper = Some(helper);
        self
    }

    /// Bounds the whole sequence from connect to activation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_versions(mut self, versions: Vec<u32>) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<SessionKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn state(&self) -> IncomingState {
        *self.state.lock()
    }

    fn set_state(&self, next: IncomingState) {
        let mut state = self.state.lock();
        debug!("takeover (incoming): {} -> {}", *state, next);
        *state = next;
    }

    /// Takes over every mount of the daemon listening on `socket`.
    /// Returns the number of mounts now served by this process.
    pub fn take_over(&self, socket: &Path) -> Result<usize, TakeoverError> {
        let deadline = Deadline::after(self.timeout);
        self.set_state(IncomingState::Connecting);
        info!("taking over from {:?}", socket);
        let result = Channel::connect(socket)
            .map_err(TakeoverError::from)
            .and_then(|channel| self.run(channel, deadline));
        self.finish(result)
    }

    /// Like [`take_over`](Self::take_over) on an already connected channel.
    pub fn take_over_channel(&self, channel: Channel) -> Result<usize, TakeoverError> {
        let deadline = Deadline::after(self.timeout);
        self.set_state(IncomingState::Connecting);
        let result = self.run(channel, deadline);
        self.finish(result)
    }

    fn finish(&self, result: Result<usize, TakeoverError>) -> Result<usize, TakeoverError> {
        if let Err(e) = &result {
            error!("takeover failed: {}", e);
            self.set_state(IncomingState::Failed);
        }
        result
    }

    fn run(&self, mut channel: Channel, deadline: Deadline) -> Result<usize, TakeoverError> {
        self.set_state(IncomingState::Negotiating);
        arm(&channel, &deadline, None)?;
        channel.send(
            &TakeoverMessage::Hello {
                versions: self.versions.clone(),
                capabilities: Capability::ALL.to_vec(),
                kinds: self.kinds.clone(),
            },
            Vec::new(),
        )?;

        let (version, count) = loop {
            match recv(&mut channel, &deadline)?.0 {
                TakeoverMessage::Ping => channel.send(&TakeoverMessage::Pong, Vec::new())?,
                TakeoverMessage::Accepted {
                    version,
                    mount_count,
                } => break (version, mount_count),
                TakeoverMessage::Refused { reason } => return Err(TakeoverError::Refused(reason)),
                other => return Err(unexpected("accepted", &other)),
            }
        };
        if !self.versions.contains(&version) {
            return Err(TakeoverError::Protocol(format!(
                "predecessor chose unoffered version {}",
                version
            )));
        }
        info!("receiving {} mounts at protocol version {}", count, version);

        self.set_state(IncomingState::Receiving);
        let mounts = if version >= TAKEOVER_VERSION_PER_ENTRY {
            self.receive_entries(&mut channel, &deadline, count)?
        } else {
            self.receive_batch(&mut channel, &deadline, count)?
        };
        if let Err(e) = self.validate(&mounts) {
            send_abort(&mut channel, &e);
            return Err(e);
        }

        if confirm(&mut channel, &deadline, mounts.len())? == Confirmation::Presumed {
            info!("activating {} mounts without an explicit commit", mounts.len());
        }
        drop(channel);
        self.activate(mounts)
    }

    fn receive_entries(
        &self,
        channel: &mut Channel,
        deadline: &Deadline,
        count: usize,
    ) -> Result<Vec<MountInfo>, TakeoverError> {
        let mut mounts = Vec::with_capacity(count);
        for expected in 0..count {
            let (message, mut handles) = recv(channel, deadline)?;
            match message {
                TakeoverMessage::Entry { index, metadata } if index == expected => {
                    if handles.len() != 1 {
                        return Err(TakeoverError::Protocol(format!(
                            "entry {} arrived with {} handles",
                            index,
                            handles.len()
                        )));
                    }
                    debug!("received entry {} ({:?})", index, metadata.mount_path);
                    mounts.push(MountInfo {
                        metadata,
                        handle: handles.remove(0),
                    });
                    channel.send(&TakeoverMessage::EntryAck { index }, Vec::new())?;
                }
                other => return Err(unexpected("entry", &other)),
            }
        }
        Ok(mounts)
    }

    fn receive_batch(
        &self,
        channel: &mut Channel,
        deadline: &Deadline,
        count: usize,
    ) -> Result<Vec<MountInfo>, TakeoverError> {
        let (message, handles) = recv(channel, deadline)?;
        let data = match message {
            TakeoverMessage::Batch { data } => TakeoverData::from_parts(data, handles)?,
            other => return Err(unexpected("batch", &other)),
        };
        if data.mounts.len() != count {
            return Err(TakeoverError::Protocol(format!(
                "batch carried {} of {} announced mounts",
                data.mounts.len(),
                count
            )));
        }
        Ok(data.mounts)
    }

    /// Everything that could make activation fail is checked before `Ready`.
    fn validate(&self, mounts: &[MountInfo]) -> Result<(), TakeoverError> {
        check_unique(mounts.iter().map(|m| &m.metadata.mount_path))?;
        for mount in mounts {
            if !self.kinds.contains(&mount.kind()) {
                return Err(TakeoverError::Protocol(format!(
                    "cannot serve {} mount at {:?}",
                    mount.kind(),
                    mount.path()
                )));
            }
            if self.registry.contains(mount.path()) {
                return Err(TakeoverError::Protocol(format!(
                    "{:?} is already mounted here",
                    mount.path()
                )));
            }
        }
        Ok(())
    }

    fn activate(&self, mounts: Vec<MountInfo>) -> Result<usize, TakeoverError> {
        self.set_state(IncomingState::Activating);
        let entries: Vec<(PathBuf, SessionKind, Vec<PathBuf>)> = mounts
            .iter()
            .map(|m| (m.path().to_path_buf(), m.kind(), m.metadata.bind_mounts.clone()))
            .collect();
        self.registry.insert_all(mounts)?;

        for (path, kind, bind_mounts) in entries.iter().cloned() {
            if let Some(helper) = &self.helper {
                if let Err(e) = helper.takeover_mount(&path, kind, bind_mounts) {
                    warn!("helper did not adopt {:?}: {}", path, e);
                }
            }
            if let Some(Err(e)) = self
                .registry
                .with_mount(&path, |info| self.sessions.attach_session(info))
            {
                error!("could not attach inherited mount {:?}: {:#}", path, e);
            }
        }

        self.service
            .resume_new_operations()
            .map_err(TakeoverError::collaborator)?;
        self.set_state(IncomingState::Serving);
        info!("serving {} inherited mounts", entries.len());
        Ok(entries.len())
    }
}

/// Points the channel timeout at whatever is left of the deadline.
fn arm(channel: &Channel, deadline: &Deadline, cap: Option<Duration>) -> Result<(), TakeoverError> {
    let remaining = deadline.remaining().ok_or(TakeoverError::DeadlineExceeded)?;
    let timeout = match cap {
        Some(cap) => remaining.min(cap),
        None => remaining,
    };
    channel.set_timeout(Some(timeout))?;
    Ok(())
}

fn recv(
    channel: &mut Channel,
    deadline: &Deadline,
) -> Result<(TakeoverMessage, Vec<OwnedFd>), TakeoverError> {
    arm(channel, deadline, None)?;
    match channel.recv() {
        Ok(received) => Ok(received),
        Err(ChannelError::Timeout) => Err(TakeoverError::DeadlineExceeded),
        Err(e) => Err(e.into()),
    }
}

/// How the predecessor's commit became known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    /// `Commit` arrived.
    Committed,
    /// `Ready` went out but no answer came back. The predecessor either
    /// committed or died; in both cases the handles here are the only copies
    /// left in service.
    Presumed,
}

/// Sends `Ready` and waits for `Commit`, repeating `Ready` while time
/// remains. Repeats are harmless: the predecessor answers each with `Commit`.
/// Only an explicit `Abort` or an out-of-sequence message fails once the
/// first `Ready` is out.
fn confirm(
    channel: &mut Channel,
    deadline: &Deadline,
    count: usize,
) -> Result<Confirmation, TakeoverError> {
    arm(channel, deadline, Some(READY_RESEND_INTERVAL))?;
    channel.send(&TakeoverMessage::Ready { count }, Vec::new())?;
    loop {
        match channel.recv::<TakeoverMessage>() {
            Ok((TakeoverMessage::Commit, _)) => return Ok(Confirmation::Committed),
            Ok((other, _)) => return Err(unexpected("commit", &other)),
            Err(ChannelError::Timeout) if !deadline.expired() => {
                debug!("no commit yet; repeating ready");
            }
            Err(e) => {
                warn!("no commit after ready ({}); assuming the predecessor committed", e);
                return Ok(Confirmation::Presumed);
            }
        }
        let resent = arm(channel, deadline, Some(READY_RESEND_INTERVAL)).and_then(|()| {
            channel
                .send(&TakeoverMessage::Ready { count }, Vec::new())
                .map_err(TakeoverError::from)
        });
        if let Err(e) = resent {
            warn!("could not repeat ready ({}); assuming the predecessor committed", e);
            return Ok(Confirmation::Presumed);
        }
    }
}

fn unexpected(expected: &str, got: &TakeoverMessage) -> TakeoverError {
    match got {
        TakeoverMessage::Abort { reason } => {
            TakeoverError::Protocol(format!("predecessor aborted: {}", reason))
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
