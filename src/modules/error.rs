//! Typed errors shared by the helper and takeover subsystems.
//!
//! Failures that cross a process boundary (`PrivilegedFailure`,
//! `RefusalReason`) live next to their wire types; the enums here wrap them
//! for local callers.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::privhelper::protocol::PrivilegedFailure;
use super::takeover::protocol::RefusalReason;

/// Errors raised while moving frames and handles over a [`Channel`](super::channel::Channel).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Underlying socket error.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed its end, possibly mid-frame.
    #[error("peer disconnected")]
    Disconnected,

    /// A read or write did not complete before the configured timeout.
    #[error("timed out waiting for peer")]
    Timeout,

    /// A frame header announced more bytes than the channel accepts.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// More handles were attached to one frame than the kernel can carry.
    #[error("{0} handles exceed the per-frame limit")]
    TooManyHandles(usize),

    /// The frame body could not be encoded or decoded.
    #[error("malformed frame body: {0}")]
    Codec(#[from] serde_json::Error),

    /// A system call failed while passing handles.
    #[error("socket call failed: {0}")]
    Os(#[from] nix::Error),
}

impl ChannelError {
    /// Whether the error means the channel itself is unusable, as opposed
    /// to a single bad frame.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::Codec(_))
    }
}

/// Violations of the one-entry-per-path invariant of a [`MountRegistry`](super::registry::MountRegistry).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A second entry was offered for a path that is already registered.
    #[error("mount path {0:?} is already registered")]
    DuplicatePath(PathBuf),

    /// The path has no registered entry.
    #[error("mount path {0:?} is not registered")]
    NotFound(PathBuf),
}

/// Errors returned by [`HelperClient`](super::privhelper::HelperClient).
#[derive(Error, Debug)]
pub enum HelperError {
    /// The channel to the helper broke.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The helper processed the request and reported a typed failure.
    #[error("privileged operation failed: {0}")]
    Failed(#[from] PrivilegedFailure),

    /// The helper could not be reached after the configured retries.
    #[error("privileged helper unavailable after {attempts} attempts: {last}")]
    Unavailable {
        /// Attempts made, including the first
        attempts: u32,
        /// Last error observed
        last: String,
    },

    /// The helper answered with a reply that does not match the request.
    #[error("unexpected helper reply: {0}")]
    UnexpectedReply(String),

    /// A reply that must carry a session handle arrived without one.
    #[error("helper reply is missing its session handle")]
    MissingHandle,
}

/// Errors raised on either side of a takeover attempt.
#[derive(Error, Debug)]
pub enum TakeoverError {
    /// The takeover channel broke; the attempt is over.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The outgoing process declined the attempt.
    #[error("takeover refused: {0}")]
    Refused(RefusalReason),

    /// The peer sent a message that is not valid in the current state.
    #[error("takeover protocol violation: {0}")]
    Protocol(String),

    /// The overall deadline passed.
    #[error("takeover deadline exceeded")]
    DeadlineExceeded,

    /// Received mounts could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The service or session layer failed a hook call.
    #[error("collaborator hook failed: {0}")]
    Collaborator(String),
}

impl TakeoverError {
    pub(crate) fn collaborator(err: anyhow::Error) -> Self {
        TakeoverError::Collaborator(format!("{:#}", err))
    }
}
