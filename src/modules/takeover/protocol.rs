//! Messages exchanged on the takeover socket.
//!
//! Exchange, with `->` from the incoming daemon and `<-` from the outgoing
//! one:
//!
//! ```text
//! -> Hello { versions, capabilities, kinds }
//! <- Accepted { version, mount_count }  |  Refused { reason }
//! <- Ping  -> Pong                          (version 2 only)
//! <- Entry { index } + handle  -> EntryAck  (version 2, once per mount)
//! <- Batch { data } + handles               (version 1)
//! -> Ready { count }
//! <- Commit
//! ```
//!
//! Either side may send `Abort` instead of its next message.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::data::TakeoverHeader;
use crate::modules::registry::{MountMetadata, SessionKind};

/// Optional protocol features a daemon can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Entries are acknowledged one by one.
    PerEntryAck,
    /// Liveness check before handles move.
    Ping,
    /// Entries carry the bind mounts layered inside them.
    BindMounts,
}

impl Capability {
    /// Everything this build understands.
    pub const ALL: [Capability; 3] = [
        Capability::PerEntryAck,
        Capability::Ping,
        Capability::BindMounts,
    ];
}

/// Why the outgoing daemon declined a takeover.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalReason {
    /// No protocol version in common.
    #[error("no common protocol version (offered {offered:?}, supported {supported:?})")]
    VersionMismatch {
        /// Versions the incoming daemon speaks
        offered: Vec<u32>,
        /// Versions the outgoing daemon speaks
        supported: Vec<u32>,
    },

    /// The incoming daemon cannot serve one of the active mounts.
    #[error("incoming daemon cannot serve {kind} mount at {path:?}")]
    UnsupportedKind {
        /// Mount that cannot be handed over
        path: PathBuf,
        /// Its session kind
        kind: SessionKind,
    },

    /// Another takeover attempt is already running.
    #[error("a takeover is already in progress")]
    AlreadyInProgress,
}

/// One frame on the takeover channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TakeoverMessage {
    /// Opening message from the incoming daemon.
    Hello {
        /// Protocol versions it speaks
        versions: Vec<u32>,
        /// Features it understands
        capabilities: Vec<Capability>,
        /// Session kinds it can serve
        kinds: Vec<SessionKind>,
    },
    /// The outgoing daemon agrees to hand over `mount_count` mounts.
    Accepted {
        /// Negotiated version
        version: u32,
        /// Number of entries that will follow
        mount_count: usize,
    },
    /// The outgoing daemon declines; nothing has changed on its side.
    Refused {
        /// Reason for refusal
        reason: RefusalReason,
    },
    /// Liveness check.
    Ping,
    /// Answer to `Ping`.
    Pong,
    /// One mount; its session handle is attached to this frame.
    Entry {
        /// Position in the transfer, starting at 0
        index: usize,
        /// Serializable part of the mount
        metadata: MountMetadata,
    },
    /// Receipt of entry `index`.
    EntryAck {
        /// Index of the acknowledged entry
        index: usize,
    },
    /// All mounts at once; handles are attached in entry order.
    Batch {
        /// Snapshot header
        data: TakeoverHeader,
    },
    /// Final acknowledgement: the incoming daemon holds all `count` entries.
    Ready {
        /// Number of entries received
        count: usize,
    },
    /// The outgoing daemon has released the mounts.
    Commit,
    /// The sender gives up on this attempt.
    Abort {
        /// Human-readable reason
        reason: String,
    },
}

impl TakeoverMessage {
    /// Short name for logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            TakeoverMessage::Hello { .. } => "hello",
            TakeoverMessage::Accepted { .. } => "accepted",
            TakeoverMessage::Refused { .. } => "refused",
            TakeoverMessage::Ping => "ping",
            TakeoverMessage::Pong => "pong",
            TakeoverMessage::Entry { .. } => "entry",
            TakeoverMessage::EntryAck { .. } => "entry-ack",
            TakeoverMessage::Batch { .. } => "batch",
            TakeoverMessage::Ready { .. } => "ready",
            TakeoverMessage::Commit => "commit",
            TakeoverMessage::Abort { .. } => "abort",
        }
    }
}

/// Highest version present in both lists.
pub fn negotiate_version(offered: &[u32], supported: &[u32]) -> Option<u32> {
    offered
        .iter()
        .filter(|version| supported.contains(version))
        .max()
        .copied()
}
