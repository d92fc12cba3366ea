//! Wire types exchanged between the daemon and the privileged helper.
//!
//! Every frame is a [`HelperEnvelope`]: the daemon sends
//! `HelperEnvelope<PrivilegedRequest>` and the helper answers with
//! `HelperEnvelope<HelperResponse>` carrying the same `xid`. Handles ride
//! along as channel attachments (the FUSE device for `Mount`, the log file
//! for `SetLogFile`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::registry::SessionKind;

/// Transaction wrapper; the response echoes the request's `xid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperEnvelope<T> {
    /// Transaction id, unique per connection
    pub xid: u32,
    /// Request or response body
    pub body: T,
}

/// Address of the daemon's loopback NFS server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsServer {
    /// IP address the server listens on
    pub addr: String,
    /// Port of the NFS program
    pub nfsd_port: u16,
    /// Port of the MOUNT program
    pub mountd_port: u16,
}

/// Options for a `Mount` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
    /// Let users other than the daemon's access the mount
    #[serde(default)]
    pub allow_other: bool,
    /// Required for `Nfs` mounts
    #[serde(default)]
    pub nfs_server: Option<NfsServer>,
}

/// Operations the helper performs on the daemon's behalf.
///
/// Extend by adding a variant; never change the meaning of an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrivilegedRequest {
    /// Must be the first request on a connection.
    Handshake {
        /// Protocol version spoken by the daemon
        version: u32,
    },
    /// Liveness check.
    Ping,
    /// Mounts a new session at `path`.
    Mount {
        /// Mount point
        path: PathBuf,
        /// Kernel bridge to mount through
        kind: SessionKind,
        /// Mount options
        options: MountOptions,
    },
    /// Unmounts `path`; `force` escalates to a forced then lazy unmount
    /// when the mount is busy.
    Unmount {
        /// Mount point
        path: PathBuf,
        /// Escalate when busy
        force: bool,
    },
    /// Bind-mounts `source` onto `target`.
    BindMount {
        /// Existing directory
        source: PathBuf,
        /// Bind target
        target: PathBuf,
    },
    /// Removes a bind mount.
    BindUnmount {
        /// Bind target
        target: PathBuf,
    },
    /// Adopts bookkeeping for a mount handed over from a previous daemon
    /// generation. No kernel-level effect.
    TakeoverMount {
        /// Mount point
        path: PathBuf,
        /// Session kind of the mount
        kind: SessionKind,
        /// Bind mounts inside it
        bind_mounts: Vec<PathBuf>,
    },
    /// Forgets a mount that is being handed to the next daemon generation.
    /// No kernel-level effect.
    TakeoverUnmount {
        /// Mount point
        path: PathBuf,
    },
    /// Redirects the helper's log output to the attached file.
    SetLogFile,
    /// Sets how long the kernel waits on an unresponsive daemon, for
    /// subsequent mounts on platforms that support it.
    SetDaemonTimeout {
        /// Timeout value
        timeout: Duration,
    },
}

impl PrivilegedRequest {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            PrivilegedRequest::Handshake { .. } => "handshake",
            PrivilegedRequest::Ping => "ping",
            PrivilegedRequest::Mount { .. } => "mount",
            PrivilegedRequest::Unmount { .. } => "unmount",
            PrivilegedRequest::BindMount { .. } => "bind-mount",
            PrivilegedRequest::BindUnmount { .. } => "bind-unmount",
            PrivilegedRequest::TakeoverMount { .. } => "takeover-mount",
            PrivilegedRequest::TakeoverUnmount { .. } => "takeover-unmount",
            PrivilegedRequest::SetLogFile => "set-log-file",
            PrivilegedRequest::SetDaemonTimeout { .. } => "set-daemon-timeout",
        }
    }
}

/// Successful outcomes, one per request variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HelperReply {
    /// Handshake accepted at this version.
    HandshakeAccepted {
        /// Agreed version
        version: u32,
    },
    /// Answer to `Ping`.
    Pong,
    /// The mount exists; for FUSE the session handle is attached.
    Mounted {
        /// Mount point
        path: PathBuf,
        /// Whether a handle is attached to this frame
        handle_attached: bool,
    },
    /// The path is no longer mounted.
    Unmounted {
        /// Mount point
        path: PathBuf,
        /// False when there was nothing to unmount
        was_mounted: bool,
    },
    /// The bind mount exists.
    BindMounted {
        /// Bind target
        target: PathBuf,
    },
    /// The bind target is no longer mounted.
    BindUnmounted {
        /// Bind target
        target: PathBuf,
        /// False when there was nothing to unmount
        was_mounted: bool,
    },
    /// The helper now tracks this mount.
    TakenOver {
        /// Mount point
        path: PathBuf,
    },
    /// The helper no longer tracks this mount.
    Released {
        /// Mount point
        path: PathBuf,
        /// False when the helper was not tracking it
        was_registered: bool,
    },
    /// Log output now goes to the supplied file.
    LogFileSet,
    /// Daemon timeout recorded.
    DaemonTimeoutSet {
        /// Recorded value
        timeout: Duration,
    },
}

/// Typed failures returned by the helper. None of them end the helper.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivilegedFailure {
    /// The kernel refused the operation for lack of privilege.
    #[error("permission denied for {path:?}: {detail}")]
    PermissionDenied {
        /// Path involved
        path: PathBuf,
        /// OS message
        detail: String,
    },

    /// The path is outside every configured mount root.
    #[error("{path:?} is outside the allowed mount roots")]
    OutsideAllowList {
        /// Rejected path
        path: PathBuf,
    },

    /// The path argument is malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The mount is busy and the request did not ask to force it.
    #[error("{path:?} is busy")]
    Busy {
        /// Busy mount point
        path: PathBuf,
    },

    /// The request could not be decoded or is not valid right now.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation is not available on this platform or for this kind.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The daemon and helper speak different protocol versions.
    #[error("protocol version mismatch: daemon speaks {daemon}, helper speaks {helper}")]
    VersionMismatch {
        /// Version sent by the daemon
        daemon: u32,
        /// Version implemented by the helper
        helper: u32,
    },

    /// Any other OS error.
    #[error("{operation} failed: {message} (errno {errno})")]
    Os {
        /// Operation that failed
        operation: String,
        /// Raw errno
        errno: i32,
        /// OS message
        message: String,
    },
}

impl PrivilegedFailure {
    /// Maps an errno from a mount-table call to a typed failure.
    pub fn from_errno(operation: &str, path: &std::path::Path, errno: nix::Error) -> Self {
        match errno {
            nix::Error::EPERM | nix::Error::EACCES => PrivilegedFailure::PermissionDenied {
                path: path.to_path_buf(),
                detail: errno.desc().to_string(),
            },
            nix::Error::EBUSY => PrivilegedFailure::Busy {
                path: path.to_path_buf(),
            },
            other => PrivilegedFailure::Os {
                operation: operation.to_string(),
                errno: other as i32,
                message: other.desc().to_string(),
            },
        }
    }
}

/// Body of every helper response frame.
pub type HelperResponse = Result<HelperReply, PrivilegedFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_keeps_xid_and_variant() {
        let request = HelperEnvelope {
            xid: 9,
            body: PrivilegedRequest::Unmount {
                path: PathBuf::from("/data/x"),
                force: true,
            },
        };
        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: HelperEnvelope<PrivilegedRequest> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_failure_survives_the_wire() {
        let response: HelperEnvelope<HelperResponse> = HelperEnvelope {
            xid: 3,
            body: Err(PrivilegedFailure::OutsideAllowList {
                path: PathBuf::from("/etc"),
            }),
        };
        let bytes = serde_json::to_vec(&response).unwrap();
        let decoded: HelperEnvelope<HelperResponse> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.body, response.body);
    }

    #[test]
    fn test_errno_mapping() {
        let path = std::path::Path::new("/data/x");
        assert!(matches!(
            PrivilegedFailure::from_errno("mount", path, nix::Error::EPERM),
            PrivilegedFailure::PermissionDenied { .. }
        ));
        assert!(matches!(
            PrivilegedFailure::from_errno("umount", path, nix::Error::EBUSY),
            PrivilegedFailure::Busy { .. }
        ));
        assert!(matches!(
            PrivilegedFailure::from_errno("mount", path, nix::Error::ENODEV),
            PrivilegedFailure::Os { errno, .. } if errno == libc::ENODEV
        ));
    }

    #[test]
    fn test_mount_options_default_when_missing() {
        let options: MountOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, MountOptions::default());
    }
}
