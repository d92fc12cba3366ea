#![doc(html_root_url = "https://docs.rs/leapfrog/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! leapfrog: a privileged mount helper and graceful takeover for
//! userspace filesystem daemons
//!
//! A filesystem daemon runs unprivileged. Mounting and unmounting go through
//! a small helper process that keeps root, and a running daemon can hand
//! its live mounts to a freshly started replacement without unmounting them.
//!
//! ## Features
//!
//! - Typed request/response protocol to the privileged helper, with
//!   retries and reconnection
//! - Mount path allow-list enforced by the helper
//! - Session handles (`/dev/fuse` or NFS sockets) passed between processes
//! - Versioned takeover protocol with per-entry acknowledgement and rollback
//! - Instance records so operators can restart and inspect running daemons
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use leapfrog::{DaemonConfig, DaemonOptions, MountRequest};
//! use std::path::PathBuf;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = DaemonConfig {
//!     instance: "repo".to_string(),
//!     mount_roots: vec![PathBuf::from("/data")],
//!     ..DaemonConfig::default()
//! };
//! let options = DaemonOptions {
//!     config,
//!     mounts: vec!["/data/repo:fuse".parse::<MountRequest>().map_err(anyhow::Error::msg)?],
//!     ..DaemonOptions::default()
//! };
//! leapfrog::run_daemon(options)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Takeover
//!
//! Start a second daemon with `--takeover <socket>` (or `lpf restart`). The
//! running daemon pauses, transfers every mount and exits once the
//! successor confirms; any failure before that leaves it serving.

pub mod modules;

pub use modules::config::DaemonConfig;
pub use modules::daemon::{run_daemon, DaemonExit, DaemonOptions, MountDaemon, MountRequest};
pub use modules::privhelper::{HelperClient, HelperServer};
pub use modules::registry::{MountInfo, MountRegistry, SessionKind};

// Re-export commonly used types
pub use modules::takeover::{TakeoverClient, TakeoverListener, TakeoverServer};
