//! The privileged mount helper.
//!
//! - `protocol`: request/response wire types
//! - `mounter`: kernel mount-table backend
//! - `server`: the helper's request loop
//! - `client`: the daemon's retrying client
//! - `process`: forking, privilege handling and connectors

pub mod client;
pub mod mounter;
pub mod process;
pub mod protocol;
pub mod server;

pub use client::{HelperClient, HelperConnector};
pub use mounter::{PrivilegedBackend, SystemMounter, UnmountMode};
pub use process::{
    drop_privileges, restrict_helper, spawn_helper, Credentials, ForkedConnector, HelperListener,
    HelperProcess, SocketConnector,
};
pub use protocol::{MountOptions, PrivilegedFailure, PrivilegedRequest};
pub use server::{HelperPolicy, HelperServer};
