//! Core daemon modules.
//!
//! - `channel`: framed messages with attached handles
//! - `config`: daemon configuration
//! - `constants`: protocol constants and default values
//! - `daemon`: process startup, serving loop and restart
//! - `error`: typed errors shared across modules
//! - `hooks`: service and session layer interfaces
//! - `instance`: records of running daemon instances
//! - `paths`: mount path normalization
//! - `privhelper`: the privileged mount helper and its client
//! - `registry`: mounts owned by this process
//! - `supervisor`: retry and deadline policies
//! - `takeover`: handing mounts to a successor

pub mod channel;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod error;
pub mod hooks;
pub mod instance;
pub mod paths;
pub mod privhelper;
pub mod registry;
pub mod supervisor;
/// Graceful takeover between daemon generations.
pub mod takeover;
