//! The snapshot handed from one daemon generation to the next.

use std::collections::BTreeSet;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::protocol::Capability;
use crate::modules::error::TakeoverError;
use crate::modules::registry::{MountInfo, MountMetadata};

/// Serializable part of [`TakeoverData`]; handles travel beside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverHeader {
    /// Negotiated protocol version
    pub version: u32,
    /// Features in use for this transfer
    pub capabilities: Vec<Capability>,
    /// One entry per mount, in transfer order
    pub mounts: Vec<MountMetadata>,
}

/// All active mounts with their session handles.
///
/// Built only by the outgoing daemon at handoff time and consumed once by
/// the incoming daemon; never written to disk.
#[derive(Debug)]
pub struct TakeoverData {
    pub version: u32,
    pub capabilities: Vec<Capability>,
    pub mounts: Vec<MountInfo>,
}

impl TakeoverData {
    /// Splits into a header and the handles in entry order. Handle `i`
    /// belongs to `header.mounts[i]`.
    pub fn into_parts(self) -> (TakeoverHeader, Vec<OwnedFd>) {
        let (mounts, handles) = self
            .mounts
            .into_iter()
            .map(|info| (info.metadata, info.handle))
            .unzip();
        (
            TakeoverHeader {
                version: self.version,
                capabilities: self.capabilities,
                mounts,
            },
            handles,
        )
    }

    /// Pairs handles back to entries by position and checks the snapshot
    /// is internally consistent.
    pub fn from_parts(header: TakeoverHeader, handles: Vec<OwnedFd>) -> Result<Self, TakeoverError> {
        if header.mounts.len() != handles.len() {
            return Err(TakeoverError::Protocol(format!(
                "{} entries arrived with {} handles",
                header.mounts.len(),
                handles.len()
            )));
        }
        check_unique(header.mounts.iter().map(|m| &m.mount_path))?;

        let mounts = header
            .mounts
            .into_iter()
            .zip(handles)
            .map(|(metadata, handle)| MountInfo { metadata, handle })
            .collect();
        Ok(Self {
            version: header.version,
            capabilities: header.capabilities,
            mounts,
        })
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.mounts.iter().map(|m| m.path().to_path_buf()).collect()
    }
}

/// Rejects a snapshot naming the same mount path twice.
pub(crate) fn check_unique<'a>(
    paths: impl IntoIterator<Item = &'a PathBuf>,
) -> Result<(), TakeoverError> {
    let mut seen = BTreeSet::new();
    for path in paths {
        if !seen.insert(path) {
            return Err(TakeoverError::Protocol(format!(
                "mount path {:?} appears twice",
                path
            )));
        }
    }
    Ok(())
}
