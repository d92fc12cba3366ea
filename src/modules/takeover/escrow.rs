//! Outgoing-side custody of mounts while a transfer is in flight.
//!
//! Each entry sent to the successor carries a duplicate of the session
//! handle; the original stays here, unserved, until the attempt ends. Commit
//! drops the originals. Abort gives them back to the registry.

use std::collections::BTreeSet;
use std::io;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;

use crate::modules::registry::{MountInfo, MountMetadata};

#[derive(Debug)]
pub struct HandleEscrow {
    entries: Vec<MountInfo>,
    acknowledged: BTreeSet<usize>,
}

impl HandleEscrow {
    pub fn new(entries: Vec<MountInfo>) -> Self {
        Self {
            entries,
            acknowledged: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Metadata of every entry, in transfer order.
    pub fn metadata(&self) -> Vec<MountMetadata> {
        self.entries.iter().map(|e| e.metadata.clone()).collect()
    }

    pub fn metadata_at(&self, index: usize) -> Option<&MountMetadata> {
        self.entries.get(index).map(|e| &e.metadata)
    }

    /// Mutable access for filling in detached session state.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut MountInfo> {
        self.entries.iter_mut()
    }

    /// A fresh descriptor for entry `index`, to be sent away.
    pub fn duplicate(&self, index: usize) -> io::Result<OwnedFd> {
        match self.entries.get(index) {
            Some(entry) => entry.handle.try_clone(),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no escrow entry {}", index),
            )),
        }
    }

    /// Duplicates of every handle, in transfer order.
    pub fn duplicate_all(&self) -> io::Result<Vec<OwnedFd>> {
        self.entries.iter().map(|e| e.handle.try_clone()).collect()
    }

    /// Records that the successor confirmed entry `index`.
    pub fn acknowledge(&mut self, index: usize) -> bool {
        index < self.entries.len() && self.acknowledged.insert(index)
    }

    pub fn acknowledge_all(&mut self) {
        self.acknowledged.extend(0..self.entries.len());
    }

    /// Mount paths the successor has not confirmed yet.
    pub fn unconfirmed(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.acknowledged.contains(index))
            .map(|(_, entry)| entry.path().to_path_buf())
            .collect()
    }

    /// Gives the mounts back after an abort.
    pub fn restore(self) -> Vec<MountInfo> {
        self.entries
    }

    /// Closes the outgoing copies after commit and returns the paths
    /// that now belong to the successor.
    pub fn release(self) -> Vec<PathBuf> {
        self.entries
            .into_iter()
            .map(|entry| entry.metadata.mount_path)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::registry::SessionKind;
    use anyhow::Result;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_unconfirmed_tracks_acks() -> Result<()> {
        let mut peers = Vec::new();
        let mut entries = Vec::new();
        for path in ["/a", "/b", "/c"] {
            let (handle, peer) = UnixStream::pair()?;
            peers.push(peer);
            entries.push(MountInfo::new(PathBuf::from(path), SessionKind::Fuse, OwnedFd::from(handle)));
        }
        let mut escrow = HandleEscrow::new(entries);
        assert_eq!(escrow.unconfirmed().len(), 3);

        assert!(escrow.acknowledge(1));
        assert!(!escrow.acknowledge(1));
        assert!(!escrow.acknowledge(7));
        assert_eq!(
            escrow.unconfirmed(),
            vec![PathBuf::from("/a"), PathBuf::from("/c")]
        );

        escrow.acknowledge_all();
        assert!(escrow.unconfirmed().is_empty());
        Ok(())
    }

    #[test]
    fn test_duplicate_reaches_same_session() -> Result<()> {
        let (handle, mut kernel) = UnixStream::pair()?;
        let escrow = HandleEscrow::new(vec![MountInfo::new(
            PathBuf::from("/a"),
            SessionKind::Fuse,
            OwnedFd::from(handle),
        )]);

        let mut copy = UnixStream::from(escrow.duplicate(0)?);
        copy.write_all(b"x")?;
        let mut buf = [0u8; 1];
        kernel.read_exact(&mut buf)?;
        assert_eq!(&buf, b"x");
        assert!(escrow.duplicate(1).is_err());

        // Restored entries keep a working handle.
        let restored = escrow.restore();
        let mut original = UnixStream::from(restored.into_iter().next().unwrap().handle);
        original.write_all(b"y")?;
        kernel.read_exact(&mut buf)?;
        assert_eq!(&buf, b"y");
        Ok(())
    }
}
