//! Graceful takeover: handing live mounts from one daemon process to its
//! successor without unmounting them.
//!
//! The outgoing daemon runs a [`TakeoverListener`] on its instance's
//! takeover socket. A successor started with that socket path connects with
//! a [`TakeoverClient`]. Commit happens when the outgoing side receives
//! `Ready` for every entry; timers only bound how long either side waits.

pub mod client;
pub mod data;
pub mod escrow;
pub mod protocol;
pub mod server;
pub mod state;

pub use client::TakeoverClient;
pub use data::{TakeoverData, TakeoverHeader};
pub use escrow::HandleEscrow;
pub use protocol::{Capability, RefusalReason, TakeoverMessage};
pub use server::{Handoff, TakeoverListener, TakeoverServer};
pub use state::{IncomingState, OutgoingState};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::channel::Channel;
    use crate::modules::error::TakeoverError;
    use crate::modules::hooks::{MemorySessionLayer, RegistryService, SessionLayer, SessionState};
    use crate::modules::privhelper::client::testing::{fast_backoff, ThreadConnector};
    use crate::modules::privhelper::mounter::fake::FakeBackend;
    use crate::modules::privhelper::HelperClient;
    use crate::modules::registry::{MountInfo, MountRegistry, SessionKind};
    use anyhow::Result;
    use parking_lot::Mutex;
    use std::io::{Read, Write};
    use std::os::unix::io::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    /// One daemon generation's collaborators.
    struct Generation {
        registry: MountRegistry,
        service: Arc<RegistryService>,
        sessions: Arc<MemorySessionLayer>,
    }

    impl Generation {
        fn new() -> Self {
            let registry = MountRegistry::new();
            Self {
                service: Arc::new(RegistryService::new(registry.clone())),
                sessions: Arc::new(MemorySessionLayer::new()),
                registry,
            }
        }

        /// Adds a served mount and returns the kernel end of its session.
        fn mount(&self, path: &str, kind: SessionKind) -> Result<UnixStream> {
            let (handle, kernel) = UnixStream::pair()?;
            self.registry
                .insert(MountInfo::new(PathBuf::from(path), kind, OwnedFd::from(handle)))?;
            self.registry
                .with_mount(Path::new(path), |info| self.sessions.attach_session(info))
                .expect("just inserted")?;
            Ok(kernel)
        }

        fn server(&self) -> TakeoverServer {
            TakeoverServer::new(self.registry.clone(), self.service.clone(), self.sessions.clone())
                .with_ack_timeout(Duration::from_secs(5))
        }

        fn client(&self) -> TakeoverClient {
            TakeoverClient::new(self.registry.clone(), self.service.clone(), self.sessions.clone())
                .with_timeout(Duration::from_secs(10))
        }

        /// Proves this generation's handle for `path` reaches `kernel`.
        fn assert_serves(&self, path: &str, kernel: &mut UnixStream) -> Result<()> {
            let mut session = self
                .registry
                .with_mount(Path::new(path), |info| info.handle.try_clone())
                .expect("mount registered")
                .map(UnixStream::from)?;
            kernel.write_all(b"ping")?;
            let mut buf = [0u8; 4];
            session.read_exact(&mut buf)?;
            assert_eq!(&buf, b"ping");
            Ok(())
        }
    }

    fn two_mounts(old: &Generation) -> Result<(UnixStream, UnixStream)> {
        let a = old.mount("/a", SessionKind::Fuse)?;
        let b = old.mount("/b", SessionKind::Nfs)?;
        Ok((a, b))
    }

    fn hello(versions: Vec<u32>) -> TakeoverMessage {
        TakeoverMessage::Hello {
            versions,
            capabilities: Capability::ALL.to_vec(),
            kinds: SessionKind::ALL.to_vec(),
        }
    }

    fn run_outgoing(
        server: Arc<TakeoverServer>,
        channel: Channel,
    ) -> thread::JoinHandle<Result<Handoff, TakeoverError>> {
        thread::spawn(move || server.accept(channel))
    }

    fn full_handoff(versions: Vec<u32>) -> Result<()> {
        let old = Generation::new();
        let (mut kernel_a, mut kernel_b) = two_mounts(&old)?;
        old.sessions.set_state(
            Path::new("/a"),
            SessionState {
                inode_counter: 77,
                blob: b"tree-a".to_vec(),
            },
        );
        let before = old.registry.kinds();

        let new = Generation::new();
        let server = Arc::new(old.server().with_versions(versions));
        let (outgoing_end, incoming_end) = Channel::pair()?;
        let outgoing = run_outgoing(server.clone(), outgoing_end);

        let client = new.client();
        assert_eq!(client.take_over_channel(incoming_end)?, 2);
        let handoff = outgoing.join().unwrap()?;

        assert_eq!(handoff.mounts, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(server.state(), OutgoingState::Committed);
        assert_eq!(client.state(), IncomingState::Serving);

        // The mount set moved as a whole, state included.
        assert!(old.registry.is_empty());
        assert_eq!(new.registry.kinds(), before);
        let a = new
            .registry
            .metadata()
            .into_iter()
            .find(|m| m.mount_path == Path::new("/a"))
            .expect("/a inherited");
        assert_eq!(a.inode_counter, 77);
        assert_eq!(a.state, b"tree-a");
        assert_eq!(new.sessions.attached(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(!new.service.is_paused());

        new.assert_serves("/a", &mut kernel_a)?;
        new.assert_serves("/b", &mut kernel_b)?;

        // A committed server accepts no further attempts.
        assert!(!server.try_begin());
        Ok(())
    }

    #[test]
    fn test_handoff_per_entry() -> Result<()> {
        full_handoff(vec![1, 2])
    }

    #[test]
    fn test_handoff_batch() -> Result<()> {
        full_handoff(vec![1])
    }

    #[test]
    fn test_disconnect_mid_transfer_restores_outgoing() -> Result<()> {
        let old = Generation::new();
        let (mut kernel_a, mut kernel_b) = two_mounts(&old)?;
        let server = Arc::new(old.server());
        let (outgoing_end, mut incoming) = Channel::pair()?;
        let outgoing = run_outgoing(server.clone(), outgoing_end);

        incoming.send(&hello(vec![2]), Vec::new())?;
        assert_eq!(incoming.recv::<TakeoverMessage>()?.0, TakeoverMessage::Ping);
        incoming.send(&TakeoverMessage::Pong, Vec::new())?;
        assert!(matches!(
            incoming.recv::<TakeoverMessage>()?.0,
            TakeoverMessage::Accepted { mount_count: 2, .. }
        ));
        let (entry, handles) = incoming.recv::<TakeoverMessage>()?;
        assert!(matches!(entry, TakeoverMessage::Entry { index: 0, .. }));
        assert_eq!(handles.len(), 1);

        // The successor dies holding /a's copy, before /b was sent.
        drop(handles);
        drop(incoming);

        let err = outgoing.join().unwrap().unwrap_err();
        assert!(matches!(err, TakeoverError::Channel(_)));
        assert_eq!(old.registry.paths(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(old.sessions.attached(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(!old.service.is_paused());
        assert_eq!(server.state(), OutgoingState::Idle);

        old.assert_serves("/a", &mut kernel_a)?;
        old.assert_serves("/b", &mut kernel_b)?;
        assert!(server.try_begin());
        Ok(())
    }

    #[test]
    fn test_unsupported_version_refused() -> Result<()> {
        let old = Generation::new();
        let _kernels = two_mounts(&old)?;
        let before = old.registry.kinds();
        let server = Arc::new(old.server());
        let (outgoing_end, incoming_end) = Channel::pair()?;
        let outgoing = run_outgoing(server.clone(), outgoing_end);

        let new = Generation::new();
        let client = new.client().with_versions(vec![99]);
        let err = client.take_over_channel(incoming_end).unwrap_err();
        match err {
            TakeoverError::Refused(RefusalReason::VersionMismatch { offered, supported }) => {
                assert_eq!(offered, vec![99]);
                assert_eq!(supported, vec![1, 2]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(client.state(), IncomingState::Failed);
        assert!(new.registry.is_empty());

        assert!(matches!(
            outgoing.join().unwrap(),
            Err(TakeoverError::Refused(_))
        ));
        assert_eq!(old.registry.kinds(), before);
        assert_eq!(old.sessions.attached().len(), 2);
        assert!(!old.service.is_paused());
        assert_eq!(server.state(), OutgoingState::Idle);
        Ok(())
    }

    #[test]
    fn test_unsupported_kind_refused() -> Result<()> {
        let old = Generation::new();
        let _kernels = two_mounts(&old)?;
        let server = Arc::new(old.server());
        let (outgoing_end, incoming_end) = Channel::pair()?;
        let outgoing = run_outgoing(server, outgoing_end);

        let new = Generation::new();
        let err = new
            .client()
            .with_kinds(vec![SessionKind::Fuse])
            .take_over_channel(incoming_end)
            .unwrap_err();
        assert!(matches!(
            err,
            TakeoverError::Refused(RefusalReason::UnsupportedKind { kind: SessionKind::Nfs, .. })
        ));
        assert!(outgoing.join().unwrap().is_err());
        assert_eq!(old.registry.len(), 2);
        Ok(())
    }

    #[test]
    fn test_repeated_ready_gets_repeated_commit() -> Result<()> {
        let old = Generation::new();
        let _kernels = two_mounts(&old)?;
        let server = Arc::new(old.server());
        let (outgoing_end, mut incoming) = Channel::pair()?;
        let outgoing = run_outgoing(server, outgoing_end);

        incoming.send(&hello(vec![1]), Vec::new())?;
        assert!(matches!(
            incoming.recv::<TakeoverMessage>()?.0,
            TakeoverMessage::Accepted { version: 1, mount_count: 2 }
        ));
        let (batch, handles) = incoming.recv::<TakeoverMessage>()?;
        assert!(matches!(batch, TakeoverMessage::Batch { .. }));
        assert_eq!(handles.len(), 2);

        for _ in 0..2 {
            incoming.send(&TakeoverMessage::Ready { count: 2 }, Vec::new())?;
            assert_eq!(incoming.recv::<TakeoverMessage>()?.0, TakeoverMessage::Commit);
        }
        drop(incoming);

        let handoff = outgoing.join().unwrap()?;
        assert_eq!(handoff.mounts.len(), 2);
        assert!(old.registry.is_empty());
        Ok(())
    }

    #[test]
    fn test_stalled_successor_times_out() -> Result<()> {
        let old = Generation::new();
        let (mut kernel_a, _kernel_b) = two_mounts(&old)?;
        let server = Arc::new(old.server().with_ack_timeout(Duration::from_millis(200)));
        let (outgoing_end, mut incoming) = Channel::pair()?;
        let outgoing = run_outgoing(server, outgoing_end);

        incoming.send(&hello(vec![2]), Vec::new())?;
        incoming.recv::<TakeoverMessage>()?;
        incoming.send(&TakeoverMessage::Pong, Vec::new())?;
        incoming.recv::<TakeoverMessage>()?;
        let (_entry, _handles) = incoming.recv::<TakeoverMessage>()?;

        // No acknowledgement; the outgoing side gives up on its own.
        let err = outgoing.join().unwrap().unwrap_err();
        assert!(matches!(err, TakeoverError::Channel(_)));
        assert_eq!(old.registry.len(), 2);
        assert!(!old.service.is_paused());
        old.assert_serves("/a", &mut kernel_a)?;
        Ok(())
    }

    #[test]
    fn test_incoming_deadline() -> Result<()> {
        let (_silent, incoming_end) = Channel::pair()?;
        let new = Generation::new();
        let client = new.client().with_timeout(Duration::from_millis(100));
        let err = client.take_over_channel(incoming_end).unwrap_err();
        assert!(matches!(err, TakeoverError::DeadlineExceeded));
        assert_eq!(client.state(), IncomingState::Failed);
        Ok(())
    }

    /// Plays the outgoing side of a one-mount v2 transfer by hand, up to and
    /// including the successor's `Ready`. Returns the kernel end of /a.
    fn send_one_entry(outgoing: &mut Channel) -> Result<UnixStream> {
        assert!(matches!(
            outgoing.recv::<TakeoverMessage>()?.0,
            TakeoverMessage::Hello { .. }
        ));
        outgoing.send(
            &TakeoverMessage::Accepted {
                version: 2,
                mount_count: 1,
            },
            Vec::new(),
        )?;
        let (handle, kernel) = UnixStream::pair()?;
        let info = MountInfo::new(PathBuf::from("/a"), SessionKind::Fuse, OwnedFd::from(handle));
        outgoing.send(
            &TakeoverMessage::Entry {
                index: 0,
                metadata: info.metadata.clone(),
            },
            vec![info.handle],
        )?;
        assert_eq!(
            outgoing.recv::<TakeoverMessage>()?.0,
            TakeoverMessage::EntryAck { index: 0 }
        );
        assert_eq!(
            outgoing.recv::<TakeoverMessage>()?.0,
            TakeoverMessage::Ready { count: 1 }
        );
        Ok(kernel)
    }

    #[test]
    fn test_hangup_after_ready_still_activates() -> Result<()> {
        let new = Generation::new();
        let client = Arc::new(new.client());
        let (mut outgoing, incoming_end) = Channel::pair()?;
        let incoming = {
            let client = client.clone();
            thread::spawn(move || client.take_over_channel(incoming_end))
        };

        let mut kernel = send_one_entry(&mut outgoing)?;
        // The predecessor commits and exits before its Commit reaches us.
        drop(outgoing);

        assert_eq!(incoming.join().unwrap()?, 1);
        assert_eq!(client.state(), IncomingState::Serving);
        assert_eq!(new.registry.paths(), vec![PathBuf::from("/a")]);
        assert_eq!(new.sessions.attached(), vec![PathBuf::from("/a")]);
        new.assert_serves("/a", &mut kernel)?;
        Ok(())
    }

    #[test]
    fn test_abort_after_ready_activates_nothing() -> Result<()> {
        let new = Generation::new();
        let client = Arc::new(new.client());
        let (mut outgoing, incoming_end) = Channel::pair()?;
        let incoming = {
            let client = client.clone();
            thread::spawn(move || client.take_over_channel(incoming_end))
        };

        let _kernel = send_one_entry(&mut outgoing)?;
        outgoing.send(
            &TakeoverMessage::Abort {
                reason: "shutting down".to_string(),
            },
            Vec::new(),
        )?;

        let err = incoming.join().unwrap().unwrap_err();
        assert!(matches!(err, TakeoverError::Protocol(_)));
        assert_eq!(client.state(), IncomingState::Failed);
        assert!(new.registry.is_empty());
        assert!(new.sessions.attached().is_empty());
        Ok(())
    }

    #[test]
    fn test_concurrent_attempt_refused() -> Result<()> {
        let dir = tempdir()?;
        let socket = dir.path().join("takeover.sock");
        let old = Generation::new();
        let _kernels = two_mounts(&old)?;
        let server = Arc::new(old.server());

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let listener = TakeoverListener::spawn(&socket, server, move |handoff| {
            let _ = tx.lock().send(handoff);
        })?;

        let first = Channel::connect(&socket)?;
        let mut second = Channel::connect(&socket)?;
        assert_eq!(
            second.recv::<TakeoverMessage>()?.0,
            TakeoverMessage::Refused {
                reason: RefusalReason::AlreadyInProgress
            }
        );

        let new = Generation::new();
        assert_eq!(new.client().take_over_channel(first)?, 2);
        let handoff = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(handoff.mounts.len(), 2);
        listener.stop();
        Ok(())
    }

    #[test]
    fn test_helpers_follow_the_mounts() -> Result<()> {
        let kernel = FakeBackend::new();
        let helper_for = |backend: &FakeBackend| -> Result<Arc<HelperClient>> {
            let (connector, _links) = ThreadConnector::new(backend.clone());
            Ok(Arc::new(HelperClient::connect(
                Box::new(connector),
                fast_backoff(),
                Duration::from_secs(5),
            )?))
        };
        let old_helper = helper_for(&kernel)?;
        let new_helper = helper_for(&kernel)?;

        let old = Generation::new();
        let _kernel_x = old.mount("/data/x", SessionKind::Fuse)?;
        old_helper.takeover_mount(Path::new("/data/x"), SessionKind::Fuse, Vec::new())?;

        let server = Arc::new(old.server().with_helper(old_helper.clone()));
        let (outgoing_end, incoming_end) = Channel::pair()?;
        let outgoing = run_outgoing(server, outgoing_end);

        let new = Generation::new();
        new.client()
            .with_helper(new_helper.clone())
            .take_over_channel(incoming_end)?;
        outgoing.join().unwrap()?;

        assert!(old_helper.registered_mounts().is_empty());
        assert_eq!(new_helper.registered_mounts(), vec![PathBuf::from("/data/x")]);
        Ok(())
    }
}
