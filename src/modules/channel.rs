//! Framed, handle-carrying local channel.
//!
//! A `Channel` wraps one end of a Unix domain stream socket. Every message is
//! a frame made of a 4-byte big-endian length followed by a JSON body.
//! OS handles travel out of band as `SCM_RIGHTS` ancillary data attached to
//! the first byte of the frame they belong to, so a receiver always knows
//! which message a handle arrived with.
//!
//! Sending takes the handles by value: once `send` returns, the sender's
//! descriptors are closed and the receiver holds the only copies.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use log::debug;
use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::constants::{FRAME_HEADER_LEN, MAX_FRAME_SIZE, MAX_HANDLES_PER_FRAME};
use super::error::ChannelError;

/// A received frame whose body has not been decoded yet.
#[derive(Debug)]
pub struct Frame {
    /// Raw JSON body
    pub body: Vec<u8>,
    /// Handles that arrived with this frame, in the order they were sent
    pub handles: Vec<OwnedFd>,
}

impl Frame {
    /// Decodes the body into a message type, leaving the handles in place.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// An ownership-exclusive, bidirectional endpoint for frames and handles.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
    max_frame: usize,
}

impl Channel {
    /// Wraps an already connected stream.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            max_frame: MAX_FRAME_SIZE,
        }
    }

    /// Creates two connected channels.
    pub fn pair() -> Result<(Channel, Channel), ChannelError> {
        let (left, right) = UnixStream::pair()?;
        Ok((Channel::new(left), Channel::new(right)))
    }

    /// Connects to a listening Unix socket.
    pub fn connect(path: &Path) -> Result<Channel, ChannelError> {
        Ok(Channel::new(UnixStream::connect(path)?))
    }

    /// Overrides the maximum accepted frame body size.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Bounds every subsequent read and write. `None` blocks indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        // A zero duration is rejected by the socket API; treat it as "already expired".
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Sends one message, transferring ownership of `handles` to the peer.
    pub fn send<T: Serialize>(
        &mut self,
        message: &T,
        handles: Vec<OwnedFd>,
    ) -> Result<(), ChannelError> {
        let body = serde_json::to_vec(message)?;
        self.send_raw(&body, handles)
    }

    /// Sends an already encoded body.
    pub fn send_raw(&mut self, body: &[u8], handles: Vec<OwnedFd>) -> Result<(), ChannelError> {
        if body.len() > self.max_frame {
            return Err(ChannelError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame,
            });
        }
        if handles.len() > MAX_HANDLES_PER_FRAME {
            return Err(ChannelError::TooManyHandles(handles.len()));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);

        if handles.is_empty() {
            self.stream.write_all(&frame).map_err(map_io)?;
        } else {
            let fds: Vec<RawFd> = handles.iter().map(|h| h.as_raw_fd()).collect();
            let sent = self.send_with_rights(&frame, &fds)?;
            self.stream.write_all(&frame[sent..]).map_err(map_io)?;
            debug!("sent frame of {} bytes with {} handles", body.len(), fds.len());
        }
        self.stream.flush().map_err(map_io)?;

        // The peer now holds its own references; ours are consumed here.
        drop(handles);
        Ok(())
    }

    fn send_with_rights(&self, frame: &[u8], fds: &[RawFd]) -> Result<usize, ChannelError> {
        let iov = [IoSlice::new(frame)];
        let cmsgs = [ControlMessage::ScmRights(fds)];
        loop {
            match sendmsg::<UnixAddr>(
                self.stream.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::empty(),
                None,
            ) {
                Ok(sent) => return Ok(sent),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(ChannelError::Timeout),
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                    return Err(ChannelError::Disconnected)
                }
                Err(errno) => return Err(ChannelError::Os(errno)),
            }
        }
    }

    /// Receives one frame without decoding its body.
    pub fn recv_frame(&mut self) -> Result<Frame, ChannelError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let (read, handles) = self.recv_header(&mut header)?;
        if read < FRAME_HEADER_LEN {
            self.stream
                .read_exact(&mut header[read..])
                .map_err(map_io)?;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            return Err(ChannelError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).map_err(map_io)?;
        Ok(Frame { body, handles })
    }

    /// Receives and decodes one message.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<(T, Vec<OwnedFd>), ChannelError> {
        let frame = self.recv_frame()?;
        let message = frame.decode()?;
        Ok((message, frame.handles))
    }

    fn recv_header(&self, header: &mut [u8]) -> Result<(usize, Vec<OwnedFd>), ChannelError> {
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_HANDLES_PER_FRAME]);
        let mut raw_fds = Vec::new();

        let (bytes, truncated) = loop {
            let mut iov = [IoSliceMut::new(header)];
            match recvmsg::<UnixAddr>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                recv_flags(),
            ) {
                Ok(msg) => {
                    for cmsg in msg.cmsgs() {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            raw_fds.extend(fds);
                        }
                    }
                    break (msg.bytes, msg.flags.contains(MsgFlags::MSG_CTRUNC));
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(ChannelError::Timeout),
                Err(Errno::ECONNRESET) => return Err(ChannelError::Disconnected),
                Err(errno) => return Err(ChannelError::Os(errno)),
            }
        };

        // Take ownership before any early return so nothing leaks.
        let handles: Vec<OwnedFd> = raw_fds
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();

        if bytes == 0 {
            return Err(ChannelError::Disconnected);
        }
        if truncated {
            return Err(ChannelError::TooManyHandles(handles.len()));
        }
        Ok((bytes, handles))
    }

    /// Shuts down both directions, waking a peer blocked in `recv`.
    pub fn shutdown(&self) -> Result<(), ChannelError> {
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl From<Channel> for OwnedFd {
    fn from(channel: Channel) -> OwnedFd {
        OwnedFd::from(channel.stream)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

fn map_io(err: io::Error) -> ChannelError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset => ChannelError::Disconnected,
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ChannelError::Timeout,
        _ => ChannelError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
        seq: u32,
    }

    fn note(text: &str, seq: u32) -> Note {
        Note {
            text: text.to_string(),
            seq,
        }
    }

    #[test]
    fn test_message_without_handles() -> Result<()> {
        let (mut left, mut right) = Channel::pair()?;
        left.send(&note("hello", 1), Vec::new())?;

        let (received, handles): (Note, _) = right.recv()?;
        assert_eq!(received, note("hello", 1));
        assert!(handles.is_empty());
        Ok(())
    }

    #[test]
    fn test_handle_stays_live_after_transfer() -> Result<()> {
        let (mut left, mut right) = Channel::pair()?;
        let (session, mut kernel_side) = UnixStream::pair()?;

        left.send(&note("session", 7), vec![OwnedFd::from(session)])?;
        let (_, mut handles): (Note, _) = right.recv()?;
        assert_eq!(handles.len(), 1);

        let mut transferred = UnixStream::from(handles.remove(0));
        transferred.write_all(b"ping")?;
        let mut buf = [0u8; 4];
        kernel_side.read_exact(&mut buf)?;
        assert_eq!(&buf, b"ping");

        // The sender's copy was consumed, so closing the received one is the
        // last reference and the kernel side observes EOF.
        drop(transferred);
        let mut rest = Vec::new();
        kernel_side.read_to_end(&mut rest)?;
        assert!(rest.is_empty());
        Ok(())
    }

    #[test]
    fn test_handles_stay_with_their_frame() -> Result<()> {
        let (mut left, mut right) = Channel::pair()?;
        let (a, _a_peer) = UnixStream::pair()?;
        let (b, _b_peer) = UnixStream::pair()?;

        left.send(&note("first", 1), vec![OwnedFd::from(a)])?;
        left.send(&note("plain", 2), Vec::new())?;
        left.send(&note("second", 3), vec![OwnedFd::from(b)])?;

        let (first, h1): (Note, _) = right.recv()?;
        let (plain, h2): (Note, _) = right.recv()?;
        let (second, h3): (Note, _) = right.recv()?;
        assert_eq!((first.seq, h1.len()), (1, 1));
        assert_eq!((plain.seq, h2.len()), (2, 0));
        assert_eq!((second.seq, h3.len()), (3, 1));
        Ok(())
    }

    #[test]
    fn test_disconnect_is_reported() -> Result<()> {
        let (left, mut right) = Channel::pair()?;
        drop(left);
        assert!(matches!(
            right.recv_frame(),
            Err(ChannelError::Disconnected)
        ));
        Ok(())
    }

    #[test]
    fn test_partial_frame_is_a_disconnect() -> Result<()> {
        let (left, mut right) = Channel::pair()?;
        let mut raw = UnixStream::from(OwnedFd::from(left));
        raw.write_all(&10u32.to_be_bytes())?;
        raw.write_all(b"abc")?;
        drop(raw);
        assert!(matches!(
            right.recv_frame(),
            Err(ChannelError::Disconnected)
        ));
        Ok(())
    }

    #[test]
    fn test_oversized_header_rejected() -> Result<()> {
        let (left, right) = Channel::pair()?;
        let mut right = right.with_max_frame(16);
        let mut raw = UnixStream::from(OwnedFd::from(left));
        raw.write_all(&1024u32.to_be_bytes())?;
        assert!(matches!(
            right.recv_frame(),
            Err(ChannelError::FrameTooLarge { len: 1024, max: 16 })
        ));
        Ok(())
    }

    #[test]
    fn test_recv_times_out() -> Result<()> {
        let (_left, mut right) = Channel::pair()?;
        right.set_timeout(Some(Duration::from_millis(20)))?;
        assert!(matches!(right.recv_frame(), Err(ChannelError::Timeout)));
        Ok(())
    }

    #[test]
    fn test_malformed_body_does_not_desync() -> Result<()> {
        let (mut left, mut right) = Channel::pair()?;
        left.send_raw(b"{not json", Vec::new())?;
        left.send(&note("after", 2), Vec::new())?;

        let bad = right.recv::<Note>();
        assert!(matches!(bad, Err(ChannelError::Codec(_))));
        let (good, _): (Note, _) = right.recv()?;
        assert_eq!(good.seq, 2);
        Ok(())
    }
}
