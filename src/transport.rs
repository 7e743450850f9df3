//! Descriptor-passing transport (spec component B).
//!
//! Two blocking primitives — `send_frame`/`recv_frame` — that move exactly
//! one length-delimited frame per `sendmsg`/`recvmsg` call, optionally
//! attaching one file descriptor as `SCM_RIGHTS` ancillary data. Message-level
//! helpers (`send_message`/`recv_message`) compose this with the wire codec
//! (component A) for callers that want typed messages rather than raw bytes.
//!
//! Client-originated request frames never carry an attached descriptor
//! (§6: only `Launch` and `ReportChild` responses do), so they are read and
//! written with plain `read(2)`/`write(2)` instead — `recv_frame_via_read`/
//! `send_frame_via_write` below — matching the original, which reads the
//! client's pipe with `read(2)` and reserves `sendmsg`/`recvmsg` for the
//! fd-carrying direction. This also means `read_fd` can be a bare `pipe(2)`
//! end, as §4.H's fd convention requires, rather than needing to be a socket.

use crate::error::TransportError;
use crate::wire::{self, Message};
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::unistd::{read, write};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Length of the little-endian `u32` length prefix.
pub const FRAME_HEADER_LEN: usize = 4;
/// Upper bound on a single frame's payload. Generous for launch argv/envp
/// bursts while still bounding the receive buffer to a fixed allocation.
const MAX_FRAME_PAYLOAD: usize = 256 * 1024;

/// Writes `bytes` as a single framed, length-prefixed `sendmsg`, optionally
/// attaching `attach_fd` as ancillary data. Retries on `EINTR`; any other
/// error, or writing fewer bytes than the frame, is reported as an error —
/// the daemon never sends partial RPC frames.
pub fn send_frame(fd: RawFd, bytes: &[u8], attach_fd: Option<RawFd>) -> Result<(), TransportError> {
  let len = u32::try_from(bytes.len()).map_err(|_| TransportError::FrameTooLarge)?;
  let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + bytes.len());
  frame.extend_from_slice(&len.to_le_bytes());
  frame.extend_from_slice(bytes);

  let iov = [IoSlice::new(&frame)];
  let fds = attach_fd.map(|f| [f]);

  let sent = loop {
    let result = match &fds {
      Some(fds) => {
        let cmsg = [ControlMessage::ScmRights(fds)];
        sendmsg::<()>(fd, &iov, &cmsg, MsgFlags::empty(), None)
      }
      None => sendmsg::<()>(fd, &iov, &[], MsgFlags::empty(), None),
    };
    match result {
      Ok(n) => break n,
      Err(Errno::EINTR) => continue,
      Err(e) => return Err(TransportError::Errno(e)),
    }
  };

  if sent != frame.len() {
    return Err(TransportError::ShortWrite {
      expected: frame.len(),
      actual: sent,
    });
  }
  Ok(())
}

/// Reads exactly one frame, returning its payload bytes and any attached
/// descriptor. Since the daemon only ever sends one frame per `sendmsg` and
/// frames are well within `MAX_FRAME_PAYLOAD`, a single `recvmsg` call is
/// expected to deliver the whole frame; anything else is a transport error
/// rather than something this layer buffers across calls.
pub fn recv_frame(fd: RawFd) -> Result<(Vec<u8>, Option<OwnedFd>), TransportError> {
  let mut buf = vec![0u8; FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD];
  let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

  let msg = loop {
    let mut iov = [IoSliceMut::new(&mut buf)];
    match recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
      Ok(msg) => break msg,
      Err(Errno::EINTR) => continue,
      Err(e) => return Err(TransportError::Errno(e)),
    }
  };

  if msg.bytes == 0 {
    return Err(TransportError::PeerHungUp);
  }
  if msg.bytes < FRAME_HEADER_LEN {
    return Err(TransportError::ShortRead);
  }

  let mut received_fd = None;
  for cmsg in msg.cmsgs().map_err(|_| TransportError::AncillaryDataMismatch)? {
    if let ControlMessageOwned::ScmRights(fds) = cmsg {
      if fds.len() != 1 || received_fd.is_some() {
        return Err(TransportError::AncillaryDataMismatch);
      }
      // SAFETY: fds[0] was just handed to us by the kernel via SCM_RIGHTS;
      // we are the sole owner of this new descriptor.
      received_fd = Some(unsafe { OwnedFd::from_raw_fd(fds[0]) });
    }
  }

  let len = u32::from_le_bytes(
    buf[..FRAME_HEADER_LEN]
      .try_into()
      .expect("slice has exactly FRAME_HEADER_LEN bytes"),
  ) as usize;
  let end = FRAME_HEADER_LEN
    .checked_add(len)
    .filter(|&end| end <= msg.bytes)
    .ok_or(TransportError::ShortRead)?;

  Ok((buf[FRAME_HEADER_LEN..end].to_vec(), received_fd))
}

/// Encodes `message` with the wire codec and sends it as one frame.
pub fn send_message(fd: RawFd, message: &Message, attach_fd: Option<RawFd>) -> Result<(), TransportError> {
  let bytes = wire::encode(message)?;
  send_frame(fd, &bytes, attach_fd)
}

/// Receives one frame and decodes it as a `Message`.
pub fn recv_message(fd: RawFd) -> Result<(Message, Option<OwnedFd>), TransportError> {
  let (bytes, attach_fd) = recv_frame(fd)?;
  let message = wire::parse(&bytes)?;
  Ok((message, attach_fd))
}

/// Writes `bytes` as a single framed `write(2)`, looping over short writes
/// and `EINTR`. Used for frames that never carry an attached descriptor.
pub fn send_frame_via_write(fd: RawFd, bytes: &[u8]) -> Result<(), TransportError> {
  let len = u32::try_from(bytes.len()).map_err(|_| TransportError::FrameTooLarge)?;
  let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + bytes.len());
  frame.extend_from_slice(&len.to_le_bytes());
  frame.extend_from_slice(bytes);
  write_all(fd, &frame)
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<(), TransportError> {
  while !buf.is_empty() {
    match write(fd, buf) {
      Ok(0) => return Err(TransportError::ShortWrite { expected: buf.len(), actual: 0 }),
      Ok(n) => buf = &buf[n..],
      Err(Errno::EINTR) => continue,
      Err(e) => return Err(TransportError::Errno(e)),
    }
  }
  Ok(())
}

/// Reads exactly one length-prefixed frame with plain `read(2)` calls,
/// looping over short reads and `EINTR` until the whole frame has arrived.
/// Unlike `recv_frame`, this never looks for ancillary data, so it works on
/// a bare pipe end as well as a socket.
pub fn recv_frame_via_read(fd: RawFd) -> Result<Vec<u8>, TransportError> {
  let mut header = [0u8; FRAME_HEADER_LEN];
  read_exact(fd, &mut header)?;
  let len = u32::from_le_bytes(header) as usize;
  let mut payload = vec![0u8; len];
  read_exact(fd, &mut payload)?;
  Ok(payload)
}

fn read_exact(fd: RawFd, buf: &mut [u8]) -> Result<(), TransportError> {
  let mut filled = 0;
  while filled < buf.len() {
    match read(fd, &mut buf[filled..]) {
      Ok(0) => return Err(TransportError::PeerHungUp),
      Ok(n) => filled += n,
      Err(Errno::EINTR) => continue,
      Err(e) => return Err(TransportError::Errno(e)),
    }
  }
  Ok(())
}

/// Encodes `message` and writes it as one frame via plain `write(2)`.
pub fn send_message_via_write(fd: RawFd, message: &Message) -> Result<(), TransportError> {
  let bytes = wire::encode(message)?;
  send_frame_via_write(fd, &bytes)
}

/// Reads one frame via plain `read(2)` and decodes it as a `Message`.
pub fn recv_message_via_read(fd: RawFd) -> Result<Message, TransportError> {
  let bytes = recv_frame_via_read(fd)?;
  wire::parse(&bytes).map_err(TransportError::from)
}

