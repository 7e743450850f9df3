//! Request dispatcher (spec component F).
//!
//! Reads one frame from the client's read fd, switches on its tag, and
//! invokes the matching handler on `Server`. Server-originated tags received
//! from a client (`Termination`, `ReportChild`) are logged and ignored —
//! they should never arrive, but a client bug here must not be fatal.

use crate::error::{ProtocolError, TransportError};
use crate::server::Server;
use crate::wire::Message;
use log::{debug, warn};
use std::os::fd::RawFd;

pub fn dispatch_one(server: &mut Server, read_fd: RawFd, write_fd: RawFd) -> Result<(), TransportError> {
  // Client requests never carry an attached descriptor, so `read_fd` is read
  // with plain `read(2)` rather than `recvmsg` — see transport.rs — which
  // also lets it be a bare pipe end per §4.H.
  let message = crate::transport::recv_message_via_read(read_fd)?;

  match message {
    Message::HandshakeRequest { max_protocol_version } => {
      server.handle_handshake(write_fd, max_protocol_version)
    }
    Message::LaunchRequest(record) => server.handle_launch(write_fd, record),
    Message::WaitRequest { pid, remove_preemptively } => {
      server.handle_wait(write_fd, pid, remove_preemptively)
    }
    Message::Termination { pid } => {
      debug!("ignoring server-originated Termination frame from client (pid {pid})");
      Ok(())
    }
    Message::ReportChild { pid, .. } => {
      debug!("ignoring server-originated ReportChild frame from client (pid {pid})");
      Ok(())
    }
    other => {
      warn!("unexpected frame from client: {other:?}");
      Err(TransportError::Protocol(ProtocolError::MalformedFrame))
    }
  }
}
