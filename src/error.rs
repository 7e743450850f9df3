//! Error taxonomy for the daemon's control plane (spec component: error handling).
//!
//! Each variant maps to one of the recovery actions described for the
//! component that raises it: transport/protocol errors drop the attached
//! phase, launch errors are reported to the client without mutating the
//! registry, and fatal init errors abort the process before any child is
//! ever owned.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("failed to encode frame")]
  Encode(#[source] bincode::error::EncodeError),
  #[error("failed to decode frame")]
  Decode(#[source] bincode::error::DecodeError),
  #[error("frame was truncated or tag-inconsistent")]
  MalformedFrame,
  #[error("handshake offered an incompatible protocol version")]
  IncompatibleVersion,
}

#[derive(Debug, Error)]
pub enum TransportError {
  #[error(transparent)]
  Protocol(#[from] ProtocolError),
  #[error("peer hung up")]
  PeerHungUp,
  #[error("frame was truncated in transit")]
  ShortRead,
  #[error("short write: expected {expected} bytes, wrote {actual}")]
  ShortWrite { expected: usize, actual: usize },
  #[error("frame exceeds the maximum size")]
  FrameTooLarge,
  #[error("ancillary data did not carry exactly one descriptor")]
  AncillaryDataMismatch,
  #[error("system call failed: {0}")]
  Errno(#[from] nix::errno::Errno),
}

#[derive(Debug, Error)]
pub enum LaunchError {
  #[error("forkpty failed: {0}")]
  ForkPty(#[source] nix::errno::Errno),
}

#[derive(Debug, Error)]
pub enum FatalInitError {
  #[error("failed to set up the self-pipe: {0}")]
  SelfPipe(#[source] nix::errno::Errno),
  #[error("failed to install the SIGCHLD handler: {0}")]
  Signal(#[source] std::io::Error),
  #[error("invalid inherited file descriptor convention: {0}")]
  FdConvention(String),
}
