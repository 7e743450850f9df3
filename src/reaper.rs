//! Self-pipe (spec component C, signal side).
//!
//! The SIGCHLD handler itself lives entirely inside the `signal-hook` crate
//! (`signal_hook::low_level::pipe::register`), which performs the single
//! async-signal-safe byte-write this component is allowed to do. Nothing in
//! this crate installs a raw `sigaction` or touches the registry from signal
//! context.

use crate::error::FatalInitError;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe, read};
use signal_hook::consts::SIGCHLD;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

pub struct SelfPipe {
  read_fd: OwnedFd,
}

impl SelfPipe {
  /// Creates the self-pipe, puts both ends in non-blocking mode, and
  /// registers the write end with `signal-hook` so SIGCHLD pokes it.
  pub fn install() -> Result<Self, FatalInitError> {
    let (read_fd, write_fd) = pipe().map_err(FatalInitError::SelfPipe)?;
    set_nonblocking(&read_fd).map_err(FatalInitError::SelfPipe)?;
    set_nonblocking(&write_fd).map_err(FatalInitError::SelfPipe)?;

    signal_hook::low_level::pipe::register(SIGCHLD, write_fd).map_err(FatalInitError::Signal)?;

    Ok(Self { read_fd })
  }

  pub fn as_raw_fd(&self) -> RawFd {
    self.read_fd.as_raw_fd()
  }

  /// Drains the pipe to exhaustion. Must run before scanning for exited
  /// children so that a SIGCHLD landing between drain and scan re-raises
  /// readability and is caught on the next poll iteration instead of lost.
  pub fn drain(&self) {
    let mut buf = [0u8; 256];
    loop {
      match read(self.read_fd.as_raw_fd(), &mut buf) {
        Ok(0) => break,
        Ok(_) => continue,
        Err(Errno::EWOULDBLOCK) => break,
        Err(Errno::EINTR) => continue,
        Err(_) => break,
      }
    }
  }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), Errno> {
  let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
  let mut flags = OFlag::from_bits_truncate(flags);
  flags.insert(OFlag::O_NONBLOCK);
  fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
  Ok(())
}
