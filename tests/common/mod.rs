//! Integration test harness: spawns the daemon binary with the fixed fd
//! convention from SPEC_FULL.md §4.H and speaks the wire protocol to it
//! directly, since no client library exists in this repo's scope.

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{dup2, pipe};
use ptyhelperd::wire::Message;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};

pub struct DaemonHarness {
  pub child: Child,
  pub socket_path: PathBuf,
  requests_fd: Option<OwnedFd>,
  responses_fd: Option<OwnedFd>,
  _dead_mans_switch: OwnedFd,
}

impl DaemonHarness {
  /// Spawns the daemon with a fresh listening socket at fd 0, a connected
  /// pair at fd 1 (the daemon's initial write_fd, which carries attached
  /// descriptors and so must be a socket) whose other end this harness keeps
  /// to read responses, a dead man's pipe at fd 2 this harness holds open,
  /// and a bare pipe at fd 3 (the daemon's initial read_fd, per §4.H) whose
  /// write end this harness keeps to send requests.
  pub fn spawn() -> Self {
    let dir = tempfile::tempdir().expect("create temp dir for socket path");
    let socket_path = dir.path().join("ptyhelperd.sock");
    // Outlive the harness: the daemon unlinks the socket itself on exit.
    std::mem::forget(dir);

    let listener = UnixListener::bind(&socket_path).expect("bind listening socket");
    let listen_fd = listener.into_raw_fd();

    let (daemon_write_end, test_responses_end) =
      socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
        .expect("create fd1 socketpair");
    let (dead_mans_read, dead_mans_write) = pipe().expect("create fd2 pipe");
    let (daemon_read_end, test_requests_end) = pipe().expect("create fd3 pipe");

    let bin = assert_cmd::cargo::cargo_bin("ptyhelperd");
    let mut command = Command::new(bin);
    command.arg(&socket_path);

    let daemon_write_raw = daemon_write_end.as_raw_fd();
    let daemon_read_raw = daemon_read_end.as_raw_fd();
    let dead_mans_read_raw = dead_mans_read.as_raw_fd();

    // SAFETY: only async-signal-safe `dup2` calls run between fork and exec.
    unsafe {
      command.pre_exec(move || {
        dup_onto(listen_fd, 0)?;
        dup_onto(daemon_write_raw, 1)?;
        dup_onto(dead_mans_read_raw, 2)?;
        dup_onto(daemon_read_raw, 3)?;
        Ok(())
      });
    }

    let child = command.spawn().expect("spawn daemon process");

    // The fork duplicated these into the child already via dup2 above;
    // this process no longer needs its own copies at these fd numbers.
    drop(unsafe { OwnedFd::from_raw_fd(listen_fd) });
    drop(daemon_write_end);
    drop(daemon_read_end);
    drop(dead_mans_read);

    Self {
      child,
      socket_path,
      requests_fd: Some(test_requests_end),
      responses_fd: Some(test_responses_end),
      _dead_mans_switch: dead_mans_write,
    }
  }

  pub fn send(&self, message: &Message) {
    let fd = self.requests_fd.as_ref().expect("client not disconnected").as_raw_fd();
    ptyhelperd::transport::send_message_via_write(fd, message).expect("send request frame");
  }

  pub fn recv(&self) -> (Message, Option<OwnedFd>) {
    let fd = self.responses_fd.as_ref().expect("client not disconnected").as_raw_fd();
    ptyhelperd::transport::recv_message(fd).expect("receive response frame")
  }

  /// Raw fd of the response channel, for tests that need to `poll` it
  /// directly (e.g. to assert that nothing arrives within a timeout).
  pub fn responses_raw_fd(&self) -> RawFd {
    self.responses_fd.as_ref().expect("client not disconnected").as_raw_fd()
  }

  /// Drops this harness's ends of the fd1/fd3 channels, simulating the
  /// client process disappearing so the daemon observes EOF and falls
  /// back to the Detached phase.
  pub fn disconnect(&mut self) {
    self.requests_fd = None;
    self.responses_fd = None;
  }

  /// Connects a fresh client to the daemon's listening socket, as the
  /// rejection-of-second-client and reattach scenarios need to do
  /// independent of the fd-inheritance convention above.
  pub fn connect_extra_client(&self) -> OwnedFd {
    use std::os::unix::net::UnixStream;
    let stream = UnixStream::connect(&self.socket_path).expect("connect second client");
    stream.into()
  }
}

impl Drop for DaemonHarness {
  fn drop(&mut self) {
    let _ = self.child.kill();
    let _ = self.child.wait();
  }
}

fn dup_onto(fd: RawFd, target: RawFd) -> std::io::Result<()> {
  if fd != target {
    dup2(fd, target).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
  }
  Ok(())
}
