//! Connection state machine and bootstrap (spec components G and H).
//!
//! `Server` holds every piece of daemon state that the original kept as
//! process-wide globals (SPEC_FULL.md §9): the registry, the self-pipe, the
//! accepting socket, and the socket path. Only the SIGCHLD handler itself
//! still reaches outside this struct, and it is reduced to the single
//! byte-write `signal-hook` performs.

use crate::dispatch;
use crate::error::{FatalInitError, TransportError};
use crate::launcher;
use crate::reaper::SelfPipe;
use crate::registry::Registry;
use crate::wire::{LaunchRecord, Message, MIN_SUPPORTED_VERSION, NEGOTIATED_VERSION, REJECTED_VERSION};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, pipe, Pid};
use std::fs;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

/// Fixed fd convention the daemon inherits from its spawning parent (§4.H / §6).
pub const ACCEPT_FD: RawFd = 0;
pub const INITIAL_WRITE_FD: RawFd = 1;
pub const DEAD_MANS_PIPE_FD: RawFd = 2;
pub const INITIAL_READ_FD: RawFd = 3;

pub struct Server {
  registry: Registry,
  self_pipe: SelfPipe,
  accept_fd: RawFd,
  socket_path: PathBuf,
}

impl Server {
  /// Performs the bootstrap sequence (component H) and runs the daemon to
  /// completion, returning the process exit code. Never returns zero, per
  /// §6: the daemon only terminates because it became useless (detached
  /// with no reportable children) or because of a fatal init error.
  pub fn bootstrap_and_run(socket_path: PathBuf) -> i32 {
    match Self::bootstrap(socket_path) {
      Ok(mut server) => {
        let code = server.run(INITIAL_WRITE_FD, INITIAL_READ_FD);
        let _ = fs::remove_file(&server.socket_path);
        info!("daemon exiting with code {code}");
        code
      }
      Err(e) => {
        warn!("fatal initialization error: {e}");
        1
      }
    }
  }

  fn bootstrap(socket_path: PathBuf) -> Result<Self, FatalInitError> {
    info!("bootstrapping; socket path {}", socket_path.display());

    set_nonblocking(ACCEPT_FD)
      .map_err(|e| FatalInitError::FdConvention(format!("fd 0 (accept): {e}")))?;
    for fd in [INITIAL_WRITE_FD, DEAD_MANS_PIPE_FD, INITIAL_READ_FD] {
      set_blocking(fd).map_err(|e| FatalInitError::FdConvention(format!("fd {fd}: {e}")))?;
    }

    // SAFETY: installed before any additional threads exist; handlers are
    // the well-understood SIG_IGN no-op.
    unsafe {
      signal(Signal::SIGHUP, SigHandler::SigIgn)
        .map_err(FatalInitError::SelfPipe)?;
      signal(Signal::SIGPIPE, SigHandler::SigIgn)
        .map_err(FatalInitError::SelfPipe)?;
    }

    let self_pipe = SelfPipe::install()?;

    detach_from_gui_session();

    Ok(Self {
      registry: Registry::new(),
      self_pipe,
      accept_fd: ACCEPT_FD,
      socket_path,
    })
  }

  /// Top-level loop: alternates Attached and Detached phases until the
  /// daemon becomes useless.
  fn run(&mut self, initial_write_fd: RawFd, initial_read_fd: RawFd) -> i32 {
    let mut write_fd = initial_write_fd;
    let mut read_fd = initial_read_fd;
    loop {
      self.run_attached(write_fd, read_fd);

      if self.registry.reportable_count() == 0 {
        info!("detached with zero reportable children; daemon is done");
        return 1;
      }

      match self.run_detached() {
        Some((new_write_fd, new_read_fd)) => {
          write_fd = new_write_fd;
          read_fd = new_read_fd;
        }
        None => return 1,
      }
    }
  }

  // ---- Attached phase (§4.G) ----

  fn run_attached(&mut self, write_fd: RawFd, read_fd: RawFd) {
    info!("entering attached phase");
    loop {
      let read_borrow = unsafe { BorrowedFd::borrow_raw(read_fd) };
      let pipe_borrow = unsafe { BorrowedFd::borrow_raw(self.self_pipe.as_raw_fd()) };
      let accept_borrow = unsafe { BorrowedFd::borrow_raw(self.accept_fd) };

      let mut fds = [
        PollFd::new(read_borrow, PollFlags::POLLIN),
        PollFd::new(pipe_borrow, PollFlags::POLLIN),
        PollFd::new(accept_borrow, PollFlags::POLLIN),
      ];

      match poll(&mut fds, PollTimeout::NONE) {
        Ok(_) => {}
        Err(Errno::EINTR) => continue,
        Err(e) => {
          warn!("poll failed: {e}; leaving attached phase");
          break;
        }
      }

      let read_ready = is_ready(&fds[0]);
      let pipe_ready = is_ready(&fds[1]);
      let accept_ready = is_ready(&fds[2]);

      // Priority order per §4.G: read_fd, then the reaper pipe, then accept.
      if read_ready {
        if let Err(e) = dispatch::dispatch_one(self, read_fd, write_fd) {
          debug!("dispatch error: {e}; leaving attached phase");
          if pipe_ready {
            self.reap_silently();
          }
          break;
        }
        continue;
      }

      if pipe_ready {
        if let Err(e) = self.reap_and_notify(write_fd) {
          warn!("failed to notify attached client of termination: {e}; leaving attached phase");
          break;
        }
        continue;
      }

      if accept_ready {
        self.reject_intruder();
        continue;
      }
    }
    let _ = close(write_fd);
    let _ = close(read_fd);
    info!("left attached phase");
  }

  /// Handshake handler (§4.G.1).
  pub(crate) fn handle_handshake(&mut self, write_fd: RawFd, max_protocol_version: u32) -> Result<(), TransportError> {
    if max_protocol_version < MIN_SUPPORTED_VERSION {
      return Err(TransportError::Protocol(crate::error::ProtocolError::IncompatibleVersion));
    }

    let num_children = self.registry.reportable_count() as u32;
    crate::transport::send_message(
      write_fd,
      &Message::HandshakeResponse {
        protocol_version: NEGOTIATED_VERSION,
        num_children,
        pid: std::process::id() as i32,
      },
      None,
    )?;

    let indices = self.registry.reportable_indices();
    let last = indices.len().checked_sub(1);
    for (i, idx) in indices.into_iter().enumerate() {
      let child = self.registry.get(idx);
      let master_fd = child.master_fd.as_ref().map(|fd| fd.as_raw_fd());
      let message = Message::ReportChild {
        launch_record: child.launch_record.clone(),
        pid: child.pid,
        tty: child.tty.clone(),
        terminated: child.terminated,
        is_last: Some(i) == last,
      };
      crate::transport::send_message(write_fd, &message, master_fd)?;
    }
    Ok(())
  }

  /// Launch handler, invoking the PTY launcher (§4.E) and replying (§4.F).
  pub(crate) fn handle_launch(&mut self, write_fd: RawFd, record: LaunchRecord) -> Result<(), TransportError> {
    match launcher::launch(&record) {
      Ok(launched) => {
        let unique_id = record.unique_id;
        let tty = launched.tty.clone();
        let pid = launched.pid;
        let master_raw = launched.master_fd.as_raw_fd();
        // Insert before sending, per §4.E ordering requirement.
        self.registry.add(record, launched.master_fd, tty.clone(), pid);
        crate::transport::send_message(
          write_fd,
          &Message::LaunchResponse { status: 0, pid, unique_id, tty },
          Some(master_raw),
        )
      }
      Err(e) => {
        warn!("launch failed: {e}");
        crate::transport::send_message(
          write_fd,
          &Message::LaunchResponse {
            status: -1,
            pid: 0,
            unique_id: record.unique_id,
            tty: String::new(),
          },
          None,
        )
      }
    }
  }

  /// Wait handler (§4.G.2).
  pub(crate) fn handle_wait(&mut self, write_fd: RawFd, pid: i32, remove_preemptively: bool) -> Result<(), TransportError> {
    let response = match self.registry.find_by_pid(pid) {
      None => Message::WaitResponse { pid, status: 0, error_number: -1 },
      Some(idx) => {
        if !self.registry.get(idx).terminated {
          if remove_preemptively {
            self.registry.disown(idx);
            Message::WaitResponse { pid, status: 0, error_number: 1 }
          } else {
            Message::WaitResponse { pid, status: 0, error_number: -2 }
          }
        } else {
          let status = self.registry.get(idx).status;
          self.registry.remove(idx);
          Message::WaitResponse { pid, status, error_number: 0 }
        }
      }
    };
    crate::transport::send_message(write_fd, &response, None)
  }

  /// Reaper pipeline (§4.C), run against the currently attached client.
  fn reap_and_notify(&mut self, write_fd: RawFd) -> Result<(), TransportError> {
    self.self_pipe.drain();
    for pid in self.registry.live_pids() {
      let Some(status) = try_wait(pid) else { continue };
      if let Some(should_notify) = self.registry.mark_terminated(pid, status) {
        if should_notify {
          crate::transport::send_message(write_fd, &Message::Termination { pid }, None)?;
        }
      }
    }
    Ok(())
  }

  /// Reaper pipeline run while Detached: statuses are recorded but no
  /// messages are sent, since there is no attached client to send them to.
  fn reap_silently(&mut self) {
    self.self_pipe.drain();
    for pid in self.registry.live_pids() {
      if let Some(status) = try_wait(pid) {
        self.registry.mark_terminated(pid, status);
      }
    }
  }

  /// Rejects a second client while one is already attached (§4.G rule 3, P6).
  fn reject_intruder(&mut self) {
    match nix::sys::socket::accept(self.accept_fd) {
      Ok(raw_fd) => {
        // SAFETY: accept() just returned a freshly opened fd we own.
        let intruder = unsafe { OwnedFd::from_raw_fd(raw_fd) };
        let reply = Message::HandshakeResponse {
          protocol_version: REJECTED_VERSION,
          num_children: 0,
          pid: std::process::id() as i32,
        };
        if let Err(e) = crate::transport::send_message(intruder.as_raw_fd(), &reply, None) {
          debug!("failed to send rejection to intruding client: {e}");
        }
        // `intruder` drops here, closing the socket.
      }
      Err(e) => warn!("failed to accept intruding connection: {e}"),
    }
  }

  // ---- Detached phase (§4.G) ----

  fn run_detached(&mut self) -> Option<(RawFd, RawFd)> {
    info!("entering detached phase");
    loop {
      let accept_borrow = unsafe { BorrowedFd::borrow_raw(self.accept_fd) };
      let pipe_borrow = unsafe { BorrowedFd::borrow_raw(self.self_pipe.as_raw_fd()) };
      let mut fds = [
        PollFd::new(accept_borrow, PollFlags::POLLIN),
        PollFd::new(pipe_borrow, PollFlags::POLLIN),
      ];

      match poll(&mut fds, PollTimeout::NONE) {
        Ok(_) => {}
        Err(Errno::EINTR) => continue,
        Err(e) => {
          warn!("poll failed while detached: {e}");
          continue;
        }
      }

      if is_ready(&fds[1]) {
        self.reap_silently();
      }

      if is_ready(&fds[0]) {
        match nix::sys::socket::accept(self.accept_fd) {
          Ok(stream_fd) => {
            if let Some(pair) = self.hand_off_reattach_pipe(stream_fd) {
              return Some(pair);
            }
          }
          Err(e) => warn!("accept failed while detached: {e}"),
        }
      }
    }
  }

  /// Creates a fresh anonymous pipe, sends its write end to the newly
  /// accepted client as an attached descriptor on an otherwise empty frame,
  /// and keeps the read end as the new Attached phase's read fd (§4.G
  /// Detached phase). A bare `pipe(2)` pair works here because client
  /// requests read off this fd go through `recv_frame_via_read`'s plain
  /// `read(2)`, not `recvmsg` — only the `sendmsg` call below, on the
  /// already-a-socket `stream_fd`, needs to carry ancillary data.
  fn hand_off_reattach_pipe(&mut self, stream_fd: RawFd) -> Option<(RawFd, RawFd)> {
    let (daemon_end, client_end) = match pipe() {
      Ok(pair) => pair,
      Err(e) => {
        warn!("failed to create reattach pipe: {e}");
        let _ = close(stream_fd);
        return None;
      }
    };

    let send_result = crate::transport::send_frame(stream_fd, &[], Some(client_end.as_raw_fd()));
    drop(client_end); // daemon keeps only its own end after the send.

    if let Err(e) = send_result {
      warn!("failed to hand off reattach descriptor: {e}");
      let _ = close(stream_fd);
      return None;
    }

    info!("client reattached");
    Some((stream_fd, daemon_end.into_raw_fd()))
  }
}

fn try_wait(pid: i32) -> Option<i32> {
  match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
    Ok(WaitStatus::Exited(_, code)) => Some(code),
    Ok(WaitStatus::Signaled(_, sig, _)) => Some(-(sig as i32)),
    Ok(_) => None,
    Err(Errno::ECHILD) | Err(Errno::EINTR) => None,
    Err(_) => None,
  }
}

fn is_ready(pfd: &PollFd) -> bool {
  pfd.revents().is_some_and(|flags| {
    flags.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
  })
}

fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
  let flags = fcntl(fd, FcntlArg::F_GETFL)?;
  let mut flags = OFlag::from_bits_truncate(flags);
  flags.insert(OFlag::O_NONBLOCK);
  fcntl(fd, FcntlArg::F_SETFL(flags))?;
  Ok(())
}

fn set_blocking(fd: RawFd) -> Result<(), Errno> {
  let flags = fcntl(fd, FcntlArg::F_GETFL)?;
  let mut flags = OFlag::from_bits_truncate(flags);
  flags.remove(OFlag::O_NONBLOCK);
  fcntl(fd, FcntlArg::F_SETFL(flags))?;
  Ok(())
}

/// Host-OS "detach from GUI session" hook (§1, §4.H). A no-op on Linux; kept
/// as an explicit, named call site so the bootstrap sequencing matches the
/// original exactly.
fn detach_from_gui_session() {}
