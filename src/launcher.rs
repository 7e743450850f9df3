//! PTY launcher (spec component E).
//!
//! Allocates a pseudo-terminal and forks via `forkpty`, which already
//! performs the child-side `setsid`/controlling-tty/`dup2` dance that a
//! separate exec helper would otherwise do (see SPEC_FULL.md §1 on why this
//! repo folds that helper into the launcher rather than shelling out to a
//! second binary). The child path never returns; the parent path returns the
//! master fd and pid.

use crate::error::LaunchError;
use crate::wire::LaunchRecord;
use nix::pty::{forkpty, Winsize};
use nix::unistd::{close, execvpe, sysconf, ForkResult, SysconfVar};
use std::ffi::CString;
use std::os::fd::OwnedFd;

pub struct Launched {
  pub pid: i32,
  pub master_fd: OwnedFd,
  pub tty: String,
}

/// Runs the PTY fork/exec pipeline. The failure signal is exclusively
/// `forkpty`'s `Result::Err`; the original's `forkState->pid == 1` sentinel
/// check is a bug (SPEC_FULL.md §9) and is deliberately not reproduced.
pub fn launch(record: &LaunchRecord) -> Result<Launched, LaunchError> {
  let winsize = Winsize {
    ws_row: record.rows,
    ws_col: record.columns,
    ws_xpixel: record.pixel_width,
    ws_ypixel: record.pixel_height,
  };

  // SAFETY: the forked child only calls async-signal-safe operations
  // (chdir, execvpe) before replacing its image; it performs no further
  // Rust allocation or access to state shared with the parent.
  let result = unsafe { forkpty(Some(&winsize), None) }.map_err(LaunchError::ForkPty)?;

  match result.fork_result {
    ForkResult::Parent { child } => {
      let tty = nix::unistd::ttyname(&result.master)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default();
      Ok(Launched {
        pid: child.as_raw(),
        master_fd: result.master,
        tty,
      })
    }
    ForkResult::Child => run_child(record),
  }
}

fn run_child(record: &LaunchRecord) -> ! {
  close_inherited_descriptors();
  let _ = std::env::set_current_dir(&record.pwd);

  let path = CString::new(record.path.as_str()).unwrap_or_else(|_| c"".into());
  let argv: Vec<CString> = record
    .argv
    .iter()
    .map(|a| CString::new(a.as_str()).unwrap_or_else(|_| c"".into()))
    .collect();
  let envp: Vec<CString> = record
    .envp
    .iter()
    .map(|e| CString::new(e.as_str()).unwrap_or_else(|_| c"".into()))
    .collect();

  let _ = execvpe(&path, &argv, &envp);
  // Only reached if execvpe failed.
  unsafe { nix::libc::_exit(127) }
}

/// Closes every fd above the standard three before `execvpe`, so a launched
/// child never inherits the listening socket, the SIGCHLD self-pipe, or any
/// other child's master PTY (SPEC_FULL.md §4.E). `forkpty` itself only
/// `dup2`s the slave onto 0/1/2; none of the daemon's other descriptors are
/// `O_CLOEXEC`, so this loop is the only thing that keeps them from leaking.
/// Mirrors `close_all_descriptors` in the pack's `zhiburt/ptyprocess` crate.
fn close_inherited_descriptors() {
  let max_fd = sysconf(SysconfVar::OPEN_MAX).ok().flatten().unwrap_or(1024) as i32;
  for fd in 3..max_fd {
    let _ = close(fd);
  }
}
