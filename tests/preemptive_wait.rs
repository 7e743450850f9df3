mod common;

use common::DaemonHarness;
use ptyhelperd::wire::{LaunchRecord, Message};

fn sleep_launch_record(unique_id: u64) -> LaunchRecord {
  LaunchRecord {
    path: "/bin/sleep".into(),
    argv: vec!["sleep".into(), "60".into()],
    envp: vec![],
    pwd: "/".into(),
    columns: 80,
    rows: 24,
    pixel_width: 0,
    pixel_height: 0,
    is_utf8: true,
    unique_id,
  }
}

#[test]
fn preemptive_wait_on_live_child_disowns_without_future_termination() {
  let daemon = DaemonHarness::spawn();

  daemon.send(&Message::LaunchRequest(sleep_launch_record(7)));
  let (response, _fd) = daemon.recv();
  let pid = match response {
    Message::LaunchResponse { status, pid, .. } => {
      assert_eq!(status, 0);
      pid
    }
    other => panic!("unexpected response: {other:?}"),
  };

  daemon.send(&Message::WaitRequest { pid, remove_preemptively: true });
  let (response, fd) = daemon.recv();
  assert!(fd.is_none());
  match response {
    Message::WaitResponse { pid: reported_pid, status, error_number } => {
      assert_eq!(reported_pid, pid);
      assert_eq!(status, 0);
      assert_eq!(error_number, 1);
    }
    other => panic!("unexpected response: {other:?}"),
  }

  // Kill the disowned sleep so the test doesn't leak a lingering process,
  // then confirm no Termination frame ever follows.
  unsafe { nix::libc::kill(pid, nix::libc::SIGKILL) };

  let poll_result = nix::poll::poll(
    &mut [nix::poll::PollFd::new(
      unsafe { std::os::fd::BorrowedFd::borrow_raw(raw_responses_fd(&daemon)) },
      nix::poll::PollFlags::POLLIN,
    )],
    nix::poll::PollTimeout::from(300u16),
  );
  assert_eq!(poll_result, Ok(0), "disowned child must not produce a Termination frame");
}

fn raw_responses_fd(daemon: &DaemonHarness) -> std::os::fd::RawFd {
  // Test-only accessor kept local to this file; the harness does not
  // expose raw fds beyond send/recv by design.
  daemon.responses_raw_fd()
}
