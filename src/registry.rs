//! Child registry (spec component D).
//!
//! A flat, insertion-ordered table of children. The registry owns every
//! child's `master_fd` and launch-record strings until that ownership is
//! explicitly given up by a disown or a remove.

use crate::wire::LaunchRecord;
use std::os::fd::OwnedFd;

/// One live-or-terminated-but-unreported child.
///
/// `master_fd` is `Some` iff `!terminated && !will_terminate` (invariant P2 /
/// §3 invariant 2): reaping a child or preemptively disowning it always
/// closes the registry's copy of the fd immediately, since it is the
/// transition point at which the local copy stops being useful (the client's
/// independently `sendmsg`-duplicated copy is unaffected).
pub struct ChildRecord {
  pub pid: i32,
  pub master_fd: Option<OwnedFd>,
  pub tty: String,
  pub launch_record: LaunchRecord,
  pub terminated: bool,
  pub status: i32,
  /// Set once the client has preemptively disowned this child (§4.G.2).
  /// A disowned-and-terminated record is NOT silently dropped — it stays
  /// in the registry until daemon exit, mirroring the original and
  /// flagged here as a deliberate, reviewed-and-kept behavior rather than
  /// an oversight (see SPEC_FULL.md §9).
  pub will_terminate: bool,
}

impl ChildRecord {
  pub fn is_reportable(&self) -> bool {
    !self.will_terminate
  }
}

#[derive(Default)]
pub struct Registry {
  children: Vec<ChildRecord>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts a newly launched child. Callers must insert before sending
  /// the `Launch` response (§4.E ordering requirement).
  pub fn add(&mut self, launch_record: LaunchRecord, master_fd: OwnedFd, tty: String, pid: i32) {
    debug_assert!(
      self.find_by_pid(pid).is_none(),
      "pid {pid} already present in registry (violates P1)"
    );
    self.children.push(ChildRecord {
      pid,
      master_fd: Some(master_fd),
      tty,
      launch_record,
      terminated: false,
      status: 0,
      will_terminate: false,
    });
  }

  pub fn find_by_pid(&self, pid: i32) -> Option<usize> {
    self.children.iter().position(|c| c.pid == pid)
  }

  pub fn get(&self, index: usize) -> &ChildRecord {
    &self.children[index]
  }

  /// Removes and returns a record, dropping (and so closing) any fd it
  /// still owned.
  pub fn remove(&mut self, index: usize) -> ChildRecord {
    self.children.remove(index)
  }

  pub fn reportable_count(&self) -> usize {
    self.children.iter().filter(|c| c.is_reportable()).count()
  }

  /// Indices of reportable children in registry (insertion) order. Callers
  /// must not expose this ordering as a guarantee (§9: order is
  /// unspecified by the original source, which iterates back-to-front).
  pub fn reportable_indices(&self) -> Vec<usize> {
    self.children
      .iter()
      .enumerate()
      .filter(|(_, c)| c.is_reportable())
      .map(|(i, _)| i)
      .collect()
  }

  /// pids of every child not yet reaped, live or disowned.
  pub fn live_pids(&self) -> Vec<i32> {
    self.children.iter().filter(|c| !c.terminated).map(|c| c.pid).collect()
  }

  /// Records a reap: sets `terminated`, stores `status`, and closes the
  /// registry's `master_fd`. Returns whether the child was reportable at
  /// reap time (i.e. whether a `Termination` message should be emitted).
  pub fn mark_terminated(&mut self, pid: i32, status: i32) -> Option<bool> {
    let index = self.find_by_pid(pid)?;
    let child = &mut self.children[index];
    child.terminated = true;
    child.status = status;
    child.master_fd.take(); // closes on drop
    Some(!child.will_terminate)
  }

  /// Preemptively disowns a still-live child (§4.G.2 `remove_preemptively`):
  /// flags it `will_terminate` and closes its `master_fd` immediately. The
  /// record stays to absorb the eventual SIGCHLD.
  pub fn disown(&mut self, index: usize) {
    let child = &mut self.children[index];
    child.will_terminate = true;
    child.master_fd.take(); // closes on drop
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(unique_id: u64) -> LaunchRecord {
    LaunchRecord {
      path: "/bin/true".into(),
      argv: vec!["true".into()],
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

  fn devnull() -> OwnedFd {
    std::fs::File::open("/dev/null").unwrap().into()
  }

  #[test]
  fn reportable_count_excludes_disowned() {
    let mut reg = Registry::new();
    reg.add(record(1), devnull(), "/dev/pts/1".into(), 100);
    reg.add(record(2), devnull(), "/dev/pts/2".into(), 101);
    assert_eq!(reg.reportable_count(), 2);

    let idx = reg.find_by_pid(100).unwrap();
    reg.disown(idx);
    assert_eq!(reg.reportable_count(), 1);
    assert!(reg.get(idx).master_fd.is_none());
  }

  #[test]
  fn mark_terminated_closes_fd_and_reports_will_terminate() {
    let mut reg = Registry::new();
    reg.add(record(1), devnull(), "/dev/pts/1".into(), 100);
    let idx = reg.find_by_pid(100).unwrap();
    reg.disown(idx);

    let should_notify = reg.mark_terminated(100, 0).unwrap();
    assert!(!should_notify, "disowned child must not trigger Termination");
    assert!(reg.get(idx).terminated);
    assert!(reg.get(idx).master_fd.is_none());
    // Mirrors the source: a disowned-and-terminated record is kept, not dropped.
    assert!(reg.find_by_pid(100).is_some());
  }

  #[test]
  fn mark_terminated_reports_live_child() {
    let mut reg = Registry::new();
    reg.add(record(1), devnull(), "/dev/pts/1".into(), 100);
    let should_notify = reg.mark_terminated(100, 0).unwrap();
    assert!(should_notify);
  }

  #[test]
  fn remove_drops_record() {
    let mut reg = Registry::new();
    reg.add(record(1), devnull(), "/dev/pts/1".into(), 100);
    let idx = reg.find_by_pid(100).unwrap();
    reg.remove(idx);
    assert!(reg.find_by_pid(100).is_none());
  }
}
