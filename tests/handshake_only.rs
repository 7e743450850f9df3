mod common;

use common::DaemonHarness;
use ptyhelperd::wire::Message;

#[test]
fn handshake_with_no_children_reports_zero_and_no_report_child_frames() {
  let daemon = DaemonHarness::spawn();

  daemon.send(&Message::HandshakeRequest { max_protocol_version: 1 });

  let (response, fd) = daemon.recv();
  assert!(fd.is_none());
  match response {
    Message::HandshakeResponse { protocol_version, num_children, .. } => {
      assert_eq!(protocol_version, 1);
      assert_eq!(num_children, 0);
    }
    other => panic!("unexpected response: {other:?}"),
  }
}
