//! Wire codec (spec component A).
//!
//! Encodes/decodes the tagged RPC message union to/from a contiguous byte
//! buffer. Opaque to every other component: nothing outside this module
//! knows the encoding is bincode.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Negotiated protocol versions start at 1.
pub const MIN_SUPPORTED_VERSION: u32 = 1;
pub const NEGOTIATED_VERSION: u32 = 1;
/// Sentinel returned in a handshake response to mean "go away".
pub const REJECTED_VERSION: u32 = u32::MAX;

/// The exact launch request that created a child, echoed back verbatim in
/// `ReportChild` so a reattaching client can recognize its own children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRecord {
  pub path: String,
  pub argv: Vec<String>,
  pub envp: Vec<String>,
  pub pwd: String,
  pub columns: u16,
  pub rows: u16,
  pub pixel_width: u16,
  pub pixel_height: u16,
  pub is_utf8: bool,
  pub unique_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
  HandshakeRequest {
    max_protocol_version: u32,
  },
  HandshakeResponse {
    protocol_version: u32,
    num_children: u32,
    pid: i32,
  },
  LaunchRequest(LaunchRecord),
  LaunchResponse {
    status: i32,
    pid: i32,
    unique_id: u64,
    tty: String,
  },
  WaitRequest {
    pid: i32,
    remove_preemptively: bool,
  },
  WaitResponse {
    pid: i32,
    status: i32,
    error_number: i32,
  },
  ReportChild {
    launch_record: LaunchRecord,
    pid: i32,
    tty: String,
    terminated: bool,
    is_last: bool,
  },
  Termination {
    pid: i32,
  },
}

pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
  bincode::serde::encode_to_vec(message, bincode::config::standard()).map_err(ProtocolError::Encode)
}

pub fn parse(bytes: &[u8]) -> Result<Message, ProtocolError> {
  let (message, consumed): (Message, usize) =
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
      .map_err(ProtocolError::Decode)?;
  if consumed != bytes.len() {
    return Err(ProtocolError::MalformedFrame);
  }
  Ok(message)
}
