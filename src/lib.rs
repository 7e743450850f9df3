//! A persistent helper daemon that owns PTY-backed child processes across
//! client reconnects. See SPEC_FULL.md for the full component breakdown;
//! module names below mirror component letters A-L.

pub mod dispatch; // F: request dispatcher
pub mod error; // error taxonomy
pub mod launcher; // E: PTY launcher
pub mod logging; // I: ambient logging
pub mod reaper; // C: self-pipe / signal side
pub mod registry; // D: child registry
pub mod server; // G + H: connection state machine, bootstrap
pub mod transport; // B: descriptor-passing transport
pub mod wire; // A: wire codec
