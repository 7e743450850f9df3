//! Ambient logging setup (SPEC_FULL.md §2 component I).
//!
//! A daemon has no terminal of its own to colorize output for, so this is
//! plain `env_logger` rather than the `anstream`/`owo-colors` combination the
//! teacher's interactive CLI commands use for their own logging.

/// Initializes the global logger. Safe to call once per process; a second
/// call is a programmer error in the same way it would be anywhere else
/// `env_logger::Builder::init` is used.
pub fn init() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_millis()
    .init();
}
