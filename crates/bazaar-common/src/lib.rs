//! # Bazaar Common
//!
//! Shared logging configuration for the Bazaar offline/PWA subsystem.
//!
//! Library crates in this workspace only emit `tracing` events and spans;
//! binaries (and integration tests that want output) call [`init_logging`]
//! or [`init_test_logging`] once to install a subscriber.

pub mod logging;

pub use logging::{init_logging, init_test_logging, LogConfig, LogFormat};
