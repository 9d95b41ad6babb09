//! Logging helpers.
//!
//! Pylon logs through `tracing`; subscriber installation lives in the server
//! crate. This module only carries [`capture_logs`], used by tests across the
//! workspace to assert that failures which are never surfaced to callers
//! (dropped messages, panicking close callbacks) were at least logged.

pub mod test_utils;

pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};
