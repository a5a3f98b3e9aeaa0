//! # maestro-adapters
//!
//! Process and filesystem adapters for the Maestro server.
//!
//! This crate provides:
//! - The allow-listed command runner with timeout and SIGTERM termination
//! - Local application of proposed edits, for clients without their own
//!   apply machinery
//!
//! Everything here touches the outside world; the core stays pure.

mod apply_edits;
mod command_runner;

pub use apply_edits::{apply_edits, ApplyOutcome};
pub use command_runner::{assert_allowlisted, CommandRunner, ALLOWED_COMMANDS};
