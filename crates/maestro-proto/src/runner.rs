//! The tool-runner seam between the server and process spawning.
//!
//! The server drives verification runs and explicit `RUN_TOOL` requests
//! through this trait so the real spawning adapter can be swapped for a
//! deterministic stub in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Result of one allow-listed command run.
///
/// `stdout`/`stderr` hold the full captured streams for durable storage;
/// `ui_stdout`/`ui_stderr` are the truncated copies safe to ship to a UI.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub command: String,
    pub cwd: PathBuf,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub ui_stdout: String,
    pub ui_stderr: String,
    /// True when either UI copy was shortened.
    pub truncated: bool,
    /// True when the run was terminated by the execution timeout.
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Executes allow-listed commands inside the workspace.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs `command` with `cwd` resolved against the workspace root.
    ///
    /// Allow-list rejections and path violations fail before execution;
    /// every other outcome (non-zero exit, spawn failure, timeout) is
    /// reported through the returned [`ToolOutcome`].
    async fn run(&self, command: &str, cwd: Option<&str>) -> crate::Result<ToolOutcome>;
}
