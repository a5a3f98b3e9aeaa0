//! Common error types for the Maestro crates.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the session core.
///
/// The variants map onto the handling classes used by the server:
/// protocol errors and persistence errors are recovered per message,
/// path-safety and allow-list violations fail the specific operation.
#[derive(Debug, Error)]
pub enum Error {
    /// A workspace-relative path resolved outside the workspace root.
    #[error("path escapes the workspace root: {0}")]
    PathEscape(String),

    /// An absolute path was supplied where a relative one is required.
    #[error("absolute paths are not allowed: {0}")]
    AbsolutePath(String),

    /// The command string is not an exact member of the allow-list.
    #[error("command is not allow-listed: {0:?}")]
    CommandNotAllowed(String),

    /// The command string contains a forbidden shell metacharacter.
    #[error("command contains forbidden shell metacharacter {found:?}: {command:?}")]
    ShellMetacharacter { command: String, found: char },

    /// A proposed edit exceeds the per-file content cap.
    #[error("edit for {path} is {size} bytes, over the {max} byte cap")]
    EditTooLarge {
        path: String,
        size: usize,
        max: usize,
    },

    /// A malformed or unknown inbound message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A message arrived for a session other than the bound one.
    #[error("message for session {got:?} ignored; bound session is {bound:?}")]
    SessionMismatch { bound: String, got: String },

    /// Filesystem failure while persisting session artifacts.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
