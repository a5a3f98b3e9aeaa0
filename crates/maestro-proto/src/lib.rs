//! # maestro-proto
//!
//! Wire types, error definitions, and traits for the CodeMaestro session server.
//!
//! This crate provides the foundational abstractions used across all Maestro
//! crates, including:
//! - The inbound/outbound protocol message unions and their payloads
//! - The line-delimited JSON codec used on the stdio transport
//! - The recursive redaction pass applied before anything is persisted
//! - The `ToolRunner` trait separating the server from process spawning
//! - Common error types

mod codec;
mod error;
mod message;
mod redact;
mod runner;

pub use codec::{LineCodec, DEFAULT_MAX_LINE_BYTES};
pub use error::{Error, Result};
pub use message::{
    AgentMessagePayload, ApplyEditResultPayload, CancelPayload, Direction, Event, FileResult,
    Inbound, InitPayload, KeyRequestPayload, Level, Outbound, ProposeEditPayload, ProposedEdit,
    RequestUserInputPayload, Role, RunToolPayload, StatusPayload, ToolOutputPayload,
    UserPromptPayload, LINE_TOO_LONG_TYPE, MAX_EDIT_BYTES, PARSE_ERROR_TYPE,
};
pub use redact::{redact_value, REDACTED};
pub use runner::{ToolOutcome, ToolRunner};
