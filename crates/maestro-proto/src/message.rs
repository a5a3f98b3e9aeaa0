//! Protocol message types for the stdio transport.
//!
//! Every message on the wire is one JSON object per line with the shape
//! `{ "type": ..., "sessionId": ..., "payload": ... }`. Inbound and outbound
//! messages are modeled as closed tagged unions so that adding a message
//! type is a compile-time-checked change: one payload struct and one match
//! arm per tag, nothing dynamically typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel `type` delivered by the codec for lines that fail to parse.
pub const PARSE_ERROR_TYPE: &str = "__PARSE_ERROR__";

/// Sentinel `type` delivered by the codec for lines over the buffer cap.
pub const LINE_TOO_LONG_TYPE: &str = "__LINE_TOO_LONG__";

/// Maximum size of a single proposed edit's replacement text.
pub const MAX_EDIT_BYTES: usize = 2 * 1024 * 1024;

/// Role tag attached to agent text messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Player,
    Coach,
}

/// Severity level for agent text messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Info,
    Warn,
    Error,
}

/// A candidate whole-file write awaiting external application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedEdit {
    /// Workspace-relative path of the file to replace.
    #[serde(rename = "filePath")]
    pub file_path: String,

    /// Full replacement content, UTF-8.
    #[serde(rename = "newText")]
    pub new_text: String,

    /// Optional one-line description of the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ProposedEdit {
    pub fn new(file_path: impl Into<String>, new_text: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            new_text: new_text.into(),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Per-file result reported back after an apply attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────
// Inbound payloads
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    /// Absolute workspace root; defaults to the server's working directory.
    #[serde(
        rename = "workspaceRoot",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub workspace_root: Option<String>,

    /// Free-form client identifier (editor name and version).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPromptPayload {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyEditResultPayload {
    pub applied: bool,
    #[serde(rename = "fileResults", default)]
    pub file_results: Vec<FileResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunToolPayload {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequestPayload {
    pub provider: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Messages the client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    #[serde(rename = "INIT")]
    Init {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        payload: InitPayload,
    },
    #[serde(rename = "USER_PROMPT")]
    UserPrompt {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: UserPromptPayload,
    },
    #[serde(rename = "APPLY_EDIT_RESULT")]
    ApplyEditResult {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: ApplyEditResultPayload,
    },
    #[serde(rename = "RUN_TOOL")]
    RunTool {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: RunToolPayload,
    },
    #[serde(rename = "KEY_REQUEST")]
    KeyRequest {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: KeyRequestPayload,
    },
    #[serde(rename = "CANCEL")]
    Cancel {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        payload: CancelPayload,
    },
}

impl Inbound {
    /// Validates a decoded line as an inbound message.
    ///
    /// Unknown `type` values and malformed payloads are rejected with a
    /// descriptive [`Error::Protocol`](crate::Error::Protocol).
    pub fn parse(value: &Value) -> crate::Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<missing type>")
            .to_string();
        serde_json::from_value(value.clone())
            .map_err(|e| crate::Error::Protocol(format!("invalid {kind} message: {e}")))
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Init { .. } => "INIT",
            Inbound::UserPrompt { .. } => "USER_PROMPT",
            Inbound::ApplyEditResult { .. } => "APPLY_EDIT_RESULT",
            Inbound::RunTool { .. } => "RUN_TOOL",
            Inbound::KeyRequest { .. } => "KEY_REQUEST",
            Inbound::Cancel { .. } => "CANCEL",
        }
    }

    /// The session id carried by every inbound message.
    pub fn session_id(&self) -> &str {
        match self {
            Inbound::Init { session_id, .. }
            | Inbound::UserPrompt { session_id, .. }
            | Inbound::ApplyEditResult { session_id, .. }
            | Inbound::RunTool { session_id, .. }
            | Inbound::KeyRequest { session_id, .. }
            | Inbound::Cancel { session_id, .. } => session_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Outbound payloads
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessagePayload {
    pub agent: Role,
    pub phase: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeEditPayload {
    pub edits: Vec<ProposedEdit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutputPayload {
    pub command: String,
    pub cwd: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(rename = "timedOut", default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUserInputPayload {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename = "AGENT_MESSAGE")]
    AgentMessage {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: AgentMessagePayload,
    },
    #[serde(rename = "PROPOSE_EDIT")]
    ProposeEdit {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: ProposeEditPayload,
    },
    #[serde(rename = "TOOL_OUTPUT")]
    ToolOutput {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: ToolOutputPayload,
    },
    #[serde(rename = "REQUEST_USER_INPUT")]
    RequestUserInput {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: RequestUserInputPayload,
    },
    #[serde(rename = "STATUS")]
    Status {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: StatusPayload,
    },
}

impl Outbound {
    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::AgentMessage { .. } => "AGENT_MESSAGE",
            Outbound::ProposeEdit { .. } => "PROPOSE_EDIT",
            Outbound::ToolOutput { .. } => "TOOL_OUTPUT",
            Outbound::RequestUserInput { .. } => "REQUEST_USER_INPUT",
            Outbound::Status { .. } => "STATUS",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Outbound::AgentMessage { session_id, .. }
            | Outbound::ProposeEdit { session_id, .. }
            | Outbound::ToolOutput { session_id, .. }
            | Outbound::RequestUserInput { session_id, .. }
            | Outbound::Status { session_id, .. } => session_id,
        }
    }

    /// The payload as a JSON value, for event persistence.
    pub fn payload_value(&self) -> Value {
        let full = serde_json::to_value(self).unwrap_or(Value::Null);
        full.get("payload").cloned().unwrap_or(Value::Null)
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Persisted events
// ─────────────────────────────────────────────────────────────────────────

/// Whether an event entered or left the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// One protocol message as persisted in `events.jsonl`.
///
/// Events are immutable once written; redaction happens in the session
/// store before the line reaches disk, never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub direction: Direction,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Creates an inbound event from a validated message and its raw line.
    pub fn inbound(message: &Inbound, raw: &Value) -> Self {
        Self {
            direction: Direction::In,
            kind: message.kind().to_string(),
            session_id: message.session_id().to_string(),
            payload: raw.get("payload").cloned().unwrap_or(Value::Null),
        }
    }

    /// Creates an outbound event from a message about to be sent.
    pub fn outbound(message: &Outbound) -> Self {
        Self {
            direction: Direction::Out,
            kind: message.kind().to_string(),
            session_id: message.session_id().to_string(),
            payload: message.payload_value(),
        }
    }

    /// Reconstructs the wire form `{type, sessionId, payload}` with the
    /// direction stripped, as replay emits it.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "type": self.kind,
            "sessionId": self.session_id,
            "payload": self.payload,
        })
    }
}
