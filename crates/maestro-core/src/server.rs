//! The protocol server: composition root for one bound session.
//!
//! Owns one active session at a time, binds inbound messages to it, drives
//! the orchestrator, and routes tool execution and edit recording through
//! the session store. Messages are handled strictly in arrival order; a
//! message's handling, including any awaited command run, completes before
//! the next begins, so the session log's append order matches true
//! processing order.

use crate::config::MaestroConfig;
use crate::orchestrator::{Orchestrator, OutputRecord, State};
use crate::session_store::SessionStore;
use maestro_proto::{
    AgentMessagePayload, Error, Event, Inbound, Level, LineCodec, Outbound, ProposeEditPayload,
    RequestUserInputPayload, Result, Role, StatusPayload, ToolOutcome,
    ToolOutputPayload, ToolRunner, LINE_TOO_LONG_TYPE, PARSE_ERROR_TYPE,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Builds a tool runner for the workspace root chosen at bind time.
pub type RunnerFactory = Box<dyn Fn(&Path) -> Box<dyn ToolRunner> + Send>;

struct BoundSession {
    session_id: String,
    workspace_root: PathBuf,
    store: SessionStore,
    orchestrator: Orchestrator,
    runner: Box<dyn ToolRunner>,
}

/// Single-session protocol server over a byte-stream transport.
pub struct Server<W: Write> {
    out: W,
    config: MaestroConfig,
    workspace_override: Option<PathBuf>,
    version: String,
    runner_factory: RunnerFactory,
    session: Option<BoundSession>,
}

impl<W: Write> Server<W> {
    pub fn new(
        out: W,
        config: MaestroConfig,
        runner_factory: RunnerFactory,
        version: impl Into<String>,
    ) -> Self {
        Self {
            out,
            config,
            workspace_override: None,
            version: version.into(),
            runner_factory,
            session: None,
        }
    }

    /// Overrides the workspace root used when `INIT` does not name one.
    pub fn with_workspace(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_override = Some(root.into());
        self
    }

    /// The bound session's directory, once a session is bound.
    pub fn session_dir(&self) -> Option<PathBuf> {
        self.session
            .as_ref()
            .map(|s| s.store.session_dir().to_path_buf())
    }

    /// Handles one decoded line from the transport.
    ///
    /// Protocol, path-safety, and persistence errors are recovered here and
    /// reported back as `AGENT_MESSAGE` at `error` level; only a failure to
    /// write to the transport itself propagates.
    pub async fn handle_line(&mut self, line: Value) -> Result<()> {
        let kind = line.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind == PARSE_ERROR_TYPE {
            let raw = line.get("raw").and_then(Value::as_str).unwrap_or_default();
            return self.report_error(&format!("unparseable line: {raw}"));
        }
        if kind == LINE_TOO_LONG_TYPE {
            let length = line.get("length").and_then(Value::as_u64).unwrap_or(0);
            return self.report_error(&format!("line exceeded the buffer cap ({length} bytes)"));
        }

        let message = match Inbound::parse(&line) {
            Ok(message) => message,
            Err(e) => return self.report_error(&e.to_string()),
        };

        if self.session.is_none() {
            if let Err(e) = self.bind(&message) {
                return self.report_error(&format!("failed to bind session: {e}"));
            }
        }

        {
            let session = self.session.as_ref().ok_or_else(session_missing)?;
            if message.session_id() != session.session_id {
                let mismatch = Error::SessionMismatch {
                    bound: session.session_id.clone(),
                    got: message.session_id().to_string(),
                };
                warn!(%mismatch, "ignoring message for unbound session");
                return Ok(());
            }
            if let Err(e) = session.store.append_event(&Event::inbound(&message, &line)) {
                return self.report_error(&format!("failed to persist inbound event: {e}"));
            }
        }

        if let Err(e) = self.dispatch(message).await {
            return self.report_error(&e.to_string());
        }
        Ok(())
    }

    /// Binds the first valid inbound message's session.
    fn bind(&mut self, message: &Inbound) -> Result<()> {
        let from_init = match message {
            Inbound::Init { payload, .. } => payload.workspace_root.clone().map(PathBuf::from),
            _ => None,
        };
        let workspace_root = match from_init.or_else(|| self.workspace_override.clone()) {
            Some(root) => root,
            None => std::env::current_dir()?,
        };

        let session_id = message.session_id().to_string();
        let mut store = SessionStore::new(&workspace_root, &session_id, &self.version);
        store.init()?;

        let orchestrator = Orchestrator::new(&session_id, self.config.gated)
            .with_max_retries(self.config.max_gated_retries);
        let runner = (self.runner_factory)(&workspace_root);

        info!(
            session_id = %session_id,
            workspace = %workspace_root.display(),
            "session bound"
        );
        self.session = Some(BoundSession {
            session_id,
            workspace_root,
            store,
            orchestrator,
            runner,
        });
        Ok(())
    }

    async fn dispatch(&mut self, message: Inbound) -> Result<()> {
        match message {
            Inbound::Init { payload, .. } => {
                let client = payload.client.unwrap_or_else(|| "unknown client".to_string());
                let text = format!("Session bound for {client}. Send USER_PROMPT to begin.");
                self.send_agent(Role::Coach, "init", &text, Level::Info)?;
            }
            Inbound::UserPrompt { payload, .. } => {
                let records = self
                    .session_mut()?
                    .orchestrator
                    .on_user_prompt(&payload.text);
                self.emit_records(records).await?;
            }
            Inbound::ApplyEditResult { payload, .. } => {
                let failed: Vec<_> = payload
                    .file_results
                    .iter()
                    .filter(|r| !r.ok)
                    .map(|r| r.file_path.clone())
                    .collect();
                if !failed.is_empty() {
                    debug!(?failed, "apply reported per-file failures");
                }
                let records = self
                    .session_mut()?
                    .orchestrator
                    .on_apply_result(payload.applied);
                self.emit_records(records).await?;
            }
            Inbound::RunTool { payload, .. } => {
                let outcome = self.run_tool(&payload.command, payload.cwd.as_deref()).await?;
                self.send(self.tool_output_message(&outcome)?)?;
            }
            Inbound::KeyRequest { payload, .. } => {
                let message = Outbound::RequestUserInput {
                    session_id: self.session_id()?,
                    payload: RequestUserInputPayload {
                        kind: "api_key".to_string(),
                        provider: Some(payload.provider),
                    },
                };
                self.send(message)?;
            }
            Inbound::Cancel { payload, .. } => {
                // Advisory only: handling is strictly sequential, so no
                // command is ever in flight when CANCEL is dequeued.
                let reason = payload
                    .reason
                    .unwrap_or_else(|| "cancelled by client".to_string());
                let records = self
                    .session_mut()?
                    .orchestrator
                    .fail(format!("session cancelled: {reason}"));
                self.emit_records(records).await?;
            }
        }
        self.refresh_summary()
    }

    /// Translates orchestrator output records into outbound messages and
    /// side effects, in order. Tool runs feed their exit code straight back
    /// into the orchestrator; follow-up records are processed next.
    async fn emit_records(&mut self, records: Vec<OutputRecord>) -> Result<()> {
        let mut queue: VecDeque<OutputRecord> = records.into();
        while let Some(record) = queue.pop_front() {
            if let Some(state) = record.status {
                let message = Outbound::Status {
                    session_id: self.session_id()?,
                    payload: StatusPayload {
                        state: state.as_str().to_string(),
                        detail: record.fail_reason.clone(),
                    },
                };
                self.send(message)?;
            }

            if let Some(text) = record.message {
                self.send_agent(text.role, text.phase, &text.text, text.level)?;
            }

            if !record.edits.is_empty() {
                let edit_id = self
                    .session_mut()?
                    .store
                    .record_proposed_edits(&record.edits)?;
                debug!(%edit_id, files = record.edits.len(), "edit batch snapshotted");
                let message = Outbound::ProposeEdit {
                    session_id: self.session_id()?,
                    payload: ProposeEditPayload {
                        edits: record.edits,
                    },
                };
                self.send(message)?;
            }

            if let Some(run) = record.run {
                let outcome = self.run_tool(&run.command, None).await?;
                self.send(self.tool_output_message(&outcome)?)?;
                let follow = self
                    .session_mut()?
                    .orchestrator
                    .on_tool_output(outcome.exit_code);
                for record in follow.into_iter().rev() {
                    queue.push_front(record);
                }
            }

            if record.done {
                info!("session complete");
            }
        }
        Ok(())
    }

    /// Runs an allow-listed command and records the execution.
    async fn run_tool(&mut self, command: &str, cwd: Option<&str>) -> Result<ToolOutcome> {
        let outcome = {
            let session = self.session.as_ref().ok_or_else(session_missing)?;
            session.runner.run(command, cwd).await?
        };
        let tool_id = self.session_mut()?.store.record_tool_execution(&outcome)?;
        debug!(%tool_id, command, exit_code = outcome.exit_code, "tool run recorded");
        Ok(outcome)
    }

    fn tool_output_message(&self, outcome: &ToolOutcome) -> Result<Outbound> {
        Ok(Outbound::ToolOutput {
            session_id: self.session_id()?,
            payload: ToolOutputPayload {
                command: outcome.command.clone(),
                cwd: outcome.cwd.display().to_string(),
                exit_code: outcome.exit_code,
                stdout: outcome.ui_stdout.clone(),
                stderr: outcome.ui_stderr.clone(),
                truncated: outcome.truncated,
                timed_out: outcome.timed_out,
            },
        })
    }

    fn send_agent(&mut self, role: Role, phase: &str, text: &str, level: Level) -> Result<()> {
        let message = Outbound::AgentMessage {
            session_id: self
                .session
                .as_ref()
                .map_or_else(|| "unbound".to_string(), |s| s.session_id.clone()),
            payload: AgentMessagePayload {
                agent: role,
                phase: phase.to_string(),
                text: text.to_string(),
                level: if level == Level::Info { None } else { Some(level) },
            },
        };
        self.send(message)
    }

    /// Reports a recovered error through the protocol channel.
    fn report_error(&mut self, text: &str) -> Result<()> {
        error!(%text, "reporting error to client");
        self.send_agent(Role::Coach, "error", text, Level::Error)
    }

    /// Appends the outbound event and writes the line to the transport.
    fn send(&mut self, message: Outbound) -> Result<()> {
        if let Some(session) = &self.session {
            let event = Event::outbound(&message);
            if let Err(e) = session.store.append_event(&event) {
                // The message still goes out; the log, not the client, is degraded.
                error!(error = %e, "failed to persist outbound event");
            }
        }
        let value = serde_json::to_value(&message)?;
        self.out.write_all(LineCodec::encode(&value).as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    fn refresh_summary(&self) -> Result<()> {
        if let Some(session) = &self.session {
            let markdown = format!(
                "# Session {}\n\nState: {}\nWorkspace: {}\nServer: v{}\n",
                session.session_id,
                session.orchestrator.state().as_str(),
                session.workspace_root.display(),
                self.version,
            );
            session.store.update_summary(&markdown)?;
        }
        Ok(())
    }

    fn session_id(&self) -> Result<String> {
        Ok(self
            .session
            .as_ref()
            .ok_or_else(session_missing)?
            .session_id
            .clone())
    }

    fn session_mut(&mut self) -> Result<&mut BoundSession> {
        self.session.as_mut().ok_or_else(session_missing)
    }

    /// The orchestrator state, for summaries and tests.
    pub fn state(&self) -> Option<State> {
        self.session.as_ref().map(|s| s.orchestrator.state())
    }

    /// The transport sink. Lets tests capture output in memory.
    pub fn out(&self) -> &W {
        &self.out
    }
}

fn session_missing() -> Error {
    Error::Protocol("no session bound".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubRunner;
    use serde_json::json;
    use tempfile::TempDir;

    fn make_server(tmp: &TempDir, exit_codes: Vec<i32>) -> Server<Vec<u8>> {
        let factory: RunnerFactory =
            Box::new(move |_| Box::new(StubRunner::with_exit_codes(exit_codes.clone())));
        Server::new(Vec::new(), MaestroConfig::default(), factory, "0.0.0-test")
            .with_workspace(tmp.path())
    }

    fn out_lines(server: &Server<Vec<u8>>) -> Vec<Value> {
        String::from_utf8_lossy(&server.out)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn kinds(server: &Server<Vec<u8>>) -> Vec<String> {
        out_lines(server)
            .iter()
            .map(|v| v["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_first_message_binds_session() {
        let tmp = TempDir::new().unwrap();
        let mut server = make_server(&tmp, vec![0]);

        server
            .handle_line(json!({"type": "INIT", "sessionId": "s-1", "payload": {}}))
            .await
            .unwrap();

        let dir = server.session_dir().unwrap();
        assert!(dir.ends_with(".maestro/sessions/s-1"));
        assert!(dir.join("events.jsonl").exists());
        assert_eq!(kinds(&server), vec!["AGENT_MESSAGE"]);
    }

    #[tokio::test]
    async fn test_mismatched_session_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut server = make_server(&tmp, vec![0]);

        server
            .handle_line(json!({"type": "INIT", "sessionId": "s-1"}))
            .await
            .unwrap();
        let before = out_lines(&server).len();

        server
            .handle_line(json!({
                "type": "USER_PROMPT", "sessionId": "other",
                "payload": {"text": "hi"}
            }))
            .await
            .unwrap();
        assert_eq!(out_lines(&server).len(), before);
    }

    #[tokio::test]
    async fn test_parse_error_reported_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut server = make_server(&tmp, vec![0]);

        server
            .handle_line(json!({"type": "__PARSE_ERROR__", "raw": "garbage"}))
            .await
            .unwrap();

        let lines = out_lines(&server);
        assert_eq!(lines[0]["type"], "AGENT_MESSAGE");
        assert_eq!(lines[0]["payload"]["level"], "error");
        assert!(lines[0]["payload"]["text"]
            .as_str()
            .unwrap()
            .contains("garbage"));
    }

    #[tokio::test]
    async fn test_unknown_type_reported() {
        let tmp = TempDir::new().unwrap();
        let mut server = make_server(&tmp, vec![0]);

        server
            .handle_line(json!({"type": "NOPE", "sessionId": "s-1"}))
            .await
            .unwrap();

        let lines = out_lines(&server);
        assert_eq!(lines[0]["type"], "AGENT_MESSAGE");
        assert!(lines[0]["payload"]["text"].as_str().unwrap().contains("NOPE"));
    }

    #[tokio::test]
    async fn test_full_happy_path_reaches_done() {
        let tmp = TempDir::new().unwrap();
        let mut server = make_server(&tmp, vec![0]);

        server
            .handle_line(json!({"type": "INIT", "sessionId": "s-1"}))
            .await
            .unwrap();
        server
            .handle_line(json!({
                "type": "USER_PROMPT", "sessionId": "s-1",
                "payload": {"text": "hello"}
            }))
            .await
            .unwrap();
        server
            .handle_line(json!({
                "type": "APPLY_EDIT_RESULT", "sessionId": "s-1",
                "payload": {"applied": true, "fileResults": []}
            }))
            .await
            .unwrap();

        assert_eq!(server.state(), Some(State::Done));
        let statuses: Vec<String> = out_lines(&server)
            .iter()
            .filter(|v| v["type"] == "STATUS")
            .map(|v| v["payload"]["state"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            statuses,
            vec![
                "PLANNING",
                "BUILDING",
                "WAITING_FOR_APPLY",
                "VERIFYING",
                "RUNNING_TOOL",
                "DONE"
            ]
        );
    }

    #[tokio::test]
    async fn test_key_request_forwarded() {
        let tmp = TempDir::new().unwrap();
        let mut server = make_server(&tmp, vec![0]);

        server
            .handle_line(json!({"type": "INIT", "sessionId": "s-1"}))
            .await
            .unwrap();
        server
            .handle_line(json!({
                "type": "KEY_REQUEST", "sessionId": "s-1",
                "payload": {"provider": "acme"}
            }))
            .await
            .unwrap();

        let lines = out_lines(&server);
        let request = lines
            .iter()
            .find(|v| v["type"] == "REQUEST_USER_INPUT")
            .unwrap();
        assert_eq!(request["payload"]["kind"], "api_key");
        assert_eq!(request["payload"]["provider"], "acme");
    }

    #[tokio::test]
    async fn test_cancel_fails_session() {
        let tmp = TempDir::new().unwrap();
        let mut server = make_server(&tmp, vec![0]);

        server
            .handle_line(json!({"type": "INIT", "sessionId": "s-1"}))
            .await
            .unwrap();
        server
            .handle_line(json!({
                "type": "CANCEL", "sessionId": "s-1",
                "payload": {"reason": "user closed the panel"}
            }))
            .await
            .unwrap();

        assert_eq!(server.state(), Some(State::Failed));
        let summary =
            std::fs::read_to_string(server.session_dir().unwrap().join("summary.md")).unwrap();
        assert!(summary.contains("State: FAILED"));
    }

    #[tokio::test]
    async fn test_explicit_run_tool_records_execution() {
        let tmp = TempDir::new().unwrap();
        let mut server = make_server(&tmp, vec![0]);

        server
            .handle_line(json!({"type": "INIT", "sessionId": "s-1"}))
            .await
            .unwrap();
        server
            .handle_line(json!({
                "type": "RUN_TOOL", "sessionId": "s-1",
                "payload": {"command": "npm test"}
            }))
            .await
            .unwrap();

        let lines = out_lines(&server);
        let output = lines.iter().find(|v| v["type"] == "TOOL_OUTPUT").unwrap();
        assert_eq!(output["payload"]["exitCode"], 0);
        assert!(server
            .session_dir()
            .unwrap()
            .join("tool/T-0001.json")
            .exists());
    }

    #[tokio::test]
    async fn test_timed_out_run_surfaces_in_tool_output() {
        let tmp = TempDir::new().unwrap();
        let factory: RunnerFactory = Box::new(|_| Box::new(StubRunner::succeeding().timing_out()));
        let mut server = Server::new(Vec::new(), MaestroConfig::default(), factory, "0.0.0-test")
            .with_workspace(tmp.path());

        server
            .handle_line(json!({"type": "INIT", "sessionId": "s-1"}))
            .await
            .unwrap();
        server
            .handle_line(json!({
                "type": "RUN_TOOL", "sessionId": "s-1",
                "payload": {"command": "npm test"}
            }))
            .await
            .unwrap();

        let lines = out_lines(&server);
        let output = lines.iter().find(|v| v["type"] == "TOOL_OUTPUT").unwrap();
        assert_eq!(output["payload"]["timedOut"], true);

        let meta = std::fs::read_to_string(
            server.session_dir().unwrap().join("tool/T-0001.json"),
        )
        .unwrap();
        assert!(meta.contains("\"timedOut\": true"));
    }

    #[tokio::test]
    async fn test_gated_retry_cycle_then_done() {
        let tmp = TempDir::new().unwrap();
        let factory: RunnerFactory =
            Box::new(move |_| Box::new(StubRunner::with_exit_codes(vec![1, 0])));
        let config = MaestroConfig {
            gated: true,
            ..MaestroConfig::default()
        };
        let mut server = Server::new(Vec::new(), config, factory, "0.0.0-test")
            .with_workspace(tmp.path());

        server
            .handle_line(json!({"type": "INIT", "sessionId": "s-1"}))
            .await
            .unwrap();
        server
            .handle_line(json!({
                "type": "USER_PROMPT", "sessionId": "s-1",
                "payload": {"text": "hello"}
            }))
            .await
            .unwrap();

        // First apply: verification fails (exit 1), corrective edit proposed.
        server
            .handle_line(json!({
                "type": "APPLY_EDIT_RESULT", "sessionId": "s-1",
                "payload": {"applied": true}
            }))
            .await
            .unwrap();
        assert_eq!(server.state(), Some(State::WaitingForApply));

        // Second apply: verification passes.
        server
            .handle_line(json!({
                "type": "APPLY_EDIT_RESULT", "sessionId": "s-1",
                "payload": {"applied": true}
            }))
            .await
            .unwrap();
        assert_eq!(server.state(), Some(State::Done));

        let propose_count = out_lines(&server)
            .iter()
            .filter(|v| v["type"] == "PROPOSE_EDIT")
            .count();
        assert_eq!(propose_count, 2);
    }
}
