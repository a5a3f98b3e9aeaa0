//! The deterministic session state machine.
//!
//! The orchestrator turns user prompts and tool results into ordered lists
//! of output records. It performs no I/O: the server owns every side effect
//! (sending messages, recording snapshots, running commands), which keeps
//! transitions unit-testable and replays byte-identical. All "unique"
//! content is seeded from a stable hash of the session id and prompt text,
//! never from the wall clock or randomness.

use maestro_proto::{Level, ProposedEdit, Role};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Fixed command used to verify an applied edit batch.
pub const VERIFY_COMMAND: &str = "npm test";

/// Hard cap on build cycles, so gated retries always terminate.
const MAX_CYCLES: u32 = 3;

/// Current position in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Planning,
    Building,
    WaitingForApply,
    Verifying,
    RunningTool,
    Done,
    Failed,
}

impl State {
    /// Wire representation used in `STATUS` payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::Planning => "PLANNING",
            State::Building => "BUILDING",
            State::WaitingForApply => "WAITING_FOR_APPLY",
            State::Verifying => "VERIFYING",
            State::RunningTool => "RUNNING_TOOL",
            State::Done => "DONE",
            State::Failed => "FAILED",
        }
    }

    /// Terminal states accept no further automatic transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }
}

/// Role-tagged text destined for an `AGENT_MESSAGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentText {
    pub role: Role,
    pub phase: &'static str,
    pub text: String,
    pub level: Level,
}

/// A request for the server to run an allow-listed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub command: String,
}

/// One side-effect description produced by a transition.
///
/// The server translates each record, in order, into zero or more outbound
/// messages and any requested side effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRecord {
    /// State change to announce via `STATUS`.
    pub status: Option<State>,
    /// Text to emit as an `AGENT_MESSAGE`.
    pub message: Option<AgentText>,
    /// Edit batch to record and propose.
    pub edits: Vec<ProposedEdit>,
    /// Command the server should execute and feed back.
    pub run: Option<RunRequest>,
    /// Set on the final record of a successful session.
    pub done: bool,
    /// Set when the session has failed.
    pub fail_reason: Option<String>,
}

impl OutputRecord {
    fn status(state: State) -> Self {
        Self {
            status: Some(state),
            ..Self::default()
        }
    }

    fn with_message(mut self, role: Role, phase: &'static str, text: impl Into<String>) -> Self {
        self.message = Some(AgentText {
            role,
            phase,
            text: text.into(),
            level: Level::Info,
        });
        self
    }

    fn with_level(mut self, level: Level) -> Self {
        if let Some(message) = self.message.as_mut() {
            message.level = level;
        }
        self
    }
}

/// Pure state machine for one bound session.
#[derive(Debug)]
pub struct Orchestrator {
    session_id: String,
    state: State,
    /// Demo gating: a failed verification earns one corrective cycle.
    gated: bool,
    max_retries: u32,
    retries_used: u32,
    /// Build cycles entered so far, bounding the whole session.
    cycles: u32,
    last_prompt: Option<String>,
}

impl Orchestrator {
    pub fn new(session_id: impl Into<String>, gated: bool) -> Self {
        Self {
            session_id: session_id.into(),
            state: State::Idle,
            gated,
            max_retries: 1,
            retries_used: 0,
            cycles: 0,
            last_prompt: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Advances `Idle` (or any prior state) through `Planning` and
    /// `Building` to `WaitingForApply`, emitting the plan and the first
    /// proposed edit batch.
    pub fn on_user_prompt(&mut self, text: &str) -> Vec<OutputRecord> {
        debug!(state = self.state.as_str(), "user prompt received");
        self.last_prompt = Some(text.to_string());
        self.retries_used = 0;
        self.cycles = 1;

        let plan = format!(
            "1. Restate the goal: {}\n\
             2. Draft the change as a single proposed edit.\n\
             3. Hand the edit to the editor and wait for it to be applied.\n\
             4. Run `{VERIFY_COMMAND}` and confirm a clean exit.",
            text.trim()
        );

        let edit = self.demo_edit(text, 0);
        self.state = State::WaitingForApply;

        vec![
            OutputRecord::status(State::Planning).with_message(Role::Planner, "planning", plan),
            OutputRecord {
                edits: vec![edit],
                ..OutputRecord::status(State::Building).with_message(
                    Role::Player,
                    "building",
                    "Drafting one proposed edit for the editor to apply.",
                )
            },
            OutputRecord::status(State::WaitingForApply).with_message(
                Role::Player,
                "building",
                "Waiting for the editor to apply the proposed edit.",
            ),
        ]
    }

    /// Consumes the editor's apply report.
    pub fn on_apply_result(&mut self, applied: bool) -> Vec<OutputRecord> {
        if self.state != State::WaitingForApply {
            return vec![self.out_of_turn("APPLY_EDIT_RESULT")];
        }

        if !applied {
            return self.fail("editor reported the edit batch was not applied");
        }

        self.state = State::RunningTool;
        vec![
            OutputRecord::status(State::Verifying).with_message(
                Role::Coach,
                "verifying",
                format!("Edit applied. Running `{VERIFY_COMMAND}` to verify."),
            ),
            OutputRecord {
                run: Some(RunRequest {
                    command: VERIFY_COMMAND.to_string(),
                }),
                ..OutputRecord::status(State::RunningTool)
            },
        ]
    }

    /// Consumes the exit code of the verification run.
    pub fn on_tool_output(&mut self, exit_code: i32) -> Vec<OutputRecord> {
        if self.state != State::RunningTool {
            return vec![self.out_of_turn("tool output")];
        }

        if exit_code == 0 {
            self.state = State::Done;
            return vec![OutputRecord {
                done: true,
                ..OutputRecord::status(State::Done).with_message(
                    Role::Coach,
                    "verifying",
                    "Verification passed. Session complete.",
                )
            }];
        }

        if self.gated && self.retries_used < self.max_retries && self.cycles < MAX_CYCLES {
            self.retries_used += 1;
            self.cycles += 1;
            let prompt = self.last_prompt.clone().unwrap_or_default();
            let edit = self.demo_edit(&prompt, self.retries_used);
            self.state = State::WaitingForApply;

            return vec![
                OutputRecord::default()
                    .with_message(
                        Role::Coach,
                        "verifying",
                        format!(
                            "Verification failed with exit code {exit_code}. \
                             Drafting a corrective edit and retrying."
                        ),
                    )
                    .with_level(Level::Error),
                OutputRecord {
                    edits: vec![edit],
                    ..OutputRecord::status(State::Building).with_message(
                        Role::Player,
                        "building",
                        "Drafting a corrective edit.",
                    )
                },
                OutputRecord::status(State::WaitingForApply).with_message(
                    Role::Player,
                    "building",
                    "Waiting for the editor to apply the corrective edit.",
                ),
            ];
        }

        self.fail(format!("verification command exited with code {exit_code}"))
    }

    /// Moves the session to `Failed` with the given reason.
    ///
    /// Also used directly by the server for `CANCEL`.
    pub fn fail(&mut self, reason: impl Into<String>) -> Vec<OutputRecord> {
        let reason = reason.into();
        self.state = State::Failed;
        vec![OutputRecord {
            fail_reason: Some(reason.clone()),
            ..OutputRecord::status(State::Failed)
                .with_message(Role::Coach, "failed", reason)
                .with_level(Level::Error)
        }]
    }

    fn out_of_turn(&self, what: &str) -> OutputRecord {
        warn!(state = self.state.as_str(), what, "input ignored out of turn");
        OutputRecord::default()
            .with_message(
                Role::Coach,
                "protocol",
                format!("Ignoring {what} in state {}.", self.state.as_str()),
            )
            .with_level(Level::Warn)
    }

    /// Deterministic demo edit for the given prompt and revision.
    fn demo_edit(&self, text: &str, revision: u32) -> ProposedEdit {
        let digest = fingerprint(&self.session_id, text, revision);
        let mut body = format!(
            "# Maestro task notes\n\nPrompt: {}\nFingerprint: {}\n",
            text.trim(),
            &digest[..12]
        );
        if revision > 0 {
            body.push_str(&format!("Revision: {revision}\n"));
        }
        body.push_str("\n- [ ] review the proposed change\n- [ ] run the verification command\n");

        let summary = if revision == 0 {
            "Capture the task notes"
        } else {
            "Revise the task notes after a failed verification"
        };
        ProposedEdit::new("maestro/TASK.md", body).with_summary(summary)
    }
}

/// Stable hex fingerprint of `(session_id, text, revision)`.
fn fingerprint(session_id: &str, text: &str, revision: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    hasher.update(revision.to_le_bytes());
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            use std::fmt::Write;
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(records: &[OutputRecord]) -> Vec<&'static str> {
        records
            .iter()
            .filter_map(|r| r.status.map(State::as_str))
            .collect()
    }

    #[test]
    fn test_prompt_reaches_waiting_for_apply() {
        let mut orch = Orchestrator::new("s-1", false);
        let records = orch.on_user_prompt("add a hello file");

        assert_eq!(
            statuses(&records),
            vec!["PLANNING", "BUILDING", "WAITING_FOR_APPLY"]
        );
        assert_eq!(orch.state(), State::WaitingForApply);

        let edits: Vec<_> = records.iter().flat_map(|r| r.edits.clone()).collect();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].file_path, "maestro/TASK.md");
        assert!(edits[0].new_text.contains("add a hello file"));
    }

    #[test]
    fn test_deterministic_across_fresh_instances() {
        let mut a = Orchestrator::new("s-1", false);
        let mut b = Orchestrator::new("s-1", false);

        let ra = a.on_user_prompt("hello");
        let rb = b.on_user_prompt("hello");
        assert_eq!(ra, rb);

        // A different session id must produce different edit content.
        let mut c = Orchestrator::new("s-2", false);
        let rc = c.on_user_prompt("hello");
        let edit_a = &ra.iter().flat_map(|r| &r.edits).next().unwrap().new_text;
        let edit_c = &rc.iter().flat_map(|r| &r.edits).next().unwrap().new_text;
        assert_ne!(edit_a, edit_c);
    }

    #[test]
    fn test_apply_success_runs_verification() {
        let mut orch = Orchestrator::new("s-1", false);
        orch.on_user_prompt("task");
        let records = orch.on_apply_result(true);

        assert_eq!(statuses(&records), vec!["VERIFYING", "RUNNING_TOOL"]);
        let run = records.iter().find_map(|r| r.run.clone()).unwrap();
        assert_eq!(run.command, VERIFY_COMMAND);
        assert_eq!(orch.state(), State::RunningTool);
    }

    #[test]
    fn test_apply_failure_fails_session() {
        let mut orch = Orchestrator::new("s-1", false);
        orch.on_user_prompt("task");
        let records = orch.on_apply_result(false);

        assert_eq!(statuses(&records), vec!["FAILED"]);
        assert!(records[0].fail_reason.is_some());
        assert_eq!(orch.state(), State::Failed);
    }

    #[test]
    fn test_clean_exit_completes_session() {
        let mut orch = Orchestrator::new("s-1", false);
        orch.on_user_prompt("task");
        orch.on_apply_result(true);
        let records = orch.on_tool_output(0);

        assert_eq!(statuses(&records), vec!["DONE"]);
        assert!(records[0].done);
        assert_eq!(orch.state(), State::Done);
    }

    #[test]
    fn test_nonzero_exit_without_gating_fails() {
        let mut orch = Orchestrator::new("s-1", false);
        orch.on_user_prompt("task");
        orch.on_apply_result(true);
        let records = orch.on_tool_output(2);

        assert_eq!(statuses(&records), vec!["FAILED"]);
        assert_eq!(orch.state(), State::Failed);
    }

    #[test]
    fn test_gated_retry_offers_corrective_edit_once() {
        let mut orch = Orchestrator::new("s-1", true);
        orch.on_user_prompt("task");
        orch.on_apply_result(true);

        let records = orch.on_tool_output(1);
        assert_eq!(statuses(&records), vec!["BUILDING", "WAITING_FOR_APPLY"]);
        let edit = records.iter().flat_map(|r| &r.edits).next().unwrap();
        assert!(edit.new_text.contains("Revision: 1"));
        assert_eq!(orch.state(), State::WaitingForApply);

        // Second failure exhausts the budget.
        orch.on_apply_result(true);
        let records = orch.on_tool_output(1);
        assert_eq!(statuses(&records), vec!["FAILED"]);
        assert_eq!(orch.state(), State::Failed);
    }

    #[test]
    fn test_out_of_turn_input_warns_without_transition() {
        let mut orch = Orchestrator::new("s-1", false);
        let records = orch.on_apply_result(true);

        assert_eq!(orch.state(), State::Idle);
        assert!(statuses(&records).is_empty());
        let message = records[0].message.as_ref().unwrap();
        assert_eq!(message.level, Level::Warn);
    }

    #[test]
    fn test_fail_is_terminal_for_tool_output() {
        let mut orch = Orchestrator::new("s-1", false);
        orch.fail("cancelled by client");
        assert_eq!(orch.state(), State::Failed);

        let records = orch.on_tool_output(0);
        assert_eq!(orch.state(), State::Failed);
        assert!(statuses(&records).is_empty());
    }
}
