//! A canned tool runner for tests that never spawns a process.

use async_trait::async_trait;
use chrono::Utc;
use maestro_proto::{Result, ToolOutcome, ToolRunner};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

/// Serves scripted exit codes instead of executing commands.
///
/// Each call consumes the next queued exit code; once the queue is empty
/// every further call reports exit code 0. Commands seen are recorded so
/// tests can assert on what the server asked to run.
#[derive(Debug, Default)]
pub struct StubRunner {
    exit_codes: Mutex<VecDeque<i32>>,
    calls: Mutex<Vec<String>>,
    timed_out: bool,
}

impl StubRunner {
    /// A runner whose every command succeeds.
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// A runner that serves the given exit codes in order.
    pub fn with_exit_codes(codes: Vec<i32>) -> Self {
        Self {
            exit_codes: Mutex::new(codes.into()),
            calls: Mutex::new(Vec::new()),
            timed_out: false,
        }
    }

    /// Marks every outcome as having hit the execution timeout.
    pub fn timing_out(mut self) -> Self {
        self.timed_out = true;
        self
    }

    /// Commands run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRunner for StubRunner {
    async fn run(&self, command: &str, cwd: Option<&str>) -> Result<ToolOutcome> {
        self.calls.lock().unwrap().push(command.to_string());
        let exit_code = self.exit_codes.lock().unwrap().pop_front().unwrap_or(0);

        let now = Utc::now();
        let stdout = format!("[stub] {command}\n");
        Ok(ToolOutcome {
            command: command.to_string(),
            cwd: PathBuf::from(cwd.unwrap_or(".")),
            exit_code,
            stdout: stdout.clone(),
            stderr: String::new(),
            ui_stdout: stdout,
            ui_stderr: String::new(),
            truncated: false,
            timed_out: self.timed_out,
            started_at: now,
            ended_at: now,
        })
    }
}
