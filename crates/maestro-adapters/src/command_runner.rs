//! Allow-listed command execution with timeout and graceful termination.
//!
//! Commands run without a shell: the exact allow-listed string is split on
//! whitespace into argv, so metacharacters never reach an interpreter. On
//! timeout the child receives SIGTERM and the outcome is flagged rather than
//! turned into an error.

use async_trait::async_trait;
use chrono::Utc;
use maestro_core::paths;
use maestro_proto::{Error, Result, ToolOutcome, ToolRunner};
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// The exact command strings the server will execute.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "npm test",
    "npm run build",
    "pytest",
    "ruff check .",
    "cargo check",
    "cargo test",
];

/// Characters that would require a shell to interpret.
const FORBIDDEN_CHARS: &[char] = &['|', ';', '&', '>', '<'];

/// Checks a command against the default allow list.
///
/// Shell metacharacters are rejected with their own error so the client can
/// tell "not on the list" from "tried to smuggle a pipeline".
pub fn assert_allowlisted(command: &str) -> Result<()> {
    check_command(command, ALLOWED_COMMANDS.iter().copied())
}

fn check_command<'a>(command: &str, allowed: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let trimmed = command.trim();
    if let Some(found) = trimmed.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(Error::ShellMetacharacter {
            command: trimmed.to_string(),
            found,
        });
    }
    if !allowed.into_iter().any(|c| c == trimmed) {
        return Err(Error::CommandNotAllowed(trimmed.to_string()));
    }
    Ok(())
}

/// Runs allow-listed commands inside one workspace.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    workspace_root: PathBuf,
    timeout: Duration,
    truncate_bytes: usize,
    allow_list: Vec<String>,
}

impl CommandRunner {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            timeout: Duration::from_secs(300),
            truncate_bytes: 200 * 1024,
            allow_list: ALLOWED_COMMANDS.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_truncate_bytes(mut self, truncate_bytes: usize) -> Self {
        self.truncate_bytes = truncate_bytes;
        self
    }

    /// Replaces the default allow list.
    pub fn with_allow_list<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Resolves the requested working directory inside the workspace.
    fn resolve_cwd(&self, cwd: Option<&str>) -> Result<PathBuf> {
        match cwd {
            None => Ok(self.workspace_root.clone()),
            Some(dir) => {
                let candidate = Path::new(dir);
                let candidate = if candidate.is_absolute() {
                    candidate.to_path_buf()
                } else {
                    self.workspace_root.join(candidate)
                };
                paths::ensure_inside(&self.workspace_root, &candidate)
            }
        }
    }
}

#[async_trait]
impl ToolRunner for CommandRunner {
    async fn run(&self, command: &str, cwd: Option<&str>) -> Result<ToolOutcome> {
        check_command(command, self.allow_list.iter().map(String::as_str))?;
        let cwd = self.resolve_cwd(cwd)?;

        let mut argv = command.split_whitespace();
        let program = argv
            .next()
            .ok_or_else(|| Error::CommandNotAllowed(command.to_string()))?;

        let started_at = Utc::now();
        debug!(command, cwd = %cwd.display(), "spawning tool command");

        let spawned = Command::new(program)
            .args(argv)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                // A missing binary is a reportable outcome, not a server fault.
                warn!(command, error = %e, "failed to spawn tool command");
                let stderr = format!("failed to spawn `{command}`: {e}\n");
                let (ui_stderr, truncated) = truncate_for_ui(&stderr, self.truncate_bytes);
                return Ok(ToolOutcome {
                    command: command.to_string(),
                    cwd,
                    exit_code: 1,
                    stdout: String::new(),
                    stderr,
                    ui_stdout: String::new(),
                    ui_stderr,
                    truncated,
                    timed_out: false,
                    started_at,
                    ended_at: Utc::now(),
                });
            }
        };

        // Read both pipes concurrently so neither can fill and deadlock.
        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();
        let drain = async {
            let stdout_future = async {
                let mut buf = String::new();
                if let Some(stdout) = stdout_handle.as_mut() {
                    stdout.read_to_string(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let stderr_future = async {
                let mut buf = String::new();
                if let Some(stderr) = stderr_handle.as_mut() {
                    stderr.read_to_string(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            tokio::try_join!(stdout_future, stderr_future)
        };

        let mut timed_out = false;
        let (stdout, stderr) = match tokio::time::timeout(self.timeout, drain).await {
            Ok(streams) => streams?,
            Err(_) => {
                warn!(
                    command,
                    timeout_secs = self.timeout.as_secs(),
                    "tool command timed out, sending SIGTERM"
                );
                timed_out = true;
                terminate_child(&mut child);
                (String::new(), String::new())
            }
        };

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(1);

        let (ui_stdout, stdout_truncated) = truncate_for_ui(&stdout, self.truncate_bytes);
        let (ui_stderr, stderr_truncated) = truncate_for_ui(&stderr, self.truncate_bytes);

        Ok(ToolOutcome {
            command: command.to_string(),
            cwd,
            exit_code,
            stdout,
            stderr,
            ui_stdout,
            ui_stderr,
            truncated: stdout_truncated || stderr_truncated,
            timed_out,
            started_at,
            ended_at: Utc::now(),
        })
    }
}

/// Sends SIGTERM to the child; the eventual `wait` reaps it.
#[cfg(unix)]
fn terminate_child(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(pid as i32);
        debug!(%pid, "sending SIGTERM to tool command");
        let _ = kill(pid, Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_child(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}

/// Caps a stream for the UI copy without splitting a UTF-8 character.
fn truncate_for_ui(text: &str, limit: usize) -> (String, bool) {
    if text.len() <= limit {
        return (text.to_string(), false);
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (format!("{}\n[output truncated]\n", &text[..end]), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allowlist_accepts_exact_commands() {
        for command in ALLOWED_COMMANDS {
            assert!(assert_allowlisted(command).is_ok());
        }
        assert!(assert_allowlisted("  npm test  ").is_ok());
    }

    #[test]
    fn test_allowlist_rejects_unknown_commands() {
        assert!(matches!(
            assert_allowlisted("echo hi"),
            Err(Error::CommandNotAllowed(_))
        ));
        assert!(matches!(
            assert_allowlisted("npm run lint"),
            Err(Error::CommandNotAllowed(_))
        ));
    }

    #[test]
    fn test_allowlist_rejects_shell_metacharacters() {
        for command in [
            "npm test && echo pwned",
            "npm test; rm -rf /",
            "npm test | tee out",
            "npm test > out.txt",
            "npm test < input",
        ] {
            assert!(matches!(
                assert_allowlisted(command),
                Err(Error::ShellMetacharacter { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_run_refuses_disallowed_command() {
        let tmp = TempDir::new().unwrap();
        let runner = CommandRunner::new(tmp.path());
        assert!(runner.run("echo hi", None).await.is_err());
    }

    #[tokio::test]
    async fn test_run_refuses_cwd_outside_workspace() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("workspace");
        std::fs::create_dir(&root).unwrap();
        let runner = CommandRunner::new(&root);

        assert!(runner.run("npm test", Some("..")).await.is_err());
        assert!(runner
            .run("npm test", Some(outer.path().to_str().unwrap()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_custom_allow_list_replaces_default() {
        let tmp = TempDir::new().unwrap();
        let runner = CommandRunner::new(tmp.path()).with_allow_list(["true"]);
        assert!(runner.run("npm test", None).await.is_err());
        assert!(runner.run("true && true", None).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_terminates_and_flags_outcome() {
        let tmp = TempDir::new().unwrap();
        let runner = CommandRunner::new(tmp.path())
            .with_allow_list(["sleep 5"])
            .with_timeout(Duration::from_millis(100));

        let outcome = runner.run("sleep 5", None).await.unwrap();
        assert!(outcome.timed_out);
        // SIGTERM leaves no exit code; the outcome reports failure.
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.stdout.is_empty());
        assert!(outcome.ended_at >= outcome.started_at);
    }

    #[tokio::test]
    async fn test_missing_binary_reported_as_failed_outcome() {
        let tmp = TempDir::new().unwrap();
        let command = "maestro-no-such-binary --version";
        let runner = CommandRunner::new(tmp.path()).with_allow_list([command]);

        let outcome = runner.run(command, None).await.unwrap();
        assert_eq!(outcome.exit_code, 1);
        assert!(!outcome.timed_out);
        assert!(outcome.stderr.contains("failed to spawn"));
        assert!(outcome.ui_stderr.contains("failed to spawn"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let (ui, truncated) = truncate_for_ui(text, 2);
        assert!(truncated);
        assert!(ui.starts_with('h'));
        assert!(ui.contains("[output truncated]"));

        let (ui, truncated) = truncate_for_ui("short", 100);
        assert!(!truncated);
        assert_eq!(ui, "short");
    }
}
