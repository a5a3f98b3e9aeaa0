//! Durable, replayable record of one session.
//!
//! Layout, rooted at `<workspace>/.maestro/sessions/<session_id>/`:
//!
//! ```text
//! meta.json                    fixed session metadata
//! events.jsonl                 append-only protocol log (source of truth)
//! summary.md                   latest status, overwritten in place
//! tool/T-NNNN.json             tool run metadata (+ .stdout.txt/.stderr.txt)
//! edits/E-NNNN/before/<path>   pre-image of each edited file
//! edits/E-NNNN/after/<path>    post-image of each edited file
//! edits/E-NNNN/manifest.json   per-file content hashes
//! ```
//!
//! Every event and tool record is redacted before the first byte touches
//! disk. Appends are sequential; the server handles one message at a time.

use crate::paths::resolve_inside;
use chrono::Utc;
use maestro_proto::{redact_value, Error, Event, ProposedEdit, Result, ToolOutcome, MAX_EDIT_BYTES};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Session directories live under this workspace-relative root.
pub const SESSION_DIR: &str = ".maestro/sessions";

/// SHA-256 hex digest of arbitrary content.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            use std::fmt::Write as _;
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

/// Append-only event log plus artifact snapshots for one bound session.
pub struct SessionStore {
    session_id: String,
    workspace_root: PathBuf,
    root: PathBuf,
    version: String,
    tool_counter: u32,
    edit_counter: u32,
}

impl SessionStore {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        session_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let workspace_root = workspace_root.into();
        let session_id = session_id.into();
        let root = session_dir(&workspace_root, &session_id);
        Self {
            session_id,
            workspace_root,
            root,
            version: version.into(),
            tool_counter: 0,
            edit_counter: 0,
        }
    }

    /// The session directory.
    pub fn session_dir(&self) -> &Path {
        &self.root
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    /// Creates the directory tree, `meta.json`, and `summary.md`.
    ///
    /// Idempotent: an existing session directory is reused and the tool and
    /// edit counters resume past any ids already on disk.
    pub fn init(&mut self) -> Result<()> {
        fs::create_dir_all(self.root.join("tool"))?;
        fs::create_dir_all(self.root.join("edits"))?;

        let meta_path = self.root.join("meta.json");
        if !meta_path.exists() {
            let meta = json!({
                "sessionId": self.session_id,
                "createdAt": Utc::now().to_rfc3339(),
                "workspaceRoot": self.workspace_root.display().to_string(),
                "workspaceRootHash": content_hash(
                    self.workspace_root.display().to_string().as_bytes()
                ),
                "version": self.version,
            });
            fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;
        }

        let summary_path = self.root.join("summary.md");
        if !summary_path.exists() {
            fs::write(
                &summary_path,
                format!("# Session {}\n\nState: IDLE\n", self.session_id),
            )?;
        }

        self.tool_counter = scan_max_id(&self.root.join("tool"), "T-");
        self.edit_counter = scan_max_id(&self.root.join("edits"), "E-");

        info!(
            session_id = %self.session_id,
            dir = %self.root.display(),
            "session store initialized"
        );
        Ok(())
    }

    /// Appends one redacted event line to `events.jsonl`.
    pub fn append_event(&self, event: &Event) -> Result<()> {
        let redacted = Event {
            payload: redact_value(&event.payload),
            ..event.clone()
        };
        let line = serde_json::to_string(&redacted)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Records a completed tool run, returning its id (`T-0001`, ...).
    ///
    /// Metadata is redacted like events; the full stdout/stderr streams go
    /// to sibling text files.
    pub fn record_tool_execution(&mut self, outcome: &ToolOutcome) -> Result<String> {
        self.tool_counter += 1;
        let tool_id = format!("T-{:04}", self.tool_counter);
        let dir = self.root.join("tool");

        let meta = json!({
            "toolId": tool_id,
            "command": outcome.command,
            "cwd": outcome.cwd.display().to_string(),
            "exitCode": outcome.exit_code,
            "timedOut": outcome.timed_out,
            "truncatedForUi": outcome.truncated,
            "startedAt": outcome.started_at.to_rfc3339(),
            "endedAt": outcome.ended_at.to_rfc3339(),
        });
        fs::write(
            dir.join(format!("{tool_id}.json")),
            serde_json::to_string_pretty(&redact_value(&meta))?,
        )?;
        fs::write(dir.join(format!("{tool_id}.stdout.txt")), &outcome.stdout)?;
        fs::write(dir.join(format!("{tool_id}.stderr.txt")), &outcome.stderr)?;

        debug!(%tool_id, exit_code = outcome.exit_code, "tool execution recorded");
        Ok(tool_id)
    }

    /// Records one batch of proposed edits, returning its id (`E-0001`, ...).
    ///
    /// All before-images are read before anything is written, so the
    /// snapshot is consistent relative to the proposal step even if the
    /// live files change afterwards.
    pub fn record_proposed_edits(&mut self, edits: &[ProposedEdit]) -> Result<String> {
        for edit in edits {
            if edit.new_text.len() > MAX_EDIT_BYTES {
                return Err(Error::EditTooLarge {
                    path: edit.file_path.clone(),
                    size: edit.new_text.len(),
                    max: MAX_EDIT_BYTES,
                });
            }
        }

        // Read every pre-image first.
        let mut before_images: Vec<Option<Vec<u8>>> = Vec::with_capacity(edits.len());
        for edit in edits {
            let live = resolve_inside(&self.workspace_root, &edit.file_path)?;
            before_images.push(fs::read(&live).ok());
        }

        self.edit_counter += 1;
        let edit_id = format!("E-{:04}", self.edit_counter);
        let batch_dir = self.root.join("edits").join(&edit_id);

        let mut manifest_files = Vec::with_capacity(edits.len());
        for (edit, before) in edits.iter().zip(&before_images) {
            if let Some(bytes) = before {
                let dest = resolve_inside(&batch_dir.join("before"), &edit.file_path)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&dest, bytes)?;
            }

            let dest = resolve_inside(&batch_dir.join("after"), &edit.file_path)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, edit.new_text.as_bytes())?;

            manifest_files.push(json!({
                "filePath": edit.file_path,
                "beforeHash": before.as_deref().map(content_hash),
                "afterHash": content_hash(edit.new_text.as_bytes()),
                "summary": edit.summary,
            }));
        }

        let manifest = json!({
            "editId": edit_id,
            "createdAt": Utc::now().to_rfc3339(),
            "files": manifest_files,
        });
        fs::write(
            batch_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        debug!(%edit_id, files = edits.len(), "edit snapshot recorded");
        Ok(edit_id)
    }

    /// Overwrites `summary.md` with the latest human-readable status.
    pub fn update_summary(&self, markdown: &str) -> Result<()> {
        fs::write(self.root.join("summary.md"), markdown)?;
        Ok(())
    }
}

/// Resolves the session directory for a session id.
pub fn session_dir(workspace_root: &Path, session_id: &str) -> PathBuf {
    workspace_root.join(SESSION_DIR).join(session_id)
}

/// Highest `<prefix>NNNN` id found among directory entries, or 0.
fn scan_max_id(dir: &Path, prefix: &str) -> u32 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rest = name.strip_prefix(prefix)?;
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u32>().ok()
        })
        .max()
        .unwrap_or(0)
}
