//! Local application of a proposed edit batch.
//!
//! The editor normally applies edits itself and reports back with
//! `APPLY_EDIT_RESULT`. This adapter covers clients without their own apply
//! machinery: each file is written inside the workspace, with per-file
//! results instead of an all-or-nothing error.

use maestro_core::paths;
use maestro_proto::{FileResult, ProposedEdit, MAX_EDIT_BYTES};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// What an apply pass did, shaped like the editor's own report.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// True only when every file was written.
    pub applied: bool,
    pub file_results: Vec<FileResult>,
}

/// Writes each proposed edit into the workspace.
///
/// A failing file does not stop the batch; its result carries the error and
/// the overall outcome reports `applied: false`.
pub fn apply_edits(workspace_root: &Path, edits: &[ProposedEdit]) -> ApplyOutcome {
    let mut outcome = ApplyOutcome {
        applied: true,
        file_results: Vec::with_capacity(edits.len()),
    };

    for edit in edits {
        match apply_one(workspace_root, edit) {
            Ok(()) => {
                debug!(file = %edit.file_path, "edit applied");
                outcome.file_results.push(FileResult {
                    file_path: edit.file_path.clone(),
                    ok: true,
                    error: None,
                });
            }
            Err(e) => {
                warn!(file = %edit.file_path, error = %e, "edit not applied");
                outcome.applied = false;
                outcome.file_results.push(FileResult {
                    file_path: edit.file_path.clone(),
                    ok: false,
                    error: Some(e),
                });
            }
        }
    }
    outcome
}

fn apply_one(workspace_root: &Path, edit: &ProposedEdit) -> Result<(), String> {
    if edit.new_text.len() > MAX_EDIT_BYTES {
        return Err(format!(
            "edit is {} bytes, over the {MAX_EDIT_BYTES} byte cap",
            edit.new_text.len()
        ));
    }
    let target =
        paths::resolve_inside(workspace_root, &edit.file_path).map_err(|e| e.to_string())?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    fs::write(&target, &edit.new_text).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_writes_nested_files() {
        let tmp = TempDir::new().unwrap();
        let edits = vec![
            ProposedEdit::new("a.txt", "top level"),
            ProposedEdit::new("nested/deep/b.txt", "below"),
        ];

        let outcome = apply_edits(tmp.path(), &edits);
        assert!(outcome.applied);
        assert!(outcome.file_results.iter().all(|r| r.ok));
        assert_eq!(
            fs::read_to_string(tmp.path().join("nested/deep/b.txt")).unwrap(),
            "below"
        );
    }

    #[test]
    fn test_escaping_edit_fails_without_stopping_batch() {
        let tmp = TempDir::new().unwrap();
        let edits = vec![
            ProposedEdit::new("../escape.txt", "nope"),
            ProposedEdit::new("ok.txt", "fine"),
        ];

        let outcome = apply_edits(tmp.path(), &edits);
        assert!(!outcome.applied);
        assert!(!outcome.file_results[0].ok);
        assert!(outcome.file_results[0].error.is_some());
        assert!(outcome.file_results[1].ok);

        // Nothing lands outside the workspace.
        assert!(!tmp.path().parent().unwrap().join("escape.txt").exists());
        assert!(tmp.path().join("ok.txt").exists());
    }

    #[test]
    fn test_absolute_path_rejected() {
        let tmp = TempDir::new().unwrap();
        let outcome = apply_edits(tmp.path(), &[ProposedEdit::new("/etc/hosts", "x")]);
        assert!(!outcome.applied);
    }

    #[test]
    fn test_oversized_edit_rejected() {
        let tmp = TempDir::new().unwrap();
        let big = "x".repeat(MAX_EDIT_BYTES + 1);
        let outcome = apply_edits(tmp.path(), &[ProposedEdit::new("big.txt", big)]);
        assert!(!outcome.applied);
        assert!(!tmp.path().join("big.txt").exists());
    }
}
