//! Workspace path safety guards.
//!
//! Every file path that crosses the protocol boundary is workspace-relative
//! and must not be able to escape the workspace root, whether through `..`
//! segments or by being absolute in the first place.

use maestro_proto::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Validates that `path` is a well-formed workspace-relative path.
///
/// Rejects empty paths, absolute paths, and any path containing a `..`
/// component. Accepts plain relative paths including nested ones.
pub fn assert_safe_relative(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(Error::Protocol("empty file path".to_string()));
    }

    let p = Path::new(path);
    if p.is_absolute() {
        return Err(Error::AbsolutePath(path.to_string()));
    }

    for component in p.components() {
        match component {
            Component::ParentDir => return Err(Error::PathEscape(path.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::AbsolutePath(path.to_string()))
            }
            Component::Normal(_) | Component::CurDir => {}
        }
    }

    Ok(())
}

/// Resolves `rel` against `root`, guaranteeing the result is a descendant.
pub fn resolve_inside(root: &Path, rel: &str) -> Result<PathBuf> {
    assert_safe_relative(rel)?;
    let joined = root.join(rel);
    if !joined.starts_with(root) {
        return Err(Error::PathEscape(rel.to_string()));
    }
    Ok(joined)
}

/// Verifies an existing path (possibly absolute) resolves inside `root`.
///
/// Used for command working directories, which unlike edit paths may be
/// given absolute. Both sides are canonicalized so symlinks cannot be used
/// to step outside.
pub fn ensure_inside(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let root = root.canonicalize()?;
    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let resolved = resolved.canonicalize()?;
    if !resolved.starts_with(&root) {
        return Err(Error::PathEscape(candidate.display().to_string()));
    }
    Ok(resolved)
}
