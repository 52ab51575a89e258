//! Chart-relative path validation and tree copies.

use std::fs;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{OptimizerError, Result};

/// Directory every template patch must target.
pub const TEMPLATES_DIR: &str = "templates";

/// Validate a patch path and normalize it relative to the chart root.
///
/// Rejects absolute paths, upward traversal and anything outside `templates/`.
pub fn validate_template_path(raw: &str) -> Result<PathBuf> {
    let escapes = || OptimizerError::PathEscapesChart {
        path: raw.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(escapes());
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escapes());
            }
        }
    }

    let mut components = normalized.components();
    let under_templates = matches!(components.next(), Some(Component::Normal(first)) if first == TEMPLATES_DIR)
        && components.next().is_some();
    if !under_templates {
        return Err(escapes());
    }

    Ok(normalized)
}

/// Resolve a validated relative path under `chart_root`, refusing symlink escapes.
pub fn resolve_in_chart(chart_root: &Path, relative: &Path) -> Result<PathBuf> {
    let target = chart_root.join(relative);
    let root = canonical_chart_path(chart_root);

    // Check the deepest existing ancestor so new files are covered too
    let mut probe = target.as_path();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent,
            None => break,
        }
    }
    let resolved = canonical_chart_path(probe);
    if !resolved.starts_with(&root) {
        return Err(OptimizerError::PathEscapesChart {
            path: relative.display().to_string(),
        });
    }

    Ok(target)
}

/// Canonical form of a chart path, used as the lock key.
pub fn canonical_chart_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

/// Copy a chart directory tree into `dest`, skipping VCS metadata.
pub fn copy_chart_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|e| OptimizerError::Io(std::io::Error::other(e.to_string())))?;
        let relative = match entry.path().strip_prefix(src) {
            Ok(r) if !r.as_os_str().is_empty() => r,
            _ => continue,
        };
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            // Symlinked files are copied by content
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}
