//! Unified-diff application.
//!
//! Supports the hunk syntax the optimizer itself produces and consumes:
//! `--- a/<path>` / `+++ b/<path>` headers, `@@ -a,b +c,d @@` hunks and
//! ` `/`-`/`+` body lines. Context and removal lines must match exactly.

use std::sync::LazyLock;

use regex::Regex;

use super::paths::validate_template_path;
use crate::analyzer::helm_optimize::types::{TemplatePatch, TemplatePatchBody};
use crate::error::{OptimizerError, Result};

static HUNK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap());

/// One body line of a hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// A parsed hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn net_change(&self) -> isize {
        self.lines
            .iter()
            .map(|l| match l {
                HunkLine::Add(_) => 1,
                HunkLine::Remove(_) => -1,
                HunkLine::Context(_) => 0,
            })
            .sum()
    }
}

struct HunkHeader {
    old_start: usize,
    old_count: usize,
    new_start: usize,
    new_count: usize,
}

fn parse_hunk_header(line: &str) -> Option<HunkHeader> {
    let caps = HUNK_HEADER.captures(line)?;
    let num = |i: usize, default: usize| {
        caps.get(i)
            .map(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(Some(default))
    };
    Some(HunkHeader {
        old_start: num(1, 0)?,
        old_count: num(2, 1)?,
        new_start: num(3, 0)?,
        new_count: num(4, 1)?,
    })
}

/// Parse every hunk in a single-file diff. File headers are skipped.
pub fn parse_hunks(diff: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();

    for line in diff.lines() {
        if line.starts_with("@@") {
            let header = parse_hunk_header(line)
                .ok_or_else(|| OptimizerError::MalformedDiff(format!("bad hunk header: {}", line)))?;
            hunks.push(Hunk {
                old_start: header.old_start,
                old_count: header.old_count,
                new_start: header.new_start,
                new_count: header.new_count,
                lines: Vec::new(),
            });
            continue;
        }

        let Some(hunk) = hunks.last_mut() else {
            // Preamble: diff/index/---/+++ lines
            continue;
        };

        if line.starts_with('\\') {
            // "\ No newline at end of file"
            continue;
        }
        let parsed = match line.chars().next() {
            Some(' ') => HunkLine::Context(line[1..].to_string()),
            Some('-') => HunkLine::Remove(line[1..].to_string()),
            Some('+') => HunkLine::Add(line[1..].to_string()),
            // Some producers drop the leading space on blank context lines
            None => HunkLine::Context(String::new()),
            Some(_) => {
                return Err(OptimizerError::MalformedDiff(format!(
                    "unexpected line in hunk: {}",
                    line
                )));
            }
        };
        hunk.lines.push(parsed);
    }

    if hunks.is_empty() {
        return Err(OptimizerError::MalformedDiff("no hunks found".to_string()));
    }
    Ok(hunks)
}

/// Apply a unified diff to `original`.
///
/// Any context or removal line that does not match the file at the cursor
/// is a [`OptimizerError::HunkMismatch`]; there is no fuzzy matching.
pub fn apply_unified_diff(original: &str, diff: &str, file: &str) -> Result<String> {
    let hunks = parse_hunks(diff)?;
    let had_trailing_newline = original.is_empty() || original.ends_with('\n');
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
    let mut offset: isize = 0;

    for hunk in &hunks {
        // A zero-length old range names the line *after* which to insert
        let base = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let start = base as isize + offset;
        if start < 0 || start as usize > lines.len() {
            return Err(OptimizerError::HunkMismatch {
                file: file.to_string(),
                line: hunk.old_start,
                expected: "hunk start within file".to_string(),
                found: format!("file has {} lines", lines.len()),
            });
        }

        let mut cursor = start as usize;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) | HunkLine::Remove(expected) => {
                    let found = lines.get(cursor).map(String::as_str).unwrap_or("<end of file>");
                    if found != expected {
                        return Err(OptimizerError::HunkMismatch {
                            file: file.to_string(),
                            line: cursor + 1,
                            expected: expected.clone(),
                            found: found.to_string(),
                        });
                    }
                    if matches!(line, HunkLine::Remove(_)) {
                        lines.remove(cursor);
                    } else {
                        cursor += 1;
                    }
                }
                HunkLine::Add(text) => {
                    lines.insert(cursor, text.clone());
                    cursor += 1;
                }
            }
        }
        offset += hunk.net_change();
    }

    let mut out = lines.join("\n");
    if had_trailing_newline && !lines.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Split a multi-file diff into per-template patches.
///
/// Each `--- `/`+++ ` header pair starts a new file. Target paths lose their
/// `a/`/`b/` prefixes and must lie under `templates/`.
pub fn parse_bundle_diff(diff: &str) -> Result<Vec<TemplatePatch>> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut patches: Vec<TemplatePatch> = Vec::new();
    let mut current: Option<(String, String)> = None;
    let mut remaining_old = 0usize;
    let mut remaining_new = 0usize;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let in_hunk = remaining_old > 0 || remaining_new > 0;

        if !in_hunk && line.starts_with("--- ") && lines.get(i + 1).is_some_and(|n| n.starts_with("+++ ")) {
            if let Some((path, body)) = current.take() {
                patches.push(finish_file(path, body)?);
            }
            let old = header_path(&line[4..]);
            let new = header_path(&lines[i + 1][4..]);
            let target = if new == "/dev/null" { old } else { new };
            if target == "/dev/null" {
                return Err(OptimizerError::MalformedDiff("diff has no target path".to_string()));
            }
            current = Some((target, format!("{}\n{}\n", line, lines[i + 1])));
            i += 2;
            continue;
        }

        if let Some((_, body)) = current.as_mut() {
            if !in_hunk && line.starts_with("@@") {
                let header = parse_hunk_header(line)
                    .ok_or_else(|| OptimizerError::MalformedDiff(format!("bad hunk header: {}", line)))?;
                remaining_old = header.old_count;
                remaining_new = header.new_count;
            } else if in_hunk {
                match line.chars().next() {
                    Some('-') => remaining_old = remaining_old.saturating_sub(1),
                    Some('+') => remaining_new = remaining_new.saturating_sub(1),
                    Some('\\') => {}
                    _ => {
                        remaining_old = remaining_old.saturating_sub(1);
                        remaining_new = remaining_new.saturating_sub(1);
                    }
                }
            } else if !line.starts_with('\\') {
                // git metadata (`diff --git`, `index ..`) between files
                i += 1;
                continue;
            }
            body.push_str(line);
            body.push('\n');
        }
        i += 1;
    }

    if let Some((path, body)) = current.take() {
        patches.push(finish_file(path, body)?);
    }
    if patches.is_empty() {
        return Err(OptimizerError::MalformedDiff("no file headers found".to_string()));
    }
    Ok(patches)
}

fn header_path(raw: &str) -> String {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}

fn finish_file(path: String, body: String) -> Result<TemplatePatch> {
    let validated = validate_template_path(&path)?;
    let normalized = validated
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    Ok(TemplatePatch {
        path: normalized,
        body: TemplatePatchBody::UnifiedDiff(body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nspec:\n  replicas: 1\n  template:\n    spec:\n      containers:\n        - name: app\n";

    #[test]
    fn test_apply_single_hunk() {
        let diff = "--- a/templates/deployment.yaml\n+++ b/templates/deployment.yaml\n@@ -3,2 +3,2 @@\n spec:\n-  replicas: 1\n+  replicas: {{ .Values.replicaCount }}\n";
        let out = apply_unified_diff(DEPLOYMENT, diff, "templates/deployment.yaml").unwrap();
        assert!(out.contains("  replicas: {{ .Values.replicaCount }}\n"));
        assert!(!out.contains("replicas: 1"));
        assert!(out.ends_with("- name: app\n"));
    }

    #[test]
    fn test_offsets_accumulate_across_hunks() {
        let diff = "@@ -1,1 +1,3 @@\n apiVersion: apps/v1\n+# one\n+# two\n@@ -8,1 +10,2 @@\n         - name: app\n+          image: nginx\n";
        let out = apply_unified_diff(DEPLOYMENT, diff, "d.yaml").unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "# one");
        assert_eq!(lines[10], "          image: nginx");
    }

    #[test]
    fn test_mismatch_is_rejected() {
        let diff = "@@ -4,1 +4,1 @@\n-  replicas: 3\n+  replicas: 2\n";
        let err = apply_unified_diff(DEPLOYMENT, diff, "templates/d.yaml").unwrap_err();
        match err {
            OptimizerError::HunkMismatch { line, expected, found, .. } => {
                assert_eq!(line, 4);
                assert_eq!(expected, "  replicas: 3");
                assert_eq!(found, "  replicas: 1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_insert_into_empty_file() {
        let diff = "@@ -0,0 +1,2 @@\n+kind: PodDisruptionBudget\n+metadata: {}\n\\ No newline at end of file\n";
        let out = apply_unified_diff("", diff, "templates/pdb.yaml").unwrap();
        assert_eq!(out, "kind: PodDisruptionBudget\nmetadata: {}\n");
    }

    #[test]
    fn test_parse_bundle_diff() {
        let diff = "diff --git a/templates/a.yaml b/templates/a.yaml\n--- a/templates/a.yaml\n+++ b/templates/a.yaml\n@@ -1,2 +1,2 @@\n--- not a header\n+kept\n x\n--- a/templates/b.yaml\t2024-01-01\n+++ b/templates/b.yaml\n@@ -1 +1 @@\n-old\n+new\n";
        let patches = parse_bundle_diff(diff).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].path, "templates/a.yaml");
        assert_eq!(patches[1].path, "templates/b.yaml");
        match &patches[0].body {
            TemplatePatchBody::UnifiedDiff(body) => assert!(body.contains("--- not a header")),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_bundle_diff_rejects_escapes() {
        for target in ["../values.yaml", "/etc/passwd", "values.yaml"] {
            let diff = format!("--- a/{target}\n+++ b/{target}\n@@ -1 +1 @@\n-a\n+b\n");
            assert!(matches!(
                parse_bundle_diff(&diff),
                Err(OptimizerError::PathEscapesChart { .. })
            ));
        }
        assert!(matches!(parse_bundle_diff("@@ -1 +1 @@\n-a\n+b\n"), Err(OptimizerError::MalformedDiff(_))));
    }
}
