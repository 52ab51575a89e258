//! Wiring diagnosis.
//!
//! When a fix leaves a violation in place, the usual cause is that the
//! values it sets are never read by a template. This module scans a chart's
//! templates for `.Values` references and classifies every path a patch sets.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use similar::TextDiff;
use walkdir::WalkDir;

use crate::analyzer::helm_optimize::apply::paths::TEMPLATES_DIR;
use crate::analyzer::helm_optimize::render::mapper::is_workload_kind;
use crate::analyzer::helm_optimize::types::ValuesPatch;

static VALUES_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.Values((?:\.[A-Za-z_][A-Za-z0-9_-]*)+)").unwrap());

static INDEX_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"index\s+\$?\.Values((?:\s+"[^"]+")+)"#).unwrap());

static QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).unwrap());

static KIND_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^kind:\s*([A-Za-z]+)\s*$").unwrap());

/// How a patched values path is consumed by the templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WiringStatus {
    /// A template reads this exact path (or something below it)
    Exact,
    /// A template reads an ancestor, e.g. `toYaml .Values.resources`
    ParentPrefix,
    /// Nothing reads it
    Unreferenced,
}

/// Where a path is referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateReference {
    /// Template path relative to the chart root
    pub file: PathBuf,
    /// 1-based line
    pub line: usize,
    /// The dotted path the template reads
    pub path: String,
}

/// Classification of one patched path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringFinding {
    pub path: String,
    pub status: WiringStatus,
    pub references: Vec<TemplateReference>,
}

/// Wiring of every path a patch sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringDiagnosis {
    pub findings: Vec<WiringFinding>,
    /// Workload templates where missing wiring most likely belongs
    pub candidate_templates: Vec<PathBuf>,
}

impl WiringDiagnosis {
    pub fn unreferenced(&self) -> impl Iterator<Item = &WiringFinding> {
        self.findings.iter().filter(|f| f.status == WiringStatus::Unreferenced)
    }

    pub fn is_fully_wired(&self) -> bool {
        self.unreferenced().next().is_none()
    }
}

/// Dotted paths of every leaf a patch sets.
pub fn flatten_patch_paths(patch: &ValuesPatch) -> Vec<String> {
    let mut out = Vec::new();
    for (key, value) in patch {
        let key = key_text(key);
        collect_leaves(&key, value, &mut out);
    }
    out
}

fn collect_leaves(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Mapping(map) if !map.is_empty() => {
            for (key, child) in map {
                collect_leaves(&format!("{}.{}", prefix, key_text(key)), child, out);
            }
        }
        _ => out.push(prefix.to_string()),
    }
}

fn key_text(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Every `.Values` reference in the chart's templates.
///
/// References inside `charts/<sub>/templates` are reported with `<sub>.`
/// prepended, matching how the parent's values reach the sub-chart.
pub fn collect_template_references(chart_dir: &Path) -> Vec<TemplateReference> {
    let mut refs = Vec::new();
    for (file, prefix) in template_files(chart_dir) {
        let Ok(content) = fs::read_to_string(chart_dir.join(&file)) else {
            debug!("Skipping unreadable template {}", file.display());
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            let mut push = |path: String| {
                let path = match &prefix {
                    Some(sub) => format!("{}.{}", sub, path),
                    None => path,
                };
                refs.push(TemplateReference {
                    file: file.clone(),
                    line: idx + 1,
                    path,
                });
            };
            for caps in VALUES_REF.captures_iter(line) {
                push(caps[1].trim_start_matches('.').to_string());
            }
            for caps in INDEX_REF.captures_iter(line) {
                let keys: Vec<&str> = QUOTED
                    .captures_iter(&caps[1])
                    .filter_map(|c| c.get(1).map(|m| m.as_str()))
                    .collect();
                if !keys.is_empty() {
                    push(keys.join("."));
                }
            }
        }
    }
    refs
}

/// Template files relative to `chart_dir`, with the sub-chart they belong to.
fn template_files(chart_dir: &Path) -> Vec<(PathBuf, Option<String>)> {
    let mut files = Vec::new();
    for entry in WalkDir::new(chart_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Ok(relative) = entry.path().strip_prefix(chart_dir) else {
            continue;
        };
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let owner = match parts.as_slice() {
            [dir, _, ..] if dir == TEMPLATES_DIR => Some(None),
            [charts, sub, dir, _, ..] if charts == "charts" && dir == TEMPLATES_DIR => Some(Some(sub.clone())),
            _ => None,
        };
        if let Some(owner) = owner {
            files.push((relative.to_path_buf(), owner));
        }
    }
    files.sort();
    files
}

/// Classify every path `patch` sets against the chart's templates.
pub fn diagnose_wiring(chart_dir: &Path, patch: &ValuesPatch) -> WiringDiagnosis {
    let refs = collect_template_references(chart_dir);
    let mut by_path: BTreeMap<&str, Vec<&TemplateReference>> = BTreeMap::new();
    for r in &refs {
        by_path.entry(r.path.as_str()).or_default().push(r);
    }

    let findings: Vec<WiringFinding> = flatten_patch_paths(patch)
        .into_iter()
        .map(|path| classify(path, &by_path))
        .collect();

    let candidate_templates = if findings.iter().any(|f| f.status == WiringStatus::Unreferenced) {
        workload_templates(chart_dir)
    } else {
        Vec::new()
    };

    WiringDiagnosis {
        findings,
        candidate_templates,
    }
}

fn classify(path: String, by_path: &BTreeMap<&str, Vec<&TemplateReference>>) -> WiringFinding {
    let mut exact = Vec::new();
    let mut parent = Vec::new();
    for (referenced, refs) in by_path {
        let is_exact = *referenced == path || referenced.starts_with(&format!("{}.", path));
        let is_parent = path.starts_with(&format!("{}.", referenced));
        if is_exact {
            exact.extend(refs.iter().map(|r| (*r).clone()));
        } else if is_parent {
            parent.extend(refs.iter().map(|r| (*r).clone()));
        }
    }

    let (status, references) = if !exact.is_empty() {
        (WiringStatus::Exact, exact)
    } else if !parent.is_empty() {
        (WiringStatus::ParentPrefix, parent)
    } else {
        (WiringStatus::Unreferenced, Vec::new())
    };
    WiringFinding {
        path,
        status,
        references,
    }
}

/// Templates that declare a workload kind.
fn workload_templates(chart_dir: &Path) -> Vec<PathBuf> {
    template_files(chart_dir)
        .into_iter()
        .filter(|(file, _)| {
            fs::read_to_string(chart_dir.join(file))
                .map(|content| {
                    KIND_LINE
                        .captures_iter(&content)
                        .any(|c| is_workload_kind(&c[1]))
                })
                .unwrap_or(false)
        })
        .map(|(file, _)| file)
        .collect()
}

/// Unified-diff preview of a values change.
pub fn values_diff_preview(before: &str, after: &str, file_name: &str) -> String {
    let diff = TextDiff::from_lines(before, after);
    diff.unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", file_name), &format!("b/{}", file_name))
        .to_string()
}

/// Human-readable follow-ups for a diagnosis.
pub fn suggestions(diagnosis: &WiringDiagnosis, values_preview: Option<String>) -> Vec<String> {
    let mut out = Vec::new();
    for finding in diagnosis.unreferenced() {
        let target = match diagnosis.candidate_templates.as_slice() {
            [] => "a workload template".to_string(),
            files => files
                .iter()
                .map(|f| f.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        };
        out.push(format!(
            "`{}` is not referenced by any template; wire `.Values.{}` into {}",
            finding.path, finding.path, target
        ));
    }
    for finding in diagnosis.findings.iter().filter(|f| f.status == WiringStatus::ParentPrefix) {
        if let Some(r) = finding.references.first() {
            out.push(format!(
                "`{}` reaches templates only through `.Values.{}` ({}:{}); check that block is rendered as-is",
                finding.path,
                r.path,
                r.file.display(),
                r.line
            ));
        }
    }
    if let Some(preview) = values_preview.filter(|p| !p.is_empty()) {
        out.push(format!("Values change that did not take effect:\n{}", preview));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::helm_optimize::rules::nested_patch;
    use tempfile::TempDir;

    fn chart() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("templates")).unwrap();
        fs::create_dir_all(dir.path().join("charts/worker/templates")).unwrap();
        fs::write(
            dir.path().join("templates/deployment.yaml"),
            "kind: Deployment\nspec:\n  replicas: {{ .Values.replicaCount }}\n  resources:\n    {{- toYaml .Values.resources | nindent 4 }}\n  image: {{ index .Values \"image\" \"tag\" }}\n",
        )
        .unwrap();
        fs::write(dir.path().join("templates/_helpers.tpl"), "{{- define \"x\" -}}{{- end }}\n").unwrap();
        fs::write(
            dir.path().join("charts/worker/templates/deploy.yaml"),
            "kind: Deployment\nreplicas: {{ $.Values.replicas }}\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_collects_references() {
        let dir = chart();
        let refs = collect_template_references(dir.path());
        let paths: Vec<&str> = refs.iter().map(|r| r.path.as_str()).collect();
        assert!(paths.contains(&"replicaCount"));
        assert!(paths.contains(&"resources"));
        assert!(paths.contains(&"image.tag"));
        assert!(paths.contains(&"worker.replicas"));
        let replica = refs.iter().find(|r| r.path == "replicaCount").unwrap();
        assert_eq!(replica.line, 3);
    }

    #[test]
    fn test_classification() {
        let dir = chart();
        let mut patch = nested_patch(&["replicaCount"], Value::from(2));
        patch.extend(nested_patch(&["resources", "requests", "cpu"], Value::from("100m")));
        patch.extend(nested_patch(&["podDisruptionBudget", "enabled"], Value::Bool(true)));

        let diagnosis = diagnose_wiring(dir.path(), &patch);
        let status = |p: &str| diagnosis.findings.iter().find(|f| f.path == p).unwrap().status;
        assert_eq!(status("replicaCount"), WiringStatus::Exact);
        assert_eq!(status("resources.requests.cpu"), WiringStatus::ParentPrefix);
        assert_eq!(status("podDisruptionBudget.enabled"), WiringStatus::Unreferenced);
        assert!(!diagnosis.is_fully_wired());
        assert!(diagnosis.candidate_templates.contains(&PathBuf::from("templates/deployment.yaml")));
        assert!(!diagnosis.candidate_templates.contains(&PathBuf::from("templates/_helpers.tpl")));

        let notes = suggestions(&diagnosis, Some(values_diff_preview("a: 1\n", "a: 2\n", "values.yaml")));
        assert!(notes.iter().any(|n| n.contains("podDisruptionBudget.enabled")));
        assert!(notes.iter().any(|n| n.contains("+a: 2")));
    }
}
