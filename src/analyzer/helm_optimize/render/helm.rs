//! `helm template` renderer.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use log::{debug, info, warn};
use tempfile::{NamedTempFile, TempDir};

use super::{ManifestRenderer, RenderOutcome, RenderRequest, RenderStatus, RenderValues};
use crate::analyzer::helm_optimize::apply::paths::copy_chart_tree;
use crate::common::command_utils::run_with_timeout;
use crate::error::Result;

/// stderr fragment helm prints when a declared dependency was never vendored.
const MISSING_DEPENDENCY_PATTERN: &str = "missing in charts/ directory";

/// Deadline for `helm version` when checking availability.
const DEFAULT_VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Renders charts by shelling out to `helm template`.
#[derive(Debug)]
pub struct HelmRenderer {
    binary: String,
    version_timeout: Duration,
    available: OnceLock<bool>,
}

impl Default for HelmRenderer {
    fn default() -> Self {
        Self::new("helm")
    }
}

impl HelmRenderer {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            version_timeout: DEFAULT_VERSION_TIMEOUT,
            available: OnceLock::new(),
        }
    }

    /// Set the deadline for the `helm version` availability check.
    pub fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Installed helm version, if any.
    pub fn version(&self) -> Option<String> {
        let out = run_with_timeout(&self.binary, &["version", "--short"], None, self.version_timeout).ok()?;
        if out.timed_out {
            warn!("{} version did not answer within {:?}", self.binary, self.version_timeout);
        }
        out.success().then(|| out.stdout.trim().to_string())
    }

    fn render_once(&self, chart_dir: &Path, request: &RenderRequest) -> RenderOutcome {
        // Inline values live in a temp file for the duration of the call
        let inline_file = match &request.values {
            RenderValues::Inline(content) => match write_inline_values(content) {
                Ok(f) => Some(f),
                Err(e) => return RenderOutcome::failed(format!("failed to stage inline values: {}", e)),
            },
            _ => None,
        };

        let chart_arg = chart_dir.to_string_lossy().to_string();
        let mut args: Vec<String> = vec![
            "template".to_string(),
            request.release_name.clone(),
            chart_arg,
        ];
        match (&request.values, &inline_file) {
            (RenderValues::File(path), _) => {
                args.push("-f".to_string());
                args.push(path.to_string_lossy().to_string());
            }
            (RenderValues::Inline(_), Some(file)) => {
                args.push("-f".to_string());
                args.push(file.path().to_string_lossy().to_string());
            }
            _ => {}
        }
        if let Some(ns) = &request.namespace {
            args.push("--namespace".to_string());
            args.push(ns.clone());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = match run_with_timeout(&self.binary, &arg_refs, None, request.timeout) {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return RenderOutcome::helm_missing();
            }
            Err(e) => return RenderOutcome::failed(format!("failed to run {}: {}", self.binary, e)),
        };

        let status = if output.timed_out {
            RenderStatus::Timeout
        } else if output.success() {
            RenderStatus::Success
        } else {
            RenderStatus::RenderFailed
        };

        RenderOutcome {
            status,
            manifest: output.stdout,
            stderr: output.stderr,
            parent_only: false,
            timeout: request.timeout,
        }
    }

    fn render_parent_only(&self, request: &RenderRequest) -> RenderOutcome {
        let staged = match stage_without_dependencies(&request.chart_dir) {
            Ok(dir) => dir,
            Err(e) => {
                return RenderOutcome::failed(format!("failed to stage parent-only chart: {}", e));
            }
        };

        let mut outcome = self.render_once(staged.path(), request);
        outcome.parent_only = true;
        outcome
    }
}

impl ManifestRenderer for HelmRenderer {
    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| match self.version() {
            Some(version) => {
                info!("Rendering with {} {}", self.binary, version);
                true
            }
            None => {
                warn!("{} is not usable, rendered analysis is unavailable", self.binary);
                false
            }
        })
    }

    fn render(&self, request: &RenderRequest) -> RenderOutcome {
        let outcome = self.render_once(&request.chart_dir, request);

        if outcome.status == RenderStatus::RenderFailed
            && outcome.stderr.contains(MISSING_DEPENDENCY_PATTERN)
        {
            warn!(
                "Dependencies of {} are not vendored, retrying parent chart only",
                request.chart_dir.display()
            );
            return self.render_parent_only(request);
        }

        if !outcome.is_success() {
            debug!(
                "Render of {} ended with {:?}: {}",
                request.chart_dir.display(),
                outcome.status,
                outcome.describe_failure()
            );
        }
        outcome
    }
}

fn write_inline_values(content: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("helm-optimizer-values-")
        .suffix(".yaml")
        .tempfile()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Copy a chart with its dependency declarations removed.
pub fn stage_without_dependencies(chart_dir: &Path) -> Result<TempDir> {
    let staged = TempDir::new()?;
    copy_chart_tree(chart_dir, staged.path())?;

    let chart_yaml = staged.path().join("Chart.yaml");
    if chart_yaml.is_file() {
        let content = fs::read_to_string(&chart_yaml)?;
        let mut doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
        if let Some(map) = doc.as_mapping_mut() {
            map.remove("dependencies");
        }
        fs::write(&chart_yaml, serde_yaml::to_string(&doc)?)?;
    }
    for lock in ["Chart.lock", "requirements.yaml", "requirements.lock"] {
        let path = staged.path().join(lock);
        if path.exists() {
            fs::remove_file(path)?;
        }
    }

    Ok(staged)
}
