//! Chart.yaml parser.
//!
//! Reads the subset of chart metadata the optimizer needs: the chart name,
//! dependencies (for umbrella detection) and ownership annotations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OptimizerError, Result};

/// Chart dependency.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Dependency {
    /// Dependency chart name
    pub name: String,
    /// Version constraint (SemVer)
    pub version: Option<String>,
    /// Repository URL or `file://` reference
    pub repository: Option<String>,
    /// Condition for enabling
    pub condition: Option<String>,
    /// Alias for the dependency
    pub alias: Option<String>,
}

impl Dependency {
    /// Name the dependency is exposed under in the parent's values.
    pub fn values_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Relative directory for `file://` references, `None` for remote ones.
    pub fn local_path(&self) -> Option<PathBuf> {
        let repo = self.repository.as_deref()?.trim();
        let path = repo.strip_prefix("file://")?;
        if path.is_empty() {
            return None;
        }
        Some(PathBuf::from(path))
    }
}

/// Parsed Chart.yaml metadata.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChartMetadata {
    #[serde(rename = "apiVersion")]
    pub api_version: Option<String>,

    pub name: Option<String>,

    pub version: Option<String>,

    /// A list of chart dependencies
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ChartMetadata {
    /// Owning team from the `team` or `owner` annotation.
    pub fn team(&self) -> Option<String> {
        self.annotations
            .get("team")
            .or_else(|| self.annotations.get("owner"))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Dependencies referenced through `file://` repositories.
    pub fn local_dependencies(&self) -> impl Iterator<Item = (&Dependency, PathBuf)> {
        self.dependencies
            .iter()
            .filter_map(|d| d.local_path().map(|p| (d, p)))
    }
}

/// Parse Chart.yaml content.
pub fn parse_chart_yaml(content: &str, path: &Path) -> Result<ChartMetadata> {
    serde_yaml::from_str(content).map_err(|e| {
        let location = e
            .location()
            .map(|l| format!("line {}: ", l.line()))
            .unwrap_or_default();
        OptimizerError::ChartMetadata {
            path: path.to_path_buf(),
            message: format!("{}{}", location, e),
        }
    })
}

/// Read Chart.yaml from a chart directory.
///
/// Returns `Ok(None)` when the chart has no Chart.yaml at all.
pub fn read_chart_metadata(chart_dir: &Path) -> Result<Option<ChartMetadata>> {
    let path = chart_dir.join("Chart.yaml");
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| OptimizerError::ChartMetadata {
        path: path.clone(),
        message: format!("Failed to read file: {}", e),
    })?;
    parse_chart_yaml(&content, &path).map(Some)
}
