//! Rendering adapter and rendered-input mapping.
//!
//! The adapter wraps an external manifest renderer behind the
//! [`ManifestRenderer`] trait so the engine and the verification pipeline can
//! be driven by a stub in tests.

pub mod helm;
pub mod mapper;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OptimizerError, Result};

pub use helm::HelmRenderer;
pub use mapper::{RenderedWorkload, map_rendered_workloads};

/// Values handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderValues {
    /// Render with the chart's defaults only
    Defaults,
    /// A values file on disk
    File(PathBuf),
    /// Values content that has not been written anywhere yet
    Inline(String),
}

/// One render invocation.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub chart_dir: PathBuf,
    pub values: RenderValues,
    pub release_name: String,
    pub namespace: Option<String>,
    pub timeout: Duration,
}

impl RenderRequest {
    pub fn new(chart_dir: impl Into<PathBuf>, values: RenderValues) -> Self {
        Self {
            chart_dir: chart_dir.into(),
            values,
            release_name: "release-name".to_string(),
            namespace: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_release(mut self, release: Option<&str>, namespace: Option<&str>) -> Self {
        if let Some(r) = release {
            self.release_name = r.to_string();
        }
        self.namespace = namespace.map(str::to_string);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Normalized render status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    Success,
    RenderFailed,
    HelmMissing,
    Timeout,
}

/// Result of one render, including any parent-only retry.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub status: RenderStatus,
    /// Multi-document YAML on success; partial output on timeout
    pub manifest: String,
    pub stderr: String,
    /// True when dependencies were stripped to get a render at all
    pub parent_only: bool,
    /// Timeout that was in force, for error reporting
    pub timeout: Duration,
}

impl RenderOutcome {
    pub fn success(manifest: impl Into<String>) -> Self {
        Self {
            status: RenderStatus::Success,
            manifest: manifest.into(),
            stderr: String::new(),
            parent_only: false,
            timeout: Duration::ZERO,
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            status: RenderStatus::RenderFailed,
            manifest: String::new(),
            stderr: stderr.into(),
            parent_only: false,
            timeout: Duration::ZERO,
        }
    }

    pub fn helm_missing() -> Self {
        Self {
            status: RenderStatus::HelmMissing,
            manifest: String::new(),
            stderr: String::new(),
            parent_only: false,
            timeout: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RenderStatus::Success
    }

    /// Convert into the manifest text or the matching renderer error.
    pub fn into_manifest(self) -> Result<String> {
        match self.status {
            RenderStatus::Success => Ok(self.manifest),
            RenderStatus::RenderFailed => Err(OptimizerError::RenderFailed(self.stderr)),
            RenderStatus::HelmMissing => Err(OptimizerError::HelmMissing),
            RenderStatus::Timeout => Err(OptimizerError::RenderTimeout {
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    /// Short human-readable reason for a non-success outcome.
    pub fn describe_failure(&self) -> String {
        match self.status {
            RenderStatus::Success => "rendered".to_string(),
            RenderStatus::HelmMissing => "helm binary not found".to_string(),
            RenderStatus::Timeout => format!("render timed out after {}s", self.timeout.as_secs()),
            RenderStatus::RenderFailed => {
                let first = self.stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                format!("render failed: {}", first.trim())
            }
        }
    }
}

/// Something that expands a chart into Kubernetes manifests.
pub trait ManifestRenderer: Send + Sync {
    /// Whether the renderer can run at all on this machine.
    fn is_available(&self) -> bool;

    /// Render a chart; never panics, failures are reported in the outcome.
    fn render(&self, request: &RenderRequest) -> RenderOutcome;
}
