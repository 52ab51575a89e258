//! Core types for Helm chart optimization.
//!
//! These types describe parsed charts, rule violations, fix payloads and
//! their verification state.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Severity
// ============================================================================

/// Severity levels for rule violations.
///
/// Ordered from most severe to least severe:
/// `Critical > High > Medium > Low > Info`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Likely to cause outages or evictions
    Critical,
    /// Significant risk or waste
    High,
    #[default]
    Medium,
    Low,
    /// Informational suggestions
    Info,
}

impl Severity {
    /// Parse a severity from a string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
            Self::Info => 4,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so Critical > High > Medium > Low > Info
        other.rank().cmp(&self.rank())
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Resources and QoS
// ============================================================================

/// Kubernetes pod QoS class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl QosClass {
    /// Derive the QoS class from the four resource fields.
    ///
    /// Guaranteed iff every field is set and requests equal limits, BestEffort
    /// iff every field is zero or absent, Burstable otherwise.
    pub fn from_resources(resources: &ResourceFields) -> Self {
        let fields = [
            resources.cpu_request,
            resources.cpu_limit,
            resources.memory_request,
            resources.memory_limit,
        ];

        if fields.iter().all(|f| f.unwrap_or(0) == 0) {
            return Self::BestEffort;
        }

        let all_set = fields.iter().all(|f| matches!(f, Some(v) if *v > 0));
        if all_set
            && resources.cpu_request == resources.cpu_limit
            && resources.memory_request == resources.memory_limit
        {
            Self::Guaranteed
        } else {
            Self::Burstable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guaranteed => "Guaranteed",
            Self::Burstable => "Burstable",
            Self::BestEffort => "BestEffort",
        }
    }
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// CPU (millicores) and memory (bytes) requests and limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
}

impl ResourceFields {
    /// Check if any resources are defined.
    pub fn has_any(&self) -> bool {
        self.cpu_request.is_some()
            || self.cpu_limit.is_some()
            || self.memory_request.is_some()
            || self.memory_limit.is_some()
    }

    pub fn qos_class(&self) -> QosClass {
        QosClass::from_resources(self)
    }

    /// Field-wise sum; a field stays absent only when absent on both sides.
    pub fn sum(&self, other: &ResourceFields) -> ResourceFields {
        fn add(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            }
        }

        ResourceFields {
            cpu_request: add(self.cpu_request, other.cpu_request),
            cpu_limit: add(self.cpu_limit, other.cpu_limit),
            memory_request: add(self.memory_request, other.memory_request),
            memory_limit: add(self.memory_limit, other.memory_limit),
        }
    }
}

// ============================================================================
// Chart Settings
// ============================================================================

/// Which health probes are configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeFlags {
    pub liveness: bool,
    pub readiness: bool,
    pub startup: bool,
}

/// PodDisruptionBudget settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdbSettings {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_available: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<String>,
}

/// HorizontalPodAutoscaler settings from values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingSettings {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
}

/// Container security context settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only_root_filesystem: Option<bool>,
}

/// Where a chart's values came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartSource {
    /// A chart directory with a values file on disk
    #[default]
    LocalFile,
    /// A values snapshot fetched from a live release
    Cluster,
}

// ============================================================================
// Chart
// ============================================================================

/// A normalized chart record built by the chart parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chart {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Chart directory
    pub path: PathBuf,
    /// Values file the record was built from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub source: ChartSource,
    /// Effective resources (aggregated over sub-charts for umbrella charts)
    pub resources: ResourceFields,
    /// Resources declared by this chart alone
    pub own_resources: ResourceFields,
    pub qos_class: QosClass,
    pub probes: ProbeFlags,
    pub anti_affinity: bool,
    pub topology_spread: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdb: Option<PdbSettings>,
    /// Effective replicas (aggregated over sub-charts for umbrella charts)
    pub replicas: u32,
    /// Replicas declared by this chart alone
    pub own_replicas: u32,
    pub autoscaling: AutoscalingSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
    pub security: SecuritySettings,
    /// Name of the umbrella chart this sub-chart belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chart: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_charts: Vec<Chart>,
}

impl Default for QosClass {
    fn default() -> Self {
        QosClass::BestEffort
    }
}

impl Chart {
    /// True when the chart is backed by a values file on disk.
    pub fn is_local(&self) -> bool {
        self.source == ChartSource::LocalFile && self.values_file.is_some()
    }

    /// This chart followed by all sub-charts.
    pub fn flatten(&self) -> Vec<&Chart> {
        let mut out = vec![self];
        for sub in &self.sub_charts {
            out.extend(sub.flatten());
        }
        out
    }

    /// Whether the record was built from the chart's default `values.yaml`.
    pub fn is_canonical_values_file(&self) -> bool {
        match &self.values_file {
            Some(file) => file
                .file_name()
                .map(|n| n == "values.yaml" || n == "values.yml")
                .unwrap_or(false),
            None => false,
        }
    }
}

// ============================================================================
// Violations
// ============================================================================

/// Rule categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Resources,
    Probes,
    Availability,
    Security,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resources => "resources",
            Self::Probes => "probes",
            Self::Availability => "availability",
            Self::Security => "security",
        }
    }
}

/// Which evaluation mode produced a violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    #[default]
    Values,
    Rendered,
}

/// Outcome of verifying a fix against rendered output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Chart is not backed by a local file
    #[default]
    NotRun,
    /// Violation absent after the fix
    Verified,
    /// Violation still present after the fix
    Unresolved,
    /// Render failed or the rule could not be evaluated
    Unverified,
}

impl VerificationStatus {
    /// Combine two statuses, keeping the worst: unverified > unresolved > verified.
    pub fn worst(self, other: VerificationStatus) -> VerificationStatus {
        fn rank(s: VerificationStatus) -> u8 {
            match s {
                VerificationStatus::Unverified => 3,
                VerificationStatus::Unresolved => 2,
                VerificationStatus::Verified => 1,
                VerificationStatus::NotRun => 0,
            }
        }
        if rank(other) > rank(self) { other } else { self }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRun => "not_run",
            Self::Verified => "verified",
            Self::Unresolved => "unresolved",
            Self::Unverified => "unverified",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single rule violation on a chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub chart_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chart: Option<String>,
    /// `Kind/name` of the workload in rendered mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload: Option<String>,
    pub current_value: String,
    pub recommended_value: String,
    pub severity: Severity,
    pub auto_fixable: bool,
    pub source: AnalysisSource,
    pub verification: VerificationStatus,
    pub message: String,
}

impl Violation {
    /// Identity used to match the same finding across passes.
    pub fn key(&self) -> (&str, &str, Option<&str>) {
        (
            self.rule_id.as_str(),
            self.chart_name.as_str(),
            self.parent_chart.as_deref(),
        )
    }

    /// Path of this chart's section inside the values file that owns it.
    ///
    /// Sub-chart values live under the sub-chart's key in the parent values.
    pub fn values_prefix(&self) -> Vec<String> {
        match &self.parent_chart {
            Some(_) => vec![self.chart_name.clone()],
            None => Vec::new(),
        }
    }
}

impl Ord for Violation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.chart_name
            .cmp(&other.chart_name)
            .then_with(|| self.parent_chart.cmp(&other.parent_chart))
            .then_with(|| self.rule_id.cmp(&other.rule_id))
            .then_with(|| self.workload.cmp(&other.workload))
            .then_with(|| self.current_value.cmp(&other.current_value))
    }
}

impl PartialOrd for Violation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Patches
// ============================================================================

/// Nested key/value map merged into a values file.
pub type ValuesPatch = serde_yaml::Mapping;

/// How a template file is changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplatePatchBody {
    /// Unified diff hunks against the current file
    UnifiedDiff(String),
    /// Complete new file content
    Replacement(String),
}

/// A change to one file under the chart's `templates/` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplatePatch {
    /// Path relative to the chart root (e.g. `templates/deployment.yaml`)
    pub path: String,
    pub body: TemplatePatchBody,
}

/// A values patch plus template patches, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchBundle {
    pub values_patch: ValuesPatch,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_patches: Vec<TemplatePatch>,
}

impl PatchBundle {
    pub fn from_values(values_patch: ValuesPatch) -> Self {
        Self {
            values_patch,
            template_patches: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values_patch.is_empty() && self.template_patches.is_empty()
    }
}
