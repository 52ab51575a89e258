//! Configuration for Helm chart optimization.

use super::types::Severity;
use serde::{Deserialize, Serialize};

/// How charts are evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// Evaluate the chart record built from values
    Values,
    /// Render the chart and evaluate each workload
    Rendered,
    /// Render when the renderer is available, otherwise use values
    #[default]
    Auto,
}

impl AnalysisMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "values" => Some(Self::Values),
            "rendered" => Some(Self::Rendered),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Configuration for chart optimization analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Evaluation mode (default: auto)
    pub mode: AnalysisMode,

    /// Worker pool ceiling; defaults to available parallelism capped at 10
    pub max_workers: Option<usize>,

    /// Values-mode batches smaller than this run on the calling thread
    pub parallel_threshold: usize,

    /// Renderer timeout in seconds (default: 60)
    pub render_timeout_secs: u64,

    /// Renderer binary (default: `helm`)
    pub helm_binary: String,

    /// Release name passed to the renderer
    pub release_name: Option<String>,

    /// Namespace passed to the renderer
    pub namespace: Option<String>,

    /// Rules to ignore (by rule code)
    pub ignore_rules: Vec<String>,

    /// Minimum severity to report (default: Info)
    pub min_severity: Severity,

    /// Maximum CPU limit to request ratio (default: 4)
    pub max_cpu_limit_ratio: f64,

    /// Maximum memory limit to request ratio (default: 2)
    pub max_memory_limit_ratio: f64,

    /// Replica floor used by availability rules and fixes (default: 2)
    pub min_replicas: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            mode: AnalysisMode::Auto,
            max_workers: None,
            parallel_threshold: 8,
            render_timeout_secs: 60,
            helm_binary: "helm".to_string(),
            release_name: None,
            namespace: None,
            ignore_rules: Vec::new(),
            min_severity: Severity::Info,
            max_cpu_limit_ratio: 4.0,
            max_memory_limit_ratio: 2.0,
            min_replicas: 2,
        }
    }
}

impl OptimizerConfig {
    /// Create a new default config.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: AnalysisMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the worker pool ceiling.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers.max(1));
        self
    }

    /// Set the minimum severity threshold.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    pub fn with_render_timeout(mut self, seconds: u64) -> Self {
        self.render_timeout_secs = seconds;
        self
    }

    pub fn with_helm_binary(mut self, binary: impl Into<String>) -> Self {
        self.helm_binary = binary.into();
        self
    }

    pub fn with_release(mut self, release: impl Into<String>, namespace: Option<String>) -> Self {
        self.release_name = Some(release.into());
        self.namespace = namespace;
        self
    }

    /// Add a rule to ignore.
    pub fn ignore_rule(mut self, rule: impl Into<String>) -> Self {
        self.ignore_rules.push(rule.into());
        self
    }

    /// Check if a rule should be ignored.
    pub fn should_ignore_rule(&self, rule: &str) -> bool {
        self.ignore_rules.iter().any(|r| r.eq_ignore_ascii_case(rule))
    }

    /// Check whether a severity passes the reporting threshold.
    pub fn reports(&self, severity: Severity) -> bool {
        severity >= self.min_severity
    }

    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        match self.max_workers {
            Some(n) => n.max(1),
            None => num_cpus::get().clamp(1, 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OptimizerConfig::default();
        assert_eq!(config.mode, AnalysisMode::Auto);
        assert_eq!(config.parallel_threshold, 8);
        assert_eq!(config.min_replicas, 2);
        assert!(config.worker_count() >= 1 && config.worker_count() <= 10);
    }

    #[test]
    fn test_builder_pattern() {
        let config = OptimizerConfig::new()
            .with_mode(AnalysisMode::Values)
            .with_max_workers(3)
            .with_severity(Severity::Medium)
            .ignore_rule("RES007");

        assert_eq!(config.worker_count(), 3);
        assert!(config.should_ignore_rule("res007"));
        assert!(config.reports(Severity::High));
        assert!(!config.reports(Severity::Low));
    }

    #[test]
    fn test_partial_toml() {
        let config: OptimizerConfig = toml::from_str("mode = \"rendered\"\nmin_replicas = 3\n").unwrap();
        assert_eq!(config.mode, AnalysisMode::Rendered);
        assert_eq!(config.min_replicas, 3);
        assert_eq!(config.helm_binary, "helm");
    }
}
