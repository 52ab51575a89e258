//! Rule engine.
//!
//! Evaluates the rule catalog against charts in values mode (one record per
//! chart) or rendered mode (one record per rendered workload). Batches run on
//! a bounded rayon pool; a failing rule is logged and skipped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, info, warn};
use rayon::prelude::*;

use super::config::{AnalysisMode, OptimizerConfig};
use super::render::{
    HelmRenderer, ManifestRenderer, RenderRequest, RenderValues, map_rendered_workloads,
};
use super::rules::{Rule, RuleInput, all_rules, find_rule};
use super::types::{Chart, Violation};
use crate::error::{OptimizerError, Result};

/// Per-chart completion callback: `(completed, total, chart_name)`.
pub type ProgressCallback<'a> = &'a (dyn Fn(usize, usize, &str) + Sync);

/// Evaluates the rule catalog against charts.
pub struct RuleEngine {
    config: OptimizerConfig,
    renderer: Arc<dyn ManifestRenderer>,
    renderer_available: OnceLock<bool>,
}

impl RuleEngine {
    /// Create an engine that renders with the configured helm binary.
    pub fn new(config: OptimizerConfig) -> Self {
        let renderer = Arc::new(HelmRenderer::new(config.helm_binary.clone()));
        Self::with_renderer(config, renderer)
    }

    /// Create an engine with a custom renderer.
    pub fn with_renderer(config: OptimizerConfig, renderer: Arc<dyn ManifestRenderer>) -> Self {
        Self {
            config,
            renderer,
            renderer_available: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn renderer(&self) -> &Arc<dyn ManifestRenderer> {
        &self.renderer
    }

    /// Whether the renderer can run; probed once per engine.
    pub fn renderer_available(&self) -> bool {
        *self.renderer_available.get_or_init(|| {
            let available = self.renderer.is_available();
            if !available {
                info!("Renderer unavailable, rendered analysis disabled for this engine");
            }
            available
        })
    }

    /// Mode that will actually be used for a local chart.
    pub fn effective_mode(&self) -> AnalysisMode {
        match self.config.mode {
            AnalysisMode::Auto if self.renderer_available() => AnalysisMode::Rendered,
            AnalysisMode::Auto => AnalysisMode::Values,
            mode => mode,
        }
    }

    /// Build a render request for a chart directory using the engine's settings.
    pub fn render_request(&self, chart: &Chart, values: RenderValues) -> RenderRequest {
        let namespace = self.config.namespace.as_deref().or(chart.namespace.as_deref());
        RenderRequest::new(&chart.path, values)
            .with_release(self.config.release_name.as_deref(), namespace)
            .with_timeout(Duration::from_secs(self.config.render_timeout_secs))
    }

    // ========================================================================
    // Single chart
    // ========================================================================

    /// Check one chart (and its sub-charts).
    ///
    /// In rendered mode a render failure is an error; in auto mode it falls
    /// back to values mode.
    pub fn check_chart(&self, chart: &Chart) -> Result<Vec<Violation>> {
        let renderable = chart.is_local() && chart.parent_chart.is_none();

        let violations = match (self.config.mode, renderable) {
            (AnalysisMode::Values, _) => self.check_chart_values(chart),
            (_, false) => {
                debug!("{} has no local values file, using values mode", chart.name);
                self.check_chart_values(chart)
            }
            (AnalysisMode::Rendered, true) => {
                if !self.renderer_available() {
                    return Err(OptimizerError::HelmMissing);
                }
                self.check_chart_rendered(chart)?
            }
            (AnalysisMode::Auto, true) => {
                if !self.renderer_available() {
                    self.check_chart_values(chart)
                } else {
                    match self.check_chart_rendered(chart) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("Rendering {} failed, falling back to values mode: {}", chart.name, e);
                            self.check_chart_values(chart)
                        }
                    }
                }
            }
        };

        Ok(finalize(violations))
    }

    /// Values-mode evaluation of a chart and its sub-charts.
    pub fn check_chart_values(&self, chart: &Chart) -> Vec<Violation> {
        let mut violations = Vec::new();
        for record in chart.flatten() {
            // An umbrella with no workload of its own has nothing to check
            if !record.sub_charts.is_empty() && !record.own_resources.has_any() {
                continue;
            }
            violations.extend(self.evaluate_input(&RuleInput::from_chart(record)));
        }
        violations
    }

    /// Rendered-mode evaluation using the chart's values file.
    pub fn check_chart_rendered(&self, chart: &Chart) -> Result<Vec<Violation>> {
        let values = match &chart.values_file {
            Some(file) => RenderValues::File(file.clone()),
            None => RenderValues::Defaults,
        };
        let outcome = self.renderer.render(&self.render_request(chart, values));
        if outcome.parent_only {
            warn!("{} rendered without its dependencies", chart.name);
        }
        let manifest = outcome.into_manifest()?;
        Ok(self.evaluate_manifest(&chart.name, chart.parent_chart.as_deref(), &manifest))
    }

    /// Evaluate every rule against rendered manifest text.
    pub fn evaluate_manifest(&self, chart_name: &str, parent_chart: Option<&str>, manifest: &str) -> Vec<Violation> {
        map_rendered_workloads(manifest)
            .iter()
            .flat_map(|w| self.evaluate_input(&RuleInput::from_rendered(chart_name, parent_chart, w)))
            .collect()
    }

    /// Evaluate one rule against rendered manifest text.
    ///
    /// Returns an error when the rule is unknown, nothing in the manifest can
    /// be evaluated or the rule itself fails.
    pub fn evaluate_rule_on_manifest(
        &self,
        rule_id: &str,
        chart_name: &str,
        parent_chart: Option<&str>,
        manifest: &str,
    ) -> Result<Vec<Violation>> {
        let rule = find_rule(rule_id)
            .ok_or_else(|| OptimizerError::VerificationIndeterminate(format!("unknown rule {}", rule_id)))?;
        let workloads = map_rendered_workloads(manifest);
        if workloads.is_empty() {
            return Err(OptimizerError::VerificationIndeterminate(format!(
                "no workloads in rendered output of {}",
                chart_name
            )));
        }

        let mut out = Vec::new();
        for workload in &workloads {
            let input = RuleInput::from_rendered(chart_name, parent_chart, workload);
            if input.ignored_rules.contains(rule.code()) {
                continue;
            }
            out.extend(self.run_rule(rule, &input)?);
        }
        Ok(out)
    }

    /// Run every enabled rule on one input, isolating failures per rule.
    pub fn evaluate_input(&self, input: &RuleInput) -> Vec<Violation> {
        let mut violations = Vec::new();
        for rule in all_rules() {
            let code = rule.code();
            if self.config.should_ignore_rule(code) || input.ignored_rules.contains(code) {
                continue;
            }
            if !self.config.reports(rule.severity()) {
                continue;
            }
            match self.run_rule(rule.as_ref(), input) {
                Ok(found) => violations.extend(found),
                Err(e) => warn!("Skipping {} on {}: {}", code, input.chart_name, e),
            }
        }
        violations
    }

    fn run_rule(&self, rule: &dyn Rule, input: &RuleInput) -> Result<Vec<Violation>> {
        match catch_unwind(AssertUnwindSafe(|| rule.check(input, &self.config))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "rule panicked".to_string());
                Err(OptimizerError::RuleCheck {
                    rule: rule.code().to_string(),
                    message,
                })
            }
        }
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Check a batch of charts; per-chart errors are logged and skipped.
    pub fn check_all_charts(&self, charts: &[Chart], on_chart_done: Option<ProgressCallback<'_>>) -> Vec<Violation> {
        let total = charts.len();
        let done = AtomicUsize::new(0);

        let check_one = |chart: &Chart| -> Vec<Violation> {
            let violations = match self.check_chart(chart) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Failed to check {}: {}", chart.name, e);
                    Vec::new()
                }
            };
            let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(callback) = on_chart_done {
                callback(completed, total, &chart.name);
            }
            violations
        };

        let sequential =
            self.config.mode == AnalysisMode::Values && total < self.config.parallel_threshold;

        let per_chart: Vec<Vec<Violation>> = if sequential || total <= 1 {
            charts.iter().map(check_one).collect()
        } else {
            // Probe before fanning out so workers share the cached answer
            if self.config.mode != AnalysisMode::Values {
                self.renderer_available();
            }
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.worker_count())
                .build()
            {
                Ok(pool) => pool.install(|| charts.par_iter().map(check_one).collect()),
                Err(e) => {
                    warn!("Failed to build worker pool, checking sequentially: {}", e);
                    charts.iter().map(check_one).collect()
                }
            }
        };

        finalize(per_chart.into_iter().flatten().collect())
    }
}

/// Deterministic order without exact duplicates.
fn finalize(mut violations: Vec<Violation>) -> Vec<Violation> {
    violations.sort();
    violations.dedup();
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::helm_optimize::render::RenderOutcome;
    use crate::analyzer::helm_optimize::types::{ChartSource, ResourceFields};
    use std::sync::Mutex;

    struct StubRenderer {
        available: bool,
        manifest: Option<String>,
        probes: AtomicUsize,
    }

    impl ManifestRenderer for StubRenderer {
        fn is_available(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.available
        }

        fn render(&self, _request: &RenderRequest) -> RenderOutcome {
            match &self.manifest {
                Some(m) => RenderOutcome::success(m.clone()),
                None => RenderOutcome::failed("Error: boom"),
            }
        }
    }

    fn stub(available: bool, manifest: Option<&str>) -> Arc<StubRenderer> {
        Arc::new(StubRenderer {
            available,
            manifest: manifest.map(str::to_string),
            probes: AtomicUsize::new(0),
        })
    }

    fn local_chart(name: &str) -> Chart {
        Chart {
            name: name.to_string(),
            path: std::path::PathBuf::from("/charts").join(name),
            values_file: Some(std::path::PathBuf::from("/charts").join(name).join("values.yaml")),
            source: ChartSource::LocalFile,
            replicas: 1,
            own_replicas: 1,
            ..Default::default()
        }
    }

    const RENDERED: &str = r#"
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
  template:
    spec:
      securityContext:
        runAsNonRoot: true
      priorityClassName: high
      topologySpreadConstraints:
        - maxSkew: 1
      containers:
        - name: web
          resources:
            requests: {cpu: 100m, memory: 64Mi}
            limits: {cpu: 200m, memory: 128Mi}
          livenessProbe: {tcpSocket: {port: 80}}
          readinessProbe: {tcpSocket: {port: 80}}
"#;

    #[test]
    fn test_values_mode_is_idempotent() {
        let engine = RuleEngine::with_renderer(
            OptimizerConfig::new().with_mode(AnalysisMode::Values),
            stub(true, None),
        );
        let chart = local_chart("api");
        let first = engine.check_chart(&chart).unwrap();
        let second = engine.check_chart(&chart).unwrap();
        assert_eq!(first, second);
        assert!(first.iter().any(|v| v.rule_id == "RES001"));
        assert!(first.iter().any(|v| v.rule_id == "AVL001"));
    }

    #[test]
    fn test_rendered_mode_uses_manifest() {
        let engine = RuleEngine::with_renderer(
            OptimizerConfig::new().with_mode(AnalysisMode::Rendered),
            stub(true, Some(RENDERED)),
        );
        let violations = engine.check_chart(&local_chart("web")).unwrap();
        let ids: Vec<&str> = violations.iter().map(|v| v.rule_id.as_str()).collect();
        // Only the PDB is missing
        assert_eq!(ids, vec!["AVL002"]);
        assert_eq!(violations[0].workload.as_deref(), Some("Deployment/web"));
    }

    #[test]
    fn test_explicit_replicas_beat_hpa_minimum() {
        let manifest = format!(
            "{RENDERED}---\nkind: HorizontalPodAutoscaler\nmetadata:\n  name: web\nspec:\n  scaleTargetRef:\n    kind: Deployment\n    name: web\n  minReplicas: 1\n"
        );
        let engine = RuleEngine::with_renderer(
            OptimizerConfig::new().with_mode(AnalysisMode::Rendered),
            stub(true, Some(&manifest)),
        );
        let violations = engine.check_chart(&local_chart("web")).unwrap();
        let ids: Vec<&str> = violations.iter().map(|v| v.rule_id.as_str()).collect();
        // Three explicit replicas: no single-replica finding, PDB still expected
        assert_eq!(ids, vec!["AVL002"]);
    }

    #[test]
    fn test_rendered_failure_is_error_but_auto_falls_back() {
        let rendered = RuleEngine::with_renderer(
            OptimizerConfig::new().with_mode(AnalysisMode::Rendered),
            stub(true, None),
        );
        assert!(matches!(
            rendered.check_chart(&local_chart("api")),
            Err(OptimizerError::RenderFailed(_))
        ));

        let auto = RuleEngine::with_renderer(OptimizerConfig::new(), stub(true, None));
        let violations = auto.check_chart(&local_chart("api")).unwrap();
        assert!(!violations.is_empty());
        assert!(violations.iter().all(|v| v.source == crate::analyzer::helm_optimize::types::AnalysisSource::Values));
    }

    #[test]
    fn test_availability_probed_once() {
        let renderer = stub(false, None);
        let engine = RuleEngine::with_renderer(OptimizerConfig::new(), renderer.clone());
        let charts: Vec<Chart> = (0..4).map(|i| local_chart(&format!("c{i}"))).collect();
        let violations = engine.check_all_charts(&charts, None);
        assert!(!violations.is_empty());
        assert_eq!(renderer.probes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_progress_callback_and_filters() {
        let config = OptimizerConfig::new()
            .with_mode(AnalysisMode::Values)
            .ignore_rule("AVL001")
            .with_severity(crate::analyzer::helm_optimize::types::Severity::High);
        let engine = RuleEngine::with_renderer(config, stub(false, None));

        let mut chart = local_chart("api");
        chart.own_resources = ResourceFields {
            cpu_request: Some(100),
            ..Default::default()
        };
        let charts = vec![chart, local_chart("b"), local_chart("c")];

        let seen = Mutex::new(Vec::new());
        let callback = |done: usize, total: usize, name: &str| {
            seen.lock().unwrap().push((done, total, name.to_string()));
        };
        let violations = engine.check_all_charts(&charts, Some(&callback));

        assert_eq!(seen.lock().unwrap().len(), 3);
        assert!(violations.iter().all(|v| v.rule_id != "AVL001"));
        assert!(violations.iter().all(|v| v.severity >= crate::analyzer::helm_optimize::types::Severity::High));
        assert!(violations.windows(2).all(|w| w[0] <= w[1]));
    }
}
