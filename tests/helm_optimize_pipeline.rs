use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use serde_yaml::Value;
use tempfile::TempDir;

use syncable_chart_optimizer::OptimizerError;
use syncable_chart_optimizer::analyzer::helm_optimize::parser::parse_values_content;
use syncable_chart_optimizer::analyzer::helm_optimize::rules::nested_patch;
use syncable_chart_optimizer::analyzer::helm_optimize::{
    AnalysisMode, CatalogFixGenerator, Chart, FixGenerator, ManifestRenderer, OptimizerConfig, PatchBundle,
    RenderOutcome, RenderRequest, RenderValues, RuleEngine, StagedApplyOptions, TemplatePatch, TemplatePatchBody,
    VerificationPipeline, VerificationStatus, Violation, apply_full_fix_bundle_atomic,
    apply_full_fix_bundle_via_staged_replace, combine_fixes, parse_chart_dir, parse_release_values,
};

const VALUES: &str = "# Web frontend
replicaCount: 1

image:
  repository: nginx   # pinned below
  tag: \"1.25\"

resources:
  limits:
    cpu: 1000m
    memory: 512Mi
  requests:
    cpu: 100m
    memory: 256Mi
";

const TEMPLATE: &str = "apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ .Release.Name }}-web
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: web
          image: \"{{ .Values.image.repository }}:{{ .Values.image.tag }}\"
          resources:
            {{- toYaml .Values.resources | nindent 12 }}
";

/// Renders one Deployment from the values it is given, the way a simple chart would.
struct EchoRenderer {
    wire_replicas: bool,
    fail: bool,
    on_render: Option<Box<dyn Fn() + Send + Sync>>,
    renders: AtomicUsize,
}

impl EchoRenderer {
    fn wired() -> Self {
        Self {
            wire_replicas: true,
            fail: false,
            on_render: None,
            renders: AtomicUsize::new(0),
        }
    }

    fn ignoring_replicas() -> Self {
        Self {
            wire_replicas: false,
            ..Self::wired()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::wired()
        }
    }
}

impl ManifestRenderer for EchoRenderer {
    fn is_available(&self) -> bool {
        true
    }

    fn render(&self, request: &RenderRequest) -> RenderOutcome {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_render {
            hook();
        }
        if self.fail {
            return RenderOutcome::failed("Error: template: web/templates/deployment.yaml:9: nil pointer");
        }

        let text = match &request.values {
            RenderValues::Inline(text) => text.clone(),
            RenderValues::File(path) => fs::read_to_string(path).unwrap_or_default(),
            RenderValues::Defaults => fs::read_to_string(request.chart_dir.join("values.yaml")).unwrap_or_default(),
        };
        let values: Value = serde_yaml::from_str(&text).unwrap_or(Value::Null);
        let replicas = if self.wire_replicas {
            values.get("replicaCount").and_then(Value::as_u64).unwrap_or(1)
        } else {
            1
        };
        let resources = values.get("resources").cloned().unwrap_or(Value::Null);

        let doc = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web" },
            "spec": {
                "replicas": replicas,
                "template": { "spec": { "containers": [{ "name": "web", "resources": resources }] } }
            }
        });
        let body = serde_yaml::to_string(&doc).unwrap_or_default();
        RenderOutcome::success(format!("---\n# Source: web/templates/deployment.yaml\n{}", body))
    }
}

fn write_chart(root: &Path) -> PathBuf {
    let chart = root.join("web");
    fs::create_dir_all(chart.join("templates")).unwrap();
    fs::write(
        chart.join("Chart.yaml"),
        "apiVersion: v2\nname: web\nversion: 0.1.0\nannotations:\n  team: storefront\n",
    )
    .unwrap();
    fs::write(chart.join("values.yaml"), VALUES).unwrap();
    fs::write(chart.join("templates/deployment.yaml"), TEMPLATE).unwrap();
    chart
}

fn engine(renderer: EchoRenderer, mode: AnalysisMode) -> RuleEngine {
    RuleEngine::with_renderer(OptimizerConfig::new().with_mode(mode), Arc::new(renderer))
}

fn values_violation(engine: &RuleEngine, chart: &Chart, rule: &str) -> Violation {
    engine
        .check_chart_values(chart)
        .into_iter()
        .find(|v| v.rule_id == rule)
        .unwrap_or_else(|| panic!("{} not reported", rule))
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

// ============================================================================
// Rule evaluation
// ============================================================================

#[test]
fn values_mode_reports_ratio_and_single_replica() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    assert_eq!(chart.name, "web");
    assert_eq!(chart.team.as_deref(), Some("storefront"));

    let engine = engine(EchoRenderer::wired(), AnalysisMode::Values);
    let violations = engine.check_chart(&chart).unwrap();
    let ids: Vec<&str> = violations.iter().map(|v| v.rule_id.as_str()).collect();
    assert!(ids.contains(&"RES005"));
    assert!(ids.contains(&"AVL001"));
    assert!(!ids.contains(&"RES001"));
    assert!(!ids.contains(&"RES006"));

    // Same input, same output
    assert_eq!(violations, engine.check_chart(&chart).unwrap());
}

#[test]
fn rendered_mode_attributes_workloads() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();

    let engine = engine(EchoRenderer::wired(), AnalysisMode::Rendered);
    let violations = engine.check_chart(&chart).unwrap();
    let ratio = violations.iter().find(|v| v.rule_id == "RES005").unwrap();
    assert_eq!(ratio.workload.as_deref(), Some("Deployment/web"));
    assert_eq!(ratio.chart_name, "web");
}

// ============================================================================
// Verification
// ============================================================================

#[test]
fn preview_verifies_wired_fix() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let engine = engine(EchoRenderer::wired(), AnalysisMode::Rendered);
    let violation = values_violation(&engine, &chart, "RES005");

    let fix = CatalogFixGenerator::default().generate_fix(&chart, &violation).unwrap();
    let result = VerificationPipeline::new(&engine).verify_fix_preview(&chart, &violation, &fix.values_patch);

    assert_eq!(result.status, VerificationStatus::Verified);
    assert_eq!(result.present_before, Some(true));
    assert_eq!(result.present_after, Some(false));
    assert!(result.wiring.is_none());
    // Preview never touches the chart
    assert_eq!(read(&chart.path.join("values.yaml")), VALUES);
}

#[test]
fn preview_explains_unwired_fix() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let engine = engine(EchoRenderer::ignoring_replicas(), AnalysisMode::Rendered);
    let violation = values_violation(&engine, &chart, "AVL001");

    let fix = CatalogFixGenerator::default().generate_fix(&chart, &violation).unwrap();
    let result = VerificationPipeline::new(&engine).verify_fix_preview(&chart, &violation, &fix.values_patch);

    assert_eq!(result.status, VerificationStatus::Unresolved);
    assert_eq!(result.present_after, Some(true));
    let wiring = result.wiring.as_ref().unwrap();
    let unreferenced: Vec<&str> = wiring.unreferenced().map(|f| f.path.as_str()).collect();
    assert_eq!(unreferenced, vec!["replicaCount"]);
    assert!(!result.suggestions.is_empty());
}

#[test]
fn preview_is_unverified_when_render_fails() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let engine = engine(EchoRenderer::failing(), AnalysisMode::Rendered);
    let violation = values_violation(&engine, &chart, "RES005");

    let fix = CatalogFixGenerator::default().generate_fix(&chart, &violation).unwrap();
    let result = VerificationPipeline::new(&engine).verify_fix_preview(&chart, &violation, &fix.values_patch);
    assert_eq!(result.status, VerificationStatus::Unverified);
    assert!(result.message.to_lowercase().contains("render failed"));
}

#[test]
fn cluster_charts_are_not_verified() {
    let dir = TempDir::new().unwrap();
    let chart_dir = write_chart(dir.path());
    let values = parse_values_content(VALUES).unwrap();
    let chart = parse_release_values(&chart_dir, "web", "prod", &values).unwrap();

    let renderer = EchoRenderer::wired();
    let engine = RuleEngine::with_renderer(OptimizerConfig::new(), Arc::new(renderer));
    let violation = values_violation(&engine, &chart, "AVL001");
    let fix = CatalogFixGenerator::default().generate_fix(&chart, &violation).unwrap();

    let pipeline = VerificationPipeline::new(&engine);
    let result = pipeline.verify_fix_preview(&chart, &violation, &fix.values_patch);
    assert_eq!(result.status, VerificationStatus::NotRun);
    assert_eq!(pipeline.verify_after_apply(&chart, &violation).status, VerificationStatus::NotRun);
    assert!(matches!(
        apply_full_fix_bundle_atomic(&chart, &fix),
        Err(OptimizerError::Config(_))
    ));
}

#[test]
fn bundle_preview_reports_worst_status() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let engine = engine(EchoRenderer::ignoring_replicas(), AnalysisMode::Rendered);
    let violations = vec![
        values_violation(&engine, &chart, "RES005"),
        values_violation(&engine, &chart, "AVL001"),
    ];
    let bundle = combine_fixes(&CatalogFixGenerator::default(), &chart, &violations);

    let result = VerificationPipeline::new(&engine).verify_full_fix_bundle_preview(&chart, &violations, &bundle);
    assert_eq!(result.status, VerificationStatus::Unresolved);
    let status_of = |rule: &str| {
        result
            .per_violation
            .iter()
            .find(|p| p.rule_id == rule)
            .map(|p| p.status)
    };
    assert_eq!(status_of("RES005"), Some(VerificationStatus::Verified));
    assert_eq!(status_of("AVL001"), Some(VerificationStatus::Unresolved));
    assert!(result.wiring.is_some());
    assert_eq!(read(&chart.path.join("values.yaml")), VALUES);

    let empty = VerificationPipeline::new(&engine).verify_full_fix_bundle_preview(&chart, &[], &bundle);
    assert_eq!(empty.status, VerificationStatus::NotRun);
}

#[test]
fn after_apply_reads_chart_from_disk() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let engine = engine(EchoRenderer::wired(), AnalysisMode::Rendered);
    let violation = values_violation(&engine, &chart, "AVL001");
    let pipeline = VerificationPipeline::new(&engine);

    assert_eq!(
        pipeline.verify_after_apply(&chart, &violation).status,
        VerificationStatus::Unresolved
    );
    let fix = CatalogFixGenerator::default().generate_fix(&chart, &violation).unwrap();
    apply_full_fix_bundle_atomic(&chart, &fix).unwrap();
    assert_eq!(
        pipeline.verify_after_apply(&chart, &violation).status,
        VerificationStatus::Verified
    );
}

// ============================================================================
// Apply
// ============================================================================

#[test]
fn atomic_apply_keeps_untouched_bytes() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let engine = engine(EchoRenderer::wired(), AnalysisMode::Values);
    let violation = values_violation(&engine, &chart, "RES005");
    let fix = CatalogFixGenerator::default().generate_fix(&chart, &violation).unwrap();

    let result = apply_full_fix_bundle_atomic(&chart, &fix).unwrap();
    assert!(result.values_changed);
    assert_eq!(result.files_written.len(), 1);

    let after = read(&chart.path.join("values.yaml"));
    let untouched = &VALUES[..VALUES.find("resources:").unwrap()];
    assert!(after.starts_with(untouched), "prefix changed:\n{}", after);
    assert!(after.ends_with('\n'));

    let values = parse_values_content(&after).unwrap();
    assert_eq!(values["resources"]["requests"]["cpu"], Value::from("667m"));
    assert_eq!(values["resources"]["limits"]["cpu"], Value::from("1000m"));
    assert_eq!(values["resources"]["requests"]["memory"], Value::from("256Mi"));

    // Applying the same fix again changes nothing
    let again = apply_full_fix_bundle_atomic(&chart, &fix).unwrap();
    assert!(!again.values_changed);
    assert!(again.files_written.is_empty());
    assert_eq!(read(&chart.path.join("values.yaml")), after);
}

#[test]
fn atomic_apply_rolls_back_on_hunk_mismatch() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let bundle = PatchBundle {
        values_patch: nested_patch(&["replicaCount"], Value::from(2)),
        template_patches: vec![
            TemplatePatch {
                path: "templates/pdb.yaml".into(),
                body: TemplatePatchBody::Replacement("kind: PodDisruptionBudget\n".into()),
            },
            TemplatePatch {
                path: "templates/deployment.yaml".into(),
                body: TemplatePatchBody::UnifiedDiff(
                    "--- a/templates/deployment.yaml\n+++ b/templates/deployment.yaml\n@@ -6,1 +6,1 @@\n-  replicas: 3\n+  replicas: {{ .Values.replicaCount }}\n"
                        .into(),
                ),
            },
        ],
    };

    let err = apply_full_fix_bundle_atomic(&chart, &bundle).unwrap_err();
    assert!(matches!(err, OptimizerError::HunkMismatch { line: 6, .. }), "{}", err);
    assert!(!chart.path.join("templates/pdb.yaml").exists());
    assert_eq!(read(&chart.path.join("templates/deployment.yaml")), TEMPLATE);
    assert_eq!(read(&chart.path.join("values.yaml")), VALUES);
}

#[test]
fn atomic_apply_writes_templates_and_values() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let bundle = PatchBundle {
        values_patch: nested_patch(&["replicaCount"], Value::from(2)),
        template_patches: vec![TemplatePatch {
            path: "templates/deployment.yaml".into(),
            body: TemplatePatchBody::UnifiedDiff(
                "--- a/templates/deployment.yaml\n+++ b/templates/deployment.yaml\n@@ -6,1 +6,1 @@\n-  replicas: 1\n+  replicas: {{ .Values.replicaCount }}\n"
                    .into(),
            ),
        }],
    };

    let result = apply_full_fix_bundle_atomic(&chart, &bundle).unwrap();
    assert_eq!(result.files_written.len(), 2);
    assert!(read(&chart.path.join("templates/deployment.yaml")).contains("replicas: {{ .Values.replicaCount }}"));
    assert!(read(&chart.path.join("values.yaml")).starts_with("# Web frontend\nreplicaCount: 2\n\nimage:\n"));
}

#[test]
fn template_paths_outside_templates_are_rejected() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let bundle = PatchBundle {
        values_patch: Default::default(),
        template_patches: vec![TemplatePatch {
            path: "templates/../Chart.yaml".into(),
            body: TemplatePatchBody::Replacement("name: evil\n".into()),
        }],
    };
    assert!(matches!(
        apply_full_fix_bundle_atomic(&chart, &bundle),
        Err(OptimizerError::PathEscapesChart { .. })
    ));
    assert!(read(&chart.path.join("Chart.yaml")).contains("name: web"));
}

#[test]
fn concurrent_applies_to_one_chart_both_land() {
    let dir = TempDir::new().unwrap();
    let chart = Arc::new(parse_chart_dir(&write_chart(dir.path())).unwrap());

    let replicas = PatchBundle::from_values(nested_patch(&["replicaCount"], Value::from(3)));
    let cpu = PatchBundle::from_values(nested_patch(&["resources", "requests", "cpu"], Value::from("667m")));

    let handles: Vec<_> = [replicas, cpu]
        .into_iter()
        .map(|bundle| {
            let chart = Arc::clone(&chart);
            thread::spawn(move || apply_full_fix_bundle_atomic(&chart, &bundle).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let values = parse_values_content(&read(&chart.path.join("values.yaml"))).unwrap();
    assert_eq!(values["replicaCount"], Value::from(3));
    assert_eq!(values["resources"]["requests"]["cpu"], Value::from("667m"));
}

#[test]
fn staged_apply_promotes_verified_bundle() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let engine = engine(EchoRenderer::wired(), AnalysisMode::Rendered);
    let violations = vec![values_violation(&engine, &chart, "RES005")];
    let bundle = combine_fixes(&CatalogFixGenerator::default(), &chart, &violations);
    let pipeline = VerificationPipeline::new(&engine);

    let options = StagedApplyOptions {
        verify: Some((&pipeline, &violations)),
        require_verified: true,
    };
    let result = apply_full_fix_bundle_via_staged_replace(&chart, &bundle, &options).unwrap();
    assert!(result.values_changed);
    assert_eq!(
        result.verification.as_ref().map(|v| v.status),
        Some(VerificationStatus::Verified)
    );
    let values = parse_values_content(&read(&chart.path.join("values.yaml"))).unwrap();
    assert_eq!(values["resources"]["requests"]["cpu"], Value::from("667m"));
}

#[test]
fn staged_apply_holds_back_unverified_bundle() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let engine = engine(EchoRenderer::ignoring_replicas(), AnalysisMode::Rendered);
    let violations = vec![values_violation(&engine, &chart, "AVL001")];
    let bundle = combine_fixes(&CatalogFixGenerator::default(), &chart, &violations);
    let pipeline = VerificationPipeline::new(&engine);

    let options = StagedApplyOptions {
        verify: Some((&pipeline, &violations)),
        require_verified: true,
    };
    let result = apply_full_fix_bundle_via_staged_replace(&chart, &bundle, &options).unwrap();
    assert!(result.files_written.is_empty());
    assert_eq!(
        result.verification.map(|v| v.status),
        Some(VerificationStatus::Unresolved)
    );
    assert_eq!(read(&chart.path.join("values.yaml")), VALUES);

    let unguarded = StagedApplyOptions {
        verify: None,
        require_verified: true,
    };
    assert!(matches!(
        apply_full_fix_bundle_via_staged_replace(&chart, &bundle, &unguarded),
        Err(OptimizerError::Config(_))
    ));
}

#[test]
fn staged_apply_detects_concurrent_edit() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let values_path = chart.path.join("values.yaml");

    // Someone edits the original while the staged copy is being rendered
    let edited = values_path.clone();
    let renderer = EchoRenderer {
        on_render: Some(Box::new(move || {
            let mut text = fs::read_to_string(&edited).unwrap_or_default();
            text.push_str("podAnnotations: {}\n");
            fs::write(&edited, text).unwrap();
        })),
        ..EchoRenderer::wired()
    };
    let engine = engine(renderer, AnalysisMode::Rendered);
    let violations = vec![values_violation(&engine, &chart, "RES005")];
    let bundle = combine_fixes(&CatalogFixGenerator::default(), &chart, &violations);
    let pipeline = VerificationPipeline::new(&engine);

    let options = StagedApplyOptions {
        verify: Some((&pipeline, &violations)),
        require_verified: false,
    };
    let err = apply_full_fix_bundle_via_staged_replace(&chart, &bundle, &options).unwrap_err();
    assert!(matches!(err, OptimizerError::ConcurrentModification { .. }), "{}", err);

    // The concurrent edit survives and the fix was not promoted
    let text = read(&values_path);
    assert!(text.ends_with("podAnnotations: {}\n"));
    assert!(text.contains("cpu: 100m"));
}

#[test]
fn bundle_verification_renders_once() {
    let dir = TempDir::new().unwrap();
    let chart = parse_chart_dir(&write_chart(dir.path())).unwrap();
    let renderer = Arc::new(EchoRenderer::wired());
    let engine = RuleEngine::with_renderer(
        OptimizerConfig::new().with_mode(AnalysisMode::Rendered),
        renderer.clone(),
    );
    let violations = vec![
        values_violation(&engine, &chart, "RES005"),
        values_violation(&engine, &chart, "AVL001"),
    ];
    let bundle = combine_fixes(&CatalogFixGenerator::default(), &chart, &violations);

    let result = VerificationPipeline::new(&engine).verify_full_fix_bundle_preview(&chart, &violations, &bundle);
    assert_eq!(result.status, VerificationStatus::Verified);
    assert_eq!(result.per_violation.len(), 2);
    assert_eq!(renderer.renders.load(Ordering::SeqCst), 1);
}
