//! Verification pipeline.
//!
//! Confirms a fix by rendering the chart and re-running the violated rule
//! on the output. Statuses:
//!
//! - `verified`: the violation is gone after the fix
//! - `unresolved`: it is still there; a wiring diagnosis explains why
//! - `unverified`: rendering or rule evaluation failed, so nothing is known
//! - `not_run`: the chart is not backed by a local values file

pub mod wiring;

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;
use tempfile::TempDir;

use super::apply::{canonical_chart_path, copy_chart_tree, write_bundle};
use super::engine::RuleEngine;
use super::render::{RenderOutcome, RenderValues};
use super::types::{AnalysisSource, Chart, PatchBundle, ValuesPatch, VerificationStatus, Violation};
use super::values_patcher::patch_values_yaml;
use crate::error::Result;

pub use wiring::{WiringDiagnosis, WiringFinding, WiringStatus, diagnose_wiring};

/// Verification outcome for one violation of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationVerification {
    pub rule_id: String,
    pub chart_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chart: Option<String>,
    pub status: VerificationStatus,
    pub message: String,
}

/// Result of a verification run.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub message: String,
    /// Whether the violation showed up before the fix (preview only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub present_before: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub present_after: Option<bool>,
    /// A render had to drop the chart's dependencies
    pub rendered_parent_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wiring: Option<WiringDiagnosis>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub per_violation: Vec<ViolationVerification>,
}

impl VerificationResult {
    fn new(status: VerificationStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            present_before: None,
            present_after: None,
            rendered_parent_only: false,
            wiring: None,
            suggestions: Vec::new(),
            per_violation: Vec::new(),
        }
    }

    fn not_run(message: impl Into<String>) -> Self {
        Self::new(VerificationStatus::NotRun, message)
    }

    fn unverified(message: impl Into<String>) -> Self {
        Self::new(VerificationStatus::Unverified, message)
    }

    fn for_all(mut self, violations: &[Violation]) -> Self {
        self.per_violation = violations
            .iter()
            .map(|v| ViolationVerification {
                rule_id: v.rule_id.clone(),
                chart_name: v.chart_name.clone(),
                parent_chart: v.parent_chart.clone(),
                status: self.status,
                message: self.message.clone(),
            })
            .collect();
        self
    }
}

/// Attach verification statuses to violations.
///
/// Violations covered by a per-violation entry take that status; all others
/// take the overall status.
pub fn attach_status(violations: &mut [Violation], result: &VerificationResult) {
    for violation in violations.iter_mut() {
        let status = result
            .per_violation
            .iter()
            .find(|p| {
                p.rule_id == violation.rule_id
                    && p.chart_name == violation.chart_name
                    && p.parent_chart == violation.parent_chart
            })
            .map(|p| p.status)
            .unwrap_or(result.status);
        violation.verification = status;
    }
}

/// Renders charts before and after fixes and re-evaluates rules.
///
/// Chart arguments are top-level chart records; violations on sub-charts are
/// matched through their parent back-reference.
pub struct VerificationPipeline<'a> {
    engine: &'a RuleEngine,
}

impl<'a> VerificationPipeline<'a> {
    pub fn new(engine: &'a RuleEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &RuleEngine {
        self.engine
    }

    // ========================================================================
    // Single violation
    // ========================================================================

    /// Render current values and values with `patch` merged, and compare.
    pub fn verify_fix_preview(&self, chart: &Chart, violation: &Violation, patch: &ValuesPatch) -> VerificationResult {
        let Some(values_file) = local_values_file(chart) else {
            return VerificationResult::not_run(format!("{} is not backed by a local values file", chart.name));
        };
        if !self.engine.renderer_available() {
            return VerificationResult::unverified("renderer unavailable");
        }

        let before_text = match fs::read_to_string(values_file) {
            Ok(text) => text,
            Err(e) => return VerificationResult::unverified(format!("cannot read {}: {}", values_file.display(), e)),
        };
        let after_text = match patch_values_yaml(&before_text, patch) {
            Ok(text) => text,
            Err(e) => return VerificationResult::unverified(format!("cannot merge patch: {}", e)),
        };

        let before = self.render(chart, &chart.path, RenderValues::Inline(before_text.clone()));
        let after = self.render(chart, &chart.path, RenderValues::Inline(after_text.clone()));
        let parent_only = before.parent_only || after.parent_only;

        let present_before = match self.presence(chart, violation, before) {
            Ok(p) => p,
            Err(e) => return with_parent_only(VerificationResult::unverified(e.to_string()), parent_only),
        };
        let present_after = match self.presence(chart, violation, after) {
            Ok(p) => p,
            Err(e) => return with_parent_only(VerificationResult::unverified(e.to_string()), parent_only),
        };

        let mut result = if present_after {
            let diagnosis = diagnose_wiring(&chart.path, patch);
            let preview = wiring::values_diff_preview(&before_text, &after_text, &file_label(values_file));
            let mut r = VerificationResult::new(
                VerificationStatus::Unresolved,
                format!("{} still reported after the fix", violation.rule_id),
            );
            r.suggestions = wiring::suggestions(&diagnosis, Some(preview));
            r.wiring = Some(diagnosis);
            r
        } else if present_before {
            VerificationResult::new(VerificationStatus::Verified, format!("{} resolved", violation.rule_id))
        } else {
            VerificationResult::new(
                VerificationStatus::Verified,
                format!("{} not present in rendered output before or after the fix", violation.rule_id),
            )
        };
        result.present_before = Some(present_before);
        result.present_after = Some(present_after);
        result.rendered_parent_only = parent_only;
        debug!("Preview of {} on {}: {}", violation.rule_id, chart.name, result.status);
        result
    }

    /// Render the chart as it is on disk and check the violation is gone.
    pub fn verify_after_apply(&self, chart: &Chart, violation: &Violation) -> VerificationResult {
        let Some(values_file) = local_values_file(chart) else {
            return VerificationResult::not_run(format!("{} is not backed by a local values file", chart.name));
        };
        if !self.engine.renderer_available() {
            return VerificationResult::unverified("renderer unavailable");
        }

        let outcome = self.render(chart, &chart.path, RenderValues::File(values_file.to_path_buf()));
        let parent_only = outcome.parent_only;
        let mut result = match self.presence(chart, violation, outcome) {
            Ok(true) => VerificationResult::new(
                VerificationStatus::Unresolved,
                format!("{} still reported after apply", violation.rule_id),
            ),
            Ok(false) => VerificationResult::new(VerificationStatus::Verified, format!("{} resolved", violation.rule_id)),
            Err(e) => VerificationResult::unverified(e.to_string()),
        };
        result.present_after = match result.status {
            VerificationStatus::Unresolved => Some(true),
            VerificationStatus::Verified => Some(false),
            _ => None,
        };
        result.rendered_parent_only = parent_only;
        result
    }

    // ========================================================================
    // Bundles
    // ========================================================================

    /// Stage a copy of the chart, apply `bundle` there and verify the copy.
    pub fn verify_full_fix_bundle_preview(
        &self,
        chart: &Chart,
        violations: &[Violation],
        bundle: &PatchBundle,
    ) -> VerificationResult {
        if local_values_file(chart).is_none() {
            return VerificationResult::not_run(format!("{} is not backed by a local values file", chart.name))
                .for_all(violations);
        }
        let Some(values_rel) = values_relative(chart) else {
            return VerificationResult::unverified("values file lies outside the chart directory").for_all(violations);
        };

        let staged = match stage_bundle(chart, &values_rel, bundle) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Could not stage fix bundle for {}: {}", chart.name, e);
                return VerificationResult::unverified(format!("bundle does not apply: {}", e)).for_all(violations);
            }
        };
        self.verify_full_fix_bundle_staged(chart, staged.path(), violations, bundle)
    }

    /// Render an already-staged chart copy once and evaluate every violation.
    pub fn verify_full_fix_bundle_staged(
        &self,
        chart: &Chart,
        staged_dir: &Path,
        violations: &[Violation],
        bundle: &PatchBundle,
    ) -> VerificationResult {
        if local_values_file(chart).is_none() {
            return VerificationResult::not_run(format!("{} is not backed by a local values file", chart.name))
                .for_all(violations);
        }
        if violations.is_empty() {
            return VerificationResult::not_run("no violations to verify");
        }
        let Some(values_rel) = values_relative(chart) else {
            return VerificationResult::unverified("values file lies outside the chart directory").for_all(violations);
        };
        if !self.engine.renderer_available() {
            return VerificationResult::unverified("renderer unavailable").for_all(violations);
        }

        let outcome = self.render(chart, staged_dir, RenderValues::File(staged_dir.join(&values_rel)));
        let parent_only = outcome.parent_only;
        if !outcome.is_success() {
            let mut result = VerificationResult::unverified(outcome.describe_failure()).for_all(violations);
            result.rendered_parent_only = parent_only;
            return result;
        }
        let manifest = outcome.manifest;

        let per_violation: Vec<ViolationVerification> = violations
            .iter()
            .map(|v| {
                let (status, message) = match self.present_in(chart, v, &manifest) {
                    Ok(true) => (VerificationStatus::Unresolved, "still reported".to_string()),
                    Ok(false) => (VerificationStatus::Verified, "resolved".to_string()),
                    Err(e) => (VerificationStatus::Unverified, e.to_string()),
                };
                ViolationVerification {
                    rule_id: v.rule_id.clone(),
                    chart_name: v.chart_name.clone(),
                    parent_chart: v.parent_chart.clone(),
                    status,
                    message,
                }
            })
            .collect();

        let status = per_violation
            .iter()
            .map(|p| p.status)
            .fold(VerificationStatus::Verified, VerificationStatus::worst);
        let resolved = per_violation
            .iter()
            .filter(|p| p.status == VerificationStatus::Verified)
            .count();

        let mut result = VerificationResult::new(
            status,
            format!("{}/{} violation(s) resolved in staged render", resolved, per_violation.len()),
        );
        result.rendered_parent_only = parent_only;

        if per_violation.iter().any(|p| p.status == VerificationStatus::Unresolved) {
            let diagnosis = diagnose_wiring(staged_dir, &bundle.values_patch);
            let preview = match (
                chart.values_file.as_deref().map(fs::read_to_string),
                fs::read_to_string(staged_dir.join(&values_rel)),
            ) {
                (Some(Ok(before)), Ok(after)) => {
                    Some(wiring::values_diff_preview(&before, &after, &values_rel.display().to_string()))
                }
                _ => None,
            };
            result.suggestions = wiring::suggestions(&diagnosis, preview);
            result.wiring = Some(diagnosis);
        }
        result.per_violation = per_violation;
        info!("Bundle verification for {}: {}", chart.name, result.message);
        result
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn render(&self, chart: &Chart, chart_dir: &Path, values: RenderValues) -> RenderOutcome {
        let mut request = self.engine.render_request(chart, values);
        request.chart_dir = chart_dir.to_path_buf();
        self.engine.renderer().render(&request)
    }

    fn presence(&self, chart: &Chart, violation: &Violation, outcome: RenderOutcome) -> Result<bool> {
        let manifest = outcome.into_manifest()?;
        self.present_in(chart, violation, &manifest)
    }

    fn present_in(&self, chart: &Chart, violation: &Violation, manifest: &str) -> Result<bool> {
        let found = self.engine.evaluate_rule_on_manifest(
            &violation.rule_id,
            &chart.name,
            chart.parent_chart.as_deref(),
            manifest,
        )?;
        Ok(found.iter().any(|f| same_finding(f, violation)))
    }
}

/// Whether a re-evaluated violation is the same finding as `target`.
fn same_finding(found: &Violation, target: &Violation) -> bool {
    if found.rule_id != target.rule_id
        || found.chart_name != target.chart_name
        || found.parent_chart != target.parent_chart
    {
        return false;
    }
    match (&target.workload, target.source) {
        (Some(workload), AnalysisSource::Rendered) => found.workload.as_ref() == Some(workload),
        _ => true,
    }
}

fn with_parent_only(mut result: VerificationResult, parent_only: bool) -> VerificationResult {
    result.rendered_parent_only = parent_only;
    result
}

fn local_values_file(chart: &Chart) -> Option<&Path> {
    if chart.is_local() {
        chart.values_file.as_deref()
    } else {
        None
    }
}

/// Values file relative to the chart directory.
fn values_relative(chart: &Chart) -> Option<PathBuf> {
    let root = canonical_chart_path(&chart.path);
    let values = canonical_chart_path(chart.values_file.as_deref()?);
    values.strip_prefix(&root).ok().map(Path::to_path_buf)
}

fn stage_bundle(chart: &Chart, values_rel: &Path, bundle: &PatchBundle) -> Result<TempDir> {
    let staged = tempfile::Builder::new().prefix("helm-verify-").tempdir()?;
    copy_chart_tree(&chart.path, staged.path())?;
    write_bundle(staged.path(), &staged.path().join(values_rel), bundle)?;
    Ok(staged)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "values.yaml".to_string())
}
