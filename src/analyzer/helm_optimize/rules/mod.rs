//! Rule catalog for Helm chart optimization.
//!
//! Every rule implements [`Rule`] and is registered once in a static catalog.
//! Rules see a [`RuleInput`], which is built either from a parsed chart
//! (values mode) or from one rendered workload (rendered mode).

mod availability;
mod probes;
mod resources;
mod security;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use serde_yaml::{Mapping, Value};

use crate::analyzer::helm_optimize::config::OptimizerConfig;
use crate::analyzer::helm_optimize::render::RenderedWorkload;
use crate::analyzer::helm_optimize::types::{
    AnalysisSource, AutoscalingSettings, Chart, ProbeFlags, ResourceFields, RuleCategory,
    SecuritySettings, Severity, ValuesPatch, VerificationStatus, Violation,
};
use crate::error::Result;

pub use availability::{MissingAntiAffinityRule, MissingPdbRule, NoPriorityClassRule, SingleReplicaRule};
pub use probes::{MissingLivenessProbeRule, MissingReadinessProbeRule};
pub use resources::{
    BestEffortQosRule, HighCpuRatioRule, HighMemoryRatioRule, MissingCpuLimitRule,
    MissingCpuRequestRule, MissingMemoryLimitRule, MissingMemoryRequestRule, DEFAULT_CPU_REQUEST,
    DEFAULT_MEMORY_REQUEST, ratio_fixed_request, recommended_cpu_limit, recommended_memory_limit,
};
pub use security::{PrivilegedContainerRule, RunAsNonRootRule};

// ============================================================================
// Rule Trait
// ============================================================================

/// A chart configuration rule.
pub trait Rule: Send + Sync {
    /// Rule code (e.g. "RES001").
    fn code(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn category(&self) -> RuleCategory;

    /// Default severity for this rule.
    fn severity(&self) -> Severity;

    /// Whether [`Rule::fix`] can produce a values patch.
    fn auto_fixable(&self) -> bool;

    /// Evaluate the rule against one input.
    fn check(&self, input: &RuleInput, config: &OptimizerConfig) -> Result<Vec<Violation>>;

    /// Values patch (relative to the chart's own values section) that resolves a violation.
    fn fix(&self, _input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        None
    }
}

/// Rule code constants.
pub mod codes {
    pub const MISSING_CPU_REQUEST: &str = "RES001";
    pub const MISSING_MEMORY_REQUEST: &str = "RES002";
    pub const MISSING_CPU_LIMIT: &str = "RES003";
    pub const MISSING_MEMORY_LIMIT: &str = "RES004";
    pub const HIGH_CPU_RATIO: &str = "RES005";
    pub const HIGH_MEMORY_RATIO: &str = "RES006";
    pub const BEST_EFFORT_QOS: &str = "RES007";
    pub const MISSING_LIVENESS_PROBE: &str = "PRB001";
    pub const MISSING_READINESS_PROBE: &str = "PRB002";
    pub const SINGLE_REPLICA: &str = "AVL001";
    pub const MISSING_PDB: &str = "AVL002";
    pub const MISSING_ANTI_AFFINITY: &str = "AVL003";
    pub const NO_PRIORITY_CLASS: &str = "AVL004";
    pub const RUN_AS_NON_ROOT: &str = "SEC001";
    pub const PRIVILEGED_CONTAINER: &str = "SEC002";
}

// ============================================================================
// Rule Registry
// ============================================================================

static CATALOG: LazyLock<Vec<Box<dyn Rule>>> = LazyLock::new(|| {
    vec![
        Box::new(MissingCpuRequestRule),
        Box::new(MissingMemoryRequestRule),
        Box::new(MissingCpuLimitRule),
        Box::new(MissingMemoryLimitRule),
        Box::new(HighCpuRatioRule),
        Box::new(HighMemoryRatioRule),
        Box::new(BestEffortQosRule),
        Box::new(MissingLivenessProbeRule),
        Box::new(MissingReadinessProbeRule),
        Box::new(SingleReplicaRule),
        Box::new(MissingPdbRule),
        Box::new(MissingAntiAffinityRule),
        Box::new(NoPriorityClassRule),
        Box::new(RunAsNonRootRule),
        Box::new(PrivilegedContainerRule),
    ]
});

/// All registered rules, in catalog order.
pub fn all_rules() -> &'static [Box<dyn Rule>] {
    &CATALOG
}

/// Look up a rule by code.
pub fn find_rule(code: &str) -> Option<&'static dyn Rule> {
    CATALOG
        .iter()
        .find(|r| r.code().eq_ignore_ascii_case(code))
        .map(|r| r.as_ref())
}

// ============================================================================
// Rule Input
// ============================================================================

/// Evaluation record for one chart (values mode) or one workload (rendered mode).
#[derive(Debug, Clone, Default)]
pub struct RuleInput {
    pub chart_name: String,
    pub parent_chart: Option<String>,
    /// `Kind/name` in rendered mode
    pub workload: Option<String>,
    /// Workload kind in rendered mode
    pub kind: Option<String>,
    pub source: AnalysisSource,
    pub resources: ResourceFields,
    pub probes: ProbeFlags,
    pub replicas: u32,
    pub autoscaling: AutoscalingSettings,
    pub pdb: bool,
    pub anti_affinity: bool,
    pub topology_spread: bool,
    pub priority_class: Option<String>,
    pub security: SecuritySettings,
    /// Rules disabled through annotations
    pub ignored_rules: BTreeSet<String>,
}

impl RuleInput {
    /// Build a values-mode input from a chart's own settings.
    pub fn from_chart(chart: &Chart) -> Self {
        Self {
            chart_name: chart.name.clone(),
            parent_chart: chart.parent_chart.clone(),
            workload: None,
            kind: None,
            source: AnalysisSource::Values,
            resources: chart.own_resources,
            probes: chart.probes,
            replicas: chart.own_replicas,
            autoscaling: chart.autoscaling,
            pdb: chart.pdb.as_ref().is_some_and(|p| p.enabled),
            anti_affinity: chart.anti_affinity,
            topology_spread: chart.topology_spread,
            priority_class: chart.priority_class.clone(),
            security: chart.security,
            ignored_rules: BTreeSet::new(),
        }
    }

    /// Build a rendered-mode input for one workload of `chart_name`.
    ///
    /// Workloads rendered from `charts/<sub>/` are attributed to the sub-chart.
    pub fn from_rendered(chart_name: &str, parent_chart: Option<&str>, workload: &RenderedWorkload) -> Self {
        let (chart_name, parent_chart) = match &workload.sub_chart {
            Some(sub) => (sub.clone(), Some(chart_name.to_string())),
            None => (chart_name.to_string(), parent_chart.map(str::to_string)),
        };

        Self {
            chart_name,
            parent_chart,
            workload: Some(workload.label()),
            kind: Some(workload.kind.clone()),
            source: AnalysisSource::Rendered,
            resources: workload.resources(),
            probes: workload.probes(),
            replicas: workload.replicas,
            autoscaling: AutoscalingSettings {
                // An explicit spec.replicas takes precedence over the HPA minimum
                enabled: workload.hpa_min_replicas.is_some() && !workload.explicit_replicas,
                min_replicas: workload.hpa_min_replicas,
                max_replicas: None,
            },
            pdb: workload.pdb,
            anti_affinity: workload.anti_affinity,
            topology_spread: workload.topology_spread,
            priority_class: workload.priority_class.clone(),
            security: workload.security(),
            ignored_rules: workload.ignored_rules.clone(),
        }
    }

    /// Replica floor: the HPA minimum when autoscaling, else the fixed count.
    pub fn effective_replicas(&self) -> u32 {
        if self.autoscaling.enabled {
            self.autoscaling.min_replicas.unwrap_or(1).max(1)
        } else {
            self.replicas
        }
    }

    /// Whether replica-oriented rules make sense for this input.
    pub fn is_scalable(&self) -> bool {
        match self.kind.as_deref() {
            None => true,
            Some(kind) => matches!(kind, "Deployment" | "StatefulSet" | "ReplicaSet"),
        }
    }

    /// Whether this input runs to completion rather than serving traffic.
    pub fn is_batch(&self) -> bool {
        matches!(self.kind.as_deref(), Some("Job" | "CronJob"))
    }

    /// Create a violation for `rule` on this input.
    pub fn violation(
        &self,
        rule: &dyn Rule,
        current: impl Into<String>,
        recommended: impl Into<String>,
        message: impl Into<String>,
    ) -> Violation {
        Violation {
            rule_id: rule.code().to_string(),
            chart_name: self.chart_name.clone(),
            parent_chart: self.parent_chart.clone(),
            workload: self.workload.clone(),
            current_value: current.into(),
            recommended_value: recommended.into(),
            severity: rule.severity(),
            auto_fixable: rule.auto_fixable(),
            source: self.source,
            verification: VerificationStatus::NotRun,
            message: message.into(),
        }
    }
}

// ============================================================================
// Patch helpers
// ============================================================================

/// Build a nested patch setting `path` to `value`.
pub fn nested_patch(path: &[&str], value: Value) -> ValuesPatch {
    let mut current = value;
    for key in path.iter().rev() {
        let mut map = Mapping::new();
        map.insert(Value::String((*key).to_string()), current);
        current = Value::Mapping(map);
    }
    match current {
        Value::Mapping(m) => m,
        _ => Mapping::new(),
    }
}

/// Merge `overlay` into `base`, recursing into nested mappings.
pub fn deep_merge(base: &mut Mapping, overlay: &Mapping) {
    for (key, value) in overlay {
        if let (Some(Value::Mapping(existing)), Value::Mapping(incoming)) = (base.get_mut(key), value) {
            deep_merge(existing, incoming);
            continue;
        }
        base.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_codes_unique() {
        let codes: BTreeSet<_> = all_rules().iter().map(|r| r.code()).collect();
        assert_eq!(codes.len(), all_rules().len());
        assert_eq!(all_rules().len(), 15);
        assert!(find_rule("res005").is_some());
        assert!(find_rule("NOPE").is_none());
    }

    #[test]
    fn test_nested_patch_and_merge() {
        let mut patch = nested_patch(&["resources", "requests", "cpu"], Value::from("100m"));
        deep_merge(
            &mut patch,
            &nested_patch(&["resources", "requests", "memory"], Value::from("128Mi")),
        );
        let yaml = serde_yaml::to_string(&patch).unwrap();
        assert_eq!(yaml, "resources:\n  requests:\n    cpu: 100m\n    memory: 128Mi\n");
    }

    #[test]
    fn test_rendered_input_attribution() {
        let workload = RenderedWorkload {
            kind: "Deployment".into(),
            name: Some("api".into()),
            sub_chart: Some("api".into()),
            replicas: 1,
            ..Default::default()
        };
        let input = RuleInput::from_rendered("platform", None, &workload);
        assert_eq!(input.chart_name, "api");
        assert_eq!(input.parent_chart.as_deref(), Some("platform"));
        assert_eq!(input.workload.as_deref(), Some("Deployment/api"));
    }
}
