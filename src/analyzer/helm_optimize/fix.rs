//! Fix generation.
//!
//! [`FixGenerator`] turns a violation into a patch bundle. The bundled
//! [`CatalogFixGenerator`] uses each rule's own values fix; other generators
//! (for example model-backed ones that also produce template diffs)
//! implement the same trait.

use serde_yaml::{Mapping, Value};

use super::config::OptimizerConfig;
use super::rules::{RuleInput, deep_merge, find_rule};
use super::types::{Chart, PatchBundle, ValuesPatch, Violation};

/// Produces patch bundles for violations.
pub trait FixGenerator: Send + Sync {
    /// Patch bundle resolving `violation` on `chart`, or `None` when no fix is known.
    fn generate_fix(&self, chart: &Chart, violation: &Violation) -> Option<PatchBundle>;
}

/// Fix generator backed by the rule catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogFixGenerator {
    config: OptimizerConfig,
}

impl CatalogFixGenerator {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }
}

impl FixGenerator for CatalogFixGenerator {
    fn generate_fix(&self, chart: &Chart, violation: &Violation) -> Option<PatchBundle> {
        let rule = find_rule(&violation.rule_id)?;
        if !rule.auto_fixable() {
            return None;
        }
        let record = find_record(chart, violation)?;
        let input = RuleInput::from_chart(record);
        let patch = rule.fix(&input, violation, &self.config)?;
        Some(PatchBundle::from_values(nest_under(&violation.values_prefix(), patch)))
    }
}

/// Chart record a violation refers to: the chart itself or one of its sub-charts.
pub fn find_record<'a>(chart: &'a Chart, violation: &Violation) -> Option<&'a Chart> {
    chart
        .flatten()
        .into_iter()
        .find(|c| c.name == violation.chart_name && c.parent_chart == violation.parent_chart)
}

/// Nest a patch under a path of keys.
pub fn nest_under(prefix: &[String], patch: ValuesPatch) -> ValuesPatch {
    let mut current = patch;
    for key in prefix.iter().rev() {
        let mut map = Mapping::new();
        map.insert(Value::String(key.clone()), Value::Mapping(current));
        current = map;
    }
    current
}

/// Merge the fixes for several violations into one bundle.
pub fn combine_fixes(generator: &dyn FixGenerator, chart: &Chart, violations: &[Violation]) -> PatchBundle {
    let mut bundle = PatchBundle::default();
    for violation in violations {
        if let Some(fix) = generator.generate_fix(chart, violation) {
            deep_merge(&mut bundle.values_patch, &fix.values_patch);
            for template in fix.template_patches {
                if !bundle.template_patches.iter().any(|t| t.path == template.path) {
                    bundle.template_patches.push(template);
                }
            }
        }
    }
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::helm_optimize::types::{AnalysisSource, Severity, VerificationStatus};

    fn violation(rule: &str, chart: &str, parent: Option<&str>) -> Violation {
        Violation {
            rule_id: rule.into(),
            chart_name: chart.into(),
            parent_chart: parent.map(str::to_string),
            workload: None,
            current_value: String::new(),
            recommended_value: String::new(),
            severity: Severity::Medium,
            auto_fixable: true,
            source: AnalysisSource::Values,
            verification: VerificationStatus::NotRun,
            message: String::new(),
        }
    }

    #[test]
    fn test_sub_chart_fix_is_nested() {
        let sub = Chart {
            name: "api".into(),
            parent_chart: Some("platform".into()),
            replicas: 1,
            own_replicas: 1,
            ..Default::default()
        };
        let chart = Chart {
            name: "platform".into(),
            sub_charts: vec![sub],
            ..Default::default()
        };

        let generator = CatalogFixGenerator::default();
        let bundle = generator
            .generate_fix(&chart, &violation("AVL001", "api", Some("platform")))
            .unwrap();
        assert_eq!(
            serde_yaml::to_string(&bundle.values_patch).unwrap(),
            "api:\n  replicaCount: 2\n"
        );
    }

    #[test]
    fn test_unfixable_and_combined() {
        let chart = Chart {
            name: "web".into(),
            replicas: 1,
            own_replicas: 1,
            ..Default::default()
        };
        let generator = CatalogFixGenerator::default();
        assert!(generator.generate_fix(&chart, &violation("PRB001", "web", None)).is_none());

        let bundle = combine_fixes(
            &generator,
            &chart,
            &[violation("RES001", "web", None), violation("RES002", "web", None)],
        );
        assert_eq!(
            serde_yaml::to_string(&bundle.values_patch).unwrap(),
            "resources:\n  requests:\n    cpu: 100m\n    memory: 128Mi\n"
        );
    }
}
