//! Health probe rules (PRB001, PRB002).
//!
//! Probes need application knowledge (paths, ports), so neither rule is
//! auto-fixable.

use super::{Rule, RuleInput, codes};
use crate::analyzer::helm_optimize::config::OptimizerConfig;
use crate::analyzer::helm_optimize::types::{RuleCategory, Severity, Violation};
use crate::error::Result;

/// Rule: no liveness probe.
pub struct MissingLivenessProbeRule;

impl Rule for MissingLivenessProbeRule {
    fn code(&self) -> &'static str {
        codes::MISSING_LIVENESS_PROBE
    }

    fn description(&self) -> &'static str {
        "No liveness probe configured"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Probes
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn auto_fixable(&self) -> bool {
        false
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if input.probes.liveness || input.is_batch() {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            "none",
            "livenessProbe",
            "No liveness probe. A hung process keeps running until someone notices.",
        )])
    }
}

/// Rule: no readiness probe.
pub struct MissingReadinessProbeRule;

impl Rule for MissingReadinessProbeRule {
    fn code(&self) -> &'static str {
        codes::MISSING_READINESS_PROBE
    }

    fn description(&self) -> &'static str {
        "No readiness probe configured"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Probes
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn auto_fixable(&self) -> bool {
        false
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if input.probes.readiness || input.is_batch() {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            "none",
            "readinessProbe",
            "No readiness probe. Traffic is routed to pods before they can serve it.",
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::helm_optimize::types::ProbeFlags;

    #[test]
    fn test_probe_rules() {
        let config = OptimizerConfig::default();
        let mut input = RuleInput {
            chart_name: "api".into(),
            ..Default::default()
        };
        assert_eq!(MissingLivenessProbeRule.check(&input, &config).unwrap().len(), 1);
        assert_eq!(MissingReadinessProbeRule.check(&input, &config).unwrap().len(), 1);

        input.probes = ProbeFlags {
            liveness: true,
            readiness: true,
            startup: false,
        };
        assert!(MissingLivenessProbeRule.check(&input, &config).unwrap().is_empty());

        let batch = RuleInput {
            chart_name: "jobs".into(),
            kind: Some("CronJob".into()),
            ..Default::default()
        };
        assert!(MissingReadinessProbeRule.check(&batch, &config).unwrap().is_empty());
    }
}
