//! Security context rules (SEC001, SEC002).

use serde_yaml::Value;

use super::{Rule, RuleInput, codes, nested_patch};
use crate::analyzer::helm_optimize::config::OptimizerConfig;
use crate::analyzer::helm_optimize::types::{RuleCategory, Severity, ValuesPatch, Violation};
use crate::error::Result;

/// Rule: containers may run as root.
pub struct RunAsNonRootRule;

impl Rule for RunAsNonRootRule {
    fn code(&self) -> &'static str {
        codes::RUN_AS_NON_ROOT
    }

    fn description(&self) -> &'static str {
        "runAsNonRoot is not enforced"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Security
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        let current = match input.security.run_as_non_root {
            Some(true) => return Ok(Vec::new()),
            Some(false) => "false",
            None => "unset",
        };
        Ok(vec![input.violation(
            self,
            current,
            "true",
            "runAsNonRoot is not enforced; a container image running as root is not rejected.",
        )])
    }

    fn fix(&self, _input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        Some(nested_patch(&["securityContext", "runAsNonRoot"], Value::Bool(true)))
    }
}

/// Rule: privileged container.
pub struct PrivilegedContainerRule;

impl Rule for PrivilegedContainerRule {
    fn code(&self) -> &'static str {
        codes::PRIVILEGED_CONTAINER
    }

    fn description(&self) -> &'static str {
        "Container runs privileged"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Security
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if !input.security.privileged {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            "true",
            "false",
            "Privileged containers have full access to the host.",
        )])
    }

    fn fix(&self, _input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        Some(nested_patch(&["securityContext", "privileged"], Value::Bool(false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::helm_optimize::types::SecuritySettings;

    #[test]
    fn test_security_rules() {
        let config = OptimizerConfig::default();
        let mut input = RuleInput {
            chart_name: "api".into(),
            ..Default::default()
        };
        assert_eq!(RunAsNonRootRule.check(&input, &config).unwrap()[0].current_value, "unset");
        assert!(PrivilegedContainerRule.check(&input, &config).unwrap().is_empty());

        input.security = SecuritySettings {
            run_as_non_root: Some(true),
            privileged: true,
            read_only_root_filesystem: None,
        };
        assert!(RunAsNonRootRule.check(&input, &config).unwrap().is_empty());
        let v = PrivilegedContainerRule.check(&input, &config).unwrap();
        assert_eq!(v[0].severity, Severity::Critical);
    }
}
