//! Availability rules (AVL001-AVL004).

use serde_yaml::{Mapping, Value};

use super::{Rule, RuleInput, codes, nested_patch};
use crate::analyzer::helm_optimize::config::OptimizerConfig;
use crate::analyzer::helm_optimize::types::{RuleCategory, Severity, ValuesPatch, Violation};
use crate::error::Result;

/// Rule: a single replica.
pub struct SingleReplicaRule;

impl Rule for SingleReplicaRule {
    fn code(&self) -> &'static str {
        codes::SINGLE_REPLICA
    }

    fn description(&self) -> &'static str {
        "Workload runs a single replica"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Availability
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, config: &OptimizerConfig) -> Result<Vec<Violation>> {
        let replicas = input.effective_replicas();
        if !input.is_scalable() || replicas > 1 || config.min_replicas <= 1 {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            replicas.to_string(),
            config.min_replicas.to_string(),
            "Only one replica. Any restart, eviction or node drain is an outage.",
        )])
    }

    fn fix(&self, input: &RuleInput, _violation: &Violation, config: &OptimizerConfig) -> Option<ValuesPatch> {
        let target = Value::from(config.min_replicas);
        if input.autoscaling.enabled {
            Some(nested_patch(&["autoscaling", "minReplicas"], target))
        } else {
            Some(nested_patch(&["replicaCount"], target))
        }
    }
}

/// Rule: several replicas but no PodDisruptionBudget.
pub struct MissingPdbRule;

impl Rule for MissingPdbRule {
    fn code(&self) -> &'static str {
        codes::MISSING_PDB
    }

    fn description(&self) -> &'static str {
        "Replicated workload has no PodDisruptionBudget"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Availability
    }

    fn severity(&self) -> Severity {
        Severity::Low
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if !input.is_scalable() || input.effective_replicas() < 2 || input.pdb {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            "no PodDisruptionBudget",
            "podDisruptionBudget.minAvailable: 1",
            "Multiple replicas without a PodDisruptionBudget. A node drain may evict all of them at once.",
        )])
    }

    fn fix(&self, _input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        let mut pdb = Mapping::new();
        pdb.insert(Value::from("enabled"), Value::Bool(true));
        pdb.insert(Value::from("minAvailable"), Value::from(1));
        Some(nested_patch(&["podDisruptionBudget"], Value::Mapping(pdb)))
    }
}

/// Rule: several replicas that may all land on one node.
pub struct MissingAntiAffinityRule;

impl Rule for MissingAntiAffinityRule {
    fn code(&self) -> &'static str {
        codes::MISSING_ANTI_AFFINITY
    }

    fn description(&self) -> &'static str {
        "Replicated workload has no anti-affinity or topology spread"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Availability
    }

    fn severity(&self) -> Severity {
        Severity::Low
    }

    fn auto_fixable(&self) -> bool {
        false
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if !input.is_scalable()
            || input.effective_replicas() < 2
            || input.anti_affinity
            || input.topology_spread
        {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            "no spreading",
            "podAntiAffinity or topologySpreadConstraints",
            "Replicas may be co-located on one node, so one node failure takes them all down.",
        )])
    }
}

/// Rule: no priority class.
pub struct NoPriorityClassRule;

impl Rule for NoPriorityClassRule {
    fn code(&self) -> &'static str {
        codes::NO_PRIORITY_CLASS
    }

    fn description(&self) -> &'static str {
        "No priority class set"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Availability
    }

    fn severity(&self) -> Severity {
        Severity::Info
    }

    fn auto_fixable(&self) -> bool {
        false
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if input.priority_class.as_deref().is_some_and(|p| !p.is_empty()) || input.is_batch() {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            "unset",
            "priorityClassName",
            "No priority class. Under pressure the scheduler cannot tell this workload from batch jobs.",
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::helm_optimize::types::AutoscalingSettings;

    fn input(replicas: u32) -> RuleInput {
        RuleInput {
            chart_name: "api".into(),
            replicas,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_replica() {
        let config = OptimizerConfig::default();
        let v = SingleReplicaRule.check(&input(1), &config).unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].recommended_value, "2");
        assert!(SingleReplicaRule.check(&input(3), &config).unwrap().is_empty());

        let patch = SingleReplicaRule.fix(&input(1), &v[0], &config).unwrap();
        assert_eq!(serde_yaml::to_string(&patch).unwrap(), "replicaCount: 2\n");
    }

    #[test]
    fn test_single_replica_autoscaled() {
        let config = OptimizerConfig::default();
        let mut hpa = input(1);
        hpa.autoscaling = AutoscalingSettings {
            enabled: true,
            min_replicas: Some(3),
            max_replicas: Some(10),
        };
        assert!(SingleReplicaRule.check(&hpa, &config).unwrap().is_empty());

        hpa.autoscaling.min_replicas = Some(1);
        let v = SingleReplicaRule.check(&hpa, &config).unwrap();
        let patch = SingleReplicaRule.fix(&hpa, &v[0], &config).unwrap();
        assert_eq!(
            serde_yaml::to_string(&patch).unwrap(),
            "autoscaling:\n  minReplicas: 2\n"
        );
    }

    #[test]
    fn test_daemonset_skips_replica_rules() {
        let config = OptimizerConfig::default();
        let mut ds = input(1);
        ds.kind = Some("DaemonSet".into());
        assert!(SingleReplicaRule.check(&ds, &config).unwrap().is_empty());
    }

    #[test]
    fn test_pdb_and_spread() {
        let config = OptimizerConfig::default();
        let replicated = input(3);
        assert_eq!(MissingPdbRule.check(&replicated, &config).unwrap().len(), 1);
        assert_eq!(MissingAntiAffinityRule.check(&replicated, &config).unwrap().len(), 1);

        let mut covered = input(3);
        covered.pdb = true;
        covered.topology_spread = true;
        assert!(MissingPdbRule.check(&covered, &config).unwrap().is_empty());
        assert!(MissingAntiAffinityRule.check(&covered, &config).unwrap().is_empty());
        assert!(MissingPdbRule.check(&input(1), &config).unwrap().is_empty());
    }
}
