//! Resource sizing rules (RES001-RES007).

use serde_yaml::Value;

use super::{Rule, RuleInput, codes, nested_patch};
use crate::analyzer::helm_optimize::config::OptimizerConfig;
use crate::analyzer::helm_optimize::parser::quantity::{
    bytes_to_memory_string, describe_cpu, describe_memory, millicores_to_cpu_string,
};
use crate::analyzer::helm_optimize::types::{QosClass, RuleCategory, Severity, ValuesPatch, Violation};
use crate::error::Result;

/// Default CPU request added when none is set (millicores).
pub const DEFAULT_CPU_REQUEST: u64 = 100;
/// Default memory request added when none is set (bytes).
pub const DEFAULT_MEMORY_REQUEST: u64 = 128 * 1024 * 1024;
/// CPU limit used when neither limit nor request is set (millicores).
pub const DEFAULT_CPU_LIMIT: u64 = 500;
/// Memory limit used when neither limit nor request is set (bytes).
pub const DEFAULT_MEMORY_LIMIT: u64 = 256 * 1024 * 1024;
/// Limits are recommended at this multiple of the request.
pub const LIMIT_TO_REQUEST_FACTOR: u64 = 2;
/// Ratio fixes raise the request to `limit / RATIO_FIX_DIVISOR`.
pub const RATIO_FIX_DIVISOR: f64 = 1.5;

/// Recommended CPU limit for a request.
pub fn recommended_cpu_limit(request: Option<u64>) -> u64 {
    match request {
        Some(r) if r > 0 => r * LIMIT_TO_REQUEST_FACTOR,
        _ => DEFAULT_CPU_LIMIT,
    }
}

/// Recommended memory limit for a request.
pub fn recommended_memory_limit(request: Option<u64>) -> u64 {
    match request {
        Some(r) if r > 0 => r * LIMIT_TO_REQUEST_FACTOR,
        _ => DEFAULT_MEMORY_LIMIT,
    }
}

/// Request that brings a limit/request ratio back to 1.5.
pub fn ratio_fixed_request(limit: u64) -> u64 {
    (limit as f64 / RATIO_FIX_DIVISOR).ceil() as u64
}

fn unset(value: Option<u64>) -> bool {
    value.unwrap_or(0) == 0
}

fn ratio(limit: Option<u64>, request: Option<u64>) -> Option<f64> {
    match (limit, request) {
        (Some(l), Some(r)) if r > 0 && l > 0 => Some(l as f64 / r as f64),
        _ => None,
    }
}

// ============================================================================
// RES001 / RES002: missing requests
// ============================================================================

/// Rule: no CPU request defined.
pub struct MissingCpuRequestRule;

impl Rule for MissingCpuRequestRule {
    fn code(&self) -> &'static str {
        codes::MISSING_CPU_REQUEST
    }

    fn description(&self) -> &'static str {
        "No CPU request defined"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Resources
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if !unset(input.resources.cpu_request) {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            describe_cpu(input.resources.cpu_request),
            millicores_to_cpu_string(DEFAULT_CPU_REQUEST),
            "No CPU request defined. The scheduler cannot place the pod reliably and it may be starved under contention.",
        )])
    }

    fn fix(&self, _input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        Some(nested_patch(
            &["resources", "requests", "cpu"],
            Value::from(millicores_to_cpu_string(DEFAULT_CPU_REQUEST)),
        ))
    }
}

/// Rule: no memory request defined.
pub struct MissingMemoryRequestRule;

impl Rule for MissingMemoryRequestRule {
    fn code(&self) -> &'static str {
        codes::MISSING_MEMORY_REQUEST
    }

    fn description(&self) -> &'static str {
        "No memory request defined"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Resources
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if !unset(input.resources.memory_request) {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            describe_memory(input.resources.memory_request),
            bytes_to_memory_string(DEFAULT_MEMORY_REQUEST),
            "No memory request defined. The pod is first in line for eviction under memory pressure.",
        )])
    }

    fn fix(&self, _input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        Some(nested_patch(
            &["resources", "requests", "memory"],
            Value::from(bytes_to_memory_string(DEFAULT_MEMORY_REQUEST)),
        ))
    }
}

// ============================================================================
// RES003 / RES004: missing limits
// ============================================================================

/// Rule: no CPU limit defined.
pub struct MissingCpuLimitRule;

impl Rule for MissingCpuLimitRule {
    fn code(&self) -> &'static str {
        codes::MISSING_CPU_LIMIT
    }

    fn description(&self) -> &'static str {
        "No CPU limit defined"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Resources
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if !unset(input.resources.cpu_limit) {
            return Ok(Vec::new());
        }
        let recommended = recommended_cpu_limit(input.resources.cpu_request);
        Ok(vec![input.violation(
            self,
            describe_cpu(input.resources.cpu_limit),
            millicores_to_cpu_string(recommended),
            "No CPU limit defined. A busy pod can consume all CPU on its node.",
        )])
    }

    fn fix(&self, input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        let limit = recommended_cpu_limit(input.resources.cpu_request);
        Some(nested_patch(
            &["resources", "limits", "cpu"],
            Value::from(millicores_to_cpu_string(limit)),
        ))
    }
}

/// Rule: no memory limit defined.
pub struct MissingMemoryLimitRule;

impl Rule for MissingMemoryLimitRule {
    fn code(&self) -> &'static str {
        codes::MISSING_MEMORY_LIMIT
    }

    fn description(&self) -> &'static str {
        "No memory limit defined"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Resources
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if !unset(input.resources.memory_limit) {
            return Ok(Vec::new());
        }
        let recommended = recommended_memory_limit(input.resources.memory_request);
        Ok(vec![input.violation(
            self,
            describe_memory(input.resources.memory_limit),
            bytes_to_memory_string(recommended),
            "No memory limit defined. A leaking pod can exhaust node memory and trigger OOM kills elsewhere.",
        )])
    }

    fn fix(&self, input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        let limit = recommended_memory_limit(input.resources.memory_request);
        Some(nested_patch(
            &["resources", "limits", "memory"],
            Value::from(bytes_to_memory_string(limit)),
        ))
    }
}

// ============================================================================
// RES005 / RES006: limit to request ratio
// ============================================================================

/// Rule: CPU limit to request ratio is excessive.
pub struct HighCpuRatioRule;

impl Rule for HighCpuRatioRule {
    fn code(&self) -> &'static str {
        codes::HIGH_CPU_RATIO
    }

    fn description(&self) -> &'static str {
        "CPU limit to request ratio is excessive"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Resources
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, config: &OptimizerConfig) -> Result<Vec<Violation>> {
        let Some(ratio) = ratio(input.resources.cpu_limit, input.resources.cpu_request) else {
            return Ok(Vec::new());
        };
        if ratio <= config.max_cpu_limit_ratio {
            return Ok(Vec::new());
        }
        let limit = input.resources.cpu_limit.unwrap_or_default();
        Ok(vec![input.violation(
            self,
            format!("request {}", describe_cpu(input.resources.cpu_request)),
            format!("request {}", millicores_to_cpu_string(ratio_fixed_request(limit))),
            format!(
                "CPU limit to request ratio is {:.1}x (threshold: {}x). The scheduler reserves far less than the pod may use.",
                ratio, config.max_cpu_limit_ratio
            ),
        )])
    }

    fn fix(&self, input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        let limit = input.resources.cpu_limit?;
        Some(nested_patch(
            &["resources", "requests", "cpu"],
            Value::from(millicores_to_cpu_string(ratio_fixed_request(limit))),
        ))
    }
}

/// Rule: memory limit to request ratio is excessive.
pub struct HighMemoryRatioRule;

impl Rule for HighMemoryRatioRule {
    fn code(&self) -> &'static str {
        codes::HIGH_MEMORY_RATIO
    }

    fn description(&self) -> &'static str {
        "Memory limit to request ratio is excessive"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Resources
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn auto_fixable(&self) -> bool {
        true
    }

    fn check(&self, input: &RuleInput, config: &OptimizerConfig) -> Result<Vec<Violation>> {
        let Some(ratio) = ratio(input.resources.memory_limit, input.resources.memory_request) else {
            return Ok(Vec::new());
        };
        if ratio <= config.max_memory_limit_ratio {
            return Ok(Vec::new());
        }
        let limit = input.resources.memory_limit.unwrap_or_default();
        Ok(vec![input.violation(
            self,
            format!("request {}", describe_memory(input.resources.memory_request)),
            format!("request {}", bytes_to_memory_string(ratio_fixed_request(limit))),
            format!(
                "Memory limit to request ratio is {:.1}x (threshold: {}x). Overcommitted memory is reclaimed by OOM kills.",
                ratio, config.max_memory_limit_ratio
            ),
        )])
    }

    fn fix(&self, input: &RuleInput, _violation: &Violation, _config: &OptimizerConfig) -> Option<ValuesPatch> {
        let limit = input.resources.memory_limit?;
        Some(nested_patch(
            &["resources", "requests", "memory"],
            Value::from(bytes_to_memory_string(ratio_fixed_request(limit))),
        ))
    }
}

// ============================================================================
// RES007: BestEffort
// ============================================================================

/// Rule: no requests or limits at all.
pub struct BestEffortQosRule;

impl Rule for BestEffortQosRule {
    fn code(&self) -> &'static str {
        codes::BEST_EFFORT_QOS
    }

    fn description(&self) -> &'static str {
        "Pod runs in the BestEffort QoS class"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Resources
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    // Resolved through the individual request and limit fixes
    fn auto_fixable(&self) -> bool {
        false
    }

    fn check(&self, input: &RuleInput, _config: &OptimizerConfig) -> Result<Vec<Violation>> {
        if input.resources.qos_class() != QosClass::BestEffort {
            return Ok(Vec::new());
        }
        Ok(vec![input.violation(
            self,
            QosClass::BestEffort.as_str(),
            QosClass::Burstable.as_str(),
            "No resources defined at all. BestEffort pods are evicted first and scheduled blindly.",
        )])
    }
}
