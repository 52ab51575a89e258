//! Resource-impact calculation.
//!
//! Given a fleet of charts and their violations, [`compute_impact`] estimates
//! what applying the resource and replica fixes would do to fleet totals,
//! node counts and monthly cost. Nothing is written; the calculation only
//! reads chart records and optional live data supplied by the caller.
//!
//! - `snapshot`: per-chart before/after snapshots and fleet totals
//! - `nodes`: node-count and cost estimates

pub mod nodes;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::config::OptimizerConfig;
use super::fix::FixGenerator;
use super::parser::quantity::{cpu_from_value, memory_from_value};
use super::rules::{
    DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_REQUEST, codes, ratio_fixed_request, recommended_cpu_limit,
    recommended_memory_limit,
};
use super::types::{Chart, Violation};

pub use nodes::{
    CPU_ALLOCATABLE_FRACTION, HOURS_PER_MONTH, InstanceType, MEMORY_ALLOCATABLE_FRACTION, NodeEstimate, NodeInfo,
    default_instance_types, estimate_cluster_nodes, estimate_nodes, nodes_needed,
};
pub use snapshot::{ChartSnapshot, ImpactDeltas, LiveReplicaMap, ResourceTotals, percent_change};

/// Team used when neither the resolver nor the chart names one.
pub const UNASSIGNED_TEAM: &str = "unassigned";

/// Rules that change resources or replicas, in the order their fixes are
/// applied: requests, then limits, then replicas.
pub const IMPACT_RULES: [&str; 7] = [
    codes::MISSING_CPU_REQUEST,
    codes::MISSING_MEMORY_REQUEST,
    codes::HIGH_CPU_RATIO,
    codes::HIGH_MEMORY_RATIO,
    codes::MISSING_CPU_LIMIT,
    codes::MISSING_MEMORY_LIMIT,
    codes::SINGLE_REPLICA,
];

/// Position of a rule in the fix order, or `None` for rules with no resource impact.
pub fn rule_priority(rule_id: &str) -> Option<usize> {
    IMPACT_RULES.iter().position(|r| r.eq_ignore_ascii_case(rule_id))
}

/// Resolves the owning team of a chart.
pub trait TeamResolver: Send + Sync {
    fn team_for(&self, chart: &Chart) -> Option<String>;
}

/// Optional inputs to [`compute_impact`].
#[derive(Default)]
pub struct ImpactOptions<'a> {
    /// Live replica counts keyed by (workload name, namespace)
    pub live_replicas: Option<&'a LiveReplicaMap>,
    /// Live node inventory; enables per-group cluster estimates
    pub nodes: &'a [NodeInfo],
    /// Instance types to estimate against (defaults to [`default_instance_types`])
    pub instance_types: Option<&'a [InstanceType]>,
    pub team_resolver: Option<&'a dyn TeamResolver>,
    /// Source of fix payloads; default adjustments are used without one
    pub fix_generator: Option<&'a dyn FixGenerator>,
    pub config: OptimizerConfig,
}

/// Before/after snapshots for one chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartImpact {
    pub team: String,
    pub before: ChartSnapshot,
    pub after: ChartSnapshot,
    /// Rules applied, in application order
    pub applied_rules: Vec<String>,
}

/// Fleet totals for one team.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamImpact {
    pub before: ResourceTotals,
    pub after: ResourceTotals,
    pub deltas: ImpactDeltas,
}

/// Result of an impact calculation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactResult {
    pub before: ResourceTotals,
    pub after: ResourceTotals,
    pub per_chart: Vec<ChartImpact>,
    pub deltas: ImpactDeltas,
    pub node_estimates: Vec<NodeEstimate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_estimates: Vec<NodeEstimate>,
    pub by_team: BTreeMap<String, TeamImpact>,
    /// Estimated monthly savings in USD
    pub monthly_savings: f64,
}

impl ImpactResult {
    /// Pretty-printed JSON report.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Estimate the fleet-wide effect of fixing `violations`.
pub fn compute_impact(charts: &[Chart], violations: &[Violation], options: &ImpactOptions<'_>) -> ImpactResult {
    let records = dedup_records(charts);
    let relevant: Vec<&Violation> = violations
        .iter()
        .filter(|v| rule_priority(&v.rule_id).is_some())
        .collect();

    let mut per_chart = Vec::with_capacity(records.len());
    for record in records {
        if is_bare_umbrella(record) {
            log::debug!("Skipping umbrella chart {} with no resources of its own", record.name);
            continue;
        }

        let before = ChartSnapshot::before(record, options.live_replicas);
        let mut rule_ids: Vec<&str> = relevant
            .iter()
            .filter(|v| v.chart_name == record.name && v.parent_chart == record.parent_chart)
            .map(|v| v.rule_id.as_str())
            .collect();
        rule_ids.sort_by_key(|id| rule_priority(id));
        rule_ids.dedup_by(|a, b| a.eq_ignore_ascii_case(b));

        let mut after = before.clone();
        let mut applied_rules = Vec::with_capacity(rule_ids.len());
        let mut requests_changed = false;
        for rule_id in rule_ids {
            let payload = options
                .fix_generator
                .and_then(|g| fix_payload(g, record, relevant.iter().copied(), rule_id));
            if apply_rule(&mut after, record, rule_id, payload.as_ref(), requests_changed, &options.config) {
                applied_rules.push(rule_id.to_ascii_uppercase());
                if matches!(rule_priority(rule_id), Some(0..=3)) {
                    requests_changed = after.cpu_request != before.cpu_request
                        || after.memory_request != before.memory_request;
                }
            }
        }
        after.reconcile_limits();

        per_chart.push(ChartImpact {
            team: team_for(record, options.team_resolver),
            before,
            after,
            applied_rules,
        });
    }

    let before: ResourceTotals = per_chart.iter().map(|c| c.before.totals()).sum();
    let after: ResourceTotals = per_chart.iter().map(|c| c.after.totals()).sum();

    let mut by_team: BTreeMap<String, TeamImpact> = BTreeMap::new();
    for chart in &per_chart {
        let team = by_team.entry(chart.team.clone()).or_default();
        team.before += chart.before.totals();
        team.after += chart.after.totals();
    }
    for team in by_team.values_mut() {
        team.deltas = ImpactDeltas::between(&team.before, &team.after);
    }

    let defaults;
    let types = match options.instance_types {
        Some(types) => types,
        None => {
            defaults = default_instance_types();
            &defaults[..]
        }
    };
    let node_estimates = estimate_nodes(&before, &after, types);
    let cluster_estimates = estimate_cluster_nodes(&before, &after, options.nodes, types);
    let monthly_savings = monthly_savings(&node_estimates, &cluster_estimates);

    log::info!(
        "Impact over {} charts: CPU requests {}m -> {}m, memory requests {} -> {} bytes",
        per_chart.len(),
        before.cpu_request,
        after.cpu_request,
        before.memory_request,
        after.memory_request
    );

    ImpactResult {
        before,
        after,
        deltas: ImpactDeltas::between(&before, &after),
        per_chart,
        node_estimates,
        cluster_estimates,
        by_team,
        monthly_savings,
    }
}

/// Flattened chart records with values-file variants collapsed.
///
/// Records sharing (name, namespace, parent chart) are variants of one
/// deployment; the one built from the canonical `values.yaml` wins, otherwise
/// the first seen.
fn dedup_records(charts: &[Chart]) -> Vec<&Chart> {
    let mut order: Vec<&Chart> = Vec::new();
    let mut index: HashMap<(&str, Option<&str>, Option<&str>), usize> = HashMap::new();

    for record in charts.iter().flat_map(Chart::flatten) {
        let key = (
            record.name.as_str(),
            record.namespace.as_deref(),
            record.parent_chart.as_deref(),
        );
        match index.get(&key) {
            Some(&i) => {
                if record.is_canonical_values_file() && !order[i].is_canonical_values_file() {
                    order[i] = record;
                }
            }
            None => {
                index.insert(key, order.len());
                order.push(record);
            }
        }
    }
    order
}

fn is_bare_umbrella(record: &Chart) -> bool {
    !record.sub_charts.is_empty() && !record.own_resources.has_any()
}

fn team_for(record: &Chart, resolver: Option<&dyn TeamResolver>) -> String {
    resolver
        .and_then(|r| r.team_for(record))
        .or_else(|| record.team.clone())
        .unwrap_or_else(|| UNASSIGNED_TEAM.to_string())
}

/// Values patch for one rule on one record, relative to the record's own section.
fn fix_payload<'v>(
    generator: &dyn FixGenerator,
    record: &Chart,
    mut violations: impl Iterator<Item = &'v Violation>,
    rule_id: &str,
) -> Option<Mapping> {
    let violation = violations.find(|v| {
        v.rule_id.eq_ignore_ascii_case(rule_id)
            && v.chart_name == record.name
            && v.parent_chart == record.parent_chart
    })?;
    let bundle = generator.generate_fix(record, violation)?;

    let mut section = &bundle.values_patch;
    for key in violation.values_prefix() {
        section = section.get(key.as_str())?.as_mapping()?;
    }
    Some(section.clone())
}

fn lookup<'v>(patch: &'v Mapping, path: &[&str]) -> Option<&'v Value> {
    let (last, parents) = path.split_last()?;
    let mut current = patch;
    for key in parents {
        current = current.get(*key)?.as_mapping()?;
    }
    current.get(*last)
}

fn payload_cpu(payload: Option<&Mapping>, path: &[&str]) -> Option<u64> {
    payload.and_then(|p| lookup(p, path)).and_then(cpu_from_value)
}

fn payload_memory(payload: Option<&Mapping>, path: &[&str]) -> Option<u64> {
    payload.and_then(|p| lookup(p, path)).and_then(memory_from_value)
}

const REPLICA_PATHS: [&[&str]; 3] = [&["replicaCount"], &["replicas"], &["autoscaling", "minReplicas"]];

fn payload_replicas(payload: Option<&Mapping>) -> Option<u32> {
    let payload = payload?;
    REPLICA_PATHS
        .iter()
        .find_map(|path| lookup(payload, path).and_then(Value::as_u64))
        .and_then(|n| u32::try_from(n).ok())
}

fn nonzero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

/// Apply one rule's adjustment to `snap`. Returns whether the rule applied.
///
/// Limit rules follow a payload only while the requests are as generated;
/// once an earlier rule changed a request, the limit is derived from the
/// updated request instead.
fn apply_rule(
    snap: &mut ChartSnapshot,
    record: &Chart,
    rule_id: &str,
    payload: Option<&Mapping>,
    requests_changed: bool,
    config: &OptimizerConfig,
) -> bool {
    let limit_payload = if requests_changed { None } else { payload };
    match rule_id.to_ascii_uppercase().as_str() {
        codes::MISSING_CPU_REQUEST => {
            snap.cpu_request =
                payload_cpu(payload, &["resources", "requests", "cpu"]).unwrap_or(DEFAULT_CPU_REQUEST);
        }
        codes::MISSING_MEMORY_REQUEST => {
            snap.memory_request =
                payload_memory(payload, &["resources", "requests", "memory"]).unwrap_or(DEFAULT_MEMORY_REQUEST);
        }
        codes::HIGH_CPU_RATIO => {
            let Some(request) = payload_cpu(payload, &["resources", "requests", "cpu"])
                .or_else(|| nonzero(snap.cpu_limit).map(ratio_fixed_request))
            else {
                return false;
            };
            snap.cpu_request = snap.cpu_request.max(request);
        }
        codes::HIGH_MEMORY_RATIO => {
            let Some(request) = payload_memory(payload, &["resources", "requests", "memory"])
                .or_else(|| nonzero(snap.memory_limit).map(ratio_fixed_request))
            else {
                return false;
            };
            snap.memory_request = snap.memory_request.max(request);
        }
        codes::MISSING_CPU_LIMIT => {
            snap.cpu_limit = payload_cpu(limit_payload, &["resources", "limits", "cpu"])
                .unwrap_or_else(|| recommended_cpu_limit(nonzero(snap.cpu_request)));
        }
        codes::MISSING_MEMORY_LIMIT => {
            snap.memory_limit = payload_memory(limit_payload, &["resources", "limits", "memory"])
                .unwrap_or_else(|| recommended_memory_limit(nonzero(snap.memory_request)));
        }
        codes::SINGLE_REPLICA => {
            let target = payload_replicas(payload).unwrap_or(config.min_replicas);
            let current = if record.autoscaling.enabled {
                record.autoscaling.min_replicas.unwrap_or(1)
            } else {
                record.own_replicas
            };
            let factor = f64::from(target) / f64::from(current.max(1));
            if factor <= 1.0 {
                return false;
            }
            snap.scale_replicas(factor);
        }
        _ => return false,
    }
    true
}

/// Savings across the live node groups, or for the cheapest canned type
/// after the fixes when no inventory was supplied.
fn monthly_savings(node_estimates: &[NodeEstimate], cluster_estimates: &[NodeEstimate]) -> f64 {
    if !cluster_estimates.is_empty() {
        let total: f64 = cluster_estimates.iter().map(|e| e.monthly_savings).sum();
        return (total * 100.0).round() / 100.0;
    }
    node_estimates
        .iter()
        .min_by(|a, b| a.monthly_cost_after.total_cmp(&b.monthly_cost_after))
        .map(|e| e.monthly_savings)
        .unwrap_or(0.0)
}
