//! Node-count and cost estimates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::snapshot::ResourceTotals;

/// Fraction of a node's vCPU left for workloads after system reservations.
pub const CPU_ALLOCATABLE_FRACTION: f64 = 0.9;
/// Fraction of a node's memory left for workloads after system reservations.
pub const MEMORY_ALLOCATABLE_FRACTION: f64 = 0.85;
/// Hours in a month (for cost calculations)
pub const HOURS_PER_MONTH: f64 = 730.0;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A purchasable node shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub vcpu: f64,
    pub memory_gib: f64,
    /// Spot price in USD per hour
    pub spot_hourly: f64,
}

impl InstanceType {
    pub fn new(name: &str, vcpu: f64, memory_gib: f64, spot_hourly: f64) -> Self {
        Self {
            name: name.to_string(),
            vcpu,
            memory_gib,
            spot_hourly,
        }
    }

    fn allocatable_cpu_millicores(&self) -> f64 {
        self.vcpu * 1000.0 * CPU_ALLOCATABLE_FRACTION
    }

    fn allocatable_memory_bytes(&self) -> f64 {
        self.memory_gib * GIB * MEMORY_ALLOCATABLE_FRACTION
    }
}

/// Canned instance types used when no cluster inventory is supplied.
pub fn default_instance_types() -> Vec<InstanceType> {
    vec![
        InstanceType::new("m5.large", 2.0, 8.0, 0.035),
        InstanceType::new("m5.xlarge", 4.0, 16.0, 0.070),
        InstanceType::new("m5.2xlarge", 8.0, 32.0, 0.140),
        InstanceType::new("c5.xlarge", 4.0, 8.0, 0.062),
        InstanceType::new("r5.xlarge", 4.0, 32.0, 0.085),
    ]
}

/// One node from a live cluster inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub instance_type: String,
    pub allocatable_cpu_millicores: u64,
    pub allocatable_memory_bytes: u64,
}

/// Nodes and cost needed before and after the fixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEstimate {
    pub instance_type: String,
    /// Nodes of this type currently in the cluster (cluster estimates only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_nodes: Option<u32>,
    pub nodes_before: u32,
    pub nodes_after: u32,
    pub monthly_cost_before: f64,
    pub monthly_cost_after: f64,
    pub monthly_savings: f64,
}

/// Nodes needed to fit `totals`, ceiling-rounded, at least one.
pub fn nodes_needed(totals: &ResourceTotals, cpu_per_node: f64, memory_per_node: f64) -> u32 {
    let by_cpu = if cpu_per_node > 0.0 {
        (totals.cpu_request as f64 / cpu_per_node).ceil()
    } else {
        0.0
    };
    let by_memory = if memory_per_node > 0.0 {
        (totals.memory_request as f64 / memory_per_node).ceil()
    } else {
        0.0
    };
    (by_cpu.max(by_memory) as u32).max(1)
}

fn monthly_cost(nodes: u32, spot_hourly: f64) -> f64 {
    round_cost(f64::from(nodes) * spot_hourly * HOURS_PER_MONTH)
}

/// Round to 2 decimal places.
fn round_cost(cost: f64) -> f64 {
    (cost * 100.0).round() / 100.0
}

/// Estimates for each canned instance type.
pub fn estimate_nodes(before: &ResourceTotals, after: &ResourceTotals, types: &[InstanceType]) -> Vec<NodeEstimate> {
    types
        .iter()
        .map(|t| {
            let cpu = t.allocatable_cpu_millicores();
            let memory = t.allocatable_memory_bytes();
            let nodes_before = nodes_needed(before, cpu, memory);
            let nodes_after = nodes_needed(after, cpu, memory);
            let cost_before = monthly_cost(nodes_before, t.spot_hourly);
            let cost_after = monthly_cost(nodes_after, t.spot_hourly);
            NodeEstimate {
                instance_type: t.name.clone(),
                current_nodes: None,
                nodes_before,
                nodes_after,
                monthly_cost_before: cost_before,
                monthly_cost_after: cost_after,
                monthly_savings: round_cost(cost_before - cost_after),
            }
        })
        .collect()
}

/// Estimates per node group of a live cluster.
///
/// Each instance type gets a share of the workload proportional to its share
/// of allocatable CPU. Prices come from `price_list` by name; unknown types
/// are estimated at zero cost.
pub fn estimate_cluster_nodes(
    before: &ResourceTotals,
    after: &ResourceTotals,
    nodes: &[NodeInfo],
    price_list: &[InstanceType],
) -> Vec<NodeEstimate> {
    let mut groups: BTreeMap<&str, (u32, u64, u64)> = BTreeMap::new();
    for node in nodes {
        let entry = groups.entry(node.instance_type.as_str()).or_default();
        entry.0 += 1;
        entry.1 += node.allocatable_cpu_millicores;
        entry.2 += node.allocatable_memory_bytes;
    }
    let cluster_cpu: u64 = groups.values().map(|g| g.1).sum();
    if cluster_cpu == 0 {
        return Vec::new();
    }

    groups
        .into_iter()
        .map(|(instance_type, (count, cpu, memory))| {
            let share = cpu as f64 / cluster_cpu as f64;
            let cpu_per_node = cpu as f64 / f64::from(count);
            let memory_per_node = memory as f64 / f64::from(count);
            let nodes_before = nodes_needed(&scaled(before, share), cpu_per_node, memory_per_node);
            let nodes_after = nodes_needed(&scaled(after, share), cpu_per_node, memory_per_node);
            let spot = price_list
                .iter()
                .find(|t| t.name == instance_type)
                .map(|t| t.spot_hourly)
                .unwrap_or(0.0);
            let cost_before = monthly_cost(nodes_before, spot);
            let cost_after = monthly_cost(nodes_after, spot);
            NodeEstimate {
                instance_type: instance_type.to_string(),
                current_nodes: Some(count),
                nodes_before,
                nodes_after,
                monthly_cost_before: cost_before,
                monthly_cost_after: cost_after,
                monthly_savings: round_cost(cost_before - cost_after),
            }
        })
        .collect()
}

fn scaled(totals: &ResourceTotals, share: f64) -> ResourceTotals {
    let scale = |v: u64| (v as f64 * share).round() as u64;
    ResourceTotals {
        cpu_request: scale(totals.cpu_request),
        cpu_limit: scale(totals.cpu_limit),
        memory_request: scale(totals.memory_request),
        memory_limit: scale(totals.memory_limit),
        replicas: totals.replicas,
    }
}
