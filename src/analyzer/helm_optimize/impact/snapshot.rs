//! Resource snapshots.
//!
//! A [`ChartSnapshot`] holds per-pod resources and replica counts for one
//! chart; [`ResourceTotals`] is the replica-weighted sum used for fleet
//! aggregation.

use std::collections::HashMap;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::analyzer::helm_optimize::types::Chart;

/// Live replica counts keyed by (workload name, namespace).
pub type LiveReplicaMap = HashMap<(String, String), u32>;

/// Replica-weighted resource totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTotals {
    /// CPU requests in millicores
    pub cpu_request: u64,
    /// CPU limits in millicores
    pub cpu_limit: u64,
    /// Memory requests in bytes
    pub memory_request: u64,
    /// Memory limits in bytes
    pub memory_limit: u64,
    pub replicas: u64,
}

impl Add for ResourceTotals {
    type Output = ResourceTotals;

    fn add(self, other: ResourceTotals) -> ResourceTotals {
        ResourceTotals {
            cpu_request: self.cpu_request + other.cpu_request,
            cpu_limit: self.cpu_limit + other.cpu_limit,
            memory_request: self.memory_request + other.memory_request,
            memory_limit: self.memory_limit + other.memory_limit,
            replicas: self.replicas + other.replicas,
        }
    }
}

impl AddAssign for ResourceTotals {
    fn add_assign(&mut self, other: ResourceTotals) {
        *self = *self + other;
    }
}

impl Sum for ResourceTotals {
    fn sum<I: Iterator<Item = ResourceTotals>>(iter: I) -> Self {
        iter.fold(ResourceTotals::default(), Add::add)
    }
}

impl ResourceTotals {
    pub fn cpu_request_cores(&self) -> f64 {
        self.cpu_request as f64 / 1000.0
    }

    pub fn memory_request_gib(&self) -> f64 {
        self.memory_request as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Per-pod resources and replica counts of one chart at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSnapshot {
    pub chart: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chart: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub cpu_request: u64,
    pub cpu_limit: u64,
    pub memory_request: u64,
    pub memory_limit: u64,
    pub replicas: u32,
    /// Smallest replica count across live releases of the chart
    pub min_replicas: u32,
    /// Largest replica count across live releases of the chart
    pub max_replicas: u32,
    /// Replicas came from live data rather than the values file
    pub live: bool,
}

impl ChartSnapshot {
    /// Snapshot of a chart record's own settings, before any fix.
    ///
    /// Uses the record's own resources and replicas so umbrella charts do
    /// not count their sub-charts twice.
    pub fn before(chart: &Chart, live: Option<&LiveReplicaMap>) -> Self {
        let resources = &chart.own_resources;
        let (replicas, min_replicas, max_replicas, is_live) = match live.and_then(|m| live_replicas(chart, m)) {
            Some((total, min, max)) => (total, min, max, true),
            None => (chart.own_replicas, chart.own_replicas, chart.own_replicas, false),
        };

        ChartSnapshot {
            chart: chart.name.clone(),
            parent_chart: chart.parent_chart.clone(),
            namespace: chart.namespace.clone(),
            cpu_request: resources.cpu_request.unwrap_or(0),
            cpu_limit: resources.cpu_limit.unwrap_or(0),
            memory_request: resources.memory_request.unwrap_or(0),
            memory_limit: resources.memory_limit.unwrap_or(0),
            replicas,
            min_replicas,
            max_replicas,
            live: is_live,
        }
    }

    /// Replica-weighted totals.
    pub fn totals(&self) -> ResourceTotals {
        let replicas = u64::from(self.replicas);
        ResourceTotals {
            cpu_request: self.cpu_request * replicas,
            cpu_limit: self.cpu_limit * replicas,
            memory_request: self.memory_request * replicas,
            memory_limit: self.memory_limit * replicas,
            replicas,
        }
    }

    /// Scale replica counts by `factor`, rounding up.
    pub fn scale_replicas(&mut self, factor: f64) {
        let scale = |n: u32| (f64::from(n) * factor).ceil() as u32;
        self.replicas = scale(self.replicas);
        self.min_replicas = scale(self.min_replicas);
        self.max_replicas = scale(self.max_replicas);
    }

    /// Raise any limit that ended up below its request.
    pub fn reconcile_limits(&mut self) {
        if self.cpu_limit > 0 && self.cpu_limit < self.cpu_request {
            self.cpu_limit = self.cpu_request;
        }
        if self.memory_limit > 0 && self.memory_limit < self.memory_request {
            self.memory_limit = self.memory_request;
        }
    }
}

/// Live replicas for a chart as `(total, min, max)`.
///
/// Charts with a namespace match exactly; charts without one sum every live
/// release that shares the chart name.
fn live_replicas(chart: &Chart, live: &LiveReplicaMap) -> Option<(u32, u32, u32)> {
    if let Some(ns) = &chart.namespace {
        return live
            .get(&(chart.name.clone(), ns.clone()))
            .map(|&n| (n, n, n));
    }

    let counts: Vec<u32> = live
        .iter()
        .filter(|((name, _), _)| *name == chart.name)
        .map(|(_, &n)| n)
        .collect();
    let min = *counts.iter().min()?;
    let max = counts.iter().copied().max().unwrap_or(min);
    Some((counts.iter().sum(), min, max))
}

/// Percentage change with a zero baseline: 0 to 0 is 0%, 0 to anything is 100%.
pub fn percent_change(before: u64, after: u64) -> f64 {
    if before == 0 {
        return if after == 0 { 0.0 } else { 100.0 };
    }
    (after as f64 - before as f64) / before as f64 * 100.0
}

/// Percentage deltas between two fleet totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactDeltas {
    pub cpu_request_pct: f64,
    pub cpu_limit_pct: f64,
    pub memory_request_pct: f64,
    pub memory_limit_pct: f64,
    pub replicas_pct: f64,
}

impl ImpactDeltas {
    pub fn between(before: &ResourceTotals, after: &ResourceTotals) -> Self {
        ImpactDeltas {
            cpu_request_pct: percent_change(before.cpu_request, after.cpu_request),
            cpu_limit_pct: percent_change(before.cpu_limit, after.cpu_limit),
            memory_request_pct: percent_change(before.memory_request, after.memory_request),
            memory_limit_pct: percent_change(before.memory_limit, after.memory_limit),
            replicas_pct: percent_change(before.replicas, after.replicas),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::helm_optimize::types::ResourceFields;

    fn chart(name: &str, namespace: Option<&str>, replicas: u32) -> Chart {
        Chart {
            name: name.into(),
            namespace: namespace.map(str::to_string),
            own_resources: ResourceFields {
                cpu_request: Some(100),
                cpu_limit: Some(200),
                memory_request: Some(64),
                memory_limit: None,
            },
            own_replicas: replicas,
            replicas,
            ..Default::default()
        }
    }

    #[test]
    fn test_percent_change_zero_baseline() {
        assert_eq!(percent_change(0, 0), 0.0);
        assert_eq!(percent_change(0, 5), 100.0);
        assert_eq!(percent_change(200, 300), 50.0);
        assert_eq!(percent_change(200, 100), -50.0);
    }

    #[test]
    fn test_totals_weighted_by_replicas() {
        let snap = ChartSnapshot::before(&chart("api", None, 3), None);
        let totals = snap.totals();
        assert_eq!(totals.cpu_request, 300);
        assert_eq!(totals.memory_limit, 0);
        assert_eq!(totals.replicas, 3);
        assert!(!snap.live);
    }

    #[test]
    fn test_live_replicas_exact_namespace() {
        let mut live = LiveReplicaMap::new();
        live.insert(("api".into(), "prod".into()), 4);
        live.insert(("api".into(), "staging".into()), 1);

        let snap = ChartSnapshot::before(&chart("api", Some("prod"), 1), Some(&live));
        assert_eq!((snap.replicas, snap.min_replicas, snap.max_replicas), (4, 4, 4));
        assert!(snap.live);

        let missing = ChartSnapshot::before(&chart("api", Some("dev"), 2), Some(&live));
        assert_eq!(missing.replicas, 2);
        assert!(!missing.live);
    }

    #[test]
    fn test_live_replicas_summed_without_namespace() {
        let mut live = LiveReplicaMap::new();
        live.insert(("api".into(), "prod".into()), 4);
        live.insert(("api".into(), "staging".into()), 1);
        live.insert(("web".into(), "prod".into()), 9);

        let mut snap = ChartSnapshot::before(&chart("api", None, 1), Some(&live));
        assert_eq!((snap.replicas, snap.min_replicas, snap.max_replicas), (5, 1, 4));

        snap.scale_replicas(2.0);
        assert_eq!((snap.replicas, snap.min_replicas, snap.max_replicas), (10, 2, 8));
    }

    #[test]
    fn test_reconcile_limits() {
        let mut snap = ChartSnapshot {
            cpu_request: 500,
            cpu_limit: 300,
            memory_request: 100,
            memory_limit: 0,
            ..Default::default()
        };
        snap.reconcile_limits();
        assert_eq!(snap.cpu_limit, 500);
        assert_eq!(snap.memory_limit, 0);
    }
}
