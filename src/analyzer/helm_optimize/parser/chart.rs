//! Chart record construction.
//!
//! Builds a normalized [`Chart`] from a chart directory and its parsed
//! values, resolving umbrella sub-charts referenced through local
//! `file://` dependencies.

use std::path::{Path, PathBuf};

use log::debug;
use serde_yaml::Value;

use super::metadata::{ChartMetadata, Dependency, read_chart_metadata};
use super::quantity::{cpu_from_value, memory_from_value};
use crate::analyzer::helm_optimize::types::{
    AutoscalingSettings, Chart, ChartSource, PdbSettings, ProbeFlags, ResourceFields,
    SecuritySettings,
};
use crate::error::{OptimizerError, Result};

/// Directory names that say nothing about the chart they hold.
const GENERIC_CHART_DIRS: &[&str] = &["main", "chart", "helm", "deploy"];

// ============================================================================
// Public API
// ============================================================================

/// Parse a chart directory with already-parsed values.
///
/// `values_file` is the file the values were read from; it is recorded on the
/// chart so verification and patching know what to re-render and rewrite.
pub fn parse_chart(chart_dir: &Path, values: &Value, values_file: &Path) -> Result<Chart> {
    let mut chart = build_chart(chart_dir, values, ChartSource::LocalFile)?;
    chart.values_file = Some(values_file.to_path_buf());
    Ok(chart)
}

/// Parse a chart directory using its default `values.yaml`.
pub fn parse_chart_dir(chart_dir: &Path) -> Result<Chart> {
    let values_file = chart_dir.join("values.yaml");
    let values = read_values_file(&values_file)?;
    parse_chart(chart_dir, &values, &values_file)
}

/// Build a chart record from a values snapshot of a live release.
///
/// Cluster-sourced charts are never patched or verified; `chart_dir` is only
/// used for metadata and sub-chart discovery when the source is available.
pub fn parse_release_values(
    chart_dir: &Path,
    release: &str,
    namespace: &str,
    values: &Value,
) -> Result<Chart> {
    let mut chart = build_chart(chart_dir, values, ChartSource::Cluster)?;
    if chart.name.is_empty() {
        chart.name = release.to_string();
    }
    chart.namespace = Some(namespace.to_string());
    Ok(chart)
}

/// Read and parse a values file; a missing or empty file is an empty mapping.
pub fn read_values_file(path: &Path) -> Result<Value> {
    if !path.is_file() {
        return Ok(Value::Mapping(Default::default()));
    }
    let content = std::fs::read_to_string(path)?;
    parse_values_content(&content)
}

/// Parse values text into a mapping.
pub fn parse_values_content(content: &str) -> Result<Value> {
    if content.trim().is_empty() {
        return Ok(Value::Mapping(Default::default()));
    }
    let value: Value = serde_yaml::from_str(content)
        .map_err(|e| OptimizerError::MalformedValues(e.to_string()))?;
    match value {
        Value::Null => Ok(Value::Mapping(Default::default())),
        Value::Mapping(_) => Ok(value),
        other => Err(OptimizerError::MalformedValues(format!(
            "top-level values must be a mapping, found {}",
            kind_of(&other)
        ))),
    }
}

/// Resolve the chart name from metadata, falling back to directory names.
///
/// A chart stored as `<service>/main` (or another generic folder name) is
/// named after its parent directory.
pub fn resolve_chart_name(chart_dir: &Path, metadata: Option<&ChartMetadata>) -> String {
    if let Some(name) = metadata.and_then(|m| m.name.as_deref()) {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }

    let dir_name = chart_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if GENERIC_CHART_DIRS.contains(&dir_name.as_str()) {
        if let Some(parent) = chart_dir
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
        {
            return parent;
        }
    }

    dir_name
}

// ============================================================================
// Chart construction
// ============================================================================

fn build_chart(chart_dir: &Path, values: &Value, source: ChartSource) -> Result<Chart> {
    let values = match values {
        Value::Null => Value::Mapping(Default::default()),
        Value::Mapping(_) => values.clone(),
        other => {
            return Err(OptimizerError::MalformedValues(format!(
                "top-level values must be a mapping, found {}",
                kind_of(other)
            )));
        }
    };

    let metadata = read_chart_metadata(chart_dir)?;
    if metadata.is_none() {
        debug!(
            "No Chart.yaml in {}, naming chart from directory",
            chart_dir.display()
        );
    }

    let name = resolve_chart_name(chart_dir, metadata.as_ref());
    let settings = WorkloadSettings::from_values(&values);
    let team = metadata
        .as_ref()
        .and_then(ChartMetadata::team)
        .or_else(|| string_at(&values, &["team"]))
        .or_else(|| string_at(&values, &["global", "team"]));

    let mut chart = settings.into_chart(name, chart_dir.to_path_buf(), source);
    chart.team = team;

    if let Some(meta) = &metadata {
        let sub_charts = resolve_sub_charts(chart_dir, meta, &values, &chart);
        if !sub_charts.is_empty() {
            chart.sub_charts = sub_charts;
            aggregate_sub_charts(&mut chart);
        }
    }

    Ok(chart)
}

/// Recompute an umbrella chart's totals as itself plus every sub-chart.
fn aggregate_sub_charts(chart: &mut Chart) {
    let mut resources = chart.own_resources;
    let mut replicas = chart.own_replicas;
    for sub in &chart.sub_charts {
        resources = resources.sum(&sub.resources);
        replicas += sub.replicas;
    }
    chart.resources = resources;
    chart.replicas = replicas;
    chart.qos_class = resources.qos_class();
}

// ============================================================================
// Umbrella sub-charts
// ============================================================================

fn resolve_sub_charts(
    chart_dir: &Path,
    metadata: &ChartMetadata,
    values: &Value,
    parent: &Chart,
) -> Vec<Chart> {
    let project_root = project_root(chart_dir);
    let mut subs = Vec::new();

    for (dep, rel_path) in metadata.local_dependencies() {
        let Some(sub_dir) = local_sub_chart_dir(chart_dir, &rel_path, &project_root) else {
            debug!(
                "Dependency {} of {} is not a local sub-chart inside {}",
                dep.name,
                parent.name,
                project_root.display()
            );
            continue;
        };

        let Some(section) = values.get(dep.values_key()) else {
            continue;
        };
        if !has_workload_keys(section) {
            continue;
        }

        subs.push(build_sub_chart(dep, &sub_dir, section, parent));
    }

    subs
}

/// Resolve a `file://` dependency to an existing directory under the project root.
fn local_sub_chart_dir(chart_dir: &Path, rel_path: &Path, project_root: &Path) -> Option<PathBuf> {
    let candidate = chart_dir.join(rel_path);
    if !candidate.is_dir() {
        return None;
    }
    let canonical = candidate.canonicalize().ok()?;
    let root = project_root.canonicalize().ok()?;
    canonical.starts_with(&root).then_some(canonical)
}

/// Nearest ancestor holding a `.git` directory, else the chart's parent directory.
fn project_root(chart_dir: &Path) -> PathBuf {
    let absolute = chart_dir
        .canonicalize()
        .unwrap_or_else(|_| chart_dir.to_path_buf());
    for ancestor in absolute.ancestors() {
        if ancestor.join(".git").exists() {
            return ancestor.to_path_buf();
        }
    }
    absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(absolute)
}

/// A values section only counts as a sub-chart when it configures a workload.
fn has_workload_keys(section: &Value) -> bool {
    if section.get("replicaCount").is_some() || section.get("replicas").is_some() {
        return true;
    }
    section
        .get("resources")
        .map(|r| r.get("requests").is_some() || r.get("limits").is_some())
        .unwrap_or(false)
}

fn build_sub_chart(dep: &Dependency, sub_dir: &Path, section: &Value, parent: &Chart) -> Chart {
    let sub_values_file = sub_dir.join("values.yaml");
    let own_values = read_values_file(&sub_values_file).unwrap_or_else(|e| {
        debug!("Ignoring unreadable sub-chart values {}: {}", sub_values_file.display(), e);
        Value::Mapping(Default::default())
    });

    // Parent's section wins, then the sub-chart's own defaults, then zero.
    let settings =
        WorkloadSettings::from_values(section).or(WorkloadSettings::from_values(&own_values));

    let mut chart = settings.into_chart(dep.values_key().to_string(), sub_dir.to_path_buf(), parent.source);
    chart.parent_chart = Some(parent.name.clone());
    chart.values_file = parent.values_file.clone();
    chart.namespace = parent.namespace.clone();
    chart.team = string_at(section, &["team"]).or_else(|| parent.team.clone());
    chart
}

// ============================================================================
// Values extraction
// ============================================================================

/// Workload settings read from one values mapping; `None` means "not set here".
#[derive(Debug, Clone, Default)]
struct WorkloadSettings {
    cpu_request: Option<u64>,
    cpu_limit: Option<u64>,
    memory_request: Option<u64>,
    memory_limit: Option<u64>,
    replicas: Option<u32>,
    liveness: Option<bool>,
    readiness: Option<bool>,
    startup: Option<bool>,
    anti_affinity: Option<bool>,
    topology_spread: Option<bool>,
    pdb: Option<PdbSettings>,
    autoscaling: Option<AutoscalingSettings>,
    priority_class: Option<String>,
    run_as_non_root: Option<bool>,
    privileged: Option<bool>,
    read_only_root_filesystem: Option<bool>,
    namespace: Option<String>,
}

impl WorkloadSettings {
    fn from_values(values: &Value) -> Self {
        let resources = values.get("resources");
        let requests = resources.and_then(|r| r.get("requests"));
        let limits = resources.and_then(|r| r.get("limits"));

        Self {
            cpu_request: requests.and_then(|r| r.get("cpu")).and_then(cpu_from_value),
            cpu_limit: limits.and_then(|r| r.get("cpu")).and_then(cpu_from_value),
            memory_request: requests
                .and_then(|r| r.get("memory"))
                .and_then(memory_from_value),
            memory_limit: limits.and_then(|r| r.get("memory")).and_then(memory_from_value),
            replicas: values
                .get("replicaCount")
                .or_else(|| values.get("replicas"))
                .and_then(as_u32),
            liveness: probe_flag(values, "livenessProbe", "liveness"),
            readiness: probe_flag(values, "readinessProbe", "readiness"),
            startup: probe_flag(values, "startupProbe", "startup"),
            anti_affinity: values
                .get("affinity")
                .map(|a| a.get("podAntiAffinity").is_some_and(|p| !p.is_null())),
            topology_spread: values
                .get("topologySpreadConstraints")
                .map(|t| t.as_sequence().is_some_and(|s| !s.is_empty())),
            pdb: values
                .get("podDisruptionBudget")
                .or_else(|| values.get("pdb"))
                .and_then(pdb_settings),
            autoscaling: values.get("autoscaling").map(autoscaling_settings),
            priority_class: string_at(values, &["priorityClassName"]),
            run_as_non_root: security_flag(values, "runAsNonRoot"),
            privileged: security_flag(values, "privileged"),
            read_only_root_filesystem: security_flag(values, "readOnlyRootFilesystem"),
            namespace: string_at(values, &["namespaceOverride"]),
        }
    }

    /// Fill every unset field from `fallback`.
    fn or(self, fallback: WorkloadSettings) -> Self {
        Self {
            cpu_request: self.cpu_request.or(fallback.cpu_request),
            cpu_limit: self.cpu_limit.or(fallback.cpu_limit),
            memory_request: self.memory_request.or(fallback.memory_request),
            memory_limit: self.memory_limit.or(fallback.memory_limit),
            replicas: self.replicas.or(fallback.replicas),
            liveness: self.liveness.or(fallback.liveness),
            readiness: self.readiness.or(fallback.readiness),
            startup: self.startup.or(fallback.startup),
            anti_affinity: self.anti_affinity.or(fallback.anti_affinity),
            topology_spread: self.topology_spread.or(fallback.topology_spread),
            pdb: self.pdb.or(fallback.pdb),
            autoscaling: self.autoscaling.or(fallback.autoscaling),
            priority_class: self.priority_class.or(fallback.priority_class),
            run_as_non_root: self.run_as_non_root.or(fallback.run_as_non_root),
            privileged: self.privileged.or(fallback.privileged),
            read_only_root_filesystem: self
                .read_only_root_filesystem
                .or(fallback.read_only_root_filesystem),
            namespace: self.namespace.or(fallback.namespace),
        }
    }

    fn into_chart(self, name: String, path: PathBuf, source: ChartSource) -> Chart {
        let resources = ResourceFields {
            cpu_request: self.cpu_request,
            cpu_limit: self.cpu_limit,
            memory_request: self.memory_request,
            memory_limit: self.memory_limit,
        };
        let replicas = self.replicas.unwrap_or(1);

        Chart {
            name,
            team: None,
            path,
            values_file: None,
            namespace: self.namespace,
            source,
            resources,
            own_resources: resources,
            qos_class: resources.qos_class(),
            probes: ProbeFlags {
                liveness: self.liveness.unwrap_or(false),
                readiness: self.readiness.unwrap_or(false),
                startup: self.startup.unwrap_or(false),
            },
            anti_affinity: self.anti_affinity.unwrap_or(false),
            topology_spread: self.topology_spread.unwrap_or(false),
            pdb: self.pdb,
            replicas,
            own_replicas: replicas,
            autoscaling: self.autoscaling.unwrap_or_default(),
            priority_class: self.priority_class,
            security: SecuritySettings {
                run_as_non_root: self.run_as_non_root,
                privileged: self.privileged.unwrap_or(false),
                read_only_root_filesystem: self.read_only_root_filesystem,
            },
            parent_chart: None,
            sub_charts: Vec::new(),
        }
    }
}

/// A probe counts when configured and not explicitly disabled.
fn probe_flag(values: &Value, key: &str, short_key: &str) -> Option<bool> {
    let probe = values
        .get(key)
        .or_else(|| values.get("probes").and_then(|p| p.get(short_key)))?;
    Some(match probe {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Mapping(m) => {
            !m.is_empty() && probe.get("enabled").and_then(Value::as_bool).unwrap_or(true)
        }
        _ => true,
    })
}

fn pdb_settings(value: &Value) -> Option<PdbSettings> {
    if !value.is_mapping() {
        return None;
    }
    let min_available = value.get("minAvailable").and_then(scalar_string);
    let max_unavailable = value.get("maxUnavailable").and_then(scalar_string);
    let enabled = value
        .get("enabled")
        .and_then(Value::as_bool)
        .unwrap_or(min_available.is_some() || max_unavailable.is_some());
    Some(PdbSettings {
        enabled,
        min_available,
        max_unavailable,
    })
}

fn autoscaling_settings(value: &Value) -> AutoscalingSettings {
    AutoscalingSettings {
        enabled: value.get("enabled").and_then(Value::as_bool).unwrap_or(false),
        min_replicas: value.get("minReplicas").and_then(as_u32),
        max_replicas: value.get("maxReplicas").and_then(as_u32),
    }
}

fn security_flag(values: &Value, key: &str) -> Option<bool> {
    ["securityContext", "containerSecurityContext", "podSecurityContext"]
        .iter()
        .filter_map(|ctx| values.get(*ctx))
        .find_map(|ctx| ctx.get(key).and_then(Value::as_bool))
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_at(values: &Value, path: &[&str]) -> Option<String> {
    let mut current = values;
    for key in path {
        current = current.get(*key)?;
    }
    current
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::helm_optimize::types::QosClass;
    use std::fs;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_simple_chart() {
        let dir = TempDir::new().unwrap();
        let chart_dir = dir.path().join("api");
        write(&chart_dir.join("Chart.yaml"), "apiVersion: v2\nname: api\nversion: 0.1.0\n");
        write(
            &chart_dir.join("values.yaml"),
            r#"
replicaCount: 3
resources:
  requests:
    cpu: 250m
    memory: 256Mi
  limits:
    cpu: 250m
    memory: 256Mi
livenessProbe:
  httpGet:
    path: /healthz
readinessProbe:
  enabled: false
priorityClassName: high
"#,
        );

        let chart = parse_chart_dir(&chart_dir).unwrap();
        assert_eq!(chart.name, "api");
        assert_eq!(chart.replicas, 3);
        assert_eq!(chart.resources.cpu_request, Some(250));
        assert_eq!(chart.resources.memory_limit, Some(256 * 1024 * 1024));
        assert_eq!(chart.qos_class, QosClass::Guaranteed);
        assert!(chart.probes.liveness);
        assert!(!chart.probes.readiness);
        assert_eq!(chart.priority_class.as_deref(), Some("high"));
        assert!(chart.is_canonical_values_file());
    }

    #[test]
    fn test_malformed_quantity_is_soft() {
        let dir = TempDir::new().unwrap();
        let values: Value =
            serde_yaml::from_str("resources:\n  requests:\n    cpu: lots\n    memory: 1Gi\n").unwrap();
        let chart = parse_chart(dir.path(), &values, &dir.path().join("values.yaml")).unwrap();
        assert_eq!(chart.resources.cpu_request, None);
        assert_eq!(chart.resources.memory_request, Some(1024 * 1024 * 1024));
        assert_eq!(chart.qos_class, QosClass::Burstable);
    }

    #[test]
    fn test_non_mapping_values_rejected() {
        let dir = TempDir::new().unwrap();
        let values = Value::String("oops".to_string());
        let err = parse_chart(dir.path(), &values, &dir.path().join("values.yaml")).unwrap_err();
        assert!(matches!(err, OptimizerError::MalformedValues(_)));
    }

    #[test]
    fn test_main_directory_naming() {
        assert_eq!(resolve_chart_name(Path::new("/repo/billing/main"), None), "billing");
        assert_eq!(resolve_chart_name(Path::new("/repo/billing"), None), "billing");
    }

    #[test]
    fn test_umbrella_sub_charts() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        let root = dir.path().join("platform");
        write(
            &root.join("Chart.yaml"),
            r#"
apiVersion: v2
name: platform
version: 1.0.0
dependencies:
  - name: api
    repository: file://charts/api
  - name: docs
    repository: file://charts/docs
  - name: outside
    repository: file://../../elsewhere
  - name: redis
    repository: https://charts.bitnami.com/bitnami
"#,
        );
        write(
            &root.join("values.yaml"),
            r#"
replicaCount: 1
resources:
  requests:
    cpu: 100m
api:
  replicaCount: 2
  resources:
    requests:
      cpu: 200m
docs:
  ingress:
    enabled: true
redis:
  replicas: 3
"#,
        );
        write(
            &root.join("charts/api/values.yaml"),
            "resources:\n  requests:\n    memory: 64Mi\n",
        );
        write(&root.join("charts/docs/values.yaml"), "replicaCount: 1\n");

        let chart = parse_chart_dir(&root).unwrap();
        assert_eq!(chart.sub_charts.len(), 1);

        let api = &chart.sub_charts[0];
        assert_eq!(api.name, "api");
        assert_eq!(api.parent_chart.as_deref(), Some("platform"));
        assert_eq!(api.replicas, 2);
        assert_eq!(api.resources.cpu_request, Some(200));
        // Falls back to the sub-chart's own values file
        assert_eq!(api.resources.memory_request, Some(64 * 1024 * 1024));

        assert_eq!(chart.own_replicas, 1);
        assert_eq!(chart.replicas, 3);
        assert_eq!(chart.resources.cpu_request, Some(300));
        assert_eq!(chart.own_resources.cpu_request, Some(100));
        assert_eq!(chart.qos_class, chart.resources.qos_class());
        assert_eq!(chart.flatten().len(), 2);
    }
}
