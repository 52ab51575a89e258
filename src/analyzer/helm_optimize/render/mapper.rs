//! Rendered manifest to per-workload evaluation records.
//!
//! Splits `helm template` output into documents, resolves replica counts
//! through HorizontalPodAutoscalers, matches PodDisruptionBudgets by label
//! selector and collapses duplicate workloads.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::analyzer::helm_optimize::parser::quantity::{cpu_from_value, memory_from_value};
use crate::analyzer::helm_optimize::pragma;
use crate::analyzer::helm_optimize::types::{ProbeFlags, ResourceFields, SecuritySettings};

/// One container's relevant settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSettings {
    pub name: Option<String>,
    pub resources: ResourceFields,
    pub probes: ProbeFlags,
    pub security: SecuritySettings,
}

/// One workload found in rendered output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderedWorkload {
    pub kind: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    /// Template path from the `# Source:` header
    pub source_template: Option<String>,
    /// Sub-chart the template belongs to, if any
    pub sub_chart: Option<String>,
    pub containers: Vec<ContainerSettings>,
    pub replicas: u32,
    /// Whether `spec.replicas` was set explicitly
    pub explicit_replicas: bool,
    pub hpa_min_replicas: Option<u32>,
    pub pdb: bool,
    pub anti_affinity: bool,
    pub topology_spread: bool,
    pub priority_class: Option<String>,
    pub pod_run_as_non_root: Option<bool>,
    pub ignored_rules: BTreeSet<String>,
}

impl RenderedWorkload {
    /// `Kind/name` label used on violations.
    pub fn label(&self) -> String {
        format!("{}/{}", self.kind, self.name.as_deref().unwrap_or("<unnamed>"))
    }

    /// A field counts as set only when every container sets it; set values are summed.
    pub fn resources(&self) -> ResourceFields {
        fn combine(values: impl Iterator<Item = Option<u64>>) -> Option<u64> {
            let mut total = 0u64;
            let mut any = false;
            for v in values {
                total += v?;
                any = true;
            }
            any.then_some(total)
        }
        ResourceFields {
            cpu_request: combine(self.containers.iter().map(|c| c.resources.cpu_request)),
            cpu_limit: combine(self.containers.iter().map(|c| c.resources.cpu_limit)),
            memory_request: combine(self.containers.iter().map(|c| c.resources.memory_request)),
            memory_limit: combine(self.containers.iter().map(|c| c.resources.memory_limit)),
        }
    }

    /// A probe counts only when every container has it.
    pub fn probes(&self) -> ProbeFlags {
        let all = |f: fn(&ProbeFlags) -> bool| {
            !self.containers.is_empty() && self.containers.iter().all(|c| f(&c.probes))
        };
        ProbeFlags {
            liveness: all(|p| p.liveness),
            readiness: all(|p| p.readiness),
            startup: all(|p| p.startup),
        }
    }

    /// Effective security settings across the pod and its containers.
    pub fn security(&self) -> SecuritySettings {
        let privileged = self.containers.iter().any(|c| c.security.privileged);
        let container_flags: Vec<Option<bool>> = self
            .containers
            .iter()
            .map(|c| c.security.run_as_non_root.or(self.pod_run_as_non_root))
            .collect();
        let run_as_non_root = if container_flags.contains(&Some(false)) {
            Some(false)
        } else if !container_flags.is_empty() && container_flags.iter().all(|f| *f == Some(true)) {
            Some(true)
        } else {
            self.pod_run_as_non_root.filter(|_| self.containers.is_empty())
        };
        let read_only_root_filesystem = if self
            .containers
            .iter()
            .any(|c| c.security.read_only_root_filesystem == Some(false))
        {
            Some(false)
        } else if !self.containers.is_empty()
            && self
                .containers
                .iter()
                .all(|c| c.security.read_only_root_filesystem == Some(true))
        {
            Some(true)
        } else {
            None
        };
        SecuritySettings {
            run_as_non_root,
            privileged,
            read_only_root_filesystem,
        }
    }

    /// Weighted signal strength used to pick between duplicates.
    fn richness(&self) -> u32 {
        let probes = self.probes();
        let resources = self.resources();
        let mut score = 0;
        if probes.liveness {
            score += 2;
        }
        if probes.readiness {
            score += 2;
        }
        if probes.startup {
            score += 1;
        }
        if self.explicit_replicas {
            score += 2;
        }
        score += [
            resources.cpu_request,
            resources.cpu_limit,
            resources.memory_request,
            resources.memory_limit,
        ]
        .iter()
        .filter(|f| f.is_some())
        .count() as u32;
        score
    }
}

/// Check if a kind is a workload that has containers.
pub fn is_workload_kind(kind: &str) -> bool {
    matches!(
        kind,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Pod" | "Job" | "CronJob"
    )
}

// ============================================================================
// Documents
// ============================================================================

struct RenderedDoc {
    value: Value,
    source: Option<String>,
}

/// Split multi-document YAML, keeping each document's `# Source:` header.
fn split_documents(manifest: &str) -> Vec<RenderedDoc> {
    let mut docs = Vec::new();
    let mut current = String::new();

    let flush = |text: &mut String, docs: &mut Vec<RenderedDoc>| {
        if text.trim().is_empty() {
            text.clear();
            return;
        }
        let source = text
            .lines()
            .find_map(|l| l.trim().strip_prefix("# Source:"))
            .map(|s| s.trim().to_string());
        match serde_yaml::from_str::<Value>(text) {
            Ok(Value::Null) => {}
            Ok(value) => docs.push(RenderedDoc { value, source }),
            Err(e) => debug!("Skipping unparseable rendered document: {}", e),
        }
        text.clear();
    };

    for line in manifest.lines() {
        if line.trim_end() == "---" || line.starts_with("--- ") {
            flush(&mut current, &mut docs);
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    flush(&mut current, &mut docs);

    docs
}

/// Sub-chart owning a template path like `platform/charts/api/templates/x.yaml`.
fn sub_chart_from_source(source: &str) -> Option<String> {
    let parts: Vec<&str> = source.split('/').collect();
    if parts.len() > 3 && parts[1] == "charts" {
        Some(parts[2].to_string())
    } else {
        None
    }
}

// ============================================================================
// Mapping
// ============================================================================

#[derive(Debug)]
struct HpaTarget {
    namespace: Option<String>,
    kind: String,
    name: String,
    min_replicas: u32,
}

#[derive(Debug)]
struct PdbSelector {
    namespace: Option<String>,
    match_labels: BTreeMap<String, String>,
}

/// Convert rendered manifest text into one record per distinct workload.
pub fn map_rendered_workloads(manifest: &str) -> Vec<RenderedWorkload> {
    let docs = split_documents(manifest);

    let mut hpas = Vec::new();
    let mut pdbs = Vec::new();
    for doc in &docs {
        match kind_of(&doc.value) {
            Some("HorizontalPodAutoscaler") => {
                if let Some(hpa) = hpa_target(&doc.value) {
                    hpas.push(hpa);
                }
            }
            Some("PodDisruptionBudget") => {
                if let Some(pdb) = pdb_selector(&doc.value) {
                    pdbs.push(pdb);
                }
            }
            _ => {}
        }
    }

    let workloads = docs
        .iter()
        .filter(|d| kind_of(&d.value).is_some_and(is_workload_kind))
        .map(|d| build_workload(d, &hpas, &pdbs))
        .collect();

    dedup_workloads(workloads)
}

fn build_workload(doc: &RenderedDoc, hpas: &[HpaTarget], pdbs: &[PdbSelector]) -> RenderedWorkload {
    let value = &doc.value;
    let kind = kind_of(value).unwrap_or_default().to_string();
    let metadata = value.get("metadata");
    let name = metadata.and_then(|m| m.get("name")).and_then(Value::as_str).map(str::to_string);
    let namespace = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let template = pod_template(value, &kind);
    let pod_spec = template.and_then(|t| t.get("spec"));

    let containers = pod_spec
        .and_then(|s| s.get("containers"))
        .and_then(Value::as_sequence)
        .map(|seq| seq.iter().map(container_settings).collect())
        .unwrap_or_default();

    let spec_replicas = value.get("spec").and_then(|s| s.get("replicas")).and_then(as_count);
    let hpa_min = name
        .as_deref()
        .and_then(|n| resolve_hpa_min(hpas, &kind, n, namespace.as_deref()));
    let (replicas, explicit_replicas) = match (kind.as_str(), spec_replicas) {
        (_, Some(r)) => (r, true),
        ("CronJob", None) => (
            value
                .get("spec")
                .and_then(|s| s.get("jobTemplate"))
                .and_then(|j| j.get("spec"))
                .and_then(|s| s.get("parallelism"))
                .and_then(as_count)
                .unwrap_or(1),
            false,
        ),
        ("Job", None) => (
            value
                .get("spec")
                .and_then(|s| s.get("parallelism"))
                .and_then(as_count)
                .unwrap_or(1),
            false,
        ),
        (_, None) => (hpa_min.unwrap_or(1), false),
    };

    let pod_labels = pod_labels(value, template);
    let pdb = pdbs.iter().any(|p| {
        (p.namespace.is_none() || namespace.is_none() || p.namespace == namespace)
            && !p.match_labels.is_empty()
            && p.match_labels.iter().all(|(k, v)| pod_labels.get(k) == Some(v))
    });

    RenderedWorkload {
        kind,
        name,
        namespace,
        source_template: doc.source.clone(),
        sub_chart: doc.source.as_deref().and_then(sub_chart_from_source),
        containers,
        replicas,
        explicit_replicas,
        hpa_min_replicas: hpa_min,
        pdb,
        anti_affinity: pod_spec
            .and_then(|s| s.get("affinity"))
            .and_then(|a| a.get("podAntiAffinity"))
            .is_some_and(|p| !p.is_null()),
        topology_spread: pod_spec
            .and_then(|s| s.get("topologySpreadConstraints"))
            .and_then(Value::as_sequence)
            .is_some_and(|s| !s.is_empty()),
        priority_class: pod_spec
            .and_then(|s| s.get("priorityClassName"))
            .and_then(Value::as_str)
            .map(str::to_string),
        pod_run_as_non_root: pod_spec
            .and_then(|s| s.get("securityContext"))
            .and_then(|c| c.get("runAsNonRoot"))
            .and_then(Value::as_bool),
        ignored_rules: pragma::ignored_rules(&pragma::workload_annotations(value)),
    }
}

/// Pod template (or the Pod itself) for a workload kind.
fn pod_template<'a>(value: &'a Value, kind: &str) -> Option<&'a Value> {
    match kind {
        "Pod" => Some(value),
        "CronJob" => value
            .get("spec")
            .and_then(|s| s.get("jobTemplate"))
            .and_then(|j| j.get("spec"))
            .and_then(|s| s.get("template")),
        _ => value.get("spec").and_then(|s| s.get("template")),
    }
}

fn pod_labels(value: &Value, template: Option<&Value>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let template_labels = template
        .and_then(|t| t.get("metadata"))
        .and_then(|m| m.get("labels"));
    let selector_labels = value
        .get("spec")
        .and_then(|s| s.get("selector"))
        .and_then(|s| s.get("matchLabels"));
    for source in [selector_labels, template_labels].into_iter().flatten() {
        labels.extend(string_map(source));
    }
    labels
}

fn container_settings(container: &Value) -> ContainerSettings {
    let resources = container.get("resources");
    let requests = resources.and_then(|r| r.get("requests"));
    let limits = resources.and_then(|r| r.get("limits"));
    let security = container.get("securityContext");
    let has = |key: &str| container.get(key).is_some_and(|p| !p.is_null());

    ContainerSettings {
        name: container.get("name").and_then(Value::as_str).map(str::to_string),
        resources: ResourceFields {
            cpu_request: requests.and_then(|r| r.get("cpu")).and_then(cpu_from_value),
            cpu_limit: limits.and_then(|r| r.get("cpu")).and_then(cpu_from_value),
            memory_request: requests.and_then(|r| r.get("memory")).and_then(memory_from_value),
            memory_limit: limits.and_then(|r| r.get("memory")).and_then(memory_from_value),
        },
        probes: ProbeFlags {
            liveness: has("livenessProbe"),
            readiness: has("readinessProbe"),
            startup: has("startupProbe"),
        },
        security: SecuritySettings {
            run_as_non_root: security
                .and_then(|s| s.get("runAsNonRoot"))
                .and_then(Value::as_bool),
            privileged: security
                .and_then(|s| s.get("privileged"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            read_only_root_filesystem: security
                .and_then(|s| s.get("readOnlyRootFilesystem"))
                .and_then(Value::as_bool),
        },
    }
}

/// Non-negative count that fits in `u32`; anything else counts as unset.
fn as_count(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|v| u32::try_from(v).ok())
}

fn hpa_target(value: &Value) -> Option<HpaTarget> {
    let spec = value.get("spec")?;
    let target = spec.get("scaleTargetRef")?;
    Some(HpaTarget {
        namespace: value
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(str::to_string),
        kind: target.get("kind").and_then(Value::as_str).unwrap_or("Deployment").to_string(),
        name: target.get("name")?.as_str()?.to_string(),
        min_replicas: spec.get("minReplicas").and_then(as_count).unwrap_or(1),
    })
}

/// HPA minimum for a workload: exact target, then a unique cross-namespace
/// target, then the largest minimum among same-named targets.
fn resolve_hpa_min(hpas: &[HpaTarget], kind: &str, name: &str, namespace: Option<&str>) -> Option<u32> {
    let same_target: Vec<&HpaTarget> = hpas.iter().filter(|h| h.kind == kind && h.name == name).collect();

    if let Some(exact) = same_target.iter().find(|h| h.namespace.as_deref() == namespace) {
        return Some(exact.min_replicas);
    }
    if same_target.len() == 1 {
        return Some(same_target[0].min_replicas);
    }
    hpas.iter().filter(|h| h.name == name).map(|h| h.min_replicas).max()
}

fn pdb_selector(value: &Value) -> Option<PdbSelector> {
    let labels = value.get("spec")?.get("selector")?.get("matchLabels")?;
    Some(PdbSelector {
        namespace: value
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(str::to_string),
        match_labels: string_map(labels),
    })
}

fn string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_mapping()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((k.as_str()?.to_string(), v))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn kind_of(value: &Value) -> Option<&str> {
    value.get("kind").and_then(Value::as_str)
}

/// Keep one record per (kind, name, namespace), preferring the richest.
fn dedup_workloads(workloads: Vec<RenderedWorkload>) -> Vec<RenderedWorkload> {
    let mut out: Vec<RenderedWorkload> = Vec::with_capacity(workloads.len());
    let mut index: HashMap<(String, String, Option<String>), usize> = HashMap::new();

    for workload in workloads {
        let Some(name) = workload.name.clone() else {
            out.push(workload);
            continue;
        };
        let key = (workload.kind.clone(), name, workload.namespace.clone());
        match index.get(&key) {
            Some(&i) => {
                if workload.richness() > out[i].richness() {
                    debug!("Replacing duplicate rendered workload {}", workload.label());
                    out[i] = workload;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(workload);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"---
# Source: platform/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
spec:
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          resources:
            requests:
              cpu: 100m
              memory: 64Mi
          livenessProbe:
            httpGet:
              path: /
---
# Source: platform/templates/hpa.yaml
apiVersion: autoscaling/v2
kind: HorizontalPodAutoscaler
metadata:
  name: web
  namespace: prod
spec:
  scaleTargetRef:
    kind: Deployment
    name: web
  minReplicas: 3
---
# Source: platform/templates/pdb.yaml
apiVersion: policy/v1
kind: PodDisruptionBudget
metadata:
  name: web
  namespace: prod
spec:
  selector:
    matchLabels:
      app: web
---
# Source: platform/charts/api/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: api
spec:
  replicas: 2
  template:
    metadata:
      annotations:
        ignore-check.helm-optimizer.io/PRB001: ""
    spec:
      containers:
        - name: api
        - name: sidecar
          securityContext:
            privileged: true
---
# Source: platform/templates/cron.yaml
apiVersion: batch/v1
kind: CronJob
metadata:
  name: cleanup
spec:
  jobTemplate:
    spec:
      parallelism: 4
      template:
        spec:
          containers:
            - name: c
"#;

    #[test]
    fn test_map_workloads() {
        let workloads = map_rendered_workloads(MANIFEST);
        assert_eq!(workloads.len(), 3);

        let web = &workloads[0];
        assert_eq!(web.label(), "Deployment/web");
        assert_eq!(web.replicas, 3);
        assert!(!web.explicit_replicas);
        assert!(web.pdb);
        assert!(web.probes().liveness);
        assert_eq!(web.resources().cpu_request, Some(100));
        assert_eq!(web.sub_chart, None);

        let api = &workloads[1];
        assert_eq!(api.sub_chart.as_deref(), Some("api"));
        assert_eq!(api.replicas, 2);
        assert!(api.explicit_replicas);
        assert!(!api.pdb);
        assert!(api.security().privileged);
        assert!(api.ignored_rules.contains("PRB001"));
        assert_eq!(api.resources().cpu_request, None);

        let cron = &workloads[2];
        assert_eq!(cron.kind, "CronJob");
        assert_eq!(cron.replicas, 4);
    }

    #[test]
    fn test_dedup_prefers_richest() {
        let manifest = r#"
kind: Deployment
metadata:
  name: dup
spec:
  template:
    spec:
      containers:
        - name: a
---
kind: Deployment
metadata:
  name: dup
spec:
  replicas: 3
  template:
    spec:
      containers:
        - name: a
          readinessProbe:
            tcpSocket:
              port: 80
---
kind: Pod
spec:
  containers:
    - name: anon
---
kind: Pod
spec:
  containers:
    - name: anon
"#;
        let workloads = map_rendered_workloads(manifest);
        assert_eq!(workloads.len(), 3);
        assert_eq!(workloads[0].replicas, 3);
        assert!(workloads[0].probes().readiness);
    }

    #[test]
    fn test_out_of_range_counts_are_unset() {
        let manifest = r#"
kind: Deployment
metadata:
  name: huge
spec:
  replicas: 4294967296
---
kind: Job
metadata:
  name: batch
spec:
  parallelism: 99999999999
---
kind: HorizontalPodAutoscaler
metadata:
  name: huge
spec:
  scaleTargetRef:
    kind: Deployment
    name: huge
  minReplicas: 4294967297
"#;
        let workloads = map_rendered_workloads(manifest);
        let huge = workloads.iter().find(|w| w.kind == "Deployment").unwrap();
        assert!(!huge.explicit_replicas);
        assert_eq!(huge.hpa_min_replicas, Some(1));
        assert_eq!(huge.replicas, 1);
        let job = workloads.iter().find(|w| w.kind == "Job").unwrap();
        assert_eq!(job.replicas, 1);
    }

    #[test]
    fn test_hpa_resolution_fallbacks() {
        let hpas = vec![
            HpaTarget {
                namespace: Some("a".into()),
                kind: "Deployment".into(),
                name: "svc".into(),
                min_replicas: 2,
            },
            HpaTarget {
                namespace: Some("b".into()),
                kind: "Deployment".into(),
                name: "svc".into(),
                min_replicas: 5,
            },
        ];
        assert_eq!(resolve_hpa_min(&hpas, "Deployment", "svc", Some("a")), Some(2));
        assert_eq!(resolve_hpa_min(&hpas, "Deployment", "svc", None), Some(5));
        assert_eq!(resolve_hpa_min(&hpas[..1], "Deployment", "svc", Some("z")), Some(2));
        assert_eq!(resolve_hpa_min(&hpas, "Deployment", "other", None), None);
    }
}
