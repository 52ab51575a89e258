//! Annotation-based rule ignores for rendered workloads.
//!
//! A workload (or its pod template) annotated with
//! `ignore-check.helm-optimizer.io/<RULE>` skips that rule in rendered mode.
//!
//! ```yaml
//! metadata:
//!   annotations:
//!     ignore-check.helm-optimizer.io/AVL001: "singleton by design of the upstream"
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde_yaml::Value;

/// Prefix for optimizer ignore annotations.
pub const IGNORE_ANNOTATION_PREFIX: &str = "ignore-check.helm-optimizer.io/";

/// Rule codes ignored by a set of annotations, upper-cased.
pub fn ignored_rules(annotations: &BTreeMap<String, String>) -> BTreeSet<String> {
    annotations
        .keys()
        .filter_map(|k| k.strip_prefix(IGNORE_ANNOTATION_PREFIX))
        .map(|code| code.trim().to_ascii_uppercase())
        .filter(|code| !code.is_empty())
        .collect()
}

/// Annotations of a rendered workload merged with those of its pod template.
///
/// Workload-level entries win on key collisions.
pub fn workload_annotations(doc: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    let template_meta = doc
        .get("spec")
        .and_then(|s| s.get("template"))
        .or_else(|| {
            // CronJob nests the pod template one level deeper
            doc.get("spec")
                .and_then(|s| s.get("jobTemplate"))
                .and_then(|j| j.get("spec"))
                .and_then(|s| s.get("template"))
        })
        .and_then(|t| t.get("metadata"));

    for meta in [template_meta, doc.get("metadata")].into_iter().flatten() {
        if let Some(map) = meta.get("annotations").and_then(Value::as_mapping) {
            for (key, value) in map {
                if let Some(k) = key.as_str() {
                    let v = value.as_str().map(str::to_string).unwrap_or_default();
                    out.insert(k.to_string(), v);
                }
            }
        }
    }

    out
}

/// Reason text attached to an ignore annotation, if any.
pub fn ignore_reason<'a>(
    annotations: &'a BTreeMap<String, String>,
    rule_code: &str,
) -> Option<&'a str> {
    annotations
        .iter()
        .find(|(k, _)| {
            k.strip_prefix(IGNORE_ANNOTATION_PREFIX)
                .is_some_and(|c| c.eq_ignore_ascii_case(rule_code))
        })
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignored_rules_from_template_and_metadata() {
        let doc: Value = serde_yaml::from_str(
            r#"
kind: Deployment
metadata:
  name: api
  annotations:
    ignore-check.helm-optimizer.io/avl001: "singleton"
spec:
  template:
    metadata:
      annotations:
        ignore-check.helm-optimizer.io/PRB001: ""
        prometheus.io/scrape: "true"
"#,
        )
        .unwrap();

        let annotations = workload_annotations(&doc);
        let ignored = ignored_rules(&annotations);
        assert!(ignored.contains("AVL001"));
        assert!(ignored.contains("PRB001"));
        assert_eq!(ignored.len(), 2);
        assert_eq!(ignore_reason(&annotations, "AVL001"), Some("singleton"));
        assert_eq!(ignore_reason(&annotations, "PRB001"), None);
    }

    #[test]
    fn test_no_annotations() {
        let doc: Value = serde_yaml::from_str("kind: Service\nmetadata:\n  name: x\n").unwrap();
        assert!(ignored_rules(&workload_annotations(&doc)).is_empty());
    }
}
