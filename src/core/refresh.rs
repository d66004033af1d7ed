//! OF-016: Refresh and drift detection — compare remote objects to the lock.
//!
//! Every locked resource is read back through its handler. An object that
//! no longer exists is dropped from the lock so the next plan re-creates
//! it. Attributes that differ from the last applied spec are reported as
//! drift and mark the entry Drifted.

use super::types::{yaml_value_to_string, Attributes, ResourceKind, ResourceStatus, Spec, StateLock};
use crate::error::Result;
use crate::resources::{self, Context, META_KEYS};
use serde_yaml_ng::Value;

/// A single drift finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftFinding {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub attribute: String,
    pub expected: String,
    pub actual: String,
}

/// Outcome of a refresh.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Resources removed from the lock because the remote object is gone
    pub cleared: Vec<String>,
    pub drift: Vec<DriftFinding>,
}

/// True when `actual` holds everything `expected` declares.
///
/// Scalars compare by their string form (`1` matches `"1"`) or numeric
/// value (`1` matches `1.0`); mappings only compare the declared keys;
/// sequences compare element-wise.
fn matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Mapping(e), Value::Mapping(a)) => e
            .iter()
            .all(|(k, v)| a.get(k).is_some_and(|av| matches(v, av))),
        (Value::Sequence(e), Value::Sequence(a)) => {
            e.len() == a.len() && e.iter().zip(a).all(|(ev, av)| matches(ev, av))
        }
        (Value::Mapping(_) | Value::Sequence(_), _) | (_, Value::Mapping(_) | Value::Sequence(_)) => {
            false
        }
        (e, a) => {
            let (e, a) = (yaml_value_to_string(e), yaml_value_to_string(a));
            e == a
                || matches!(
                    (e.parse::<f64>(), a.parse::<f64>()),
                    (Ok(x), Ok(y)) if x == y
                )
        }
    }
}

/// Compare a spec against attributes read back from the remote object.
///
/// Only attributes present on both sides are compared.
pub fn detect_drift(
    resource_id: &str,
    kind: ResourceKind,
    spec: &Spec,
    attributes: &Attributes,
) -> Vec<DriftFinding> {
    spec.iter()
        .filter(|(key, _)| !META_KEYS.contains(&key.as_str()))
        .filter_map(|(key, expected)| {
            let actual = attributes.get(key)?;
            if matches(expected, actual) {
                return None;
            }
            Some(DriftFinding {
                resource_id: resource_id.to_string(),
                kind,
                attribute: key.clone(),
                expected: yaml_value_to_string(expected),
                actual: yaml_value_to_string(actual),
            })
        })
        .collect()
}

/// Read every locked resource and update the lock in place.
pub fn refresh(ctx: &Context<'_>, lock: &mut StateLock) -> Result<RefreshReport> {
    let mut report = RefreshReport::default();

    let ids: Vec<String> = lock.resources.keys().cloned().collect();
    for id in ids {
        let Some(entry) = lock.resources.get_mut(&id) else {
            continue;
        };
        let Some(remote_id) = entry.remote_id else {
            continue;
        };

        let handler = resources::handler(entry.kind);
        match handler.read(ctx, remote_id, &entry.spec) {
            Ok(attributes) => {
                let findings = detect_drift(&id, entry.kind, &entry.spec, &attributes);
                for f in &findings {
                    tracing::warn!(
                        resource = %id,
                        attribute = %f.attribute,
                        expected = %f.expected,
                        actual = %f.actual,
                        "drift detected"
                    );
                }
                if !findings.is_empty() && entry.status == ResourceStatus::Converged {
                    entry.status = ResourceStatus::Drifted;
                }
                entry.attributes = attributes;
                report.drift.extend(findings);
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(resource = %id, kind = %entry.kind, remote_id, "remote object gone, clearing state");
                lock.resources.shift_remove(&id);
                report.cleared.push(id);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> Spec {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn test_of016_no_drift_with_string_numbers() {
        let s = spec("name: web\nmemory: 1024\ntags: { env: prod }\n");
        let a = spec("id: 4\nname: web\nmemory: \"1024\"\ntags: { env: prod }\ntags_all: { env: prod, owner: ops }\n");
        assert!(detect_drift("vm", ResourceKind::VirtualMachine, &s, &a).is_empty());
        let whole = spec("cpu: 1
");
        let float = spec("cpu: 1.0
");
        assert!(detect_drift("vm", ResourceKind::VirtualMachine, &whole, &float).is_empty());
    }

    #[test]
    fn test_of016_scalar_drift() {
        let s = spec("name: web\nmemory: 1024\n");
        let a = spec("name: web-renamed\nmemory: 1024\n");
        let findings = detect_drift("vm", ResourceKind::VirtualMachine, &s, &a);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].attribute, "name");
        assert_eq!(findings[0].expected, "web");
        assert_eq!(findings[0].actual, "web-renamed");
    }

    #[test]
    fn test_of016_nested_declared_subset() {
        let s = spec("disks:\n  - image_id: 3\n");
        let same = spec("disks:\n  - image_id: 3\n    target: vda\n");
        assert!(detect_drift("vm", ResourceKind::VirtualMachine, &s, &same).is_empty());
        let extra = spec("disks:\n  - image_id: 3\n  - image_id: 9\n");
        assert_eq!(detect_drift("vm", ResourceKind::VirtualMachine, &s, &extra).len(), 1);
        let changed = spec("disks:\n  - image_id: 4\n");
        assert_eq!(detect_drift("vm", ResourceKind::VirtualMachine, &s, &changed).len(), 1);
    }

    #[test]
    fn test_of016_unread_and_meta_keys_ignored() {
        let s = spec("name: a\npath: /tmp/x.qcow2\ntimeouts: { create: 1m }\n");
        let a = spec("name: a\n");
        assert!(detect_drift("img", ResourceKind::Image, &s, &a).is_empty());
    }
}
