//! OF-004: Plan generation — diff desired state against lock state.

use super::resolver::{destroy_order, resolve_spec, ResolveContext};
use super::types::*;
use crate::resources;

/// Generate an execution plan by comparing the declaration to lock state.
///
/// Destroys (locked resources no longer declared, or declared `absent`)
/// come first in reverse dependency order; everything else follows
/// `execution_order`. Specs whose references cannot be resolved yet (their
/// targets are still to be created) plan as Create, or Update when locked.
pub fn plan(
    decl: &Declaration,
    execution_order: &[String],
    lock: Option<&StateLock>,
    ctx: &ResolveContext,
) -> ExecutionPlan {
    let mut changes = Vec::new();
    let mut to_create = 0u32;
    let mut to_update = 0u32;
    let mut to_replace = 0u32;
    let mut unchanged = 0u32;

    let mut doomed: Vec<String> = Vec::new();
    if let Some(lock) = lock {
        for id in lock.resources.keys() {
            let gone = decl.resources.get(id).is_none_or(ResourceDecl::is_absent);
            if gone {
                doomed.push(id.clone());
            }
        }
    }
    if let Some(lock) = lock {
        for id in destroy_order(lock, &doomed) {
            if let Some(entry) = lock.resources.get(&id) {
                changes.push(PlannedChange {
                    description: describe_action(&id, entry.kind, PlanAction::Destroy, &[]),
                    resource_id: id,
                    kind: entry.kind,
                    action: PlanAction::Destroy,
                    changed: Vec::new(),
                });
            }
        }
    }
    let to_destroy = changes.len() as u32;

    for resource_id in execution_order {
        let resource = match decl.resources.get(resource_id) {
            Some(r) => r,
            None => continue,
        };
        if resource.is_absent() {
            // Already handled above when locked.
            continue;
        }
        let entry = lock.and_then(|l| l.resources.get(resource_id));

        let (action, changed) = match resolve_spec(&resource.spec, ctx) {
            Ok(spec) => determine_action(resource.kind, &spec, entry),
            Err(_) => match entry {
                None => (PlanAction::Create, Vec::new()),
                Some(_) => (PlanAction::Update, vec!["(references)".to_string()]),
            },
        };

        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::Replace => to_replace += 1,
            PlanAction::Destroy => {}
            PlanAction::NoOp => unchanged += 1,
        }

        changes.push(PlannedChange {
            resource_id: resource_id.clone(),
            kind: resource.kind,
            action,
            description: describe_action(resource_id, resource.kind, action, &changed),
            changed,
        });
    }

    ExecutionPlan {
        name: decl.name.clone(),
        changes,
        execution_order: execution_order.to_vec(),
        to_create,
        to_update,
        to_replace,
        to_destroy,
        unchanged,
    }
}

/// Determine what action to take for a resolved spec given its lock entry.
///
/// Returns the action and the attribute names that differ from the last
/// applied spec.
pub fn determine_action(
    kind: ResourceKind,
    spec: &Spec,
    entry: Option<&ResourceLock>,
) -> (PlanAction, Vec<String>) {
    let entry = match entry {
        Some(e) if e.remote_id.is_some() => e,
        _ => return (PlanAction::Create, Vec::new()),
    };

    if entry.kind != kind {
        return (PlanAction::Replace, vec!["type".to_string()]);
    }
    let changed = changed_keys(&entry.spec, spec);
    if entry.status == ResourceStatus::Tainted {
        return (PlanAction::Replace, changed);
    }
    let force_new = resources::handler(kind).force_new();
    if changed.iter().any(|k| force_new.contains(&k.as_str())) {
        return (PlanAction::Replace, changed);
    }
    if entry.status != ResourceStatus::Converged {
        return (PlanAction::Update, changed);
    }
    if entry.hash != hash_desired_state(kind, spec) {
        return (PlanAction::Update, changed);
    }
    (PlanAction::NoOp, Vec::new())
}

/// Compute a hash of the desired state for comparison.
///
/// Keys are serialized in sorted order, so declaration key order does not
/// affect the hash.
pub fn hash_desired_state(kind: ResourceKind, spec: &Spec) -> String {
    let body = serde_json::to_value(spec)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| serde_yaml_ng::to_string(spec).unwrap_or_default());
    let joined = format!("{}\0{}", kind, body);
    format!("blake3:{}", blake3::hash(joined.as_bytes()).to_hex())
}

/// Attribute names whose values differ between two specs.
pub fn changed_keys(old: &Spec, new: &Spec) -> Vec<String> {
    let mut keys: Vec<String> = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    keys.extend(
        old.keys()
            .filter(|k| !new.contains_key(*k))
            .cloned(),
    );
    keys
}

/// Generate a human-readable description of a planned action.
fn describe_action(
    resource_id: &str,
    kind: ResourceKind,
    action: PlanAction,
    changed: &[String],
) -> String {
    match action {
        PlanAction::Create => format!("{}: create {}", resource_id, kind),
        PlanAction::Update if changed.is_empty() => {
            format!("{}: update {} (re-apply)", resource_id, kind)
        }
        PlanAction::Update => format!("{}: update {} ({})", resource_id, kind, changed.join(", ")),
        PlanAction::Replace => format!("{}: replace {}", resource_id, kind),
        PlanAction::Destroy => format!("{}: destroy {}", resource_id, kind),
        PlanAction::NoOp => format!("{}: no changes", resource_id),
    }
}
