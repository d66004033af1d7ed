//! OF-012: Executor — orchestration loop for apply and destroy.
//!
//! parse → validate → data lookups → refresh → DAG → plan → for each
//! change: resolve → handler CRUD → read back → lock entry.

use super::parser::validate_declaration;
use super::planner;
use super::refresh::{self, DriftFinding, RefreshReport};
use super::resolver::{self, ResolveContext};
use super::state;
use super::types::*;
use crate::datasources;
use crate::error::{Error, Result};
use crate::resources::{self, Context};
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

/// Options for an apply run.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions<'a> {
    pub state_dir: &'a Path,
    /// Plan only; the API sees read calls and nothing is persisted
    pub dry_run: bool,
    /// Re-apply resources that plan as no-op
    pub force: bool,
    /// Only act on this resource
    pub resource_filter: Option<&'a str>,
}

impl<'a> ApplyOptions<'a> {
    pub fn new(state_dir: &'a Path) -> Self {
        Self {
            state_dir,
            dry_run: false,
            force: false,
            resource_filter: None,
        }
    }
}

/// Everything an apply run produced.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub plan: ExecutionPlan,
    pub result: ApplyResult,
    pub drift: Vec<DriftFinding>,
    /// Resources dropped from the lock because their object was gone
    pub cleared: Vec<String>,
}

/// Outcome of applying a single change.
enum ResourceOutcome {
    Created,
    Updated,
    Replaced,
    Destroyed,
    Unchanged,
    /// Filtered out
    Skipped,
}

/// Shared state while walking a plan.
struct RunCtx<'a, 'c> {
    ctx: &'a Context<'c>,
    decl: &'a Declaration,
    opts: &'a ApplyOptions<'a>,
    lock: StateLock,
    resolve: ResolveContext,
}

/// Execute the apply loop.
pub fn apply(ctx: &Context<'_>, decl: &Declaration, opts: &ApplyOptions<'_>) -> Result<ApplyReport> {
    let start = Instant::now();

    let errors = validate_declaration(decl);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(Error::validation("declaration", messages.join("; ")));
    }

    let execution_order = resolver::build_execution_order(decl)?;
    let mut lock = state::load_lock(opts.state_dir, &decl.name)?
        .unwrap_or_else(|| state::new_lock(&decl.name));

    let mut resolve = ResolveContext::new(decl.params.clone());
    for (id, data) in &decl.data {
        resolve.data.insert(id.clone(), datasources::lookup(ctx, id, data)?);
    }

    let report = if decl.policy.refresh {
        refresh::refresh(ctx, &mut lock)?
    } else {
        RefreshReport::default()
    };
    for (id, entry) in &lock.resources {
        resolve.resources.insert(id.clone(), entry.attributes.clone());
    }

    let plan = planner::plan(decl, &execution_order, Some(&lock), &resolve);
    tracing::info!(
        name = %decl.name,
        create = plan.to_create,
        update = plan.to_update,
        replace = plan.to_replace,
        destroy = plan.to_destroy,
        unchanged = plan.unchanged,
        dry_run = opts.dry_run,
        "plan ready"
    );

    if opts.dry_run {
        let result = ApplyResult {
            name: decl.name.clone(),
            unchanged: plan.unchanged,
            total_duration: start.elapsed(),
            ..Default::default()
        };
        return Ok(ApplyReport {
            plan,
            result,
            drift: report.drift,
            cleared: report.cleared,
        });
    }

    let mut run = RunCtx {
        ctx,
        decl,
        opts,
        lock,
        resolve,
    };
    let mut result = ApplyResult {
        name: decl.name.clone(),
        ..Default::default()
    };
    let mut failed: HashSet<String> = HashSet::new();
    let mut stopped = false;

    for change in &plan.changes {
        if stopped {
            result.skipped += 1;
            continue;
        }
        if let Some(blocker) = blocked_by(&run, change, &failed) {
            tracing::warn!(resource = %change.resource_id, dependency = %blocker, "skipped, dependency failed");
            failed.insert(change.resource_id.clone());
            result.skipped += 1;
            continue;
        }

        match apply_change(&mut run, change) {
            Ok(ResourceOutcome::Created) => result.created += 1,
            Ok(ResourceOutcome::Updated) => result.updated += 1,
            Ok(ResourceOutcome::Replaced) => result.replaced += 1,
            Ok(ResourceOutcome::Destroyed) => result.destroyed += 1,
            Ok(ResourceOutcome::Unchanged) => result.unchanged += 1,
            Ok(ResourceOutcome::Skipped) => {}
            Err(e) => {
                tracing::error!(resource = %change.resource_id, action = %change.action, error = %e, "apply failed");
                result.failed += 1;
                result.failures.push(ResourceFailure {
                    resource_id: change.resource_id.clone(),
                    error: e.to_string(),
                });
                failed.insert(change.resource_id.clone());
                if decl.policy.failure == FailurePolicy::StopOnFirst {
                    tracing::warn!(resource = %change.resource_id, "stopping after first failure");
                    stopped = true;
                }
            }
        }
    }

    let mut lock = run.lock;
    lock.generated_at = state::now_rfc3339();
    if decl.policy.lock_file {
        state::save_lock(opts.state_dir, &lock)?;
    }

    result.total_duration = start.elapsed();
    tracing::info!(
        name = %decl.name,
        created = result.created,
        updated = result.updated,
        replaced = result.replaced,
        destroyed = result.destroyed,
        unchanged = result.unchanged,
        failed = result.failed,
        skipped = result.skipped,
        seconds = result.total_duration.as_secs_f64(),
        "apply finished"
    );

    Ok(ApplyReport {
        plan,
        result,
        drift: report.drift,
        cleared: report.cleared,
    })
}

/// A failed resource this change has to wait for, if any.
///
/// Declared resources wait for their dependencies; destroys wait for the
/// locked resources that depend on them.
fn blocked_by(run: &RunCtx<'_, '_>, change: &PlannedChange, failed: &HashSet<String>) -> Option<String> {
    if failed.is_empty() {
        return None;
    }
    if change.action == PlanAction::Destroy {
        return run
            .lock
            .resources
            .iter()
            .find(|(id, entry)| failed.contains(*id) && entry.depends_on.contains(&change.resource_id))
            .map(|(id, _)| id.clone());
    }
    let resource = run.decl.resources.get(&change.resource_id)?;
    resolver::all_dependencies(resource)
        .unwrap_or_default()
        .into_iter()
        .find(|dep| failed.contains(dep))
}

/// Apply a single planned change.
fn apply_change(run: &mut RunCtx<'_, '_>, change: &PlannedChange) -> Result<ResourceOutcome> {
    if run
        .opts
        .resource_filter
        .is_some_and(|filter| filter != change.resource_id)
    {
        return Ok(ResourceOutcome::Skipped);
    }

    if change.action == PlanAction::Destroy {
        destroy_entry(run.ctx, &mut run.lock, &change.resource_id)?;
        run.resolve.resources.shift_remove(&change.resource_id);
        return Ok(ResourceOutcome::Destroyed);
    }

    let decl = run.decl;
    let resource = decl
        .resources
        .get(&change.resource_id)
        .ok_or_else(|| Error::Resolve(format!("resource '{}' is not declared", change.resource_id)))?;
    let handler = resources::handler(resource.kind);

    // References to resources applied earlier in this run resolve now.
    let spec = resolver::resolve_spec(&resource.spec, &run.resolve)?;
    let problems = handler.validate(&spec);
    if !problems.is_empty() {
        return Err(Error::validation(
            format!("resource '{}' ({})", change.resource_id, resource.kind),
            problems.join("; "),
        ));
    }

    let entry = run.lock.resources.get(&change.resource_id);
    let (mut action, _) = planner::determine_action(resource.kind, &spec, entry);
    if action == PlanAction::NoOp {
        if !run.opts.force {
            return Ok(ResourceOutcome::Unchanged);
        }
        action = PlanAction::Update;
    }

    let deps = resolver::all_dependencies(resource)?;
    let started = Instant::now();
    tracing::info!(resource = %change.resource_id, kind = %resource.kind, action = %action, "applying");

    let outcome = match action {
        PlanAction::Create => {
            create_entry(run, &change.resource_id, resource.kind, &spec, deps, started)?;
            ResourceOutcome::Created
        }
        PlanAction::Replace => {
            destroy_entry(run.ctx, &mut run.lock, &change.resource_id)?;
            create_entry(run, &change.resource_id, resource.kind, &spec, deps, started)?;
            ResourceOutcome::Replaced
        }
        _ => {
            update_entry(run, &change.resource_id, &spec, deps, started)?;
            ResourceOutcome::Updated
        }
    };
    Ok(outcome)
}

/// Create, wait for, configure and read back a resource.
///
/// The entry is recorded as Tainted as soon as the object is allocated, so
/// a failed wait or configure is replaced by the next apply instead of
/// leaking.
fn create_entry(
    run: &mut RunCtx<'_, '_>,
    resource_id: &str,
    kind: ResourceKind,
    spec: &Spec,
    depends_on: Vec<String>,
    started: Instant,
) -> Result<()> {
    let handler = resources::handler(kind);
    let remote_id = handler.create(run.ctx, spec)?;
    run.lock.resources.insert(
        resource_id.to_string(),
        ResourceLock {
            kind,
            status: ResourceStatus::Tainted,
            remote_id: Some(remote_id),
            applied_at: Some(state::now_rfc3339()),
            duration_seconds: None,
            hash: planner::hash_desired_state(kind, spec),
            depends_on,
            spec: spec.clone(),
            attributes: Attributes::new(),
        },
    );

    handler.wait_created(run.ctx, remote_id, spec)?;
    handler.configure(run.ctx, remote_id, spec)?;
    let attributes = handler.read(run.ctx, remote_id, spec)?;
    record_success(run, resource_id, attributes, started);
    tracing::info!(resource = %resource_id, kind = %kind, remote_id, "created");
    Ok(())
}

/// Update a locked resource in place and read it back.
fn update_entry(
    run: &mut RunCtx<'_, '_>,
    resource_id: &str,
    spec: &Spec,
    depends_on: Vec<String>,
    started: Instant,
) -> Result<()> {
    let entry = run
        .lock
        .resources
        .get(resource_id)
        .ok_or_else(|| Error::Resolve(format!("resource '{}' has no state to update", resource_id)))?;
    let remote_id = entry
        .remote_id
        .ok_or_else(|| Error::Resolve(format!("resource '{}' has no remote id", resource_id)))?;
    let kind = entry.kind;
    let old = observed_spec(resource_id, entry);
    let handler = resources::handler(kind);

    let result = handler
        .update(run.ctx, remote_id, &old, spec)
        .and_then(|()| handler.read(run.ctx, remote_id, spec));
    let attributes = match result {
        Ok(attributes) => attributes,
        Err(e) => {
            // Keep the last applied spec so the retry diffs against it.
            if let Some(entry) = run.lock.resources.get_mut(resource_id) {
                entry.status = ResourceStatus::Failed;
            }
            return Err(e);
        }
    };

    if let Some(entry) = run.lock.resources.get_mut(resource_id) {
        entry.hash = planner::hash_desired_state(kind, spec);
        entry.spec = spec.clone();
        entry.depends_on = depends_on;
        entry.applied_at = Some(state::now_rfc3339());
    }
    record_success(run, resource_id, attributes, started);
    tracing::info!(resource = %resource_id, kind = %kind, remote_id, "updated");
    Ok(())
}

/// The last applied spec with drifted attributes replaced by what was
/// read back, so a diff-based update puts them back.
fn observed_spec(resource_id: &str, entry: &ResourceLock) -> Spec {
    let mut old = entry.spec.clone();
    if entry.status == ResourceStatus::Drifted {
        for finding in refresh::detect_drift(resource_id, entry.kind, &entry.spec, &entry.attributes) {
            if let Some(actual) = entry.attributes.get(&finding.attribute) {
                old.insert(finding.attribute, actual.clone());
            }
        }
    }
    old
}

fn record_success(run: &mut RunCtx<'_, '_>, resource_id: &str, attributes: Attributes, started: Instant) {
    run.resolve
        .resources
        .insert(resource_id.to_string(), attributes.clone());
    if let Some(entry) = run.lock.resources.get_mut(resource_id) {
        entry.status = ResourceStatus::Converged;
        entry.duration_seconds = Some(started.elapsed().as_secs_f64());
        entry.attributes = attributes;
    }
}

/// Delete a locked resource's remote object and drop its entry. An object
/// that is already gone counts as deleted.
fn destroy_entry(ctx: &Context<'_>, lock: &mut StateLock, resource_id: &str) -> Result<()> {
    let Some(entry) = lock.resources.get(resource_id) else {
        return Ok(());
    };
    if let Some(remote_id) = entry.remote_id {
        let handler = resources::handler(entry.kind);
        match handler.delete(ctx, remote_id, &entry.spec) {
            Ok(()) => tracing::info!(resource = %resource_id, kind = %entry.kind, remote_id, "destroyed"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(resource = %resource_id, remote_id, "already gone")
            }
            Err(e) => return Err(e),
        }
    }
    lock.resources.shift_remove(resource_id);
    Ok(())
}

/// Destroy every locked resource of a declaration, dependents first.
///
/// Stops at the first failure; the lock keeps whatever was not removed.
pub fn destroy(ctx: &Context<'_>, name: &str, state_dir: &Path) -> Result<ApplyResult> {
    let start = Instant::now();
    let mut result = ApplyResult {
        name: name.to_string(),
        ..Default::default()
    };
    let Some(mut lock) = state::load_lock(state_dir, name)? else {
        tracing::info!(name, "nothing to destroy");
        return Ok(result);
    };

    let ids: Vec<String> = lock.resources.keys().cloned().collect();
    let order = resolver::destroy_order(&lock, &ids);
    let total = order.len() as u32;
    for id in order {
        match destroy_entry(ctx, &mut lock, &id) {
            Ok(()) => result.destroyed += 1,
            Err(e) => {
                tracing::error!(resource = %id, error = %e, "destroy failed");
                result.failed += 1;
                result.failures.push(ResourceFailure {
                    resource_id: id,
                    error: e.to_string(),
                });
                break;
            }
        }
    }
    result.skipped = total - result.destroyed - result.failed;

    lock.generated_at = state::now_rfc3339();
    state::save_lock(state_dir, &lock)?;
    result.total_duration = start.elapsed();
    tracing::info!(name, destroyed = result.destroyed, failed = result.failed, "destroy finished");
    Ok(result)
}

/// Refresh a declaration's lock against the remote objects and save it.
pub fn refresh_only(ctx: &Context<'_>, name: &str, state_dir: &Path) -> Result<RefreshReport> {
    let Some(mut lock) = state::load_lock(state_dir, name)? else {
        return Ok(RefreshReport::default());
    };
    let report = refresh::refresh(ctx, &mut lock)?;
    lock.generated_at = state::now_rfc3339();
    state::save_lock(state_dir, &lock)?;
    Ok(report)
}
