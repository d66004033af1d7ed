//! Host resource.
//!
//! A host is allocated with its monitoring and virtualization drivers and
//! is usable once monitoring reports MONITORED. Overcommit declares the
//! CPU and memory the scheduler may hand out; it is stored as the
//! difference to the monitored totals (RESERVED_CPU, RESERVED_MEM).

use super::common::{self, Labels, LABEL_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{Action, AllocateRequest, HostState, ObjectKind, RemoteObject};
use crate::config::Operation;
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::core::wait;
use crate::error::{Error, Result};
use crate::template::DynTemplate;
use serde::{Deserialize, Serialize};

const KEYS: &[&str] = &["name", "host_type", "custom", "cluster_id", "overcommit"];

/// Host types whose monitoring and virtualization drivers share the name.
const BUILTIN_TYPES: &[&str] = &["kvm", "qemu", "lxd", "lxc", "firecracker", "vcenter"];

#[derive(Debug, Clone, Deserialize)]
struct HostSpec {
    name: String,
    host_type: String,
    #[serde(default)]
    custom: Option<CustomDrivers>,
    #[serde(default)]
    cluster_id: Option<u32>,
    #[serde(default)]
    overcommit: Option<Overcommit>,
    #[serde(flatten)]
    labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomDrivers {
    virtualization: String,
    information: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Overcommit {
    /// CPU in hundredths of a core
    cpu: i64,
    /// Memory in KB
    memory: i64,
}

impl HostSpec {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let host_type = self.host_type.to_lowercase();
        if host_type == "custom" {
            if self.custom.is_none() {
                problems.push("host_type custom needs a custom block".to_string());
            }
        } else if !BUILTIN_TYPES.contains(&host_type.as_str()) {
            problems.push(format!(
                "invalid host_type \"{}\" (expected one of {}, custom)",
                self.host_type,
                BUILTIN_TYPES.join(", ")
            ));
        } else if self.custom.is_some() {
            problems.push("custom is only valid with host_type custom".to_string());
        }
        problems
    }

    /// (IM_MAD, VM_MAD)
    fn drivers(&self) -> Result<(String, String)> {
        let host_type = self.host_type.to_lowercase();
        if host_type == "custom" {
            return self
                .custom
                .as_ref()
                .map(|c| (c.information.clone(), c.virtualization.clone()))
                .ok_or_else(|| Error::validation("custom", "required for host_type custom"));
        }
        Ok((host_type.clone(), host_type))
    }
}

fn totals(object: &RemoteObject) -> (i64, i64) {
    let get = |key: &str| object.attr(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    (get("TOTAL_CPU"), get("TOTAL_MEM"))
}

fn apply_overcommit(template: &mut DynTemplate, object: &RemoteObject, overcommit: Option<Overcommit>) {
    let (total_cpu, total_mem) = totals(object);
    common::set_or_del(template, "RESERVED_CPU", overcommit.map(|o| total_cpu - o.cpu));
    common::set_or_del(template, "RESERVED_MEM", overcommit.map(|o| total_mem - o.memory));
}

/// Update the template from a fresh read. The reservation keys are only
/// written when the declared overcommit changed from `old`.
fn write_template(
    ctx: &Context<'_>,
    id: u32,
    old: Option<Overcommit>,
    overcommit: Option<Overcommit>,
    edit: impl FnOnce(&mut DynTemplate),
) -> Result<()> {
    let object = ctx.api.info(ObjectKind::Host, id)?;
    common::update_template(ctx, ObjectKind::Host, id, |tpl| {
        if old != overcommit {
            apply_overcommit(tpl, &object, overcommit);
        }
        edit(tpl);
    })?;
    Ok(())
}

pub struct HostHandler;

impl ResourceHandler for HostHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Host
    }

    fn force_new(&self) -> &'static [&'static str] {
        &["host_type"]
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<HostSpec, _>(spec, &[KEYS, LABEL_KEYS], |s| s.problems())
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: HostSpec = common::decode(spec)?;
        let (im_mad, vm_mad) = s.drivers()?;
        let id = ctx.api.allocate(
            ObjectKind::Host,
            AllocateRequest::Host {
                name: s.name.clone(),
                im_mad,
                vm_mad,
                cluster_id: s.cluster_id,
            },
        )?;
        tracing::info!(id, name = %s.name, "host allocated");
        Ok(id)
    }

    fn wait_created(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        tracing::info!(id, "waiting for host monitoring");
        wait::wait_for_host_states(
            ctx.api,
            id,
            ctx.poll,
            ctx.timeout(spec, Operation::Create)?,
            &["MONITORED"],
        )?;
        Ok(())
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: HostSpec = common::decode(spec)?;
        write_template(ctx, id, None, s.overcommit, |tpl| s.labels.add_to(ctx, tpl))
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: HostSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::Host, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        let im_mad = object.attr("IM_MAD").unwrap_or_default();
        let vm_mad = object.attr("VM_MAD").unwrap_or_default();
        let builtin = im_mad == vm_mad && BUILTIN_TYPES.contains(&im_mad);
        if builtin && s.host_type.eq_ignore_ascii_case(im_mad) {
            common::put(&mut attrs, "host_type", s.host_type.as_str());
        } else if builtin {
            common::put(&mut attrs, "host_type", im_mad);
        } else {
            common::put(&mut attrs, "host_type", "custom");
            let custom = CustomDrivers {
                virtualization: vm_mad.to_string(),
                information: im_mad.to_string(),
            };
            common::put_value(&mut attrs, "custom", &custom)?;
        }
        if let Some(cluster) = object.attr("CLUSTER_ID").and_then(|v| v.parse::<u32>().ok()) {
            common::put(&mut attrs, "cluster_id", cluster);
        }
        if let (Some(reserved_cpu), Some(reserved_mem)) = (
            template.get_parsed::<i64>("RESERVED_CPU"),
            template.get_parsed::<i64>("RESERVED_MEM"),
        ) {
            let (total_cpu, total_mem) = totals(&object);
            let overcommit = Overcommit {
                cpu: total_cpu - reserved_cpu,
                memory: total_mem - reserved_mem,
            };
            common::put_value(&mut attrs, "overcommit", &overcommit)?;
        }
        let state = HostState::from_code(object.state).map_or("UNKNOWN", HostState::name);
        common::put(&mut attrs, "state", state);
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: HostSpec = common::decode(old)?;
        let n: HostSpec = common::decode(new)?;
        common::rename_if_changed(ctx, ObjectKind::Host, id, &o.name, &n.name)?;

        if o.cluster_id != n.cluster_id {
            let cluster = n.cluster_id.unwrap_or(0);
            tracing::info!(id, cluster, "moving host");
            ctx.api.action(
                ObjectKind::Cluster,
                cluster,
                Action::AddMember {
                    member: ObjectKind::Host,
                    id,
                },
            )?;
        }

        write_template(ctx, id, o.overcommit, n.overcommit, |tpl| {
            n.labels.reconcile(ctx, &o.labels, tpl)
        })
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        ctx.api.delete(ObjectKind::Host, id)?;
        wait::wait_for_deletion(
            ctx.api,
            ObjectKind::Host,
            id,
            ctx.poll,
            ctx.timeout(spec, Operation::Delete)?,
        )
    }
}
