//! Virtual machine resource.
//!
//! A VM is instantiated from `template_id` (the shape is merged over the
//! template) or allocated from the shape alone. Capacity changes need the
//! VM powered off, so a resize runs poweroff, resize, resume. Disks and
//! NICs are hot-plugged by list difference.

use super::common::{self, Access, Labels, LABEL_KEYS, LOCK_KEYS, OWNER_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{Action, AllocateRequest, ObjectKind, VmAction, VmState};
use crate::config::Operation;
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::core::wait::{self, NOT_FOUND};
use crate::error::{ApiError, Error, Result};
use crate::template::vm::{self, DiskSpec, NicSpec, VmShape, SHAPE_KEYS};
use crate::template::{DynTemplate, Vector};
use serde::Deserialize;
use std::time::Duration;

const KEYS: &[&str] = &["name", "template_id", "pending", "hard_shutdown"];

const BOOTING: &[&str] = &["PENDING", "LCM_INIT", "PROLOG", "BOOT", "POWEROFF"];
const POWERING_OFF: &[&str] = &["RUNNING", "SHUTDOWN_POWEROFF"];
const TERMINATING: &[&str] = &[
    "PENDING",
    "HOLD",
    "LCM_INIT",
    "PROLOG",
    "BOOT",
    "RUNNING",
    "POWEROFF",
    "SHUTDOWN",
    "SHUTDOWN_POWEROFF",
];

#[derive(Debug, Clone, Deserialize)]
struct VmSpec {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    template_id: Option<u32>,
    /// Keep the VM on hold instead of deploying it
    #[serde(default)]
    pending: bool,
    #[serde(default)]
    hard_shutdown: bool,
    #[serde(flatten)]
    shape: VmShape,
    #[serde(flatten)]
    access: Access,
    #[serde(flatten)]
    labels: Labels,
}

impl VmSpec {
    fn problems(&self) -> Vec<String> {
        let mut problems = self.access.problems();
        problems.extend(self.shape.problems());
        if self.template_id.is_none() {
            if self.shape.cpu.is_none() {
                problems.push("cpu is required without template_id".to_string());
            }
            if self.shape.memory.is_none() {
                problems.push("memory is required without template_id".to_string());
            }
        }
        problems
    }

    fn capacity(&self) -> (Option<f64>, Option<u32>, Option<u64>) {
        (self.shape.cpu, self.shape.vcpu, self.shape.memory)
    }
}

/// Items only in `new`, then items only in `old`, counting duplicates.
fn list_diff<T: PartialEq + Clone>(old: &[T], new: &[T]) -> (Vec<T>, Vec<T>) {
    let mut unmatched: Vec<Option<&T>> = new.iter().map(Some).collect();
    let mut removed = Vec::new();
    for item in old {
        match unmatched.iter_mut().find(|slot| slot.is_some_and(|n| n == item)) {
            Some(slot) => *slot = None,
            None => removed.push(item.clone()),
        }
    }
    let added = unmatched.into_iter().flatten().cloned().collect();
    (added, removed)
}

/// Every pair of `declared` is present in `remote` with the same value.
fn covers(declared: &Vector, remote: &Vector) -> bool {
    declared
        .pairs
        .iter()
        .all(|p| remote.get_str(&p.key) == Some(p.value.as_str()))
}

/// Remote ids (`id_key`) of the `key` vectors matching `removed`.
fn remote_ids(template: &DynTemplate, key: &str, id_key: &str, removed: &[Vector]) -> Result<Vec<u32>> {
    let mut taken = Vec::new();
    for declared in removed {
        let id = template
            .vectors(key)
            .filter_map(|v| v.get_parsed::<u32>(id_key).map(|id| (id, v)))
            .find(|(id, v)| !taken.contains(id) && covers(declared, v))
            .map(|(id, _)| id)
            .ok_or_else(|| {
                Error::validation(
                    key.to_lowercase(),
                    format!("no attached {} matches {}", key, attach_request(declared.clone()).trim()),
                )
            })?;
        taken.push(id);
    }
    Ok(taken)
}

fn attach_request(vector: Vector) -> String {
    let mut template = DynTemplate::new();
    template.add_vector(vector);
    template.render()
}

pub struct VirtualMachineHandler;

impl VirtualMachineHandler {
    fn wait(&self, ctx: &Context<'_>, id: u32, timeout: Duration, pending: &[&str], target: &[&str]) -> Result<String> {
        wait::wait_for_vm_state(ctx.api, id, ctx.poll, timeout, pending, target)
    }

    fn resize(&self, ctx: &Context<'_>, id: u32, n: &VmSpec, timeout: Duration) -> Result<()> {
        let (cpu, vcpu, memory) = n.capacity();
        let object = ctx.api.info(ObjectKind::VirtualMachine, id)?;
        let running = wait::vm_state_name(&object) == "RUNNING";

        if running {
            let poweroff = if n.hard_shutdown {
                VmAction::PoweroffHard
            } else {
                VmAction::Poweroff
            };
            tracing::info!(id, "powering off virtual machine to resize");
            ctx.api.action(ObjectKind::VirtualMachine, id, Action::Vm(poweroff))?;
            self.wait(ctx, id, timeout, POWERING_OFF, &["POWEROFF"])?;
        }
        ctx.api
            .action(ObjectKind::VirtualMachine, id, Action::Resize { cpu, vcpu, memory })?;
        if running {
            ctx.api.action(ObjectKind::VirtualMachine, id, Action::Vm(VmAction::Resume))?;
            self.wait(ctx, id, timeout, BOOTING, &["RUNNING"])?;
        }
        Ok(())
    }

    fn hotplug(&self, ctx: &Context<'_>, id: u32, o: &VmSpec, n: &VmSpec) -> Result<()> {
        let old_disks: Vec<Vector> = o.shape.disks.iter().map(DiskSpec::to_vector).collect();
        let new_disks: Vec<Vector> = n.shape.disks.iter().map(DiskSpec::to_vector).collect();
        let old_nics: Vec<Vector> = o.shape.nics.iter().map(NicSpec::to_vector).collect();
        let new_nics: Vec<Vector> = n.shape.nics.iter().map(NicSpec::to_vector).collect();
        let (disks_added, disks_removed) = list_diff(&old_disks, &new_disks);
        let (nics_added, nics_removed) = list_diff(&old_nics, &new_nics);
        if disks_added.is_empty() && disks_removed.is_empty() && nics_added.is_empty() && nics_removed.is_empty() {
            return Ok(());
        }

        let object = ctx.api.info(ObjectKind::VirtualMachine, id)?;
        let template = common::template_of(&object)?;
        for disk in remote_ids(&template, "DISK", "DISK_ID", &disks_removed)? {
            ctx.api.action(ObjectKind::VirtualMachine, id, Action::DetachDisk(disk))?;
        }
        for nic in remote_ids(&template, "NIC", "NIC_ID", &nics_removed)? {
            ctx.api.action(ObjectKind::VirtualMachine, id, Action::DetachNic(nic))?;
        }
        for disk in disks_added {
            ctx.api
                .action(ObjectKind::VirtualMachine, id, Action::AttachDisk(attach_request(disk)))?;
        }
        for nic in nics_added {
            ctx.api
                .action(ObjectKind::VirtualMachine, id, Action::AttachNic(attach_request(nic)))?;
        }
        Ok(())
    }

    fn update_conf(&self, ctx: &Context<'_>, id: u32, o: &VmSpec, n: &VmSpec) -> Result<()> {
        let changed = o.shape.context != n.shape.context
            || o.shape.graphics != n.shape.graphics
            || o.shape.os != n.shape.os;
        if !changed {
            return Ok(());
        }
        let conf = vm::generate(&VmShape {
            context: n.shape.context.clone(),
            graphics: n.shape.graphics.clone(),
            os: n.shape.os.clone(),
            ..Default::default()
        });
        ctx.api
            .action(ObjectKind::VirtualMachine, id, Action::UpdateConf(conf.render()))?;
        Ok(())
    }
}

impl ResourceHandler for VirtualMachineHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::VirtualMachine
    }

    fn force_new(&self) -> &'static [&'static str] {
        &["template_id"]
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<VmSpec, _>(
            spec,
            &[KEYS, SHAPE_KEYS, OWNER_KEYS, LOCK_KEYS, LABEL_KEYS],
            VmSpec::problems,
        )
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: VmSpec = common::decode(spec)?;
        let mut template = vm::generate(&s.shape);
        s.labels.add_to(ctx, &mut template);

        let id = match s.template_id {
            Some(template_id) => ctx.api.allocate(
                ObjectKind::VirtualMachine,
                AllocateRequest::Instantiate {
                    template_id,
                    name: s.name.clone().unwrap_or_default(),
                    hold: s.pending,
                    extra: template.render(),
                },
            )?,
            None => {
                if let Some(ref name) = s.name {
                    template.set_pair("NAME", name);
                }
                ctx.api.allocate(
                    ObjectKind::VirtualMachine,
                    AllocateRequest::Template {
                        template: template.render(),
                        cluster_id: None,
                        datastore_id: None,
                    },
                )?
            }
        };
        tracing::info!(id, "virtual machine allocated");
        Ok(id)
    }

    fn wait_created(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: VmSpec = common::decode(spec)?;
        // Allocated from a raw template; instantiate holds on its own.
        if s.pending && s.template_id.is_none() {
            ctx.api.action(ObjectKind::VirtualMachine, id, Action::Vm(VmAction::Hold))?;
        }
        let target = if s.pending { "HOLD" } else { "RUNNING" };
        tracing::info!(id, target, "waiting for virtual machine");
        self.wait(ctx, id, ctx.timeout(spec, Operation::Create)?, BOOTING, &[target])?;
        Ok(())
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: VmSpec = common::decode(spec)?;
        common::apply_access(ctx, ObjectKind::VirtualMachine, id, &s.access, None)?;
        common::apply_lock(ctx, ObjectKind::VirtualMachine, id, s.access.lock.as_deref())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: VmSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::VirtualMachine, id)?;
        if object.state == VmState::Done.code() {
            return Err(ApiError::NotFound {
                kind: ObjectKind::VirtualMachine,
                id,
            }
            .into());
        }
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        common::ownership_attributes(&object, &mut attrs);
        common::lock_attribute(&object, &s.access, &mut attrs);
        if let Some(template_id) = template.get_parsed::<u32>("TEMPLATE_ID") {
            common::put(&mut attrs, "template_id", template_id);
        }
        let state = wait::vm_state_name(&object);
        common::put(&mut attrs, "pending", state == "HOLD");
        common::put(&mut attrs, "state", state);
        common::put_fields(&mut attrs, &vm::flatten(&template).respelled(&s.shape))?;
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: VmSpec = common::decode(old)?;
        let n: VmSpec = common::decode(new)?;
        let timeout = ctx.timeout(new, Operation::Update)?;
        let lock = common::desired_lock(&o.access, &n.access);

        common::with_unlocked(ctx, ObjectKind::VirtualMachine, id, lock, || {
            if let (Some(old_name), Some(new_name)) = (&o.name, &n.name) {
                common::rename_if_changed(ctx, ObjectKind::VirtualMachine, id, old_name, new_name)?;
            }

            match (o.pending, n.pending) {
                (false, true) => {
                    ctx.api.action(ObjectKind::VirtualMachine, id, Action::Vm(VmAction::Hold))?;
                }
                (true, false) => {
                    ctx.api
                        .action(ObjectKind::VirtualMachine, id, Action::Vm(VmAction::Release))?;
                    self.wait(ctx, id, timeout, BOOTING, &["RUNNING"])?;
                }
                _ => {}
            }

            if o.capacity() != n.capacity() {
                self.resize(ctx, id, &n, timeout)?;
            }
            self.hotplug(ctx, id, &o, &n)?;
            self.update_conf(ctx, id, &o, &n)?;

            common::update_template(ctx, ObjectKind::VirtualMachine, id, |tpl| {
                common::set_if_changed(
                    tpl,
                    "SCHED_REQUIREMENTS",
                    o.shape.sched_requirements.as_ref(),
                    n.shape.sched_requirements.as_ref(),
                );
                common::set_if_changed(
                    tpl,
                    "SCHED_DS_REQUIREMENTS",
                    o.shape.sched_ds_requirements.as_ref(),
                    n.shape.sched_ds_requirements.as_ref(),
                );
                common::set_if_changed(
                    tpl,
                    "DESCRIPTION",
                    o.shape.description.as_ref(),
                    n.shape.description.as_ref(),
                );
                n.labels.reconcile(ctx, &o.labels, tpl);
            })?;
            common::apply_access(ctx, ObjectKind::VirtualMachine, id, &n.access, Some(&o.access))
        })
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: VmSpec = common::decode(spec)?;
        common::unlock_if_locked(ctx, ObjectKind::VirtualMachine, id)?;
        let terminate = if s.hard_shutdown {
            VmAction::TerminateHard
        } else {
            VmAction::Terminate
        };
        ctx.api.action(ObjectKind::VirtualMachine, id, Action::Vm(terminate))?;
        self.wait(
            ctx,
            id,
            ctx.timeout(spec, Operation::Delete)?,
            TERMINATING,
            &["DONE", NOT_FOUND],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryCloud;
    use crate::api::{CloudApi, LcmState};
    use crate::config::ProviderConfig;
    use crate::resources::testing::{allocate, ctx, spec};

    fn base_template(cloud: &MemoryCloud) -> u32 {
        allocate(cloud, ObjectKind::Template, "NAME=\"base\"\nCPU=\"1\"\nMEMORY=\"512\"\nDISK=[ IMAGE_ID=\"0\" ]")
    }

    fn running(cloud: &MemoryCloud, yaml: &str) -> (u32, Spec) {
        let config = ProviderConfig::default();
        let ctx = ctx(cloud, &config);
        let s = spec(yaml);
        assert!(VirtualMachineHandler.validate(&s).is_empty(), "{:?}", VirtualMachineHandler.validate(&s));
        let id = VirtualMachineHandler.create(&ctx, &s).unwrap();
        VirtualMachineHandler.wait_created(&ctx, id, &s).unwrap();
        VirtualMachineHandler.configure(&ctx, id, &s).unwrap();
        (id, s)
    }

    #[test]
    fn test_of055_instantiate_and_read() {
        let cloud = MemoryCloud::with_settle_polls(3);
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let tpl = base_template(&cloud);
        let (id, s) = running(
            &cloud,
            &format!("name: web-1\ntemplate_id: {}\nmemory: 1024\ncontext: {{ hostname: web-1 }}\ntags: {{ env: prod }}\n", tpl),
        );

        let attrs = VirtualMachineHandler.read(&ctx, id, &s).unwrap();
        assert_eq!(attrs["state"], "RUNNING");
        assert_eq!(attrs["template_id"].as_u64(), Some(u64::from(tpl)));
        assert_eq!(attrs["memory"].as_u64(), Some(1024));
        assert_eq!(attrs["context"]["hostname"], "web-1");
        assert_eq!(attrs["pending"].as_bool(), Some(false));
        assert_eq!(attrs["tags"]["env"], "prod");
        assert!(crate::core::refresh::detect_drift("vm", ResourceKind::VirtualMachine, &s, &attrs).is_empty());
    }

    #[test]
    fn test_of055_pending_then_release() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let (id, old) = running(&cloud, "name: held\ncpu: 1\nmemory: 256\npending: true\n");
        let obj = cloud.info(ObjectKind::VirtualMachine, id).unwrap();
        assert_eq!(obj.state, VmState::Hold.code());

        let new = spec("name: held\ncpu: 1\nmemory: 256\npending: false\n");
        VirtualMachineHandler.update(&ctx, id, &old, &new).unwrap();
        let obj = cloud.info(ObjectKind::VirtualMachine, id).unwrap();
        assert_eq!(wait::vm_state_name(&obj), "RUNNING");
    }

    #[test]
    fn test_of055_resize_cycles_power() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let (id, old) = running(&cloud, "name: app\ncpu: 1\nmemory: 512\n");

        cloud.clear_calls();
        let new = spec("name: app\ncpu: 2\nmemory: 2048\n");
        VirtualMachineHandler.update(&ctx, id, &old, &new).unwrap();

        let prefix = format!("action virtual machine {} ", id);
        let actions: Vec<String> = cloud
            .calls()
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect();
        assert_eq!(actions, vec!["poweroff", "resize", "resume"]);
        let obj = cloud.info(ObjectKind::VirtualMachine, id).unwrap();
        let tpl = common::template_of(&obj).unwrap();
        assert_eq!(tpl.get_str("MEMORY"), Some("2048"));
        assert_eq!(obj.lcm_state, LcmState::Running.code());
    }

    #[test]
    fn test_of055_hotplug_by_diff() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let (id, old) = running(
            &cloud,
            "name: db\ncpu: 1\nmemory: 512\ndisks: [ { image_id: 4 }, { size: 1024, type: fs } ]\nnics: [ { network_id: 1 } ]\n",
        );

        cloud.clear_calls();
        let new = spec("name: db\ncpu: 1\nmemory: 512\ndisks: [ { image_id: 4 }, { size: 2048, type: fs } ]\nnics: [ { network_id: 1 }, { network_id: 2 } ]\n");
        VirtualMachineHandler.update(&ctx, id, &old, &new).unwrap();

        let calls = cloud.calls();
        assert!(calls.contains(&format!("action virtual machine {} disk-detach", id)));
        assert!(calls.contains(&format!("action virtual machine {} disk-attach", id)));
        assert!(calls.contains(&format!("action virtual machine {} nic-attach", id)));
        assert!(!calls.iter().any(|c| c.ends_with("nic-detach")));

        let attrs = VirtualMachineHandler.read(&ctx, id, &new).unwrap();
        assert!(crate::core::refresh::detect_drift("vm", ResourceKind::VirtualMachine, &new, &attrs).is_empty());
    }

    #[test]
    fn test_of055_context_update_uses_updateconf() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let (id, old) = running(&cloud, "cpu: 1\nmemory: 512\ncontext: { network: \"YES\" }\n");
        let new = spec("cpu: 1\nmemory: 512\ncontext: { network: \"YES\", ssh_public_key: abc }\n");
        cloud.clear_calls();
        VirtualMachineHandler.update(&ctx, id, &old, &new).unwrap();
        assert!(cloud.calls().contains(&format!("action virtual machine {} updateconf", id)));
        let obj = cloud.info(ObjectKind::VirtualMachine, id).unwrap();
        let tpl = common::template_of(&obj).unwrap();
        assert_eq!(tpl.get_vector("CONTEXT").unwrap().get_str("SSH_PUBLIC_KEY"), Some("abc"));
    }

    #[test]
    fn test_of055_update_keeps_inherited_scheduling() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let tpl = allocate(
            &cloud,
            ObjectKind::Template,
            "NAME=\"sched\"\nCPU=\"1\"\nMEMORY=\"512\"\nSCHED_REQUIREMENTS=\"HYPERVISOR=kvm\"",
        );
        let (id, old) = running(&cloud, &format!("name: web\ntemplate_id: {}\ntags: {{ env: dev }}\n", tpl));

        let new = spec(&format!("name: web\ntemplate_id: {}\ntags: {{ env: prod }}\n", tpl));
        VirtualMachineHandler.update(&ctx, id, &old, &new).unwrap();

        let obj = cloud.info(ObjectKind::VirtualMachine, id).unwrap();
        let vm_tpl = common::template_of(&obj).unwrap();
        assert_eq!(vm_tpl.get_str("ENV"), Some("prod"));
        assert_eq!(vm_tpl.get_str("SCHED_REQUIREMENTS"), Some("HYPERVISOR=kvm"));
    }

    #[test]
    fn test_of055_delete_waits_done() {
        let cloud = MemoryCloud::with_settle_polls(2);
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let (id, s) = running(&cloud, "name: tmp\ncpu: 1\nmemory: 128\nhard_shutdown: true\nlock: USE\n");
        VirtualMachineHandler.delete(&ctx, id, &s).unwrap();
        assert!(cloud.calls().contains(&format!("action virtual machine {} terminate-hard", id)));
        assert!(VirtualMachineHandler.read(&ctx, id, &s).unwrap_err().is_not_found());
    }

    #[test]
    fn test_of055_validation_and_diff() {
        let problems = VirtualMachineHandler.validate(&spec("name: bare\n"));
        assert_eq!(problems.len(), 2, "{:?}", problems);
        assert!(VirtualMachineHandler.validate(&spec("template_id: 1\n")).is_empty());
        assert_eq!(VirtualMachineHandler.force_new(), &["template_id"]);

        let (added, removed) = list_diff(&[1, 2, 2, 3], &[2, 3, 3]);
        assert_eq!(added, vec![3]);
        assert_eq!(removed, vec![1, 2]);
    }
}
