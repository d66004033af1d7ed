//! OF-031: In-memory OpenNebula endpoint.
//!
//! [`MemoryCloud`] implements [`CloudApi`] over a map of objects. It keeps
//! the front-end's rules that handlers depend on: unique names per kind,
//! locks, single-cluster hosts, resize only while powered off. Remote
//! transitions (image copy, host monitoring, VM boot and shutdown) settle
//! after a configurable number of `info` polls.
//!
//! Tests drive it with [`MemoryCloud::fail_next`], [`MemoryCloud::force_state`]
//! and [`MemoryCloud::drop_object`].

use super::{
    acl, Action, AllocateRequest, CloudApi, DatastoreState, HostState, ImageState, LcmState,
    LockLevel, MarketplaceState, ObjectKind, Permissions, RemoteObject, UpdateMode, VmAction,
    VmState,
};
use crate::error::ApiError;
use crate::template::{DynTemplate, Element};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Monitored capacity every host reports.
pub const HOST_TOTAL_CPU: u64 = 800;
pub const HOST_TOTAL_MEM: u64 = 16_777_216;

const DATASTORE_TYPES: &[&str] = &["IMAGE_DS", "SYSTEM_DS", "FILE_DS"];
const IMAGE_TYPES: &[&str] = &["OS", "CDROM", "DATABLOCK", "KERNEL", "RAMDISK", "CONTEXT"];

#[derive(Debug, Clone, Copy)]
struct Transition {
    polls_left: u32,
    state: i32,
    lcm_state: i32,
}

#[derive(Debug, Clone)]
struct Stored {
    object: RemoteObject,
    template: DynTemplate,
    quotas: DynTemplate,
    transition: Option<Transition>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<(ObjectKind, u32), Stored>,
    next_ids: BTreeMap<ObjectKind, u32>,
    settle_polls: u32,
    failures: Vec<(ObjectKind, &'static str, ApiError)>,
    calls: Vec<String>,
}

/// In-memory cloud endpoint.
#[derive(Debug)]
pub struct MemoryCloud {
    inner: Mutex<Inner>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_template(text: &str) -> Result<DynTemplate, ApiError> {
    text.parse::<DynTemplate>()
        .map_err(|e| ApiError::Invalid(e.to_string()))
}

fn unique_names(kind: ObjectKind) -> bool {
    !matches!(kind, ObjectKind::VirtualMachine | ObjectKind::Acl)
}

fn lockable(kind: ObjectKind) -> bool {
    matches!(
        kind,
        ObjectKind::Image
            | ObjectKind::Template
            | ObjectKind::VirtualMachine
            | ObjectKind::VirtualNetwork
            | ObjectKind::VirtualRouter
            | ObjectKind::VmGroup
    )
}

fn truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_uppercase).as_deref(),
        Some("YES" | "1" | "TRUE")
    )
}

impl Inner {
    fn seed(&mut self, kind: ObjectKind, id: u32, name: &str) {
        self.objects.insert((kind, id), Stored::new(id, name.to_string()));
        let next = self.next_ids.entry(kind).or_insert(0);
        *next = (*next).max(id + 1);
    }

    fn take_failure(&mut self, kind: ObjectKind, op: &'static str) -> Result<(), ApiError> {
        match self
            .failures
            .iter()
            .position(|(k, o, _)| *k == kind && *o == op)
        {
            Some(i) => Err(self.failures.remove(i).2),
            None => Ok(()),
        }
    }

    fn get(&self, kind: ObjectKind, id: u32) -> Result<&Stored, ApiError> {
        self.objects
            .get(&(kind, id))
            .ok_or(ApiError::NotFound { kind, id })
    }

    fn get_mut(&mut self, kind: ObjectKind, id: u32) -> Result<&mut Stored, ApiError> {
        self.objects
            .get_mut(&(kind, id))
            .ok_or(ApiError::NotFound { kind, id })
    }

    fn unlocked_mut(&mut self, kind: ObjectKind, id: u32) -> Result<&mut Stored, ApiError> {
        let stored = self.get_mut(kind, id)?;
        if stored.object.lock.is_some() {
            return Err(ApiError::Locked { kind, id });
        }
        Ok(stored)
    }

    fn check_name(&self, kind: ObjectKind, name: &str, except: Option<u32>) -> Result<(), ApiError> {
        if !unique_names(kind) {
            return Ok(());
        }
        if name.trim().is_empty() {
            return Err(ApiError::Invalid(format!("{} name must not be empty", kind)));
        }
        let taken = self
            .objects
            .iter()
            .any(|((k, id), s)| *k == kind && Some(*id) != except && s.object.name == name);
        if taken {
            return Err(ApiError::NameTaken {
                kind,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn peek_id(&self, kind: ObjectKind) -> u32 {
        self.next_ids.get(&kind).copied().unwrap_or(0)
    }

    fn insert(&mut self, kind: ObjectKind, name: String, template: DynTemplate) -> Result<u32, ApiError> {
        self.check_name(kind, &name, None)?;
        let next = self.next_ids.entry(kind).or_insert(0);
        let id = *next;
        *next += 1;
        let mut stored = Stored::new(id, name);
        stored.template = template;
        self.objects.insert((kind, id), stored);
        Ok(id)
    }

    fn begin(
        &mut self,
        kind: ObjectKind,
        id: u32,
        now: (i32, i32),
        then: (i32, i32),
    ) -> Result<(), ApiError> {
        let polls = self.settle_polls;
        let stored = self.get_mut(kind, id)?;
        stored.object.state = now.0;
        stored.object.lcm_state = now.1;
        stored.transition = Some(Transition {
            polls_left: polls,
            state: then.0,
            lcm_state: then.1,
        });
        Ok(())
    }

    fn settle(&mut self, kind: ObjectKind, id: u32, state: i32) -> Result<(), ApiError> {
        let stored = self.get_mut(kind, id)?;
        stored.object.state = state;
        stored.transition = None;
        Ok(())
    }

    fn add_member(
        &mut self,
        owner: (ObjectKind, u32),
        key: String,
        member: ObjectKind,
        id: u32,
    ) -> Result<(), ApiError> {
        self.get(member, id)?;
        let stored = self.get_mut(owner.0, owner.1)?;
        let ids = stored.object.members.entry(key).or_default();
        if !ids.contains(&id) {
            ids.push(id);
            ids.sort_unstable();
        }
        Ok(())
    }

    fn remove_member(&mut self, owner: (ObjectKind, u32), key: &str, id: u32) -> Result<(), ApiError> {
        let stored = self.get_mut(owner.0, owner.1)?;
        if let Some(ids) = stored.object.members.get_mut(key) {
            ids.retain(|m| *m != id);
        }
        Ok(())
    }

    fn members_key(owner: ObjectKind, member: ObjectKind) -> Result<&'static str, ApiError> {
        member.members_key().ok_or_else(|| ApiError::Unsupported {
            kind: owner,
            action: format!("membership of {}", member),
        })
    }

    fn join_cluster(&mut self, cluster: u32, member: ObjectKind, id: u32) -> Result<(), ApiError> {
        let key = Self::members_key(ObjectKind::Cluster, member)?;
        let cluster_name = self.get(ObjectKind::Cluster, cluster)?.object.name.clone();
        self.get(member, id)?;
        match member {
            ObjectKind::Host => {
                let current: Vec<u32> = self
                    .objects
                    .iter()
                    .filter(|((k, _), s)| *k == ObjectKind::Cluster && s.object.members(key).contains(&id))
                    .map(|((_, cid), _)| *cid)
                    .collect();
                for other in current {
                    self.remove_member((ObjectKind::Cluster, other), key, id)?;
                }
                let host = self.get_mut(ObjectKind::Host, id)?;
                host.object.attrs.insert("CLUSTER_ID".to_string(), cluster.to_string());
                host.object.attrs.insert("CLUSTER".to_string(), cluster_name);
            }
            ObjectKind::Datastore => {
                self.add_member(
                    (ObjectKind::Datastore, id),
                    "CLUSTERS".to_string(),
                    ObjectKind::Cluster,
                    cluster,
                )?;
            }
            _ => {}
        }
        self.add_member((ObjectKind::Cluster, cluster), key.to_string(), member, id)
    }

    fn leave_cluster(&mut self, cluster: u32, member: ObjectKind, id: u32) -> Result<(), ApiError> {
        let key = Self::members_key(ObjectKind::Cluster, member)?;
        self.remove_member((ObjectKind::Cluster, cluster), key, id)?;
        match member {
            // Hosts always belong to a cluster; they fall back to the default.
            ObjectKind::Host if cluster != 0 => self.join_cluster(0, member, id),
            ObjectKind::Datastore => self.remove_member((ObjectKind::Datastore, id), "CLUSTERS", cluster),
            _ => Ok(()),
        }
    }

    fn purge(&mut self, kind: ObjectKind, id: u32) -> bool {
        let existed = self.objects.remove(&(kind, id)).is_some();
        if let Some(key) = kind.members_key() {
            let zoned = format!("_{}", key);
            for stored in self.objects.values_mut() {
                for (k, ids) in stored.object.members.iter_mut() {
                    if k == key || k.ends_with(&zoned) {
                        ids.retain(|m| *m != id);
                    }
                }
            }
        }
        existed
    }

    fn allocate(&mut self, kind: ObjectKind, request: AllocateRequest) -> Result<u32, ApiError> {
        match (kind, request) {
            (
                ObjectKind::Cluster | ObjectKind::Group | ObjectKind::Vdc,
                AllocateRequest::Named { name },
            ) => self.insert(kind, name, DynTemplate::new()),
            (
                ObjectKind::Host,
                AllocateRequest::Host {
                    name,
                    im_mad,
                    vm_mad,
                    cluster_id,
                },
            ) => self.allocate_host(name, im_mad, vm_mad, cluster_id),
            (
                ObjectKind::Image,
                AllocateRequest::Clone {
                    source,
                    name,
                    datastore_id,
                },
            ) => self.clone_image(source, name, datastore_id),
            (
                ObjectKind::VirtualMachine,
                AllocateRequest::Instantiate {
                    template_id,
                    name,
                    hold,
                    extra,
                },
            ) => {
                let mut template = self.get(ObjectKind::Template, template_id)?.template.clone();
                template.merge(&parse_template(&extra)?);
                let name = if name.is_empty() {
                    format!("one-{}", self.peek_id(kind))
                } else {
                    name
                };
                template.del("NAME");
                template.add_pair("TEMPLATE_ID", template_id);
                self.start_vm(name, template, hold)
            }
            (
                ObjectKind::Acl,
                AllocateRequest::Acl {
                    user,
                    resource,
                    rights,
                    zone,
                },
            ) => self.allocate_acl(user, resource, rights, zone.unwrap_or(acl::INDIVIDUAL_ID)),
            (
                kind,
                AllocateRequest::Template {
                    template,
                    cluster_id,
                    datastore_id,
                },
            ) => self.allocate_template(kind, &template, cluster_id, datastore_id),
            (kind, _) => Err(ApiError::Unsupported {
                kind,
                action: "allocate".to_string(),
            }),
        }
    }

    fn allocate_host(
        &mut self,
        name: String,
        im_mad: String,
        vm_mad: String,
        cluster_id: Option<u32>,
    ) -> Result<u32, ApiError> {
        let cluster = cluster_id.unwrap_or(0);
        self.get(ObjectKind::Cluster, cluster)?;
        let id = self.insert(ObjectKind::Host, name, DynTemplate::new())?;
        let host = self.get_mut(ObjectKind::Host, id)?;
        let attrs = &mut host.object.attrs;
        attrs.insert("IM_MAD".to_string(), im_mad);
        attrs.insert("VM_MAD".to_string(), vm_mad);
        attrs.insert("TOTAL_CPU".to_string(), HOST_TOTAL_CPU.to_string());
        attrs.insert("TOTAL_MEM".to_string(), HOST_TOTAL_MEM.to_string());
        self.join_cluster(cluster, ObjectKind::Host, id)?;
        self.begin(
            ObjectKind::Host,
            id,
            (HostState::Init.code(), 0),
            (HostState::Monitored.code(), 0),
        )?;
        Ok(id)
    }

    fn allocate_template(
        &mut self,
        kind: ObjectKind,
        text: &str,
        cluster_id: Option<u32>,
        datastore_id: Option<u32>,
    ) -> Result<u32, ApiError> {
        let mut template = parse_template(text)?;
        let name = template.get_str("NAME").map(str::to_string);
        template.del("NAME");
        match kind {
            ObjectKind::Datastore => {
                let name = name.unwrap_or_default();
                self.allocate_datastore(name, template, cluster_id.unwrap_or(0))
            }
            ObjectKind::Image => {
                let datastore = datastore_id
                    .ok_or_else(|| ApiError::Invalid("image allocation needs a datastore".to_string()))?;
                self.allocate_image(name.unwrap_or_default(), template, datastore)
            }
            ObjectKind::VirtualMachine => {
                let name = name.unwrap_or_else(|| format!("one-{}", self.peek_id(kind)));
                self.start_vm(name, template, false)
            }
            ObjectKind::Marketplace => {
                let mad = template
                    .get_str("MARKET_MAD")
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::Invalid("marketplace needs MARKET_MAD".to_string()))?;
                let id = self.insert(kind, name.unwrap_or_default(), template)?;
                let stored = self.get_mut(kind, id)?;
                stored.object.attrs.insert("MARKET_MAD".to_string(), mad);
                stored.object.state = MarketplaceState::Enabled.code();
                Ok(id)
            }
            ObjectKind::VmGroup => {
                if template.vectors("ROLE").any(|r| r.get_str("NAME").is_none()) {
                    return Err(ApiError::Invalid("every ROLE needs a NAME".to_string()));
                }
                self.insert(kind, name.unwrap_or_default(), template)
            }
            ObjectKind::Template
            | ObjectKind::VirtualNetwork
            | ObjectKind::SecurityGroup
            | ObjectKind::VirtualRouter => self.insert(kind, name.unwrap_or_default(), template),
            _ => Err(ApiError::Unsupported {
                kind,
                action: "allocate from template".to_string(),
            }),
        }
    }

    fn allocate_datastore(
        &mut self,
        name: String,
        mut template: DynTemplate,
        cluster: u32,
    ) -> Result<u32, ApiError> {
        self.get(ObjectKind::Cluster, cluster)?;
        let ds_type = template
            .get_str("TYPE")
            .map(str::to_uppercase)
            .unwrap_or_else(|| "IMAGE_DS".to_string());
        if !DATASTORE_TYPES.contains(&ds_type.as_str()) {
            return Err(ApiError::Invalid(format!("unknown datastore type {}", ds_type)));
        }
        template.del("TYPE");
        let ds_mad = template.get_str("DS_MAD").unwrap_or_default().to_string();
        let tm_mad = template.get_str("TM_MAD").unwrap_or_default().to_string();
        let id = self.insert(ObjectKind::Datastore, name, template)?;
        let stored = self.get_mut(ObjectKind::Datastore, id)?;
        stored.object.attrs.insert("TYPE".to_string(), ds_type);
        stored.object.attrs.insert("DS_MAD".to_string(), ds_mad);
        stored.object.attrs.insert("TM_MAD".to_string(), tm_mad);
        stored.object.state = DatastoreState::Ready.code();
        self.join_cluster(cluster, ObjectKind::Datastore, id)?;
        Ok(id)
    }

    fn image_datastore(&self, datastore: u32) -> Result<String, ApiError> {
        let ds = self.get(ObjectKind::Datastore, datastore)?;
        if ds.object.attr("TYPE") == Some("SYSTEM_DS") {
            return Err(ApiError::Invalid(format!(
                "datastore {} is a system datastore",
                datastore
            )));
        }
        Ok(ds.object.name.clone())
    }

    fn allocate_image(
        &mut self,
        name: String,
        mut template: DynTemplate,
        datastore: u32,
    ) -> Result<u32, ApiError> {
        let ds_name = self.image_datastore(datastore)?;
        let path = template.get_str("PATH").map(str::to_string);
        let size = template.get_str("SIZE").map(str::to_string);
        if path.is_none() && size.is_none() {
            return Err(ApiError::Invalid("image needs PATH or SIZE".to_string()));
        }
        let image_type = template
            .get_str("TYPE")
            .map(str::to_uppercase)
            .unwrap_or_else(|| "OS".to_string());
        if !IMAGE_TYPES.contains(&image_type.as_str()) {
            return Err(ApiError::Invalid(format!("unknown image type {}", image_type)));
        }
        let persistent = truthy(template.get_str("PERSISTENT"));
        for key in ["PATH", "SIZE", "TYPE", "PERSISTENT"] {
            template.del(key);
        }

        let id = self.insert(ObjectKind::Image, name, template)?;
        let stored = self.get_mut(ObjectKind::Image, id)?;
        let attrs = &mut stored.object.attrs;
        attrs.insert("DATASTORE_ID".to_string(), datastore.to_string());
        attrs.insert("DATASTORE".to_string(), ds_name);
        attrs.insert("TYPE".to_string(), image_type);
        attrs.insert("PERSISTENT".to_string(), if persistent { "1" } else { "0" }.to_string());
        attrs.insert("SIZE".to_string(), size.unwrap_or_else(|| "256".to_string()));
        if let Some(path) = path {
            attrs.insert("PATH".to_string(), path);
        }
        self.begin(
            ObjectKind::Image,
            id,
            (ImageState::Locked.code(), 0),
            (ImageState::Ready.code(), 0),
        )?;
        Ok(id)
    }

    fn clone_image(&mut self, source: u32, name: String, datastore_id: Option<u32>) -> Result<u32, ApiError> {
        let original = self.get(ObjectKind::Image, source)?.clone();
        let datastore = match datastore_id {
            Some(ds) => ds,
            None => original
                .object
                .attr("DATASTORE_ID")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
        };
        let ds_name = self.image_datastore(datastore)?;
        let id = self.insert(ObjectKind::Image, name, original.template)?;
        let stored = self.get_mut(ObjectKind::Image, id)?;
        stored.object.attrs = original.object.attrs;
        stored.object.attrs.insert("DATASTORE_ID".to_string(), datastore.to_string());
        stored.object.attrs.insert("DATASTORE".to_string(), ds_name);
        stored.object.attrs.insert("PERSISTENT".to_string(), "0".to_string());
        stored.object.attrs.insert("CLONING_ID".to_string(), source.to_string());
        self.begin(
            ObjectKind::Image,
            id,
            (ImageState::Locked.code(), 0),
            (ImageState::Ready.code(), 0),
        )?;
        Ok(id)
    }

    fn start_vm(&mut self, name: String, mut template: DynTemplate, hold: bool) -> Result<u32, ApiError> {
        number_vectors(&mut template, "DISK", "DISK_ID");
        number_vectors(&mut template, "NIC", "NIC_ID");
        let id = self.insert(ObjectKind::VirtualMachine, name, template)?;
        if hold {
            self.settle(ObjectKind::VirtualMachine, id, VmState::Hold.code())?;
        } else {
            self.begin(
                ObjectKind::VirtualMachine,
                id,
                (VmState::Pending.code(), LcmState::LcmInit.code()),
                (VmState::Active.code(), LcmState::Running.code()),
            )?;
        }
        Ok(id)
    }

    fn allocate_acl(&mut self, user: u64, resource: u64, rights: u64, zone: u64) -> Result<u32, ApiError> {
        let rule = [
            acl::format_users(user),
            acl::format_resources(resource),
            acl::format_rights(rights),
            acl::format_zone(zone),
        ]
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::Invalid(e.to_string()))?
        .join(" ");
        let duplicate = self
            .objects
            .iter()
            .any(|((k, _), s)| *k == ObjectKind::Acl && s.object.attr("STRING") == Some(rule.as_str()));
        if duplicate {
            return Err(ApiError::Invalid(format!("rule \"{}\" already exists", rule)));
        }
        let id = self.insert(ObjectKind::Acl, String::new(), DynTemplate::new())?;
        let stored = self.get_mut(ObjectKind::Acl, id)?;
        let attrs = &mut stored.object.attrs;
        attrs.insert("USER".to_string(), format!("{:x}", user));
        attrs.insert("RESOURCE".to_string(), format!("{:x}", resource));
        attrs.insert("RIGHTS".to_string(), format!("{:x}", rights));
        attrs.insert("ZONE".to_string(), format!("{:x}", zone));
        attrs.insert("STRING".to_string(), rule);
        Ok(id)
    }

    fn action(&mut self, kind: ObjectKind, id: u32, action: Action) -> Result<(), ApiError> {
        match (kind, action) {
            (ObjectKind::Host, Action::Enable(true)) => self.begin(
                kind,
                id,
                (HostState::Init.code(), 0),
                (HostState::Monitored.code(), 0),
            ),
            (ObjectKind::Host, Action::Enable(false)) => {
                self.settle(kind, id, HostState::Disabled.code())
            }
            (ObjectKind::Datastore, Action::Enable(enable)) => {
                let state = if enable {
                    DatastoreState::Ready
                } else {
                    DatastoreState::Disabled
                };
                self.settle(kind, id, state.code())
            }
            (ObjectKind::Marketplace, Action::Enable(enable)) => {
                let now = self.get(kind, id)?.object.state;
                let target = if enable {
                    MarketplaceState::Enabled
                } else {
                    MarketplaceState::Disabled
                };
                self.begin(kind, id, (now, 0), (target.code(), 0))
            }
            (ObjectKind::Image, Action::Enable(enable)) => {
                let state = self.get(kind, id)?.object.state;
                if state != ImageState::Ready.code() && state != ImageState::Disabled.code() {
                    return Err(ApiError::Invalid(format!("image {} is busy", id)));
                }
                let state = if enable {
                    ImageState::Ready
                } else {
                    ImageState::Disabled
                };
                self.settle(kind, id, state.code())
            }
            (ObjectKind::Image, Action::Persistent(persistent)) => {
                let stored = self.unlocked_mut(kind, id)?;
                stored.object.attrs.insert(
                    "PERSISTENT".to_string(),
                    if persistent { "1" } else { "0" }.to_string(),
                );
                Ok(())
            }
            (ObjectKind::Image, Action::ChangeType(image_type)) => {
                let image_type = image_type.to_uppercase();
                if !IMAGE_TYPES.contains(&image_type.as_str()) {
                    return Err(ApiError::Invalid(format!("unknown image type {}", image_type)));
                }
                let stored = self.unlocked_mut(kind, id)?;
                stored.object.attrs.insert("TYPE".to_string(), image_type);
                Ok(())
            }
            (ObjectKind::Cluster, Action::AddMember { member, id: mid }) => {
                self.join_cluster(id, member, mid)
            }
            (ObjectKind::Cluster, Action::RemoveMember { member, id: mid }) => {
                self.leave_cluster(id, member, mid)
            }
            (ObjectKind::Vdc, Action::AddMember { member, id: mid }) => {
                let key = Self::members_key(kind, member)?;
                self.add_member((kind, id), key.to_string(), member, mid)
            }
            (ObjectKind::Vdc, Action::RemoveMember { member, id: mid }) => {
                let key = Self::members_key(kind, member)?;
                self.remove_member((kind, id), key, mid)
            }
            (ObjectKind::Vdc, Action::AddZoneMember { zone, member, id: mid }) => {
                self.get(ObjectKind::Zone, zone)?;
                let key = member.zone_members_key(zone).ok_or_else(|| ApiError::Unsupported {
                    kind,
                    action: format!("membership of {}", member),
                })?;
                self.add_member((kind, id), key, member, mid)
            }
            (ObjectKind::Vdc, Action::RemoveZoneMember { zone, member, id: mid }) => {
                let key = member.zone_members_key(zone).ok_or_else(|| ApiError::Unsupported {
                    kind,
                    action: format!("membership of {}", member),
                })?;
                self.remove_member((kind, id), &key, mid)
            }
            (ObjectKind::VirtualMachine, Action::Vm(vm_action)) => self.vm_action(id, vm_action),
            (ObjectKind::VirtualMachine, Action::Resize { cpu, vcpu, memory }) => {
                let stored = self.get_mut(kind, id)?;
                if stored.object.state != VmState::Poweroff.code() {
                    return Err(ApiError::Invalid(format!(
                        "virtual machine {} must be powered off to resize",
                        id
                    )));
                }
                if let Some(cpu) = cpu {
                    stored.template.set_pair("CPU", cpu);
                }
                if let Some(vcpu) = vcpu {
                    stored.template.set_pair("VCPU", vcpu);
                }
                if let Some(memory) = memory {
                    stored.template.set_pair("MEMORY", memory);
                }
                Ok(())
            }
            (ObjectKind::VirtualMachine, Action::AttachDisk(text)) => {
                self.hotplug_attach(id, &text, "DISK", "DISK_ID")
            }
            (ObjectKind::VirtualMachine, Action::DetachDisk(disk)) => {
                self.hotplug_detach(id, disk, "DISK", "DISK_ID")
            }
            (ObjectKind::VirtualMachine, Action::AttachNic(text)) => {
                self.hotplug_attach(id, &text, "NIC", "NIC_ID")
            }
            (ObjectKind::VirtualMachine, Action::DetachNic(nic)) => {
                self.hotplug_detach(id, nic, "NIC", "NIC_ID")
            }
            (ObjectKind::VirtualMachine, Action::UpdateConf(text)) => {
                let patch = parse_template(&text)?;
                let stored = self.get_mut(kind, id)?;
                if stored.object.state == VmState::Done.code() {
                    return Err(ApiError::Invalid(format!("virtual machine {} is done", id)));
                }
                stored.template.merge(&patch);
                Ok(())
            }
            (ObjectKind::Group, Action::SetQuota(text)) => {
                let update = parse_template(&text)?;
                let stored = self.get_mut(kind, id)?;
                merge_quotas(&mut stored.quotas, &update);
                Ok(())
            }
            (ObjectKind::SecurityGroup, Action::CommitRules) => self.get(kind, id).map(|_| ()),
            (kind, action) => Err(ApiError::Unsupported {
                kind,
                action: action.label(),
            }),
        }
    }

    fn vm_action(&mut self, id: u32, action: VmAction) -> Result<(), ApiError> {
        let kind = ObjectKind::VirtualMachine;
        let object = &self.get(kind, id)?.object;
        let (state, lcm) = (object.state, object.lcm_state);
        let refuse = || {
            let name = VmState::from_code(state).map(|s| s.name()).unwrap_or("UNKNOWN");
            Err(ApiError::Invalid(format!(
                "cannot {} virtual machine {} in state {}",
                action, id, name
            )))
        };
        match action {
            VmAction::Terminate | VmAction::TerminateHard => {
                if state == VmState::Done.code() {
                    return refuse();
                }
                self.begin(
                    kind,
                    id,
                    (VmState::Active.code(), LcmState::Shutdown.code()),
                    (VmState::Done.code(), LcmState::LcmInit.code()),
                )
            }
            VmAction::Poweroff | VmAction::PoweroffHard => {
                if state != VmState::Active.code() || lcm != LcmState::Running.code() {
                    return refuse();
                }
                self.begin(
                    kind,
                    id,
                    (VmState::Active.code(), LcmState::ShutdownPoweroff.code()),
                    (VmState::Poweroff.code(), LcmState::LcmInit.code()),
                )
            }
            VmAction::Resume => {
                let resumable = [
                    VmState::Poweroff,
                    VmState::Suspended,
                    VmState::Stopped,
                    VmState::Undeployed,
                ];
                if !resumable.iter().any(|s| s.code() == state) {
                    return refuse();
                }
                self.begin(
                    kind,
                    id,
                    (VmState::Active.code(), LcmState::Boot.code()),
                    (VmState::Active.code(), LcmState::Running.code()),
                )
            }
            VmAction::Hold => {
                if state != VmState::Pending.code() {
                    return refuse();
                }
                self.settle(kind, id, VmState::Hold.code())
            }
            VmAction::Release => {
                if state != VmState::Hold.code() {
                    return refuse();
                }
                self.begin(
                    kind,
                    id,
                    (VmState::Pending.code(), LcmState::LcmInit.code()),
                    (VmState::Active.code(), LcmState::Running.code()),
                )
            }
        }
    }

    fn hotplug_ready(&self, id: u32) -> Result<(), ApiError> {
        let object = &self.get(ObjectKind::VirtualMachine, id)?.object;
        let running = object.state == VmState::Active.code()
            && object.lcm_state == LcmState::Running.code();
        if running || object.state == VmState::Poweroff.code() {
            Ok(())
        } else {
            Err(ApiError::Invalid(format!(
                "virtual machine {} is not running or powered off",
                id
            )))
        }
    }

    fn hotplug_attach(&mut self, id: u32, text: &str, key: &str, id_key: &str) -> Result<(), ApiError> {
        self.hotplug_ready(id)?;
        let patch = parse_template(text)?;
        let mut vector = patch
            .get_vector(key)
            .cloned()
            .ok_or_else(|| ApiError::Invalid(format!("attach request has no {} vector", key)))?;
        let stored = self.get_mut(ObjectKind::VirtualMachine, id)?;
        let next = stored
            .template
            .vectors(key)
            .filter_map(|v| v.get_parsed::<u32>(id_key))
            .max()
            .map_or(0, |max| max + 1);
        vector.del(id_key);
        vector.add_pair(id_key, next);
        stored.template.add_vector(vector);
        Ok(())
    }

    fn hotplug_detach(&mut self, id: u32, target: u32, key: &str, id_key: &str) -> Result<(), ApiError> {
        self.hotplug_ready(id)?;
        let stored = self.get_mut(ObjectKind::VirtualMachine, id)?;
        let before = stored.template.elements.len();
        stored.template.elements.retain(|e| match e {
            Element::Vector(v) => {
                !(v.key == key && v.get_parsed::<u32>(id_key) == Some(target))
            }
            Element::Pair(_) => true,
        });
        if stored.template.elements.len() == before {
            return Err(ApiError::Invalid(format!(
                "virtual machine {} has no {} {}",
                id, key, target
            )));
        }
        Ok(())
    }

    fn delete(&mut self, kind: ObjectKind, id: u32) -> Result<(), ApiError> {
        self.unlocked_mut(kind, id)?;
        match kind {
            ObjectKind::Cluster if id == 0 => {
                return Err(ApiError::Invalid("the default cluster cannot be deleted".to_string()))
            }
            ObjectKind::Cluster => {
                let hosts = self.get(kind, id)?.object.members("HOSTS").to_vec();
                for host in hosts {
                    self.join_cluster(0, ObjectKind::Host, host)?;
                }
            }
            ObjectKind::Datastore => {
                let id_text = id.to_string();
                let in_use = self.objects.iter().any(|((k, _), s)| {
                    *k == ObjectKind::Image && s.object.attr("DATASTORE_ID") == Some(id_text.as_str())
                });
                if in_use {
                    return Err(ApiError::Invalid(format!("datastore {} is not empty", id)));
                }
            }
            ObjectKind::Group | ObjectKind::User if id <= 1 => {
                return Err(ApiError::Authorization(format!("{} {} is reserved", kind, id)))
            }
            _ => {}
        }
        self.purge(kind, id);
        Ok(())
    }
}

impl Stored {
    fn new(id: u32, name: String) -> Self {
        Self {
            object: RemoteObject {
                id,
                name,
                uname: "oneadmin".to_string(),
                gname: "oneadmin".to_string(),
                permissions: Permissions {
                    owner: 6,
                    group: 0,
                    other: 0,
                },
                ..Default::default()
            },
            template: DynTemplate::new(),
            quotas: DynTemplate::new(),
            transition: None,
        }
    }

    fn snapshot(&self) -> RemoteObject {
        let mut object = self.object.clone();
        object.template = self.template.render();
        object.quotas = self.quotas.render();
        object
    }
}

/// Number every `key` vector in order, overwriting existing ids.
fn number_vectors(template: &mut DynTemplate, key: &str, id_key: &str) {
    let mut next = 0u32;
    for element in &mut template.elements {
        if let Element::Vector(v) = element {
            if v.key == key {
                v.del(id_key);
                v.add_pair(id_key, next);
                next += 1;
            }
        }
    }
}

/// Quota vectors replace the stored vector of the same key and `ID`.
fn merge_quotas(quotas: &mut DynTemplate, update: &DynTemplate) {
    for element in &update.elements {
        if let Element::Vector(vector) = element {
            let id = vector.get_str("ID");
            quotas.elements.retain(|e| match e {
                Element::Vector(v) => !(v.key == vector.key && v.get_str("ID") == id),
                Element::Pair(_) => true,
            });
            quotas.add_vector(vector.clone());
        }
    }
}

impl MemoryCloud {
    /// Transitions settle on the first `info` poll.
    pub fn new() -> Self {
        Self::with_settle_polls(1)
    }

    /// Transitions settle on the `polls`-th `info` poll.
    pub fn with_settle_polls(polls: u32) -> Self {
        let mut inner = Inner {
            settle_polls: polls.max(1),
            ..Default::default()
        };
        inner.seed(ObjectKind::Cluster, 0, "default");
        inner.seed(ObjectKind::Group, 0, "oneadmin");
        inner.seed(ObjectKind::Group, 1, "users");
        inner.seed(ObjectKind::User, 0, "oneadmin");
        inner.seed(ObjectKind::Zone, 0, "OpenNebula");
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `op` call on `kind` fail with `error`.
    pub fn fail_next(&self, kind: ObjectKind, op: &'static str, error: ApiError) {
        self.inner().failures.push((kind, op, error));
    }

    /// Put an object into a state, cancelling any pending transition.
    pub fn force_state(&self, kind: ObjectKind, id: u32, state: i32, lcm_state: i32) -> Result<(), ApiError> {
        let mut inner = self.inner();
        let stored = inner.get_mut(kind, id)?;
        stored.object.state = state;
        stored.object.lcm_state = lcm_state;
        stored.transition = None;
        Ok(())
    }

    /// Set a template pair behind the API's back.
    pub fn set_template_value(&self, kind: ObjectKind, id: u32, key: &str, value: &str) -> Result<(), ApiError> {
        let mut inner = self.inner();
        inner.get_mut(kind, id)?.template.set_pair(key, value);
        Ok(())
    }

    /// Remove an object out of band, ignoring locks.
    pub fn drop_object(&self, kind: ObjectKind, id: u32) -> bool {
        self.inner().purge(kind, id)
    }

    /// Mutating calls made so far, e.g. `"action virtual machine 3 resize"`.
    pub fn calls(&self) -> Vec<String> {
        self.inner().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner().calls.clear();
    }

    /// Number of live objects of a kind.
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.inner()
            .objects
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

impl CloudApi for MemoryCloud {
    fn allocate(&self, kind: ObjectKind, request: AllocateRequest) -> Result<u32, ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "allocate")?;
        let id = inner.allocate(kind, request)?;
        inner.calls.push(format!("allocate {} {}", kind, id));
        Ok(id)
    }

    fn info(&self, kind: ObjectKind, id: u32) -> Result<RemoteObject, ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "info")?;
        let stored = inner.get_mut(kind, id)?;
        if let Some(mut transition) = stored.transition.take() {
            transition.polls_left = transition.polls_left.saturating_sub(1);
            if transition.polls_left == 0 {
                stored.object.state = transition.state;
                stored.object.lcm_state = transition.lcm_state;
            } else {
                stored.transition = Some(transition);
            }
        }
        Ok(stored.snapshot())
    }

    fn list(&self, kind: ObjectKind) -> Result<Vec<RemoteObject>, ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "list")?;
        Ok(inner
            .objects
            .iter()
            .filter(|((k, _), s)| {
                *k == kind
                    && !(kind == ObjectKind::VirtualMachine && s.object.state == VmState::Done.code())
            })
            .map(|(_, s)| s.snapshot())
            .collect())
    }

    fn update(&self, kind: ObjectKind, id: u32, template: &str, mode: UpdateMode) -> Result<(), ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "update")?;
        let mut parsed = parse_template(template)?;
        let stored = inner.unlocked_mut(kind, id)?;
        match mode {
            UpdateMode::Replace => {
                parsed.del("NAME");
                stored.template = parsed;
            }
            UpdateMode::Merge => stored.template.merge(&parsed),
        }
        inner.calls.push(format!("update {} {}", kind, id));
        Ok(())
    }

    fn rename(&self, kind: ObjectKind, id: u32, name: &str) -> Result<(), ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "rename")?;
        inner.check_name(kind, name, Some(id))?;
        inner.unlocked_mut(kind, id)?.object.name = name.to_string();
        inner.calls.push(format!("rename {} {}", kind, id));
        Ok(())
    }

    fn chmod(&self, kind: ObjectKind, id: u32, permissions: Permissions) -> Result<(), ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "chmod")?;
        if kind == ObjectKind::Acl {
            return Err(ApiError::Unsupported {
                kind,
                action: "chmod".to_string(),
            });
        }
        inner.unlocked_mut(kind, id)?.object.permissions = permissions;
        inner.calls.push(format!("chmod {} {}", kind, id));
        Ok(())
    }

    fn chown(&self, kind: ObjectKind, id: u32, uid: Option<u32>, gid: Option<u32>) -> Result<(), ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "chown")?;
        let uname = match uid {
            Some(uid) => Some(inner.get(ObjectKind::User, uid)?.object.name.clone()),
            None => None,
        };
        let gname = match gid {
            Some(gid) => Some(inner.get(ObjectKind::Group, gid)?.object.name.clone()),
            None => None,
        };
        let object = &mut inner.unlocked_mut(kind, id)?.object;
        if let (Some(uid), Some(uname)) = (uid, uname) {
            object.uid = uid;
            object.uname = uname;
        }
        if let (Some(gid), Some(gname)) = (gid, gname) {
            object.gid = gid;
            object.gname = gname;
        }
        inner.calls.push(format!("chown {} {}", kind, id));
        Ok(())
    }

    fn lock(&self, kind: ObjectKind, id: u32, level: LockLevel) -> Result<(), ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "lock")?;
        if !lockable(kind) {
            return Err(ApiError::Unsupported {
                kind,
                action: "lock".to_string(),
            });
        }
        inner.get_mut(kind, id)?.object.lock = Some(level);
        inner.calls.push(format!("lock {} {}", kind, id));
        Ok(())
    }

    fn unlock(&self, kind: ObjectKind, id: u32) -> Result<(), ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "unlock")?;
        inner.get_mut(kind, id)?.object.lock = None;
        inner.calls.push(format!("unlock {} {}", kind, id));
        Ok(())
    }

    fn action(&self, kind: ObjectKind, id: u32, action: Action) -> Result<(), ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "action")?;
        let label = action.label();
        inner.action(kind, id, action)?;
        inner.calls.push(format!("action {} {} {}", kind, id, label));
        Ok(())
    }

    fn delete(&self, kind: ObjectKind, id: u32) -> Result<(), ApiError> {
        let mut inner = self.inner();
        inner.take_failure(kind, "delete")?;
        inner.delete(kind, id)?;
        inner.calls.push(format!("delete {} {}", kind, id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datastore(cloud: &MemoryCloud, name: &str) -> u32 {
        cloud
            .allocate(
                ObjectKind::Datastore,
                AllocateRequest::Template {
                    template: format!("NAME=\"{}\"\nTYPE=\"IMAGE_DS\"\nDS_MAD=\"fs\"\nTM_MAD=\"ssh\"", name),
                    cluster_id: None,
                    datastore_id: None,
                },
            )
            .unwrap()
    }

    fn vm_template(cloud: &MemoryCloud) -> u32 {
        cloud
            .allocate(
                ObjectKind::Template,
                AllocateRequest::Template {
                    template: "NAME=\"small\"\nCPU=\"1\"\nMEMORY=\"512\"\nDISK=[ IMAGE_ID=\"4\" ]".to_string(),
                    cluster_id: None,
                    datastore_id: None,
                },
            )
            .unwrap()
    }

    fn running_vm(cloud: &MemoryCloud) -> u32 {
        let template_id = vm_template(cloud);
        let id = cloud
            .allocate(
                ObjectKind::VirtualMachine,
                AllocateRequest::Instantiate {
                    template_id,
                    name: "web".to_string(),
                    hold: false,
                    extra: String::new(),
                },
            )
            .unwrap();
        cloud.info(ObjectKind::VirtualMachine, id).unwrap();
        id
    }

    #[test]
    fn test_of031_seeded_objects() {
        let cloud = MemoryCloud::new();
        assert_eq!(cloud.info(ObjectKind::Cluster, 0).unwrap().name, "default");
        let groups: Vec<_> = cloud
            .list(ObjectKind::Group)
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(groups, vec!["oneadmin", "users"]);
        assert_eq!(cloud.info(ObjectKind::User, 0).unwrap().name, "oneadmin");
    }

    #[test]
    fn test_of031_names_unique_per_kind() {
        let cloud = MemoryCloud::new();
        let named = |name: &str| AllocateRequest::Named {
            name: name.to_string(),
        };
        cloud.allocate(ObjectKind::Cluster, named("c1")).unwrap();
        let err = cloud.allocate(ObjectKind::Cluster, named("c1")).unwrap_err();
        assert!(matches!(err, ApiError::NameTaken { .. }));
        cloud.allocate(ObjectKind::Group, named("c1")).unwrap();
        let err = cloud.rename(ObjectKind::Cluster, 0, "c1").unwrap_err();
        assert!(matches!(err, ApiError::NameTaken { .. }));
    }

    #[test]
    fn test_of031_lock_rejects_mutation() {
        let cloud = MemoryCloud::new();
        let id = vm_template(&cloud);
        cloud.lock(ObjectKind::Template, id, LockLevel::Use).unwrap();
        assert_eq!(
            cloud.update(ObjectKind::Template, id, "CPU=\"2\"", UpdateMode::Merge),
            Err(ApiError::Locked {
                kind: ObjectKind::Template,
                id
            })
        );
        assert!(cloud.delete(ObjectKind::Template, id).is_err());
        assert!(cloud.chmod(ObjectKind::Template, id, Permissions::default()).is_err());
        cloud.unlock(ObjectKind::Template, id).unwrap();
        cloud
            .update(ObjectKind::Template, id, "CPU=\"2\"", UpdateMode::Merge)
            .unwrap();
        let info = cloud.info(ObjectKind::Template, id).unwrap();
        assert!(info.template.contains("CPU=\"2\""));
        assert!(info.template.contains("MEMORY=\"512\""));
        assert!(cloud.lock(ObjectKind::Cluster, 0, LockLevel::All).is_err());
    }

    #[test]
    fn test_of031_host_moves_between_clusters() {
        let cloud = MemoryCloud::new();
        let c1 = cloud
            .allocate(ObjectKind::Cluster, AllocateRequest::Named { name: "c1".to_string() })
            .unwrap();
        let host = cloud
            .allocate(
                ObjectKind::Host,
                AllocateRequest::Host {
                    name: "node1".to_string(),
                    im_mad: "kvm".to_string(),
                    vm_mad: "kvm".to_string(),
                    cluster_id: None,
                },
            )
            .unwrap();
        assert_eq!(cloud.info(ObjectKind::Cluster, 0).unwrap().members("HOSTS"), &[host]);
        cloud
            .action(ObjectKind::Cluster, c1, Action::AddMember { member: ObjectKind::Host, id: host })
            .unwrap();
        assert!(cloud.info(ObjectKind::Cluster, 0).unwrap().members("HOSTS").is_empty());
        assert_eq!(cloud.info(ObjectKind::Cluster, c1).unwrap().members("HOSTS"), &[host]);
        let cluster_id = c1.to_string();
        assert_eq!(
            cloud.info(ObjectKind::Host, host).unwrap().attr("CLUSTER_ID"),
            Some(cluster_id.as_str())
        );

        cloud.delete(ObjectKind::Cluster, c1).unwrap();
        assert_eq!(cloud.info(ObjectKind::Cluster, 0).unwrap().members("HOSTS"), &[host]);
        cloud.delete(ObjectKind::Host, host).unwrap();
        assert!(cloud.info(ObjectKind::Cluster, 0).unwrap().members("HOSTS").is_empty());
    }

    #[test]
    fn test_of031_image_settles_after_polls() {
        let cloud = MemoryCloud::with_settle_polls(3);
        let ds = datastore(&cloud, "images");
        let id = cloud
            .allocate(
                ObjectKind::Image,
                AllocateRequest::Template {
                    template: "NAME=\"img\"\nSIZE=\"1024\"\nTYPE=\"datablock\"".to_string(),
                    cluster_id: None,
                    datastore_id: Some(ds),
                },
            )
            .unwrap();
        let states: Vec<i32> = (0..3)
            .map(|_| cloud.info(ObjectKind::Image, id).unwrap().state)
            .collect();
        assert_eq!(
            states,
            vec![
                ImageState::Locked.code(),
                ImageState::Locked.code(),
                ImageState::Ready.code()
            ]
        );
        let info = cloud.info(ObjectKind::Image, id).unwrap();
        assert_eq!(info.attr("TYPE"), Some("DATABLOCK"));
        assert_eq!(info.attr("PERSISTENT"), Some("0"));
        assert!(cloud.delete(ObjectKind::Datastore, ds).is_err());
    }

    #[test]
    fn test_of031_image_needs_datastore_and_source() {
        let cloud = MemoryCloud::new();
        let err = cloud
            .allocate(
                ObjectKind::Image,
                AllocateRequest::Template {
                    template: "NAME=\"img\"\nSIZE=\"1\"".to_string(),
                    cluster_id: None,
                    datastore_id: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::Invalid(_)));
        let ds = datastore(&cloud, "images");
        let err = cloud
            .allocate(
                ObjectKind::Image,
                AllocateRequest::Template {
                    template: "NAME=\"img\"".to_string(),
                    cluster_id: None,
                    datastore_id: Some(ds),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::Invalid(_)));
    }

    #[test]
    fn test_of031_vm_resize_requires_poweroff() {
        let cloud = MemoryCloud::new();
        let id = running_vm(&cloud);
        let resize = Action::Resize {
            cpu: Some(2.0),
            vcpu: None,
            memory: Some(2048),
        };
        assert!(cloud.action(ObjectKind::VirtualMachine, id, resize.clone()).is_err());

        cloud
            .action(ObjectKind::VirtualMachine, id, Action::Vm(VmAction::Poweroff))
            .unwrap();
        let info = cloud.info(ObjectKind::VirtualMachine, id).unwrap();
        assert_eq!(info.state, VmState::Poweroff.code());
        cloud.action(ObjectKind::VirtualMachine, id, resize).unwrap();
        cloud
            .action(ObjectKind::VirtualMachine, id, Action::Vm(VmAction::Resume))
            .unwrap();
        let info = cloud.info(ObjectKind::VirtualMachine, id).unwrap();
        assert_eq!(info.state, VmState::Active.code());
        assert_eq!(info.lcm_state, LcmState::Running.code());
        assert!(info.template.contains("MEMORY=\"2048\""));
    }

    #[test]
    fn test_of031_vm_disk_hotplug() {
        let cloud = MemoryCloud::new();
        let id = running_vm(&cloud);
        cloud
            .action(
                ObjectKind::VirtualMachine,
                id,
                Action::AttachDisk("DISK=[ IMAGE_ID=\"7\" ]".to_string()),
            )
            .unwrap();
        let t: DynTemplate = cloud.info(ObjectKind::VirtualMachine, id).unwrap().template.parse().unwrap();
        let ids: Vec<_> = t.vectors("DISK").filter_map(|d| d.get_parsed::<u32>("DISK_ID")).collect();
        assert_eq!(ids, vec![0, 1]);
        cloud
            .action(ObjectKind::VirtualMachine, id, Action::DetachDisk(0))
            .unwrap();
        let t: DynTemplate = cloud.info(ObjectKind::VirtualMachine, id).unwrap().template.parse().unwrap();
        assert_eq!(t.get_vector("DISK").unwrap().get_str("IMAGE_ID"), Some("7"));
        assert!(cloud
            .action(ObjectKind::VirtualMachine, id, Action::DetachDisk(0))
            .is_err());
    }

    #[test]
    fn test_of031_terminated_vm_leaves_list() {
        let cloud = MemoryCloud::new();
        let id = running_vm(&cloud);
        cloud
            .action(ObjectKind::VirtualMachine, id, Action::Vm(VmAction::TerminateHard))
            .unwrap();
        assert_eq!(
            cloud.info(ObjectKind::VirtualMachine, id).unwrap().state,
            VmState::Done.code()
        );
        assert!(cloud.list(ObjectKind::VirtualMachine).unwrap().is_empty());
    }

    #[test]
    fn test_of031_injected_failure_fires_once() {
        let cloud = MemoryCloud::new();
        cloud.fail_next(ObjectKind::Cluster, "info", ApiError::Backend("boom".to_string()));
        assert_eq!(
            cloud.info(ObjectKind::Cluster, 0),
            Err(ApiError::Backend("boom".to_string()))
        );
        assert!(cloud.info(ObjectKind::Cluster, 0).is_ok());
    }

    #[test]
    fn test_of031_acl_rules() {
        let cloud = MemoryCloud::new();
        let request = AllocateRequest::Acl {
            user: acl::parse_users("@1").unwrap(),
            resource: acl::parse_resources("VM+NET/*").unwrap(),
            rights: acl::parse_rights("USE").unwrap(),
            zone: None,
        };
        let id = cloud.allocate(ObjectKind::Acl, request.clone()).unwrap();
        let info = cloud.info(ObjectKind::Acl, id).unwrap();
        assert_eq!(info.attr("STRING"), Some("@1 VM+NET/* USE #0"));
        assert_eq!(info.attr("USER"), Some("200000001"));
        assert!(matches!(
            cloud.allocate(ObjectKind::Acl, request),
            Err(ApiError::Invalid(_))
        ));
    }

    #[test]
    fn test_of031_quotas_merge_by_id() {
        let cloud = MemoryCloud::new();
        let set = |text: &str| {
            cloud
                .action(ObjectKind::Group, 1, Action::SetQuota(text.to_string()))
                .unwrap()
        };
        set("DATASTORE=[ ID=\"1\", SIZE=\"100\" ]\nDATASTORE=[ ID=\"2\", SIZE=\"5\" ]");
        set("DATASTORE=[ ID=\"1\", SIZE=\"200\" ]\nVM=[ CPU=\"4\" ]");
        let quotas: DynTemplate = cloud.info(ObjectKind::Group, 1).unwrap().quotas.parse().unwrap();
        let sizes: Vec<_> = quotas
            .vectors("DATASTORE")
            .map(|v| (v.get_str("ID").unwrap().to_string(), v.get_str("SIZE").unwrap().to_string()))
            .collect();
        assert_eq!(
            sizes,
            vec![("2".to_string(), "5".to_string()), ("1".to_string(), "200".to_string())]
        );
        assert_eq!(quotas.get_vector("VM").unwrap().get_str("CPU"), Some("4"));
    }

    #[test]
    fn test_of031_call_log_and_drop() {
        let cloud = MemoryCloud::new();
        let id = vm_template(&cloud);
        cloud.rename(ObjectKind::Template, id, "big").unwrap();
        assert_eq!(
            cloud.calls(),
            vec![format!("allocate template {}", id), format!("rename template {}", id)]
        );
        cloud.lock(ObjectKind::Template, id, LockLevel::All).unwrap();
        assert!(cloud.drop_object(ObjectKind::Template, id));
        assert!(cloud.info(ObjectKind::Template, id).unwrap_err().is_not_found());
    }
}
