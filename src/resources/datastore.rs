//! Datastore resource.
//!
//! The type (image, system or file) is fixed at creation. Drivers default
//! per type and can be overridden with a `custom` block or a `ceph` block.
//! Cluster membership is reconciled by set difference.

use super::common::{self, Access, Labels, LABEL_KEYS, OWNER_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{Action, AllocateRequest, DatastoreState, ObjectKind};
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::error::{Error, Result};
use crate::template::DynTemplate;
use serde::Deserialize;

const KEYS: &[&str] = &[
    "name",
    "datastore_type",
    "cluster_ids",
    "custom",
    "ceph",
    "restricted_directories",
    "safe_directories",
    "no_decompress",
    "storage_usage_limit",
    "transfer_bandwidth_limit",
    "check_available_capacity",
    "bridge_list",
    "enabled",
];

#[derive(Debug, Clone, Deserialize)]
struct DatastoreSpec {
    name: String,
    datastore_type: String,
    #[serde(default)]
    cluster_ids: Vec<u32>,
    #[serde(default)]
    custom: Option<CustomDrivers>,
    #[serde(default)]
    ceph: Option<CephSpec>,
    #[serde(default)]
    restricted_directories: Option<String>,
    #[serde(default)]
    safe_directories: Option<String>,
    #[serde(default)]
    no_decompress: Option<bool>,
    /// MB
    #[serde(default)]
    storage_usage_limit: Option<u64>,
    #[serde(default)]
    transfer_bandwidth_limit: Option<u64>,
    #[serde(default)]
    check_available_capacity: Option<bool>,
    #[serde(default)]
    bridge_list: Vec<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(flatten)]
    access: Access,
    #[serde(flatten)]
    labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomDrivers {
    #[serde(default)]
    datastore: Option<String>,
    #[serde(default)]
    transfer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct CephSpec {
    pool_name: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    host: Vec<String>,
    #[serde(default)]
    rbd_format: Option<u32>,
}

fn remote_type(datastore_type: &str) -> Option<&'static str> {
    match datastore_type.to_lowercase().as_str() {
        "image" => Some("IMAGE_DS"),
        "system" => Some("SYSTEM_DS"),
        "file" => Some("FILE_DS"),
        _ => None,
    }
}

fn declared_type(remote: &str) -> &'static str {
    match remote {
        "SYSTEM_DS" => "system",
        "FILE_DS" => "file",
        _ => "image",
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "YES"
    } else {
        "NO"
    }
}

impl DatastoreSpec {
    fn problems(&self) -> Vec<String> {
        let mut problems = self.access.problems();
        if remote_type(&self.datastore_type).is_none() {
            problems.push(format!(
                "invalid datastore_type \"{}\" (expected image, system or file)",
                self.datastore_type
            ));
        }
        if self.custom.is_some() && self.ceph.is_some() {
            problems.push("custom and ceph are mutually exclusive".to_string());
        }
        if self.ceph.is_some() && self.datastore_type.eq_ignore_ascii_case("file") {
            problems.push("ceph cannot back a file datastore".to_string());
        }
        problems
    }

    /// (DS_MAD, TM_MAD); system datastores have no DS_MAD.
    fn drivers(&self) -> (Option<String>, Option<String>) {
        let system = self.datastore_type.eq_ignore_ascii_case("system");
        let (ds, tm) = if self.ceph.is_some() {
            ("ceph", "ceph")
        } else {
            ("fs", "ssh")
        };
        let mut ds_mad = (!system).then(|| ds.to_string());
        let mut tm_mad = Some(tm.to_string());
        if let Some(ref custom) = self.custom {
            if custom.datastore.is_some() {
                ds_mad = custom.datastore.clone();
            }
            if custom.transfer.is_some() {
                tm_mad = custom.transfer.clone();
            }
        }
        (ds_mad, tm_mad)
    }

    /// Every template key the spec manages, with its declared value.
    fn options(&self) -> Vec<(&'static str, Option<String>)> {
        let (ds_mad, tm_mad) = self.drivers();
        let ceph = self.ceph.as_ref();
        vec![
            ("DS_MAD", ds_mad),
            ("TM_MAD", tm_mad),
            ("RESTRICTED_DIRS", self.restricted_directories.clone()),
            ("SAFE_DIRS", self.safe_directories.clone()),
            ("NO_DECOMPRESS", self.no_decompress.map(|v| yes_no(v).to_string())),
            ("LIMIT_MB", self.storage_usage_limit.map(|v| v.to_string())),
            ("LIMIT_TRANSFER_BW", self.transfer_bandwidth_limit.map(|v| v.to_string())),
            (
                "DATASTORE_CAPACITY_CHECK",
                self.check_available_capacity.map(|v| yes_no(v).to_string()),
            ),
            ("BRIDGE_LIST", (!self.bridge_list.is_empty()).then(|| self.bridge_list.join(" "))),
            ("POOL_NAME", ceph.map(|c| c.pool_name.clone())),
            ("CEPH_USER", ceph.and_then(|c| c.user.clone())),
            ("CEPH_SECRET", ceph.and_then(|c| c.secret.clone())),
            (
                "CEPH_HOST",
                ceph.filter(|c| !c.host.is_empty()).map(|c| c.host.join(" ")),
            ),
            ("RBD_FORMAT", ceph.and_then(|c| c.rbd_format).map(|f| f.to_string())),
        ]
    }

    fn add_options(&self, template: &mut DynTemplate) {
        for (key, value) in self.options() {
            if let Some(value) = value {
                template.add_pair(key, value);
            }
        }
    }

    /// Write the option keys whose declared value changed since `old`.
    fn update_options(&self, old: &Self, template: &mut DynTemplate) {
        for ((key, before), (_, after)) in old.options().into_iter().zip(self.options()) {
            common::set_if_changed(template, key, before, after);
        }
    }
}

fn set_enabled(ctx: &Context<'_>, id: u32, enabled: bool) -> Result<()> {
    ctx.api.action(ObjectKind::Datastore, id, Action::Enable(enabled))?;
    Ok(())
}

pub struct DatastoreHandler;

impl ResourceHandler for DatastoreHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Datastore
    }

    fn force_new(&self) -> &'static [&'static str] {
        &["datastore_type"]
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<DatastoreSpec, _>(spec, &[KEYS, OWNER_KEYS, LABEL_KEYS], |s| s.problems())
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: DatastoreSpec = common::decode(spec)?;
        let remote = remote_type(&s.datastore_type)
            .ok_or_else(|| Error::validation("datastore_type", s.datastore_type.clone()))?;

        let mut template = DynTemplate::new();
        template.add_pair("NAME", &s.name);
        template.add_pair("TYPE", remote);
        s.add_options(&mut template);
        s.labels.add_to(ctx, &mut template);

        let id = ctx.api.allocate(
            ObjectKind::Datastore,
            AllocateRequest::Template {
                template: template.render(),
                cluster_id: s.cluster_ids.first().copied(),
                datastore_id: None,
            },
        )?;
        tracing::info!(id, name = %s.name, ds_type = remote, "datastore allocated");
        Ok(id)
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: DatastoreSpec = common::decode(spec)?;
        for cluster in s.cluster_ids.iter().skip(1) {
            ctx.api.action(
                ObjectKind::Cluster,
                *cluster,
                Action::AddMember {
                    member: ObjectKind::Datastore,
                    id,
                },
            )?;
        }
        common::apply_access(ctx, ObjectKind::Datastore, id, &s.access, None)?;
        if s.enabled == Some(false) {
            set_enabled(ctx, id, false)?;
        }
        Ok(())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: DatastoreSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::Datastore, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        common::ownership_attributes(&object, &mut attrs);
        let remote = object.attr("TYPE").unwrap_or("IMAGE_DS");
        common::put(&mut attrs, "datastore_type", declared_type(remote));
        common::put_value(&mut attrs, "cluster_ids", object.members("CLUSTERS"))?;
        common::put(
            &mut attrs,
            "enabled",
            object.state == DatastoreState::Ready.code(),
        );
        for (attr, key) in [("ds_mad", "DS_MAD"), ("tm_mad", "TM_MAD")] {
            if let Some(value) = object.attr(key).filter(|v| !v.is_empty()) {
                common::put(&mut attrs, attr, value);
            }
        }
        for (attr, key) in [
            ("restricted_directories", "RESTRICTED_DIRS"),
            ("safe_directories", "SAFE_DIRS"),
        ] {
            if let Some(value) = template.get_str(key) {
                common::put(&mut attrs, attr, value);
            }
        }
        for (attr, key) in [
            ("no_decompress", "NO_DECOMPRESS"),
            ("check_available_capacity", "DATASTORE_CAPACITY_CHECK"),
        ] {
            if let Some(value) = template.get_str(key) {
                common::put(&mut attrs, attr, value.eq_ignore_ascii_case("YES"));
            }
        }
        for (attr, key) in [
            ("storage_usage_limit", "LIMIT_MB"),
            ("transfer_bandwidth_limit", "LIMIT_TRANSFER_BW"),
        ] {
            if let Some(value) = template.get_parsed::<u64>(key) {
                common::put(&mut attrs, attr, value);
            }
        }
        if let Some(bridges) = template.get_str("BRIDGE_LIST") {
            let list: Vec<&str> = bridges.split_whitespace().collect();
            common::put_value(&mut attrs, "bridge_list", &list)?;
        }
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: DatastoreSpec = common::decode(old)?;
        let n: DatastoreSpec = common::decode(new)?;
        common::rename_if_changed(ctx, ObjectKind::Datastore, id, &o.name, &n.name)?;

        let (added, removed) = common::set_diff(&o.cluster_ids, &n.cluster_ids);
        for cluster in added {
            ctx.api.action(
                ObjectKind::Cluster,
                cluster,
                Action::AddMember {
                    member: ObjectKind::Datastore,
                    id,
                },
            )?;
        }
        for cluster in removed {
            ctx.api.action(
                ObjectKind::Cluster,
                cluster,
                Action::RemoveMember {
                    member: ObjectKind::Datastore,
                    id,
                },
            )?;
        }

        common::update_template(ctx, ObjectKind::Datastore, id, |tpl| {
            n.update_options(&o, tpl);
            n.labels.reconcile(ctx, &o.labels, tpl);
        })?;
        common::apply_access(ctx, ObjectKind::Datastore, id, &n.access, Some(&o.access))?;

        let enabled = n.enabled.unwrap_or(true);
        if enabled != o.enabled.unwrap_or(true) {
            set_enabled(ctx, id, enabled)?;
        }
        Ok(())
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, _spec: &Spec) -> Result<()> {
        ctx.api.delete(ObjectKind::Datastore, id)?;
        Ok(())
    }
}
