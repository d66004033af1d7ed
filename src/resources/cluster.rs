//! Cluster resource: a named grouping of hosts, datastores and virtual
//! networks. Membership is reconciled by set difference.

use super::common::{self, Labels, LABEL_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{Action, AllocateRequest, ObjectKind};
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::error::Result;
use serde::Deserialize;

const KEYS: &[&str] = &["name", "hosts", "datastores", "virtual_networks"];

#[derive(Debug, Clone, Deserialize)]
struct ClusterSpec {
    name: String,
    #[serde(default)]
    hosts: Vec<u32>,
    #[serde(default)]
    datastores: Vec<u32>,
    #[serde(default)]
    virtual_networks: Vec<u32>,
    #[serde(flatten)]
    labels: Labels,
}

impl ClusterSpec {
    /// (member kind, attribute name, declared ids)
    fn members(&self) -> [(ObjectKind, &'static str, &[u32]); 3] {
        [
            (ObjectKind::Host, "hosts", self.hosts.as_slice()),
            (ObjectKind::Datastore, "datastores", self.datastores.as_slice()),
            (ObjectKind::VirtualNetwork, "virtual_networks", self.virtual_networks.as_slice()),
        ]
    }
}

pub struct ClusterHandler;

impl ResourceHandler for ClusterHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Cluster
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<ClusterSpec, _>(spec, &[KEYS, LABEL_KEYS], |s| {
            let mut problems = Vec::new();
            if s.name.trim().is_empty() {
                problems.push("name must not be empty".to_string());
            }
            problems
        })
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: ClusterSpec = common::decode(spec)?;
        let id = ctx.api.allocate(
            ObjectKind::Cluster,
            AllocateRequest::Named { name: s.name.clone() },
        )?;
        tracing::info!(id, name = %s.name, "cluster allocated");
        Ok(id)
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: ClusterSpec = common::decode(spec)?;
        common::update_template(ctx, ObjectKind::Cluster, id, |tpl| s.labels.add_to(ctx, tpl))?;
        for (member, _, ids) in s.members() {
            for mid in ids {
                ctx.api.action(ObjectKind::Cluster, id, Action::AddMember { member, id: *mid })?;
            }
        }
        Ok(())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: ClusterSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::Cluster, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        for (member, attr, _) in s.members() {
            if let Some(key) = member.members_key() {
                common::put_value(&mut attrs, attr, object.members(key))?;
            }
        }
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: ClusterSpec = common::decode(old)?;
        let n: ClusterSpec = common::decode(new)?;
        common::rename_if_changed(ctx, ObjectKind::Cluster, id, &o.name, &n.name)?;

        for ((member, _, old_ids), (_, _, new_ids)) in o.members().into_iter().zip(n.members()) {
            let (added, removed) = common::set_diff(old_ids, new_ids);
            for mid in removed {
                ctx.api
                    .action(ObjectKind::Cluster, id, Action::RemoveMember { member, id: mid })?;
            }
            for mid in added {
                ctx.api
                    .action(ObjectKind::Cluster, id, Action::AddMember { member, id: mid })?;
            }
        }

        common::update_template(ctx, ObjectKind::Cluster, id, |tpl| {
            n.labels.reconcile(ctx, &o.labels, tpl)
        })?;
        Ok(())
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, _spec: &Spec) -> Result<()> {
        ctx.api.delete(ObjectKind::Cluster, id)?;
        Ok(())
    }
}
