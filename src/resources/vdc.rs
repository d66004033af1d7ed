//! Virtual data center resource: groups plus per-zone clusters, hosts,
//! datastores and virtual networks, all reconciled by set difference.

use super::common::{self, Labels, LABEL_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{Action, AllocateRequest, ObjectKind};
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const KEYS: &[&str] = &["name", "description", "group_ids", "zones"];

/// Member kinds a zone entry lists.
const ZONE_MEMBERS: &[ObjectKind] = &[
    ObjectKind::Cluster,
    ObjectKind::Host,
    ObjectKind::Datastore,
    ObjectKind::VirtualNetwork,
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ZoneSpec {
    #[serde(default)]
    id: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    cluster_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    host_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    datastore_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    vnet_ids: Vec<u32>,
}

impl ZoneSpec {
    fn ids(&self, member: ObjectKind) -> &[u32] {
        match member {
            ObjectKind::Cluster => &self.cluster_ids,
            ObjectKind::Host => &self.host_ids,
            ObjectKind::Datastore => &self.datastore_ids,
            ObjectKind::VirtualNetwork => &self.vnet_ids,
            _ => &[],
        }
    }

    fn ids_mut(&mut self, member: ObjectKind) -> Option<&mut Vec<u32>> {
        match member {
            ObjectKind::Cluster => Some(&mut self.cluster_ids),
            ObjectKind::Host => Some(&mut self.host_ids),
            ObjectKind::Datastore => Some(&mut self.datastore_ids),
            ObjectKind::VirtualNetwork => Some(&mut self.vnet_ids),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct VdcSpec {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    group_ids: Vec<u32>,
    #[serde(default)]
    zones: Vec<ZoneSpec>,
    #[serde(flatten)]
    labels: Labels,
}

impl VdcSpec {
    /// Every (zone, member kind, id) the spec places in the VDC.
    fn zone_members(&self) -> BTreeSet<(u32, ObjectKind, u32)> {
        self.zones
            .iter()
            .flat_map(|zone| {
                ZONE_MEMBERS.iter().flat_map(move |member| {
                    zone.ids(*member).iter().map(move |id| (zone.id, *member, *id))
                })
            })
            .collect()
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = BTreeSet::new();
        for zone in &self.zones {
            if !seen.insert(zone.id) {
                problems.push(format!("zone {} is listed twice", zone.id));
            }
        }
        problems
    }
}

pub struct VdcHandler;

impl ResourceHandler for VdcHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Vdc
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<VdcSpec, _>(spec, &[KEYS, LABEL_KEYS], VdcSpec::problems)
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: VdcSpec = common::decode(spec)?;
        let id = ctx
            .api
            .allocate(ObjectKind::Vdc, AllocateRequest::Named { name: s.name.clone() })?;
        tracing::info!(id, name = %s.name, "vdc allocated");
        Ok(id)
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: VdcSpec = common::decode(spec)?;
        common::update_template(ctx, ObjectKind::Vdc, id, |tpl| {
            if let Some(ref description) = s.description {
                tpl.set_pair("DESCRIPTION", description);
            }
            s.labels.add_to(ctx, tpl);
        })?;
        for group in &s.group_ids {
            ctx.api.action(
                ObjectKind::Vdc,
                id,
                Action::AddMember { member: ObjectKind::Group, id: *group },
            )?;
        }
        for (zone, member, mid) in s.zone_members() {
            ctx.api
                .action(ObjectKind::Vdc, id, Action::AddZoneMember { zone, member, id: mid })?;
        }
        Ok(())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: VdcSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::Vdc, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        if let Some(description) = template.get_str("DESCRIPTION") {
            common::put(&mut attrs, "description", description);
        }
        common::put_value(&mut attrs, "group_ids", object.members("GROUPS"))?;

        // Declared zones first, then any other zone holding resources.
        let mut zone_ids: Vec<u32> = s.zones.iter().map(|z| z.id).collect();
        let remote_zones = object.members.keys().filter_map(|key| {
            key.strip_prefix("ZONE")
                .and_then(|rest| rest.split_once('_'))
                .and_then(|(zone, _)| zone.parse::<u32>().ok())
        });
        for zone in remote_zones.collect::<BTreeSet<_>>() {
            if !zone_ids.contains(&zone) {
                zone_ids.push(zone);
            }
        }
        let mut zones = Vec::new();
        for zone_id in zone_ids {
            let mut zone = ZoneSpec {
                id: zone_id,
                ..Default::default()
            };
            for member in ZONE_MEMBERS {
                if let (Some(key), Some(ids)) = (member.zone_members_key(zone_id), zone.ids_mut(*member)) {
                    ids.extend_from_slice(object.members(&key));
                }
            }
            let declared = s.zones.iter().any(|z| z.id == zone_id);
            let empty = ZONE_MEMBERS.iter().all(|member| zone.ids(*member).is_empty());
            if declared || !empty {
                zones.push(zone);
            }
        }
        common::put_value(&mut attrs, "zones", &zones)?;
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: VdcSpec = common::decode(old)?;
        let n: VdcSpec = common::decode(new)?;
        common::rename_if_changed(ctx, ObjectKind::Vdc, id, &o.name, &n.name)?;

        let (added, removed) = common::set_diff(&o.group_ids, &n.group_ids);
        for group in removed {
            ctx.api.action(
                ObjectKind::Vdc,
                id,
                Action::RemoveMember { member: ObjectKind::Group, id: group },
            )?;
        }
        for group in added {
            ctx.api.action(
                ObjectKind::Vdc,
                id,
                Action::AddMember { member: ObjectKind::Group, id: group },
            )?;
        }

        let (old_members, new_members) = (o.zone_members(), n.zone_members());
        for &(zone, member, mid) in old_members.difference(&new_members) {
            ctx.api
                .action(ObjectKind::Vdc, id, Action::RemoveZoneMember { zone, member, id: mid })?;
        }
        for &(zone, member, mid) in new_members.difference(&old_members) {
            ctx.api
                .action(ObjectKind::Vdc, id, Action::AddZoneMember { zone, member, id: mid })?;
        }

        common::update_template(ctx, ObjectKind::Vdc, id, |tpl| {
            common::set_if_changed(tpl, "DESCRIPTION", o.description.as_ref(), n.description.as_ref());
            n.labels.reconcile(ctx, &o.labels, tpl);
        })?;
        Ok(())
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, _spec: &Spec) -> Result<()> {
        ctx.api.delete(ObjectKind::Vdc, id)?;
        Ok(())
    }
}
