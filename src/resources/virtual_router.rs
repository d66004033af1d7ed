//! Virtual router resource. Its template records the VM template the
//! router's instances are created from.

use super::common::{self, Access, Labels, LABEL_KEYS, LOCK_KEYS, OWNER_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{AllocateRequest, ObjectKind};
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::error::Result;
use crate::template::DynTemplate;
use serde::Deserialize;

const KEYS: &[&str] = &["name", "instance_template_id", "description"];

#[derive(Debug, Clone, Deserialize)]
struct VirtualRouterSpec {
    name: String,
    instance_template_id: u32,
    #[serde(default)]
    description: Option<String>,
    #[serde(flatten)]
    access: Access,
    #[serde(flatten)]
    labels: Labels,
}

pub struct VirtualRouterHandler;

impl ResourceHandler for VirtualRouterHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::VirtualRouter
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<VirtualRouterSpec, _>(
            spec,
            &[KEYS, OWNER_KEYS, LOCK_KEYS, LABEL_KEYS],
            |s| s.access.problems(),
        )
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: VirtualRouterSpec = common::decode(spec)?;
        ctx.api.info(ObjectKind::Template, s.instance_template_id)?;

        let mut template = DynTemplate::new();
        template.add_pair("NAME", &s.name);
        template.add_pair("TEMPLATE_ID", s.instance_template_id);
        if let Some(ref description) = s.description {
            template.add_pair("DESCRIPTION", description);
        }
        s.labels.add_to(ctx, &mut template);

        let id = ctx.api.allocate(
            ObjectKind::VirtualRouter,
            AllocateRequest::Template {
                template: template.render(),
                cluster_id: None,
                datastore_id: None,
            },
        )?;
        tracing::info!(id, name = %s.name, "virtual router allocated");
        Ok(id)
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: VirtualRouterSpec = common::decode(spec)?;
        common::apply_access(ctx, ObjectKind::VirtualRouter, id, &s.access, None)?;
        common::apply_lock(ctx, ObjectKind::VirtualRouter, id, s.access.lock.as_deref())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: VirtualRouterSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::VirtualRouter, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        common::ownership_attributes(&object, &mut attrs);
        common::lock_attribute(&object, &s.access, &mut attrs);
        if let Some(template_id) = template.get_parsed::<u32>("TEMPLATE_ID") {
            common::put(&mut attrs, "instance_template_id", template_id);
        }
        if let Some(description) = template.get_str("DESCRIPTION") {
            common::put(&mut attrs, "description", description);
        }
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: VirtualRouterSpec = common::decode(old)?;
        let n: VirtualRouterSpec = common::decode(new)?;
        let lock = common::desired_lock(&o.access, &n.access);

        common::with_unlocked(ctx, ObjectKind::VirtualRouter, id, lock, || {
            common::rename_if_changed(ctx, ObjectKind::VirtualRouter, id, &o.name, &n.name)?;
            common::update_template(ctx, ObjectKind::VirtualRouter, id, |tpl| {
                tpl.set_pair("TEMPLATE_ID", n.instance_template_id);
                common::set_if_changed(tpl, "DESCRIPTION", o.description.as_ref(), n.description.as_ref());
                n.labels.reconcile(ctx, &o.labels, tpl);
            })?;
            common::apply_access(ctx, ObjectKind::VirtualRouter, id, &n.access, Some(&o.access))
        })
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, _spec: &Spec) -> Result<()> {
        common::unlock_if_locked(ctx, ObjectKind::VirtualRouter, id)?;
        ctx.api.delete(ObjectKind::VirtualRouter, id)?;
        Ok(())
    }
}
