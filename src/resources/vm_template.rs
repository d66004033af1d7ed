//! VM template resource.
//!
//! The template body is generated from a [`VmShape`]. Updates replace only
//! the shape's keys so pairs added in Sunstone or by other tools survive.

use super::common::{self, Access, Labels, LABEL_KEYS, LOCK_KEYS, OWNER_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{AllocateRequest, ObjectKind};
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::error::Result;
use crate::template::vm::{self, VmShape, SHAPE_KEYS};
use crate::template::DynTemplate;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct TemplateSpec {
    name: String,
    #[serde(flatten)]
    shape: VmShape,
    #[serde(flatten)]
    access: Access,
    #[serde(flatten)]
    labels: Labels,
}

pub struct TemplateHandler;

impl ResourceHandler for TemplateHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Template
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<TemplateSpec, _>(
            spec,
            &[&["name"], SHAPE_KEYS, OWNER_KEYS, LOCK_KEYS, LABEL_KEYS],
            |s| {
                let mut problems = s.access.problems();
                problems.extend(s.shape.problems());
                problems
            },
        )
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: TemplateSpec = common::decode(spec)?;
        let mut template = DynTemplate::new();
        template.add_pair("NAME", &s.name);
        vm::append(&mut template, &s.shape);
        s.labels.add_to(ctx, &mut template);

        let id = ctx.api.allocate(
            ObjectKind::Template,
            AllocateRequest::Template {
                template: template.render(),
                cluster_id: None,
                datastore_id: None,
            },
        )?;
        tracing::info!(id, name = %s.name, "template allocated");
        Ok(id)
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: TemplateSpec = common::decode(spec)?;
        common::apply_access(ctx, ObjectKind::Template, id, &s.access, None)?;
        common::apply_lock(ctx, ObjectKind::Template, id, s.access.lock.as_deref())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: TemplateSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::Template, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        common::ownership_attributes(&object, &mut attrs);
        common::lock_attribute(&object, &s.access, &mut attrs);
        common::put_fields(&mut attrs, &vm::flatten(&template).respelled(&s.shape))?;
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: TemplateSpec = common::decode(old)?;
        let n: TemplateSpec = common::decode(new)?;
        let lock = common::desired_lock(&o.access, &n.access);

        common::with_unlocked(ctx, ObjectKind::Template, id, lock, || {
            common::rename_if_changed(ctx, ObjectKind::Template, id, &o.name, &n.name)?;
            common::update_template(ctx, ObjectKind::Template, id, |tpl| {
                if o.shape != n.shape {
                    vm::replace_managed(tpl, &n.shape);
                }
                n.labels.reconcile(ctx, &o.labels, tpl);
            })?;
            common::apply_access(ctx, ObjectKind::Template, id, &n.access, Some(&o.access))
        })
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, _spec: &Spec) -> Result<()> {
        common::unlock_if_locked(ctx, ObjectKind::Template, id)?;
        ctx.api.delete(ObjectKind::Template, id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryCloud;
    use crate::api::{CloudApi, LockLevel};
    use crate::config::ProviderConfig;
    use crate::resources::testing::{ctx, spec};

    const WEB: &str = "name: web
cpu: 0.5
vcpu: 2
memory: 1024
disks:
  - image_id: 3
    target: vda
nics:
  - network_id: 1
context:
  ssh_public_key: ssh-ed25519 AAAA
  network: \"YES\"
tags: { tier: web }
permissions: 640
";

    #[test]
    fn test_of054_create_and_read_shape() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let s = spec(WEB);
        assert!(TemplateHandler.validate(&s).is_empty(), "{:?}", TemplateHandler.validate(&s));
        let id = TemplateHandler.create(&ctx, &s).unwrap();
        TemplateHandler.configure(&ctx, id, &s).unwrap();

        let obj = cloud.info(ObjectKind::Template, id).unwrap();
        assert_eq!(obj.permissions.to_octal(), "640");
        let attrs = TemplateHandler.read(&ctx, id, &s).unwrap();
        assert_eq!(attrs["memory"].as_u64(), Some(1024));
        assert_eq!(attrs["disks"][0]["target"], "vda");
        assert_eq!(attrs["context"]["ssh_public_key"], "ssh-ed25519 AAAA");
        assert_eq!(attrs["tags"]["tier"], "web");
        assert!(crate::core::refresh::detect_drift("t", ResourceKind::Template, &s, &attrs).is_empty());
    }

    #[test]
    fn test_of054_update_keeps_foreign_keys() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let old = spec(WEB);
        let id = TemplateHandler.create(&ctx, &old).unwrap();
        cloud
            .set_template_value(ObjectKind::Template, id, "LOGO", "images/logos/debian.png")
            .unwrap();

        let new = spec(&WEB.replace("memory: 1024", "memory: 2048").replace("name: web", "name: web2"));
        TemplateHandler.update(&ctx, id, &old, &new).unwrap();
        let obj = cloud.info(ObjectKind::Template, id).unwrap();
        let tpl = common::template_of(&obj).unwrap();
        assert_eq!(obj.name, "web2");
        assert_eq!(tpl.get_str("MEMORY"), Some("2048"));
        assert_eq!(tpl.get_str("LOGO"), Some("images/logos/debian.png"));
        assert_eq!(tpl.get_str("TIER"), Some("web"));
    }

    #[test]
    fn test_of054_lock_survives_update() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let old = spec("name: t\ncpu: 1\nmemory: 128\nlock: USE\n");
        let id = TemplateHandler.create(&ctx, &old).unwrap();
        TemplateHandler.configure(&ctx, id, &old).unwrap();

        let new = spec("name: t\ncpu: 2\nmemory: 128\nlock: USE\n");
        TemplateHandler.update(&ctx, id, &old, &new).unwrap();
        let obj = cloud.info(ObjectKind::Template, id).unwrap();
        assert_eq!(obj.lock, Some(LockLevel::Use));
        assert_eq!(common::template_of(&obj).unwrap().get_str("CPU"), Some("2"));

        TemplateHandler.delete(&ctx, id, &new).unwrap();
        assert_eq!(cloud.count(ObjectKind::Template), 0);
    }

    #[test]
    fn test_of054_validation() {
        let problems = TemplateHandler.validate(&spec("name: t\ncpu: 0\ngraphics: { type: RDP }\n"));
        assert_eq!(problems.len(), 2, "{:?}", problems);
        let problems = TemplateHandler.validate(&spec("name: t\ndisks: [ { image_id: 1, colour: red } ]\n"));
        assert_eq!(problems.len(), 1, "{:?}", problems);
    }
}
