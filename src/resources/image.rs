//! Image resource.
//!
//! Images come from a `path`, an empty block of `size` MB, or a clone of
//! another image, and are usable once the copy reaches READY. Type and
//! persistence are changed with their own actions; the remaining fields
//! live in the template.

use super::common::{self, Access, Labels, LABEL_KEYS, LOCK_KEYS, OWNER_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{Action, AllocateRequest, ImageState, ObjectKind};
use crate::config::Operation;
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::core::wait;
use crate::error::Result;
use crate::template::DynTemplate;
use serde::Deserialize;

const KEYS: &[&str] = &[
    "name",
    "datastore_id",
    "path",
    "size",
    "clone_from_image",
    "image_type",
    "persistent",
    "description",
    "dev_prefix",
    "driver",
    "format",
    "target",
];

const IMAGE_TYPES: &[&str] = &["OS", "CDROM", "DATABLOCK", "KERNEL", "RAMDISK", "CONTEXT"];

#[derive(Debug, Clone, Deserialize)]
struct ImageSpec {
    name: String,
    datastore_id: u32,
    #[serde(default)]
    path: Option<String>,
    /// MB
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    clone_from_image: Option<u32>,
    #[serde(default)]
    image_type: Option<String>,
    #[serde(default)]
    persistent: Option<bool>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    dev_prefix: Option<String>,
    #[serde(default)]
    driver: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(flatten)]
    access: Access,
    #[serde(flatten)]
    labels: Labels,
}

impl ImageSpec {
    fn problems(&self) -> Vec<String> {
        let mut problems = self.access.problems();
        let from_source = self.path.is_some() || self.size.is_some();
        if self.clone_from_image.is_some() && from_source {
            problems.push("clone_from_image excludes path and size".to_string());
        }
        if self.clone_from_image.is_none() && !from_source {
            problems.push("one of path, size or clone_from_image is required".to_string());
        }
        if let Some(ref t) = self.image_type {
            if !IMAGE_TYPES.contains(&t.to_uppercase().as_str()) {
                problems.push(format!(
                    "invalid image_type \"{}\" (expected one of {})",
                    t,
                    IMAGE_TYPES.join(", ")
                ));
            }
        }
        problems
    }

    /// (attribute, template key, value)
    fn fields(&self) -> [(&'static str, &'static str, Option<&String>); 5] {
        [
            ("description", "DESCRIPTION", self.description.as_ref()),
            ("dev_prefix", "DEV_PREFIX", self.dev_prefix.as_ref()),
            ("driver", "DRIVER", self.driver.as_ref()),
            ("format", "FORMAT", self.format.as_ref()),
            ("target", "TARGET", self.target.as_ref()),
        ]
    }

    /// Set the declared fields; undeclared ones keep whatever is there.
    fn set_fields(&self, template: &mut DynTemplate) {
        for (_, key, value) in self.fields() {
            if let Some(value) = value {
                template.set_pair(key, value);
            }
        }
    }

    fn update_fields(&self, old: &Self, template: &mut DynTemplate) {
        for ((_, key, before), (_, _, after)) in old.fields().into_iter().zip(self.fields()) {
            common::set_if_changed(template, key, before, after);
        }
    }
}

pub struct ImageHandler;

impl ResourceHandler for ImageHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Image
    }

    fn force_new(&self) -> &'static [&'static str] {
        &["datastore_id", "path", "size", "clone_from_image"]
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<ImageSpec, _>(
            spec,
            &[KEYS, OWNER_KEYS, LOCK_KEYS, LABEL_KEYS],
            |s| s.problems(),
        )
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: ImageSpec = common::decode(spec)?;
        let request = match s.clone_from_image {
            Some(source) => AllocateRequest::Clone {
                source,
                name: s.name.clone(),
                datastore_id: Some(s.datastore_id),
            },
            None => {
                let mut template = DynTemplate::new();
                template.add_pair("NAME", &s.name);
                if let Some(ref path) = s.path {
                    template.add_pair("PATH", path);
                }
                if let Some(size) = s.size {
                    template.add_pair("SIZE", size);
                }
                if let Some(ref t) = s.image_type {
                    template.add_pair("TYPE", t.to_uppercase());
                }
                if let Some(persistent) = s.persistent {
                    template.add_pair("PERSISTENT", if persistent { "YES" } else { "NO" });
                }
                s.set_fields(&mut template);
                s.labels.add_to(ctx, &mut template);
                AllocateRequest::Template {
                    template: template.render(),
                    cluster_id: None,
                    datastore_id: Some(s.datastore_id),
                }
            }
        };

        let id = ctx.api.allocate(ObjectKind::Image, request)?;
        tracing::info!(id, name = %s.name, "image allocated");
        Ok(id)
    }

    fn wait_created(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        tracing::info!(id, "waiting for image READY");
        wait::wait_for_image_state(ctx.api, id, ctx.poll, ctx.timeout(spec, Operation::Create)?)?;
        Ok(())
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: ImageSpec = common::decode(spec)?;
        if s.clone_from_image.is_some() {
            // Clones start from the source's template and flags.
            common::update_template(ctx, ObjectKind::Image, id, |tpl| {
                s.set_fields(tpl);
                s.labels.add_to(ctx, tpl);
            })?;
            if s.persistent == Some(true) {
                ctx.api.action(ObjectKind::Image, id, Action::Persistent(true))?;
            }
            if let Some(ref t) = s.image_type {
                let current = ctx.api.info(ObjectKind::Image, id)?;
                if !current.attr("TYPE").is_some_and(|c| c.eq_ignore_ascii_case(t)) {
                    ctx.api.action(ObjectKind::Image, id, Action::ChangeType(t.to_uppercase()))?;
                }
            }
        }
        common::apply_access(ctx, ObjectKind::Image, id, &s.access, None)?;
        common::apply_lock(ctx, ObjectKind::Image, id, s.access.lock.as_deref())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: ImageSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::Image, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        common::ownership_attributes(&object, &mut attrs);
        common::lock_attribute(&object, &s.access, &mut attrs);

        if let Some(ds) = object.attr("DATASTORE_ID").and_then(|v| v.parse::<u32>().ok()) {
            common::put(&mut attrs, "datastore_id", ds);
        }
        if let Some(path) = object.attr("PATH") {
            common::put(&mut attrs, "path", path);
        }
        if let Some(size) = object.attr("SIZE").and_then(|v| v.parse::<u64>().ok()) {
            common::put(&mut attrs, "size", size);
        }
        if let Some(source) = object.attr("CLONING_ID").and_then(|v| v.parse::<u32>().ok()) {
            common::put(&mut attrs, "clone_from_image", source);
        }
        if let Some(actual) = object.attr("TYPE") {
            let value = match s.image_type {
                Some(ref declared) if declared.eq_ignore_ascii_case(actual) => declared.clone(),
                _ => actual.to_string(),
            };
            common::put(&mut attrs, "image_type", value);
        }
        common::put(&mut attrs, "persistent", object.attr("PERSISTENT") == Some("1"));
        for (attr, key, _) in s.fields() {
            if let Some(value) = template.get_str(key) {
                common::put(&mut attrs, attr, value);
            }
        }
        let state = ImageState::from_code(object.state).map_or("UNKNOWN", ImageState::name);
        common::put(&mut attrs, "state", state);
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: ImageSpec = common::decode(old)?;
        let n: ImageSpec = common::decode(new)?;
        let lock = common::desired_lock(&o.access, &n.access);

        common::with_unlocked(ctx, ObjectKind::Image, id, lock, || {
            common::rename_if_changed(ctx, ObjectKind::Image, id, &o.name, &n.name)?;

            if let Some(ref t) = n.image_type {
                let changed = o.image_type.as_ref().is_none_or(|old| !old.eq_ignore_ascii_case(t));
                if changed {
                    ctx.api.action(ObjectKind::Image, id, Action::ChangeType(t.to_uppercase()))?;
                }
            }
            let persistent = n.persistent.unwrap_or(false);
            if persistent != o.persistent.unwrap_or(false) {
                ctx.api.action(ObjectKind::Image, id, Action::Persistent(persistent))?;
            }

            common::update_template(ctx, ObjectKind::Image, id, |tpl| {
                n.update_fields(&o, tpl);
                n.labels.reconcile(ctx, &o.labels, tpl);
            })?;
            common::apply_access(ctx, ObjectKind::Image, id, &n.access, Some(&o.access))
        })
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        common::unlock_if_locked(ctx, ObjectKind::Image, id)?;
        ctx.api.delete(ObjectKind::Image, id)?;
        wait::wait_for_deletion(
            ctx.api,
            ObjectKind::Image,
            id,
            ctx.poll,
            ctx.timeout(spec, Operation::Delete)?,
        )
    }
}
