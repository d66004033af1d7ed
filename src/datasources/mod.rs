//! OF-040: Data sources — read-only lookups of existing objects.
//!
//! A `data:` entry filters the objects of one kind by id, name and tags.
//! Exactly one object must match; its attributes become available as
//! `{{data.<id>.<attr>}}`.

use crate::api::{ObjectKind, RemoteObject};
use crate::core::types::{Attributes, DataDecl};
use crate::error::{Error, Result};
use crate::resources::{common, Context};
use crate::template::DynTemplate;

/// Kinds a data source can look up.
pub const SUPPORTED_KINDS: &[ObjectKind] = &[
    ObjectKind::Cluster,
    ObjectKind::Datastore,
    ObjectKind::Host,
    ObjectKind::Image,
    ObjectKind::Template,
    ObjectKind::SecurityGroup,
    ObjectKind::Marketplace,
    ObjectKind::VirtualRouter,
    ObjectKind::Vdc,
    ObjectKind::VmGroup,
    ObjectKind::Group,
    ObjectKind::User,
    ObjectKind::VirtualNetwork,
];

fn matches(object: &RemoteObject, template: &DynTemplate, decl: &DataDecl) -> bool {
    decl.id.is_none_or(|id| object.id == id)
        && decl.name.as_ref().is_none_or(|name| &object.name == name)
        && decl
            .tags
            .iter()
            .all(|(key, value)| template.get_str(key) == Some(value.as_str()))
}

/// Look up the single object `decl` describes.
pub fn lookup(ctx: &Context<'_>, id: &str, decl: &DataDecl) -> Result<Attributes> {
    if !SUPPORTED_KINDS.contains(&decl.kind) {
        return Err(Error::validation(
            format!("data source '{}'", id),
            format!("cannot look up {} objects", decl.kind),
        ));
    }

    let mut found = Vec::new();
    for object in ctx.api.list(decl.kind)? {
        let template = common::template_of(&object)?;
        if matches(&object, &template, decl) {
            found.push((object, template));
        }
    }

    let (object, template) = match found.len() {
        1 => found.remove(0),
        0 => {
            return Err(Error::validation(
                format!("data source '{}'", id),
                format!("no {} matches the filter", decl.kind),
            ))
        }
        n => {
            let ids: Vec<String> = found.iter().map(|(o, _)| o.id.to_string()).collect();
            return Err(Error::validation(
                format!("data source '{}'", id),
                format!("{} {} objects match ({}); narrow the filter", n, decl.kind, ids.join(", ")),
            ));
        }
    };
    tracing::debug!(data = %id, kind = %decl.kind, remote_id = object.id, "data source resolved");

    let mut attrs = common::base_attributes(&object);
    common::ownership_attributes(&object, &mut attrs);
    common::put_value(&mut attrs, "tags", &crate::template::tags::read_tags(&template, &decl.tags))?;
    common::put_value(&mut attrs, "template", &template.flatten_pairs(&["NAME"]))?;
    for (key, value) in &object.attrs {
        common::put(&mut attrs, &key.to_lowercase(), value.as_str());
    }
    Ok(attrs)
}
