//! ACL rule resource. Rules cannot be edited, so every attribute forces a
//! replacement.

use super::common;
use super::{Context, ResourceHandler};
use crate::api::{acl, AllocateRequest, ObjectKind, RemoteObject};
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::error::{Error, Result};
use serde::Deserialize;

const KEYS: &[&str] = &["user", "resource", "rights", "zone"];

#[derive(Debug, Clone, Deserialize)]
struct AclSpec {
    user: String,
    resource: String,
    rights: String,
    #[serde(default)]
    zone: Option<String>,
}

/// A rule component: attribute, declared text, parser and formatter.
type Component<'a> = (
    &'static str,
    Option<&'a str>,
    fn(&str) -> Result<u64>,
    fn(u64) -> Result<String>,
);

impl AclSpec {
    fn components(&self) -> [Component<'_>; 4] {
        [
            ("user", Some(self.user.as_str()), acl::parse_users, acl::format_users),
            ("resource", Some(self.resource.as_str()), acl::parse_resources, acl::format_resources),
            ("rights", Some(self.rights.as_str()), acl::parse_rights, acl::format_rights),
            ("zone", self.zone.as_deref(), acl::parse_zone, acl::format_zone),
        ]
    }
}

fn remote_mask(object: &RemoteObject, attr: &str) -> Result<u64> {
    let key = attr.to_uppercase();
    let text = object
        .attr(&key)
        .ok_or_else(|| Error::validation(format!("acl {}", attr), "missing from remote rule"))?;
    u64::from_str_radix(text, 16)
        .map_err(|e| Error::validation(format!("acl {}", attr), format!("\"{}\": {}", text, e)))
}

pub struct AclHandler;

impl ResourceHandler for AclHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Acl
    }

    fn force_new(&self) -> &'static [&'static str] {
        KEYS
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<AclSpec, _>(spec, &[KEYS], |s| {
            s.components()
                .into_iter()
                .filter_map(|(_, text, parse, _)| text.and_then(|t| parse(t).err()))
                .map(|e| e.to_string())
                .collect()
        })
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: AclSpec = common::decode(spec)?;
        let request = AllocateRequest::Acl {
            user: acl::parse_users(&s.user)?,
            resource: acl::parse_resources(&s.resource)?,
            rights: acl::parse_rights(&s.rights)?,
            zone: s.zone.as_deref().map(acl::parse_zone).transpose()?,
        };
        let id = ctx.api.allocate(ObjectKind::Acl, request)?;
        tracing::info!(id, rule = %format!("{} {} {}", s.user, s.resource, s.rights), "acl rule created");
        Ok(id)
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: AclSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::Acl, id)?;

        let mut attrs = Attributes::new();
        common::put(&mut attrs, "id", id);
        for (attr, declared, parse, format) in s.components() {
            let mask = remote_mask(&object, attr)?;
            // Keep the declared spelling (`vm+net`, `use+manage`) when it
            // encodes to the same mask.
            let value = match declared {
                Some(text) if parse(text).ok() == Some(mask) => text.to_string(),
                _ => format(mask)?,
            };
            common::put(&mut attrs, attr, value);
        }
        Ok(attrs)
    }

    fn update(&self, _ctx: &Context<'_>, _id: u32, _old: &Spec, _new: &Spec) -> Result<()> {
        Ok(())
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, _spec: &Spec) -> Result<()> {
        ctx.api.delete(ObjectKind::Acl, id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryCloud;
    use crate::api::CloudApi;
    use crate::config::ProviderConfig;
    use crate::resources::testing::{ctx, spec};

    #[test]
    fn test_of060_create_and_read_back() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let s = spec("user: \"@1\"\nresource: vm+net/*\nrights: use+manage\n");
        assert!(AclHandler.validate(&s).is_empty());
        let id = AclHandler.create(&ctx, &s).unwrap();

        let obj = cloud.info(ObjectKind::Acl, id).unwrap();
        assert_eq!(obj.attr("STRING"), Some("@1 VM+NET/* USE+MANAGE #0"));
        let attrs = AclHandler.read(&ctx, id, &s).unwrap();
        assert_eq!(attrs["resource"], "vm+net/*");
        assert_eq!(attrs["zone"], "#0");
        assert!(crate::core::refresh::detect_drift("a", ResourceKind::Acl, &s, &attrs).is_empty());
    }

    #[test]
    fn test_of060_duplicate_rule_rejected() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let s = spec("user: \"#3\"\nresource: IMAGE/@1\nrights: USE\nzone: \"#0\"\n");
        AclHandler.create(&ctx, &s).unwrap();
        assert!(AclHandler.create(&ctx, &s).is_err());
    }

    #[test]
    fn test_of060_validation_and_force_new() {
        let problems = AclHandler.validate(&spec("user: \"5\"\nresource: SPACESHIP/*\nrights: FLY\n"));
        assert_eq!(problems.len(), 3, "{:?}", problems);
        for key in KEYS {
            assert!(AclHandler.force_new().contains(key));
        }
    }
}
