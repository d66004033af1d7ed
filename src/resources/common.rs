//! Helpers shared by the resource handlers: spec decoding, ownership and
//! locks, tag and section reconciliation, attribute read-back.

use super::{Context, META_KEYS};
use crate::api::{LockLevel, ObjectKind, Permissions, RemoteObject, UpdateMode};
use crate::core::types::{yaml_value_to_string, Attributes, Spec};
use crate::error::{Error, Result};
use crate::template::section::{add_sections, read_sections, reconcile_sections, TemplateSection};
use crate::template::tags::{add_tags, diff_tags, merge_default_tags, read_tags, TagMap};
use crate::template::DynTemplate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml_ng::Value;

/// Ownership keys every owned object accepts.
pub const OWNER_KEYS: &[&str] = &["permissions", "uid", "gid", "group"];

/// Accepted by kinds that support locking.
pub const LOCK_KEYS: &[&str] = &["lock"];

pub const LABEL_KEYS: &[&str] = &["tags", "template_section"];

/// Lock value that removes an existing lock.
pub const UNLOCK: &str = "UNLOCK";

/// Decode a spec into a typed struct, ignoring meta keys.
pub fn decode<T: DeserializeOwned>(spec: &Spec) -> Result<T> {
    let mut mapping = serde_yaml_ng::Mapping::new();
    for (key, value) in spec {
        if !META_KEYS.contains(&key.as_str()) {
            mapping.insert(Value::String(key.clone()), value.clone());
        }
    }
    serde_yaml_ng::from_value(Value::Mapping(mapping))
        .map_err(|e| Error::validation("spec", e.to_string()))
}

/// One problem per spec key outside `known`.
pub fn unknown_keys(spec: &Spec, known: &[&[&str]]) -> Vec<String> {
    spec.keys()
        .filter(|key| !META_KEYS.contains(&key.as_str()))
        .filter(|key| !known.iter().any(|set| set.contains(&key.as_str())))
        .map(|key| format!("unknown attribute '{}'", key))
        .collect()
}

/// Unknown-key check, decode, then the handler's own rules.
pub fn check<T, F>(spec: &Spec, known: &[&[&str]], rules: F) -> Vec<String>
where
    T: DeserializeOwned,
    F: FnOnce(&T) -> Vec<String>,
{
    let mut problems = unknown_keys(spec, known);
    match decode::<T>(spec) {
        Ok(typed) => problems.extend(rules(&typed)),
        Err(e) => problems.push(e.to_string()),
    }
    problems
}

/// Accept `640` as well as `"640"`.
fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(|v| yaml_value_to_string(&v)))
}

// ============================================================================
// Ownership and locks
// ============================================================================

/// Permissions, owner, group and lock as declared.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Access {
    #[serde(default, deserialize_with = "scalar_string")]
    pub permissions: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    /// Group name, resolved to a gid at apply time
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub lock: Option<String>,
}

impl Access {
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(ref text) = self.permissions {
            if let Err(e) = parse_permissions(text) {
                problems.push(e.to_string());
            }
        }
        if self.gid.is_some() && self.group.is_some() {
            problems.push("group and gid are mutually exclusive".to_string());
        }
        if let Some(ref lock) = self.lock {
            if !lock.eq_ignore_ascii_case(UNLOCK) && LockLevel::parse(lock).is_none() {
                problems.push(format!(
                    "invalid lock \"{}\" (expected USE, MANAGE, ADMIN, ALL or UNLOCK)",
                    lock
                ));
            }
        }
        problems
    }
}

pub fn parse_permissions(text: &str) -> Result<Permissions> {
    Permissions::from_octal(text).map_err(|message| Error::validation("permissions", message))
}

/// Resolve the declared group to a gid.
pub fn resolve_gid(ctx: &Context<'_>, access: &Access) -> Result<Option<u32>> {
    if let Some(gid) = access.gid {
        return Ok(Some(gid));
    }
    let Some(ref name) = access.group else {
        return Ok(None);
    };
    ctx.api
        .list(ObjectKind::Group)?
        .into_iter()
        .find(|g| &g.name == name)
        .map(|g| Some(g.id))
        .ok_or_else(|| Error::Resolve(format!("group \"{}\" not found", name)))
}

/// chmod/chown for whatever differs from `old` (everything on create).
pub fn apply_access(
    ctx: &Context<'_>,
    kind: ObjectKind,
    id: u32,
    new: &Access,
    old: Option<&Access>,
) -> Result<()> {
    if let Some(ref text) = new.permissions {
        if old.and_then(|o| o.permissions.as_ref()) != Some(text) {
            ctx.api.chmod(kind, id, parse_permissions(text)?)?;
        }
    }

    let uid = new.uid.filter(|uid| old.and_then(|o| o.uid) != Some(*uid));
    let group_declared = new.gid.is_some() || new.group.is_some();
    let group_changed = old.is_none_or(|o| o.gid != new.gid || o.group != new.group);
    let gid = if group_declared && group_changed {
        resolve_gid(ctx, new)?
    } else {
        None
    };
    if uid.is_some() || gid.is_some() {
        ctx.api.chown(kind, id, uid, gid)?;
    }
    Ok(())
}

/// Set the declared lock. `None` leaves the object as it is.
pub fn apply_lock(ctx: &Context<'_>, kind: ObjectKind, id: u32, declared: Option<&str>) -> Result<()> {
    match declared.map(LockLevel::parse) {
        None => Ok(()),
        Some(Some(level)) => Ok(ctx.api.lock(kind, id, level)?),
        Some(None) => Ok(ctx.api.unlock(kind, id)?),
    }
}

/// Lock wanted after an update. Dropping `lock` from the spec unlocks.
pub fn desired_lock<'a>(old: &'a Access, new: &'a Access) -> Option<&'a str> {
    match (&old.lock, &new.lock) {
        (_, Some(level)) => Some(level.as_str()),
        (Some(_), None) => Some(UNLOCK),
        (None, None) => None,
    }
}

/// Run `f` on an unlocked object, then lock it at the declared level, or
/// back at its previous level when nothing is declared.
pub fn with_unlocked<T>(
    ctx: &Context<'_>,
    kind: ObjectKind,
    id: u32,
    declared: Option<&str>,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let before = ctx.api.info(kind, id)?.lock;
    if before.is_some() {
        ctx.api.unlock(kind, id)?;
    }
    let result = f();
    let after = match declared {
        Some(level) => LockLevel::parse(level),
        None => before,
    };
    let relocked = match after {
        Some(level) => ctx.api.lock(kind, id, level).map_err(Error::from),
        None => Ok(()),
    };
    let value = result?;
    relocked?;
    Ok(value)
}

pub fn unlock_if_locked(ctx: &Context<'_>, kind: ObjectKind, id: u32) -> Result<()> {
    if ctx.api.info(kind, id)?.lock.is_some() {
        ctx.api.unlock(kind, id)?;
    }
    Ok(())
}

// ============================================================================
// Tags and template sections
// ============================================================================

/// Tags and template sections as declared.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Labels {
    #[serde(default)]
    pub tags: TagMap,
    #[serde(default)]
    pub template_section: Vec<TemplateSection>,
}

impl Labels {
    /// Declared tags over the provider's default tags.
    pub fn tags_all(&self, ctx: &Context<'_>) -> TagMap {
        merge_default_tags(&ctx.config.default_tags, &self.tags)
    }

    pub fn add_to(&self, ctx: &Context<'_>, template: &mut DynTemplate) {
        add_tags(template, &self.tags_all(ctx));
        add_sections(template, &self.template_section);
    }

    pub fn reconcile(&self, ctx: &Context<'_>, old: &Labels, template: &mut DynTemplate) {
        diff_tags(&old.tags_all(ctx), &self.tags_all(ctx)).apply(template);
        reconcile_sections(template, &old.template_section, &self.template_section);
    }

    pub fn read_into(&self, ctx: &Context<'_>, template: &DynTemplate, attrs: &mut Attributes) -> Result<()> {
        put_value(attrs, "tags", &read_tags(template, &self.tags))?;
        put_value(attrs, "tags_all", &read_tags(template, &self.tags_all(ctx)))?;
        if !self.template_section.is_empty() {
            put_value(
                attrs,
                "template_section",
                &read_sections(template, &self.template_section),
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// Remote templates
// ============================================================================

pub fn template_of(object: &RemoteObject) -> Result<DynTemplate> {
    object.template.parse()
}

/// Fetch the template, let `f` edit it, and write it back when it changed.
pub fn update_template<F>(ctx: &Context<'_>, kind: ObjectKind, id: u32, f: F) -> Result<bool>
where
    F: FnOnce(&mut DynTemplate),
{
    let object = ctx.api.info(kind, id)?;
    let mut template = template_of(&object)?;
    let before = template.clone();
    f(&mut template);
    if template == before {
        return Ok(false);
    }
    tracing::debug!(%kind, id, "updating template");
    ctx.api.update(kind, id, &template.render(), UpdateMode::Replace)?;
    Ok(true)
}

/// Set `key` when `value` is present, remove it otherwise.
pub fn set_or_del<V: ToString>(template: &mut DynTemplate, key: &str, value: Option<V>) {
    match value {
        Some(v) => template.set_pair(key, v),
        None => {
            template.del(key);
        }
    }
}

/// Touch `key` only when the declared value changed between two specs.
/// Keys the spec never declared stay as they are on the remote side.
pub fn set_if_changed<V: ToString + PartialEq>(
    template: &mut DynTemplate,
    key: &str,
    old: Option<V>,
    new: Option<V>,
) {
    if old != new {
        set_or_del(template, key, new);
    }
}

pub fn rename_if_changed(ctx: &Context<'_>, kind: ObjectKind, id: u32, old: &str, new: &str) -> Result<()> {
    if old != new {
        ctx.api.rename(kind, id, new)?;
    }
    Ok(())
}

/// Ids only in `new`, then ids only in `old`.
pub fn set_diff(old: &[u32], new: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let added = new.iter().filter(|id| !old.contains(id)).copied().collect();
    let removed = old.iter().filter(|id| !new.contains(id)).copied().collect();
    (added, removed)
}

/// Comma-separated id list, as OpenNebula stores them in templates.
pub fn join_ids(ids: &[u32]) -> String {
    ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

pub fn split_ids(text: Option<&str>) -> Vec<u32> {
    text.map(|s| s.split(',').filter_map(|x| x.trim().parse().ok()).collect())
        .unwrap_or_default()
}

// ============================================================================
// Attributes
// ============================================================================

pub fn put(attrs: &mut Attributes, key: &str, value: impl Into<Value>) {
    attrs.insert(key.to_string(), value.into());
}

pub fn put_value<T: Serialize + ?Sized>(attrs: &mut Attributes, key: &str, value: &T) -> Result<()> {
    attrs.insert(key.to_string(), serde_yaml_ng::to_value(value)?);
    Ok(())
}

/// Insert each field of a serialized struct as its own attribute.
pub fn put_fields<T: Serialize>(attrs: &mut Attributes, value: &T) -> Result<()> {
    if let Value::Mapping(mapping) = serde_yaml_ng::to_value(value)? {
        for (key, field) in mapping {
            if let Value::String(key) = key {
                attrs.insert(key, field);
            }
        }
    }
    Ok(())
}

/// `id` and `name`.
pub fn base_attributes(object: &RemoteObject) -> Attributes {
    let mut attrs = Attributes::new();
    put(&mut attrs, "id", object.id);
    put(&mut attrs, "name", object.name.as_str());
    attrs
}

/// Owner, group and permissions.
pub fn ownership_attributes(object: &RemoteObject, attrs: &mut Attributes) {
    put(attrs, "uid", object.uid);
    put(attrs, "gid", object.gid);
    put(attrs, "uname", object.uname.as_str());
    put(attrs, "gname", object.gname.as_str());
    put(attrs, "group", object.gname.as_str());
    put(attrs, "permissions", object.permissions.to_octal());
}

/// The lock level, or `UNLOCK`, in the declared spelling when it matches.
pub fn lock_attribute(object: &RemoteObject, declared: &Access, attrs: &mut Attributes) {
    let actual = object
        .lock
        .map(|level| level.to_string())
        .unwrap_or_else(|| UNLOCK.to_string());
    let value = match declared.lock {
        Some(ref d) if d.eq_ignore_ascii_case(&actual) => d.clone(),
        _ => actual,
    };
    put(attrs, "lock", value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryCloud;
    use crate::api::{AllocateRequest, CloudApi};
    use crate::config::ProviderConfig;
    use crate::core::wait::Poll;

    fn spec(yaml: &str) -> Spec {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(flatten)]
        access: Access,
        #[serde(flatten)]
        labels: Labels,
    }

    fn template_object(cloud: &MemoryCloud, name: &str) -> u32 {
        cloud
            .allocate(
                ObjectKind::Template,
                AllocateRequest::Template {
                    template: format!("NAME=\"{}\"\nCPU=\"1\"", name),
                    cluster_id: None,
                    datastore_id: None,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_of041_decode_flattened_and_meta() {
        let s = spec("name: a\npermissions: 640\ngroup: users\ntags: { env: prod }\ntimeouts: { create: 1m }\n");
        let sample: Sample = decode(&s).unwrap();
        assert_eq!(sample.name, "a");
        assert_eq!(sample.access.permissions.as_deref(), Some("640"));
        assert_eq!(sample.access.group.as_deref(), Some("users"));
        assert_eq!(sample.labels.tags["env"], "prod");
        assert!(decode::<Sample>(&spec("permissions: \"600\"")).is_err());
    }

    #[test]
    fn test_of041_unknown_keys_and_problems() {
        let s = spec("name: a\nlock: sometimes\ngid: 1\ngroup: users\ncolour: red\n");
        let problems = check::<Sample, _>(&s, &[&["name"], OWNER_KEYS, LOCK_KEYS], |t| {
            t.access.problems()
        });
        assert_eq!(problems.len(), 3, "{:?}", problems);
        assert!(problems[0].contains("'colour'"));
        assert!(problems.iter().any(|p| p.contains("mutually exclusive")));
        assert!(problems.iter().any(|p| p.contains("invalid lock")));
    }

    #[test]
    fn test_of041_apply_access_resolves_group() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = Context::new(&cloud, &config).unwrap();
        let id = template_object(&cloud, "t");

        let access: Access = decode(&spec("permissions: \"644\"\ngroup: users")).unwrap();
        apply_access(&ctx, ObjectKind::Template, id, &access, None).unwrap();
        let obj = cloud.info(ObjectKind::Template, id).unwrap();
        assert_eq!(obj.permissions.to_octal(), "644");
        assert_eq!(obj.gid, 1);

        cloud.clear_calls();
        apply_access(&ctx, ObjectKind::Template, id, &access, Some(&access)).unwrap();
        assert!(cloud.calls().is_empty());

        let missing: Access = decode(&spec("group: nobody")).unwrap();
        let err = apply_access(&ctx, ObjectKind::Template, id, &missing, None).unwrap_err();
        assert!(err.to_string().contains("nobody"));
    }

    #[test]
    fn test_of041_with_unlocked_relocks() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = Context::new(&cloud, &config).unwrap().with_poll(Poll::immediate());
        let id = template_object(&cloud, "t");
        cloud.lock(ObjectKind::Template, id, LockLevel::Use).unwrap();

        with_unlocked(&ctx, ObjectKind::Template, id, None, || {
            Ok(ctx.api.rename(ObjectKind::Template, id, "renamed")?)
        })
        .unwrap();
        let obj = cloud.info(ObjectKind::Template, id).unwrap();
        assert_eq!(obj.name, "renamed");
        assert_eq!(obj.lock, Some(LockLevel::Use));

        with_unlocked(&ctx, ObjectKind::Template, id, Some("unlock"), || Ok(())).unwrap();
        assert_eq!(cloud.info(ObjectKind::Template, id).unwrap().lock, None);

        let failed: Result<()> = with_unlocked(&ctx, ObjectKind::Template, id, Some("ADMIN"), || {
            Err(Error::Resolve("boom".to_string()))
        });
        assert!(failed.is_err());
        assert_eq!(cloud.info(ObjectKind::Template, id).unwrap().lock, Some(LockLevel::Admin));
    }

    #[test]
    fn test_of041_labels_reconcile_with_defaults() {
        let cloud = MemoryCloud::new();
        let mut config = ProviderConfig::default();
        config.default_tags.insert("owner".to_string(), "ops".to_string());
        let ctx = Context::new(&cloud, &config).unwrap();

        let old: Labels = decode(&spec("tags: { env: dev, tier: web }")).unwrap();
        let new: Labels = decode(&spec("tags: { env: prod, owner: me }")).unwrap();
        let mut tpl: DynTemplate = "CPU=\"1\"".parse().unwrap();
        old.add_to(&ctx, &mut tpl);
        assert_eq!(tpl.get_str("OWNER"), Some("ops"));

        new.reconcile(&ctx, &old, &mut tpl);
        assert_eq!(tpl.get_str("ENV"), Some("prod"));
        assert_eq!(tpl.get_str("OWNER"), Some("me"));
        assert!(!tpl.contains_key("TIER"));
        assert_eq!(tpl.get_str("CPU"), Some("1"));

        let mut attrs = Attributes::new();
        new.read_into(&ctx, &tpl, &mut attrs).unwrap();
        assert_eq!(attrs["tags"]["env"], Value::from("prod"));
        assert_eq!(attrs["tags_all"]["owner"], Value::from("me"));
    }

    #[test]
    fn test_of041_small_helpers() {
        use std::collections::BTreeMap;
        assert_eq!(set_diff(&[1, 2, 3], &[2, 3, 4]), (vec![4], vec![1]));
        assert_eq!(join_ids(&[1, 5]), "1,5");
        assert_eq!(split_ids(Some("1, 5,x")), vec![1, 5]);
        let declared = BTreeMap::from([("ssh_key".to_string(), String::new())]);
        let actual = BTreeMap::from([
            ("SSH_KEY".to_string(), "k".to_string()),
            ("NETWORK".to_string(), "YES".to_string()),
        ]);
        let respelled = crate::template::respell(actual, &declared);
        assert_eq!(respelled["ssh_key"], "k");
        assert_eq!(respelled["NETWORK"], "YES");
    }
}
