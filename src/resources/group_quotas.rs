//! Group quotas resource.
//!
//! Quotas live on the group itself, so the resource's remote id is the
//! group id. Entries are written as DATASTORE, NETWORK, IMAGE and VM
//! vectors; removing an entry (or the resource) resets its limits to the
//! default, `-1`.

use super::common;
use super::{Context, ResourceHandler};
use crate::api::{Action, ObjectKind};
use crate::core::types::{yaml_value_to_string, Attributes, ResourceKind, Spec};
use crate::error::Result;
use crate::template::{DynTemplate, Vector};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml_ng::Value;

const KEYS: &[&str] = &["group_id", "datastore", "network", "image", "vm"];

/// Limit value meaning "use the default quota".
const DEFAULT_LIMIT: &str = "-1";

/// One quota entry, keyed by attribute name.
type Entry = IndexMap<String, Value>;

struct Section {
    attr: &'static str,
    vector: &'static str,
    /// Entries carry an `id` (datastore, network, image)
    keyed: bool,
    /// (attribute, vector key)
    limits: &'static [(&'static str, &'static str)],
}

const SECTIONS: &[Section] = &[
    Section {
        attr: "datastore",
        vector: "DATASTORE",
        keyed: true,
        limits: &[("images", "IMAGES"), ("size", "SIZE")],
    },
    Section {
        attr: "network",
        vector: "NETWORK",
        keyed: true,
        limits: &[("leases", "LEASES")],
    },
    Section {
        attr: "image",
        vector: "IMAGE",
        keyed: true,
        limits: &[("running_vms", "RVMS")],
    },
    Section {
        attr: "vm",
        vector: "VM",
        keyed: false,
        limits: &[
            ("cpu", "CPU"),
            ("memory", "MEMORY"),
            ("running_cpu", "RUNNING_CPU"),
            ("running_memory", "RUNNING_MEMORY"),
            ("running_vms", "RUNNING_VMS"),
            ("system_disk_size", "SYSTEM_DISK_SIZE"),
            ("vms", "VMS"),
        ],
    },
];

#[derive(Debug, Clone, Deserialize)]
struct GroupQuotasSpec {
    group_id: u32,
    #[serde(default)]
    datastore: Vec<Entry>,
    #[serde(default)]
    network: Vec<Entry>,
    #[serde(default)]
    image: Vec<Entry>,
    #[serde(default)]
    vm: Option<Entry>,
}

impl GroupQuotasSpec {
    fn sections(&self) -> [(&'static Section, Vec<&Entry>); 4] {
        [
            (&SECTIONS[0], self.datastore.iter().collect()),
            (&SECTIONS[1], self.network.iter().collect()),
            (&SECTIONS[2], self.image.iter().collect()),
            (&SECTIONS[3], self.vm.iter().collect()),
        ]
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (section, entries) in self.sections() {
            let mut seen = Vec::new();
            for (i, entry) in entries.iter().enumerate() {
                let at = if section.keyed {
                    format!("{}[{}]", section.attr, i)
                } else {
                    section.attr.to_string()
                };
                for (key, value) in entry.iter() {
                    let known = (section.keyed && key == "id")
                        || section.limits.iter().any(|(attr, _)| attr == key);
                    if !known {
                        problems.push(format!("{}: unknown attribute '{}'", at, key));
                    } else if yaml_value_to_string(value).parse::<f64>().is_err() {
                        problems.push(format!("{}.{} must be a number", at, key));
                    }
                }
                if section.keyed {
                    match entry.get("id").map(yaml_value_to_string) {
                        None => problems.push(format!("{}: id is required", at)),
                        Some(id) if seen.contains(&id) => {
                            problems.push(format!("{}: duplicate id {}", at, id));
                        }
                        Some(id) => seen.push(id),
                    }
                }
            }
        }
        problems
    }
}

fn entry_id(entry: &Entry) -> Option<String> {
    entry.get("id").map(yaml_value_to_string)
}

fn to_vector(section: &Section, entry: &Entry) -> Vector {
    let mut v = Vector::new(section.vector);
    if let Some(id) = entry_id(entry).filter(|_| section.keyed) {
        v.add_pair("ID", id);
    }
    for (attr, key) in section.limits {
        if let Some(value) = entry.get(*attr) {
            v.add_pair(key, yaml_value_to_string(value));
        }
    }
    v
}

fn reset_vector(section: &Section, id: Option<String>) -> Vector {
    let mut v = Vector::new(section.vector);
    if let Some(id) = id.filter(|_| section.keyed) {
        v.add_pair("ID", id);
    }
    for (_, key) in section.limits {
        v.add_pair(key, DEFAULT_LIMIT);
    }
    v
}

/// Numbers come back as numbers, anything else as text.
fn number(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        Value::from(i)
    } else if let Ok(f) = text.parse::<f64>() {
        Value::from(f)
    } else {
        Value::from(text)
    }
}

fn from_vector(section: &Section, v: &Vector) -> Entry {
    let mut entry = Entry::new();
    if section.keyed {
        if let Some(id) = v.get_str("ID") {
            entry.insert("id".to_string(), number(id));
        }
    }
    for (attr, key) in section.limits {
        if let Some(value) = v.get_str(key) {
            entry.insert(attr.to_string(), number(value));
        }
    }
    entry
}

fn is_default(section: &Section, v: &Vector) -> bool {
    section
        .limits
        .iter()
        .all(|(_, key)| v.get_str(key).is_none_or(|value| value == DEFAULT_LIMIT))
}

fn set_quota(ctx: &Context<'_>, group: u32, vectors: Vec<Vector>) -> Result<()> {
    if vectors.is_empty() {
        return Ok(());
    }
    let mut template = DynTemplate::new();
    for v in vectors {
        template.add_vector(v);
    }
    tracing::debug!(group, "setting group quotas");
    ctx.api.action(ObjectKind::Group, group, Action::SetQuota(template.render()))?;
    Ok(())
}

pub struct GroupQuotasHandler;

impl ResourceHandler for GroupQuotasHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::GroupQuotas
    }

    fn force_new(&self) -> &'static [&'static str] {
        &["group_id"]
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<GroupQuotasSpec, _>(spec, &[KEYS], GroupQuotasSpec::problems)
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: GroupQuotasSpec = common::decode(spec)?;
        ctx.api.info(ObjectKind::Group, s.group_id)?;
        let vectors = s
            .sections()
            .into_iter()
            .flat_map(|(section, entries)| entries.into_iter().map(move |e| to_vector(section, e)))
            .collect();
        set_quota(ctx, s.group_id, vectors)?;
        tracing::info!(group = s.group_id, "group quotas set");
        Ok(s.group_id)
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: GroupQuotasSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::Group, id)?;
        let quotas: DynTemplate = object.quotas.parse()?;

        let mut attrs = Attributes::new();
        common::put(&mut attrs, "id", id);
        common::put(&mut attrs, "group_id", id);
        for (section, declared) in s.sections() {
            let mut remote: Vec<&Vector> = quotas
                .vectors(section.vector)
                .filter(|v| !is_default(section, v))
                .collect();
            // Declared entries first, in declared order.
            let mut entries = Vec::new();
            for entry in declared {
                let position = remote.iter().position(|v| {
                    !section.keyed || v.get_str("ID").map(str::to_string) == entry_id(entry)
                });
                if let Some(i) = position {
                    entries.push(from_vector(section, remote.remove(i)));
                }
            }
            entries.extend(remote.into_iter().map(|v| from_vector(section, v)));

            if section.keyed {
                common::put_value(&mut attrs, section.attr, &entries)?;
            } else if let Some(vm) = entries.into_iter().next() {
                common::put_value(&mut attrs, section.attr, &vm)?;
            }
        }
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: GroupQuotasSpec = common::decode(old)?;
        let n: GroupQuotasSpec = common::decode(new)?;

        let mut vectors = Vec::new();
        for ((section, old_entries), (_, new_entries)) in o.sections().into_iter().zip(n.sections()) {
            for entry in &old_entries {
                let kept = new_entries
                    .iter()
                    .any(|e| !section.keyed || entry_id(e) == entry_id(entry));
                if !kept {
                    vectors.push(reset_vector(section, entry_id(entry)));
                }
            }
            for entry in &new_entries {
                if !old_entries.contains(entry) {
                    let mut v = reset_vector(section, entry_id(entry));
                    for pair in to_vector(section, entry).pairs {
                        v.del(&pair.key);
                        v.add_pair(&pair.key, pair.value);
                    }
                    vectors.push(v);
                }
            }
        }
        set_quota(ctx, id, vectors)
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: GroupQuotasSpec = common::decode(spec)?;
        let vectors = s
            .sections()
            .into_iter()
            .flat_map(|(section, entries)| {
                entries
                    .into_iter()
                    .map(move |e| reset_vector(section, entry_id(e)))
            })
            .collect();
        match set_quota(ctx, id, vectors) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
