//! VM group resource: named roles with placement policy and host
//! (anti-)affinity. Roles are fixed at creation.

use super::common::{self, Access, Labels, LABEL_KEYS, LOCK_KEYS, OWNER_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{AllocateRequest, ObjectKind};
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::error::Result;
use crate::template::{DynTemplate, Vector};
use serde::{Deserialize, Serialize};

const KEYS: &[&str] = &["name", "roles"];

const POLICIES: &[&str] = &["NONE", "AFFINED", "ANTI_AFFINED"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoleSpec {
    name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    host_affined: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    host_anti_affined: Vec<u32>,
    /// VM-to-VM placement inside the role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    policy: Option<String>,
}

impl RoleSpec {
    fn to_vector(&self) -> Vector {
        let mut v = Vector::new("ROLE").with("NAME", &self.name);
        if !self.host_affined.is_empty() {
            v.add_pair("HOST_AFFINED", common::join_ids(&self.host_affined));
        }
        if !self.host_anti_affined.is_empty() {
            v.add_pair("HOST_ANTI_AFFINED", common::join_ids(&self.host_anti_affined));
        }
        if let Some(ref policy) = self.policy {
            v.add_pair("POLICY", policy.to_uppercase());
        }
        v
    }

    fn from_vector(v: &Vector, declared: Option<&RoleSpec>) -> Self {
        let policy = v.get_str("POLICY").map(|actual| match declared.and_then(|d| d.policy.as_ref()) {
            Some(d) if d.eq_ignore_ascii_case(actual) => d.clone(),
            _ => actual.to_string(),
        });
        Self {
            name: v.get_str("NAME").unwrap_or_default().to_string(),
            host_affined: common::split_ids(v.get_str("HOST_AFFINED")),
            host_anti_affined: common::split_ids(v.get_str("HOST_ANTI_AFFINED")),
            policy,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct VmGroupSpec {
    name: String,
    roles: Vec<RoleSpec>,
    #[serde(flatten)]
    access: Access,
    #[serde(flatten)]
    labels: Labels,
}

impl VmGroupSpec {
    fn problems(&self) -> Vec<String> {
        let mut problems = self.access.problems();
        if self.roles.is_empty() {
            problems.push("at least one role is required".to_string());
        }
        let mut names: Vec<&str> = Vec::new();
        for (i, role) in self.roles.iter().enumerate() {
            if role.name.trim().is_empty() {
                problems.push(format!("roles[{}]: name must not be empty", i));
            } else if names.contains(&role.name.as_str()) {
                problems.push(format!("roles[{}]: duplicate role \"{}\"", i, role.name));
            }
            names.push(&role.name);
            if let Some(ref policy) = role.policy {
                if !POLICIES.contains(&policy.to_uppercase().as_str()) {
                    problems.push(format!(
                        "roles[{}]: invalid policy \"{}\" (expected one of {})",
                        i,
                        policy,
                        POLICIES.join(", ")
                    ));
                }
            }
            if let Some(host) = role.host_affined.iter().find(|h| role.host_anti_affined.contains(h)) {
                problems.push(format!(
                    "roles[{}]: host {} is both affined and anti-affined",
                    i, host
                ));
            }
        }
        problems
    }
}

pub struct VmGroupHandler;

impl ResourceHandler for VmGroupHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::VmGroup
    }

    fn force_new(&self) -> &'static [&'static str] {
        &["roles"]
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<VmGroupSpec, _>(
            spec,
            &[KEYS, OWNER_KEYS, LOCK_KEYS, LABEL_KEYS],
            VmGroupSpec::problems,
        )
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: VmGroupSpec = common::decode(spec)?;
        let mut template = DynTemplate::new();
        template.add_pair("NAME", &s.name);
        for role in &s.roles {
            template.add_vector(role.to_vector());
        }
        s.labels.add_to(ctx, &mut template);

        let id = ctx.api.allocate(
            ObjectKind::VmGroup,
            AllocateRequest::Template {
                template: template.render(),
                cluster_id: None,
                datastore_id: None,
            },
        )?;
        tracing::info!(id, name = %s.name, roles = s.roles.len(), "vm group allocated");
        Ok(id)
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: VmGroupSpec = common::decode(spec)?;
        common::apply_access(ctx, ObjectKind::VmGroup, id, &s.access, None)?;
        common::apply_lock(ctx, ObjectKind::VmGroup, id, s.access.lock.as_deref())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: VmGroupSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::VmGroup, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        common::ownership_attributes(&object, &mut attrs);
        common::lock_attribute(&object, &s.access, &mut attrs);
        let roles: Vec<RoleSpec> = template
            .vectors("ROLE")
            .map(|v| {
                let declared = s.roles.iter().find(|r| Some(r.name.as_str()) == v.get_str("NAME"));
                RoleSpec::from_vector(v, declared)
            })
            .collect();
        common::put_value(&mut attrs, "roles", &roles)?;
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: VmGroupSpec = common::decode(old)?;
        let n: VmGroupSpec = common::decode(new)?;
        let lock = common::desired_lock(&o.access, &n.access);

        common::with_unlocked(ctx, ObjectKind::VmGroup, id, lock, || {
            common::rename_if_changed(ctx, ObjectKind::VmGroup, id, &o.name, &n.name)?;
            common::update_template(ctx, ObjectKind::VmGroup, id, |tpl| {
                n.labels.reconcile(ctx, &o.labels, tpl);
            })?;
            common::apply_access(ctx, ObjectKind::VmGroup, id, &n.access, Some(&o.access))
        })
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, _spec: &Spec) -> Result<()> {
        common::unlock_if_locked(ctx, ObjectKind::VmGroup, id)?;
        ctx.api.delete(ObjectKind::VmGroup, id)?;
        Ok(())
    }
}
