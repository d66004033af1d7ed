//! Security group resource: RULE vectors, committed to the VMs using the
//! group whenever they change.

use super::common::{self, Access, Labels, LABEL_KEYS, OWNER_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{Action, AllocateRequest, ObjectKind};
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::error::Result;
use crate::template::{DynTemplate, Vector};
use serde::{Deserialize, Serialize};

const KEYS: &[&str] = &["name", "description", "rules", "commit"];

const PROTOCOLS: &[&str] = &["ALL", "TCP", "UDP", "ICMP", "ICMPV6", "IPSEC"];
const RULE_TYPES: &[&str] = &["inbound", "outbound"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
    protocol: String,
    rule_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u32>,
    /// Port ranges, e.g. `22,80:90`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    icmp_type: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    network_id: Option<u32>,
}

impl RuleSpec {
    fn to_vector(&self) -> Vector {
        let mut v = Vector::new("RULE")
            .with("PROTOCOL", self.protocol.to_uppercase())
            .with("RULE_TYPE", self.rule_type.to_lowercase());
        if let Some(ref ip) = self.ip {
            v.add_pair("IP", ip);
        }
        if let Some(size) = self.size {
            v.add_pair("SIZE", size);
        }
        if let Some(ref range) = self.range {
            v.add_pair("RANGE", range);
        }
        if let Some(icmp) = self.icmp_type {
            v.add_pair("ICMP_TYPE", icmp);
        }
        if let Some(network) = self.network_id {
            v.add_pair("NETWORK_ID", network);
        }
        v
    }

    fn from_vector(v: &Vector) -> Self {
        Self {
            protocol: v.get_str("PROTOCOL").unwrap_or_default().to_string(),
            rule_type: v.get_str("RULE_TYPE").unwrap_or_default().to_string(),
            ip: v.get_str("IP").map(str::to_string),
            size: v.get_parsed("SIZE"),
            range: v.get_str("RANGE").map(str::to_string),
            icmp_type: v.get_parsed("ICMP_TYPE"),
            network_id: v.get_parsed("NETWORK_ID"),
        }
    }

    fn problems(&self, index: usize) -> Vec<String> {
        let mut problems = Vec::new();
        let protocol = self.protocol.to_uppercase();
        if !PROTOCOLS.contains(&protocol.as_str()) {
            problems.push(format!(
                "rules[{}]: invalid protocol \"{}\" (expected one of {})",
                index,
                self.protocol,
                PROTOCOLS.join(", ")
            ));
        }
        if !RULE_TYPES.contains(&self.rule_type.to_lowercase().as_str()) {
            problems.push(format!(
                "rules[{}]: rule_type must be inbound or outbound, got \"{}\"",
                index, self.rule_type
            ));
        }
        if self.range.is_some() && !matches!(protocol.as_str(), "TCP" | "UDP") {
            problems.push(format!("rules[{}]: range only applies to TCP and UDP", index));
        }
        if self.icmp_type.is_some() && protocol != "ICMP" {
            problems.push(format!("rules[{}]: icmp_type only applies to ICMP", index));
        }
        if self.size.is_some() && self.ip.is_none() {
            problems.push(format!("rules[{}]: size needs ip", index));
        }
        problems
    }

    /// Take the declared spelling of protocol and rule type when they match.
    fn respelled(mut self, declared: Option<&RuleSpec>) -> Self {
        if let Some(d) = declared {
            if d.protocol.eq_ignore_ascii_case(&self.protocol) {
                self.protocol = d.protocol.clone();
            }
            if d.rule_type.eq_ignore_ascii_case(&self.rule_type) {
                self.rule_type = d.rule_type.clone();
            }
        }
        self
    }
}

fn default_commit() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct SecurityGroupSpec {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    rules: Vec<RuleSpec>,
    /// Push rule changes to the VMs using the group
    #[serde(default = "default_commit")]
    commit: bool,
    #[serde(flatten)]
    access: Access,
    #[serde(flatten)]
    labels: Labels,
}

impl SecurityGroupSpec {
    fn write_rules(&self, template: &mut DynTemplate) {
        template.del("RULE");
        for rule in &self.rules {
            template.add_vector(rule.to_vector());
        }
    }
}

pub struct SecurityGroupHandler;

impl ResourceHandler for SecurityGroupHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::SecurityGroup
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<SecurityGroupSpec, _>(spec, &[KEYS, OWNER_KEYS, LABEL_KEYS], |s| {
            let mut problems = s.access.problems();
            for (i, rule) in s.rules.iter().enumerate() {
                problems.extend(rule.problems(i));
            }
            problems
        })
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: SecurityGroupSpec = common::decode(spec)?;
        let mut template = DynTemplate::new();
        template.add_pair("NAME", &s.name);
        if let Some(ref description) = s.description {
            template.add_pair("DESCRIPTION", description);
        }
        s.write_rules(&mut template);
        s.labels.add_to(ctx, &mut template);

        let id = ctx.api.allocate(
            ObjectKind::SecurityGroup,
            AllocateRequest::Template {
                template: template.render(),
                cluster_id: None,
                datastore_id: None,
            },
        )?;
        tracing::info!(id, name = %s.name, rules = s.rules.len(), "security group allocated");
        Ok(id)
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: SecurityGroupSpec = common::decode(spec)?;
        common::apply_access(ctx, ObjectKind::SecurityGroup, id, &s.access, None)
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: SecurityGroupSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::SecurityGroup, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        common::ownership_attributes(&object, &mut attrs);
        if let Some(description) = template.get_str("DESCRIPTION") {
            common::put(&mut attrs, "description", description);
        }
        let rules: Vec<RuleSpec> = template
            .vectors("RULE")
            .enumerate()
            .map(|(i, v)| RuleSpec::from_vector(v).respelled(s.rules.get(i)))
            .collect();
        common::put_value(&mut attrs, "rules", &rules)?;
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: SecurityGroupSpec = common::decode(old)?;
        let n: SecurityGroupSpec = common::decode(new)?;
        common::rename_if_changed(ctx, ObjectKind::SecurityGroup, id, &o.name, &n.name)?;

        let rules_changed = o.rules != n.rules;
        common::update_template(ctx, ObjectKind::SecurityGroup, id, |tpl| {
            if rules_changed {
                n.write_rules(tpl);
            }
            common::set_if_changed(tpl, "DESCRIPTION", o.description.as_ref(), n.description.as_ref());
            n.labels.reconcile(ctx, &o.labels, tpl);
        })?;
        if rules_changed && n.commit {
            tracing::info!(id, "committing security group rules");
            ctx.api.action(ObjectKind::SecurityGroup, id, Action::CommitRules)?;
        }
        common::apply_access(ctx, ObjectKind::SecurityGroup, id, &n.access, Some(&o.access))
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, _spec: &Spec) -> Result<()> {
        ctx.api.delete(ObjectKind::SecurityGroup, id)?;
        Ok(())
    }
}
