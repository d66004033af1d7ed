//! Marketplace resource.
//!
//! Exactly one backend block (`one`, `http`, `s3`, `lxc`, `dockerhub`)
//! selects the MARKET_MAD driver and the template keys it accepts.
//! Enabling and disabling are asynchronous and awaited.

use super::common::{self, Access, Labels, LABEL_KEYS, OWNER_KEYS};
use super::{Context, ResourceHandler};
use crate::api::{Action, AllocateRequest, MarketplaceState, ObjectKind};
use crate::config::Operation;
use crate::core::types::{yaml_value_to_string, Attributes, ResourceKind, Spec};
use crate::core::wait;
use crate::error::{Error, Result};
use crate::template::DynTemplate;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml_ng::Value;

const KEYS: &[&str] = &["name", "description", "disabled", "one", "http", "s3", "lxc", "dockerhub"];

/// A backend block, keyed by attribute name.
type Block = IndexMap<String, Value>;

struct Backend {
    block: &'static str,
    mad: &'static str,
    /// (attribute, template key)
    fields: &'static [(&'static str, &'static str)],
    required: &'static [&'static str],
}

const BACKENDS: &[Backend] = &[
    Backend {
        block: "one",
        mad: "one",
        fields: &[("endpoint_url", "ENDPOINT")],
        required: &[],
    },
    Backend {
        block: "http",
        mad: "http",
        fields: &[
            ("endpoint_url", "BASE_URL"),
            ("storage_path", "PUBLIC_DIR"),
            ("bridge_list", "BRIDGE_LIST"),
        ],
        required: &["endpoint_url", "storage_path"],
    },
    Backend {
        block: "s3",
        mad: "s3",
        fields: &[
            ("access_key_id", "ACCESS_KEY_ID"),
            ("secret_access_key", "SECRET_ACCESS_KEY"),
            ("bucket", "BUCKET"),
            ("region", "REGION"),
            ("endpoint_url", "ENDPOINT"),
            ("signature_version", "SIGNATURE_VERSION"),
            ("force_path_style", "FORCE_PATH_STYLE"),
            ("total_size", "TOTAL_MB"),
            ("read_block_length", "READ_LENGTH"),
        ],
        required: &["access_key_id", "secret_access_key", "bucket", "region"],
    },
    Backend {
        block: "lxc",
        mad: "linuxcontainers",
        fields: &[
            ("endpoint_url", "ENDPOINT"),
            ("image_block_file_size", "IMAGE_SIZE_MB"),
            ("filesystem", "FILESYSTEM"),
            ("format", "FORMAT"),
            ("skip_untested", "SKIP_UNTESTED"),
            ("cpu", "CPU"),
            ("vcpu", "VCPU"),
            ("memory", "MEMORY"),
            ("privileged", "PRIVILEGED"),
        ],
        required: &[],
    },
    Backend {
        block: "dockerhub",
        mad: "dockerhub",
        fields: &[],
        required: &[],
    },
];

/// Every template key some backend owns.
fn backend_keys() -> impl Iterator<Item = &'static str> {
    std::iter::once("MARKET_MAD").chain(BACKENDS.iter().flat_map(|b| b.fields.iter().map(|(_, key)| *key)))
}

#[derive(Debug, Clone, Deserialize)]
struct MarketplaceSpec {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    one: Option<Block>,
    #[serde(default)]
    http: Option<Block>,
    #[serde(default)]
    s3: Option<Block>,
    #[serde(default)]
    lxc: Option<Block>,
    #[serde(default)]
    dockerhub: Option<Block>,
    #[serde(flatten)]
    access: Access,
    #[serde(flatten)]
    labels: Labels,
}

impl MarketplaceSpec {
    fn declared(&self) -> Vec<(&'static Backend, &Block)> {
        let blocks = [&self.one, &self.http, &self.s3, &self.lxc, &self.dockerhub];
        BACKENDS
            .iter()
            .zip(blocks)
            .filter_map(|(backend, block)| block.as_ref().map(|b| (backend, b)))
            .collect()
    }

    fn declared_blocks(&self) -> Vec<(&'static str, &Block)> {
        self.declared().into_iter().map(|(b, block)| (b.block, block)).collect()
    }

    fn backend(&self) -> Result<(&'static Backend, &Block)> {
        match self.declared().as_slice() {
            [one] => Ok(*one),
            _ => Err(Error::validation(
                "marketplace",
                "exactly one of one, http, s3, lxc or dockerhub is required",
            )),
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = self.access.problems();
        let declared = self.declared();
        if declared.len() != 1 {
            problems.push(format!(
                "exactly one of one, http, s3, lxc or dockerhub is required, got {}",
                declared.len()
            ));
        }
        for (backend, block) in declared {
            for (key, value) in block {
                if !backend.fields.iter().any(|(attr, _)| attr == key) {
                    problems.push(format!("{}: unknown attribute '{}'", backend.block, key));
                } else if matches!(value, Value::Mapping(_) | Value::Sequence(_)) {
                    problems.push(format!("{}.{} must be a scalar", backend.block, key));
                }
            }
            for required in backend.required {
                if !block.contains_key(*required) {
                    problems.push(format!("{}.{} is required", backend.block, required));
                }
            }
        }
        problems
    }

    /// Replace every backend key with the declared backend's.
    fn write_backend(&self, template: &mut DynTemplate) -> Result<()> {
        let (backend, block) = self.backend()?;
        for key in backend_keys() {
            template.del(key);
        }
        template.add_pair("MARKET_MAD", backend.mad);
        for (attr, key) in backend.fields {
            if let Some(value) = block.get(*attr) {
                template.add_pair(key, yaml_value_to_string(value));
            }
        }
        Ok(())
    }
}

pub struct MarketplaceHandler;

impl MarketplaceHandler {
    fn set_enabled(&self, ctx: &Context<'_>, id: u32, enabled: bool, timeout: std::time::Duration) -> Result<()> {
        tracing::info!(id, enabled, "switching marketplace");
        ctx.api.action(ObjectKind::Marketplace, id, Action::Enable(enabled))?;
        wait::wait_for_marketplace_state(ctx.api, id, ctx.poll, timeout, enabled)?;
        Ok(())
    }
}

impl ResourceHandler for MarketplaceHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Marketplace
    }

    fn validate(&self, spec: &Spec) -> Vec<String> {
        common::check::<MarketplaceSpec, _>(spec, &[KEYS, OWNER_KEYS, LABEL_KEYS], MarketplaceSpec::problems)
    }

    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32> {
        let s: MarketplaceSpec = common::decode(spec)?;
        let mut template = DynTemplate::new();
        template.add_pair("NAME", &s.name);
        if let Some(ref description) = s.description {
            template.add_pair("DESCRIPTION", description);
        }
        s.write_backend(&mut template)?;
        s.labels.add_to(ctx, &mut template);

        let id = ctx.api.allocate(
            ObjectKind::Marketplace,
            AllocateRequest::Template {
                template: template.render(),
                cluster_id: None,
                datastore_id: None,
            },
        )?;
        tracing::info!(id, name = %s.name, "marketplace allocated");
        Ok(id)
    }

    fn configure(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()> {
        let s: MarketplaceSpec = common::decode(spec)?;
        common::apply_access(ctx, ObjectKind::Marketplace, id, &s.access, None)?;
        if s.disabled {
            self.set_enabled(ctx, id, false, ctx.timeout(spec, Operation::Create)?)?;
        }
        Ok(())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes> {
        let s: MarketplaceSpec = common::decode(spec)?;
        let object = ctx.api.info(ObjectKind::Marketplace, id)?;
        let template = common::template_of(&object)?;

        let mut attrs = common::base_attributes(&object);
        common::ownership_attributes(&object, &mut attrs);
        if let Some(description) = template.get_str("DESCRIPTION") {
            common::put(&mut attrs, "description", description);
        }
        let disabled = object.state == MarketplaceState::Disabled.code();
        common::put(&mut attrs, "disabled", disabled);

        let mad = template.get_str("MARKET_MAD").or(object.attr("MARKET_MAD"));
        if let Some(backend) = BACKENDS.iter().find(|b| Some(b.mad) == mad) {
            let mut block = Block::new();
            for (attr, key) in backend.fields {
                if let Some(value) = template.get_str(key) {
                    block.insert(attr.to_string(), Value::from(value));
                }
            }
            common::put_value(&mut attrs, backend.block, &block)?;
        }
        s.labels.read_into(ctx, &template, &mut attrs)?;
        Ok(attrs)
    }

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()> {
        let o: MarketplaceSpec = common::decode(old)?;
        let n: MarketplaceSpec = common::decode(new)?;
        common::rename_if_changed(ctx, ObjectKind::Marketplace, id, &o.name, &n.name)?;

        let backend_changed = o.declared_blocks() != n.declared_blocks();
        let mut written = Ok(());
        common::update_template(ctx, ObjectKind::Marketplace, id, |tpl| {
            if backend_changed {
                written = n.write_backend(tpl);
            }
            common::set_if_changed(tpl, "DESCRIPTION", o.description.as_ref(), n.description.as_ref());
            n.labels.reconcile(ctx, &o.labels, tpl);
        })?;
        written?;

        if o.disabled != n.disabled {
            self.set_enabled(ctx, id, !n.disabled, ctx.timeout(new, Operation::Update)?)?;
        }
        common::apply_access(ctx, ObjectKind::Marketplace, id, &n.access, Some(&o.access))
    }

    fn delete(&self, ctx: &Context<'_>, id: u32, _spec: &Spec) -> Result<()> {
        ctx.api.delete(ObjectKind::Marketplace, id)?;
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

    const HTTP: &str = "name: files
http:
  endpoint_url: http://files.example
  storage_path: /var/local/market-http
";

    #[test]
    fn test_of057_create_http_backend() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let s = spec(HTTP);
        assert!(MarketplaceHandler.validate(&s).is_empty());
        let id = MarketplaceHandler.create(&ctx, &s).unwrap();
        MarketplaceHandler.configure(&ctx, id, &s).unwrap();

        let obj = cloud.info(ObjectKind::Marketplace, id).unwrap();
        assert_eq!(obj.attr("MARKET_MAD"), Some("http"));
        let tpl = common::template_of(&obj).unwrap();
        assert_eq!(tpl.get_str("BASE_URL"), Some("http://files.example"));

        let attrs = MarketplaceHandler.read(&ctx, id, &s).unwrap();
        assert_eq!(attrs["http"]["storage_path"], "/var/local/market-http");
        assert_eq!(attrs["disabled"].as_bool(), Some(false));
        assert!(crate::core::refresh::detect_drift("m", ResourceKind::Marketplace, &s, &attrs).is_empty());
    }

    #[test]
    fn test_of057_disable_waits() {
        let cloud = MemoryCloud::with_settle_polls(3);
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let s = spec("name: hub\ndockerhub: {}\ndisabled: true\n");
        let id = MarketplaceHandler.create(&ctx, &s).unwrap();
        MarketplaceHandler.configure(&ctx, id, &s).unwrap();
        let obj = cloud.info(ObjectKind::Marketplace, id).unwrap();
        assert_eq!(obj.state, MarketplaceState::Disabled.code());

        let enabled = spec("name: hub\ndockerhub: {}\n");
        MarketplaceHandler.update(&ctx, id, &s, &enabled).unwrap();
        let obj = cloud.info(ObjectKind::Marketplace, id).unwrap();
        assert_eq!(obj.state, MarketplaceState::Enabled.code());
    }

    #[test]
    fn test_of057_switch_backend_in_place() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = ctx(&cloud, &config);
        let old = spec(HTTP);
        let id = MarketplaceHandler.create(&ctx, &old).unwrap();
        let new = spec("name: files\ns3:\n  access_key_id: AK\n  secret_access_key: SK\n  bucket: market\n  region: eu-west-1\n  total_size: 10240\n");
        MarketplaceHandler.update(&ctx, id, &old, &new).unwrap();

        let tpl = common::template_of(&cloud.info(ObjectKind::Marketplace, id).unwrap()).unwrap();
        assert_eq!(tpl.get_str("MARKET_MAD"), Some("s3"));
        assert_eq!(tpl.get_str("TOTAL_MB"), Some("10240"));
        assert!(!tpl.contains_key("BASE_URL"));
    }

    #[test]
    fn test_of057_exactly_one_backend() {
        let none = MarketplaceHandler.validate(&spec("name: m\n"));
        assert_eq!(none.len(), 1, "{:?}", none);
        let two = MarketplaceHandler.validate(&spec("name: m\none: {}\ndockerhub: {}\n"));
        assert_eq!(two.len(), 1, "{:?}", two);
        let incomplete = MarketplaceHandler.validate(&spec("name: m\ns3: { bucket: b, colour: red }\n"));
        assert_eq!(incomplete.len(), 4, "{:?}", incomplete);
    }
}
