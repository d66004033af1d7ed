//! Resource handlers — CRUD callbacks for each resource kind.
//!
//! Each handler:
//! 1. validates a spec (enum values, octal permissions, exclusive blocks)
//! 2. allocates the remote object, then waits for it to settle
//! 3. configures what can only be set once the object exists (ownership,
//!    membership, locks)
//! 4. reads attributes back, updates in place by diff, and deletes

pub mod acl;
pub mod cluster;
pub mod common;
pub mod datastore;
pub mod group_quotas;
pub mod host;
pub mod image;
pub mod marketplace;
pub mod security_group;
#[cfg(test)]
pub(crate) mod testing;
pub mod vdc;
pub mod virtual_machine;
pub mod virtual_router;
pub mod vm_group;
pub mod vm_template;

use crate::api::CloudApi;
use crate::config::{parse_duration, Operation, ProviderConfig};
use crate::core::types::{Attributes, ResourceKind, Spec};
use crate::core::wait::Poll;
use crate::error::Result;
use std::time::Duration;

/// Spec keys every kind accepts that are not remote attributes.
pub const META_KEYS: &[&str] = &["timeouts"];

/// Shared handle passed to every callback.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub api: &'a dyn CloudApi,
    pub config: &'a ProviderConfig,
    pub poll: Poll,
}

impl<'a> Context<'a> {
    pub fn new(api: &'a dyn CloudApi, config: &'a ProviderConfig) -> Result<Self> {
        Ok(Self {
            api,
            config,
            poll: Poll::from_config(config)?,
        })
    }

    pub fn with_poll(mut self, poll: Poll) -> Self {
        self.poll = poll;
        self
    }

    /// Timeout for `op`: the spec's `timeouts` block wins over the provider.
    pub fn timeout(&self, spec: &Spec, op: Operation) -> Result<Duration> {
        let declared = spec
            .get("timeouts")
            .and_then(|t| t.get(op.key()))
            .and_then(|v| v.as_str());
        match declared {
            Some(text) => parse_duration(text),
            None => self.config.timeout(op),
        }
    }
}

/// CRUD callbacks for one resource kind.
pub trait ResourceHandler: Sync {
    fn kind(&self) -> ResourceKind;

    /// Attributes whose change forces a replacement.
    fn force_new(&self) -> &'static [&'static str] {
        &[]
    }

    /// Problems with a spec; empty when valid.
    fn validate(&self, spec: &Spec) -> Vec<String>;

    /// Allocate the remote object. Nothing may fail after the allocation
    /// succeeds, so the caller always learns the new id.
    fn create(&self, ctx: &Context<'_>, spec: &Spec) -> Result<u32>;

    /// Wait until a freshly allocated object is usable.
    fn wait_created(&self, _ctx: &Context<'_>, _id: u32, _spec: &Spec) -> Result<()> {
        Ok(())
    }

    /// Post-allocation settings. A failure here leaves the object tainted.
    fn configure(&self, _ctx: &Context<'_>, _id: u32, _spec: &Spec) -> Result<()> {
        Ok(())
    }

    fn read(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<Attributes>;

    fn update(&self, ctx: &Context<'_>, id: u32, old: &Spec, new: &Spec) -> Result<()>;

    fn delete(&self, ctx: &Context<'_>, id: u32, spec: &Spec) -> Result<()>;
}

/// The handler for a kind.
pub fn handler(kind: ResourceKind) -> &'static dyn ResourceHandler {
    match kind {
        ResourceKind::Cluster => &cluster::ClusterHandler,
        ResourceKind::Datastore => &datastore::DatastoreHandler,
        ResourceKind::Host => &host::HostHandler,
        ResourceKind::Image => &image::ImageHandler,
        ResourceKind::Template => &vm_template::TemplateHandler,
        ResourceKind::VirtualMachine => &virtual_machine::VirtualMachineHandler,
        ResourceKind::SecurityGroup => &security_group::SecurityGroupHandler,
        ResourceKind::Marketplace => &marketplace::MarketplaceHandler,
        ResourceKind::VirtualRouter => &virtual_router::VirtualRouterHandler,
        ResourceKind::GroupQuotas => &group_quotas::GroupQuotasHandler,
        ResourceKind::Acl => &acl::AclHandler,
        ResourceKind::Vdc => &vdc::VdcHandler,
        ResourceKind::VmGroup => &vm_group::VmGroupHandler,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryCloud;

    const ALL_KINDS: &[ResourceKind] = &[
        ResourceKind::Cluster,
        ResourceKind::Datastore,
        ResourceKind::Host,
        ResourceKind::Image,
        ResourceKind::Template,
        ResourceKind::VirtualMachine,
        ResourceKind::SecurityGroup,
        ResourceKind::Marketplace,
        ResourceKind::VirtualRouter,
        ResourceKind::GroupQuotas,
        ResourceKind::Acl,
        ResourceKind::Vdc,
        ResourceKind::VmGroup,
    ];

    #[test]
    fn test_of040_handler_kinds_match() {
        for kind in ALL_KINDS {
            assert_eq!(handler(*kind).kind(), *kind);
        }
    }

    #[test]
    fn test_of040_timeout_override() {
        let cloud = MemoryCloud::new();
        let config = ProviderConfig::default();
        let ctx = Context::new(&cloud, &config).unwrap();
        let spec: Spec = serde_yaml_ng::from_str("timeouts: { create: 90s }").unwrap();
        assert_eq!(ctx.timeout(&spec, Operation::Create).unwrap(), Duration::from_secs(90));
        assert_eq!(ctx.timeout(&spec, Operation::Delete).unwrap(), Duration::from_secs(300));
        let bad: Spec = serde_yaml_ng::from_str("timeouts: { update: soon }").unwrap();
        assert!(ctx.timeout(&bad, Operation::Update).is_err());
    }

    #[test]
    fn test_of040_unknown_attribute_rejected_everywhere() {
        let spec: Spec = serde_yaml_ng::from_str("bogus_attribute: 1").unwrap();
        for kind in ALL_KINDS {
            let problems = handler(*kind).validate(&spec);
            assert!(
                problems.iter().any(|p| p.contains("bogus_attribute")),
                "{} accepted an unknown attribute: {:?}",
                kind,
                problems
            );
        }
    }
}
