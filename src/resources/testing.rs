//! Fixtures shared by the handler tests.

use super::Context;
use crate::api::memory::MemoryCloud;
use crate::api::{AllocateRequest, CloudApi, ObjectKind};
use crate::config::ProviderConfig;
use crate::core::types::Spec;
use crate::core::wait::Poll;

pub fn spec(yaml: &str) -> Spec {
    serde_yaml_ng::from_str(yaml).unwrap()
}

pub fn ctx<'a>(cloud: &'a MemoryCloud, config: &'a ProviderConfig) -> Context<'a> {
    Context::new(cloud, config).unwrap().with_poll(Poll::immediate())
}

pub fn allocate(cloud: &MemoryCloud, kind: ObjectKind, template: &str) -> u32 {
    cloud
        .allocate(
            kind,
            AllocateRequest::Template {
                template: template.to_string(),
                cluster_id: None,
                datastore_id: None,
            },
        )
        .unwrap()
}

pub fn named(cloud: &MemoryCloud, kind: ObjectKind, name: &str) -> u32 {
    cloud
        .allocate(kind, AllocateRequest::Named { name: name.to_string() })
        .unwrap()
}

pub fn host(cloud: &MemoryCloud, name: &str) -> u32 {
    let id = cloud
        .allocate(
            ObjectKind::Host,
            AllocateRequest::Host {
                name: name.to_string(),
                im_mad: "kvm".to_string(),
                vm_mad: "kvm".to_string(),
                cluster_id: None,
            },
        )
        .unwrap();
    cloud.info(ObjectKind::Host, id).unwrap();
    id
}

/// An image datastore with a READY image in it.
pub fn image(cloud: &MemoryCloud, name: &str) -> u32 {
    let ds = allocate(
        cloud,
        ObjectKind::Datastore,
        &format!("NAME=\"{}-ds\"\nTYPE=\"IMAGE_DS\"", name),
    );
    let id = cloud
        .allocate(
            ObjectKind::Image,
            AllocateRequest::Template {
                template: format!("NAME=\"{}\"\nSIZE=\"128\"", name),
                cluster_id: None,
                datastore_id: Some(ds),
            },
        )
        .unwrap();
    cloud.info(ObjectKind::Image, id).unwrap();
    id
}
