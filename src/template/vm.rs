//! OF-024: VM template generation and flattening.
//!
//! Shared by the `template` and `virtual_machine` resources. The shape owns
//! a fixed set of keys ([`MANAGED_KEYS`]); everything else in the remote
//! template is left alone.

use super::{respell, DynTemplate, Vector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Template keys generated from a [`VmShape`].
pub const MANAGED_KEYS: &[&str] = &[
    "CPU",
    "VCPU",
    "MEMORY",
    "DISK",
    "NIC",
    "CONTEXT",
    "GRAPHICS",
    "OS",
    "SCHED_REQUIREMENTS",
    "SCHED_DS_REQUIREMENTS",
    "DESCRIPTION",
    "USER_INPUTS",
];

/// Spec attributes a [`VmShape`] reads.
pub const SHAPE_KEYS: &[&str] = &[
    "cpu",
    "vcpu",
    "memory",
    "disks",
    "nics",
    "context",
    "graphics",
    "os",
    "sched_requirements",
    "sched_ds_requirements",
    "description",
    "user_inputs",
];

const GRAPHICS_TYPES: &[&str] = &["VNC", "SPICE", "SDL"];

/// Compute and device layout of a VM or VM template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmShape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpu: Option<u32>,
    /// Memory in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<NicSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graphics: Option<GraphicsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sched_requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sched_ds_requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<u32>,
    /// Size in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Volatile disk type (`fs` or `swap`)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub volatile_type: Option<String>,
    #[serde(default, rename = "format", skip_serializing_if = "Option::is_none")]
    pub volatile_format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NicSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtio_queues: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphicsSpec {
    #[serde(rename = "type")]
    pub graphics_type: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keymap: Option<String>,
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OsSpec {
    pub arch: String,
    #[serde(default)]
    pub boot: String,
}

impl DiskSpec {
    pub fn to_vector(&self) -> Vector {
        let mut v = Vector::new("DISK");
        if let Some(id) = self.image_id {
            v.add_pair("IMAGE_ID", id);
        }
        if let Some(size) = self.size {
            v.add_pair("SIZE", size);
        }
        if let Some(ref target) = self.target {
            v.add_pair("TARGET", target);
        }
        if let Some(ref driver) = self.driver {
            v.add_pair("DRIVER", driver);
        }
        if let Some(ref t) = self.volatile_type {
            v.add_pair("TYPE", t);
        }
        if let Some(ref f) = self.volatile_format {
            v.add_pair("FORMAT", f);
        }
        v
    }

    pub fn from_vector(v: &Vector) -> Self {
        Self {
            image_id: v.get_parsed("IMAGE_ID"),
            size: v.get_parsed("SIZE"),
            target: v.get_str("TARGET").map(str::to_string),
            driver: v.get_str("DRIVER").map(str::to_string),
            volatile_type: v.get_str("TYPE").map(str::to_string),
            volatile_format: v.get_str("FORMAT").map(str::to_string),
        }
    }
}

impl NicSpec {
    pub fn to_vector(&self) -> Vector {
        let mut v = Vector::new("NIC");
        if let Some(id) = self.network_id {
            v.add_pair("NETWORK_ID", id);
        }
        if let Some(ref ip) = self.ip {
            v.add_pair("IP", ip);
        }
        if let Some(ref mac) = self.mac {
            v.add_pair("MAC", mac);
        }
        if let Some(ref model) = self.model {
            v.add_pair("MODEL", model);
        }
        if let Some(q) = self.virtio_queues {
            v.add_pair("VIRTIO_QUEUES", q);
        }
        if !self.security_groups.is_empty() {
            let ids: Vec<String> = self.security_groups.iter().map(u32::to_string).collect();
            v.add_pair("SECURITY_GROUPS", ids.join(","));
        }
        v
    }

    pub fn from_vector(v: &Vector) -> Self {
        Self {
            network_id: v.get_parsed("NETWORK_ID"),
            ip: v.get_str("IP").map(str::to_string),
            mac: v.get_str("MAC").map(str::to_string),
            model: v.get_str("MODEL").map(str::to_string),
            virtio_queues: v.get_parsed("VIRTIO_QUEUES"),
            security_groups: v
                .get_str("SECURITY_GROUPS")
                .map(|s| s.split(',').filter_map(|x| x.trim().parse().ok()).collect())
                .unwrap_or_default(),
        }
    }
}

impl VmShape {
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.cpu.is_some_and(|cpu| cpu <= 0.0) {
            problems.push("cpu must be greater than 0".to_string());
        }
        if self.vcpu == Some(0) {
            problems.push("vcpu must be greater than 0".to_string());
        }
        if self.memory == Some(0) {
            problems.push("memory must be greater than 0".to_string());
        }
        for (i, disk) in self.disks.iter().enumerate() {
            if disk.image_id.is_none() && disk.size.is_none() {
                problems.push(format!("disks[{}]: image_id or size is required", i));
            }
            if let Some(ref t) = disk.volatile_type {
                if disk.image_id.is_some() || !matches!(t.as_str(), "fs" | "swap") {
                    problems.push(format!("disks[{}]: type must be fs or swap on a volatile disk", i));
                }
            }
        }
        if let Some(ref g) = self.graphics {
            if !GRAPHICS_TYPES.contains(&g.graphics_type.to_uppercase().as_str()) {
                problems.push(format!(
                    "graphics type \"{}\" (expected one of {})",
                    g.graphics_type,
                    GRAPHICS_TYPES.join(", ")
                ));
            }
        }
        problems
    }

    /// Re-key `context` and `user_inputs` with the declared spelling.
    pub fn respelled(mut self, declared: &VmShape) -> Self {
        self.context = respell(self.context, &declared.context);
        self.user_inputs = respell(self.user_inputs, &declared.user_inputs);
        self
    }
}

fn map_vector(key: &str, map: &BTreeMap<String, String>) -> Vector {
    let mut v = Vector::new(key);
    for (k, val) in map {
        v.add_pair(k, val);
    }
    v
}

fn vector_map(v: &Vector) -> BTreeMap<String, String> {
    v.pairs
        .iter()
        .map(|p| (p.key.clone(), p.value.clone()))
        .collect()
}

/// Append the shape's keys to `template`.
pub fn append(template: &mut DynTemplate, shape: &VmShape) {
    if let Some(cpu) = shape.cpu {
        template.add_pair("CPU", cpu);
    }
    if let Some(vcpu) = shape.vcpu {
        template.add_pair("VCPU", vcpu);
    }
    if let Some(memory) = shape.memory {
        template.add_pair("MEMORY", memory);
    }
    for disk in &shape.disks {
        template.add_vector(disk.to_vector());
    }
    for nic in &shape.nics {
        template.add_vector(nic.to_vector());
    }
    if !shape.context.is_empty() {
        template.add_vector(map_vector("CONTEXT", &shape.context));
    }
    if let Some(ref g) = shape.graphics {
        let mut v = Vector::new("GRAPHICS")
            .with("TYPE", &g.graphics_type)
            .with("LISTEN", &g.listen);
        if let Some(ref port) = g.port {
            v.add_pair("PORT", port);
        }
        if let Some(ref keymap) = g.keymap {
            v.add_pair("KEYMAP", keymap);
        }
        template.add_vector(v);
    }
    if let Some(ref os) = shape.os {
        template.add_vector(Vector::new("OS").with("ARCH", &os.arch).with("BOOT", &os.boot));
    }
    if let Some(ref req) = shape.sched_requirements {
        template.add_pair("SCHED_REQUIREMENTS", req);
    }
    if let Some(ref req) = shape.sched_ds_requirements {
        template.add_pair("SCHED_DS_REQUIREMENTS", req);
    }
    if let Some(ref desc) = shape.description {
        template.add_pair("DESCRIPTION", desc);
    }
    if !shape.user_inputs.is_empty() {
        template.add_vector(map_vector("USER_INPUTS", &shape.user_inputs));
    }
}

/// Build a fresh template from a shape.
pub fn generate(shape: &VmShape) -> DynTemplate {
    let mut template = DynTemplate::new();
    append(&mut template, shape);
    template
}

/// Drop every managed key, then re-add them from `shape`.
pub fn replace_managed(template: &mut DynTemplate, shape: &VmShape) {
    for key in MANAGED_KEYS {
        template.del(key);
    }
    append(template, shape);
}

/// Read the managed keys back out of a template.
pub fn flatten(template: &DynTemplate) -> VmShape {
    VmShape {
        cpu: template.get_parsed("CPU"),
        vcpu: template.get_parsed("VCPU"),
        memory: template.get_parsed("MEMORY"),
        disks: template.vectors("DISK").map(DiskSpec::from_vector).collect(),
        nics: template.vectors("NIC").map(NicSpec::from_vector).collect(),
        context: template.get_vector("CONTEXT").map(vector_map).unwrap_or_default(),
        graphics: template.get_vector("GRAPHICS").map(|v| GraphicsSpec {
            graphics_type: v.get_str("TYPE").unwrap_or_default().to_string(),
            listen: v.get_str("LISTEN").map(str::to_string).unwrap_or_else(default_listen),
            port: v.get_str("PORT").map(str::to_string),
            keymap: v.get_str("KEYMAP").map(str::to_string),
        }),
        os: template.get_vector("OS").map(|v| OsSpec {
            arch: v.get_str("ARCH").unwrap_or_default().to_string(),
            boot: v.get_str("BOOT").unwrap_or_default().to_string(),
        }),
        sched_requirements: template.get_str("SCHED_REQUIREMENTS").map(str::to_string),
        sched_ds_requirements: template.get_str("SCHED_DS_REQUIREMENTS").map(str::to_string),
        description: template.get_str("DESCRIPTION").map(str::to_string),
        user_inputs: template
            .get_vector("USER_INPUTS")
            .map(vector_map)
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse;

    fn shape() -> VmShape {
        VmShape {
            cpu: Some(0.5),
            vcpu: Some(2),
            memory: Some(1024),
            disks: vec![DiskSpec {
                image_id: Some(3),
                target: Some("vda".to_string()),
                ..Default::default()
            }],
            nics: vec![NicSpec {
                network_id: Some(1),
                model: Some("virtio".to_string()),
                security_groups: vec![0, 100],
                ..Default::default()
            }],
            context: BTreeMap::from([("NETWORK".to_string(), "YES".to_string())]),
            graphics: Some(GraphicsSpec {
                graphics_type: "VNC".to_string(),
                listen: default_listen(),
                port: None,
                keymap: Some("en-us".to_string()),
            }),
            os: Some(OsSpec {
                arch: "x86_64".to_string(),
                boot: "disk0".to_string(),
            }),
            sched_requirements: Some("FREE_CPU > 60".to_string()),
            sched_ds_requirements: None,
            description: Some("web tier".to_string()),
            user_inputs: BTreeMap::new(),
        }
    }

    #[test]
    fn test_of024_generate_keys() {
        let t = generate(&shape());
        assert_eq!(t.get_str("CPU"), Some("0.5"));
        assert_eq!(t.get_str("MEMORY"), Some("1024"));
        assert_eq!(t.get_vector("DISK").unwrap().get_str("TARGET"), Some("vda"));
        assert_eq!(
            t.get_vector("NIC").unwrap().get_str("SECURITY_GROUPS"),
            Some("0,100")
        );
        assert_eq!(t.get_vector("GRAPHICS").unwrap().get_str("LISTEN"), Some("0.0.0.0"));
        assert!(!t.contains_key("USER_INPUTS"));
    }

    #[test]
    fn test_of024_flatten_inverts_generate_through_text() {
        let original = shape();
        let text = generate(&original).render();
        let back = flatten(&parse(&text).unwrap());
        assert_eq!(back, original);
    }

    #[test]
    fn test_of024_replace_managed_keeps_other_keys() {
        let mut t = parse("NAME=\"tpl\"\nCPU=\"4\"\nDISK=[ IMAGE_ID=\"9\" ]\nLOGO=\"images/logos/ubuntu.png\"").unwrap();
        let s = VmShape {
            cpu: Some(1.0),
            memory: Some(512),
            ..Default::default()
        };
        replace_managed(&mut t, &s);
        assert_eq!(t.get_str("NAME"), Some("tpl"));
        assert_eq!(t.get_str("LOGO"), Some("images/logos/ubuntu.png"));
        assert_eq!(t.get_str("CPU"), Some("1"));
        assert_eq!(t.get_str("MEMORY"), Some("512"));
        assert!(!t.contains_key("DISK"));
    }

    #[test]
    fn test_of024_shape_problems() {
        assert!(shape().problems().is_empty());
        let bad = VmShape {
            cpu: Some(0.0),
            memory: Some(0),
            disks: vec![
                DiskSpec::default(),
                DiskSpec {
                    size: Some(1024),
                    volatile_type: Some("raw".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(bad.problems().len(), 4, "{:?}", bad.problems());
    }

    #[test]
    fn test_of024_context_keys_keep_declared_spelling() {
        let declared = VmShape {
            context: BTreeMap::from([("ssh_public_key".to_string(), "k".to_string())]),
            ..Default::default()
        };
        let t = generate(&declared);
        let back = flatten(&t).respelled(&declared);
        assert_eq!(back.context, declared.context);
    }
}
