//! OF-032: ACL rule strings and their 64-bit encodings.
//!
//! A rule is `USER RESOURCE RIGHTS [ZONE]`, e.g. `@1 VM+NET/* USE+MANAGE #0`.
//! Each component encodes to a mask: an id-spec (`#id`, `@gid`, `%cid`,
//! `*`) in the low 36 bits, resource types above that, rights as low bits.

use crate::error::{Error, Result};

pub const INDIVIDUAL_ID: u64 = 0x0000_0001_0000_0000;
pub const GROUP_ID: u64 = 0x0000_0002_0000_0000;
pub const ALL_ID: u64 = 0x0000_0004_0000_0000;
pub const CLUSTER_ID: u64 = 0x0000_0008_0000_0000;

const ID_MASK: u64 = 0x0000_0000_FFFF_FFFF;
const SPEC_MASK: u64 = INDIVIDUAL_ID | GROUP_ID | ALL_ID | CLUSTER_ID;

/// Resource type bits, in the order rule strings list them.
pub const RESOURCE_TYPES: &[(&str, u64)] = &[
    ("VM", 0x0000_0010_0000_0000),
    ("HOST", 0x0000_0020_0000_0000),
    ("NET", 0x0000_0040_0000_0000),
    ("IMAGE", 0x0000_0080_0000_0000),
    ("USER", 0x0000_0100_0000_0000),
    ("TEMPLATE", 0x0000_0200_0000_0000),
    ("GROUP", 0x0000_0400_0000_0000),
    ("DATASTORE", 0x0000_1000_0000_0000),
    ("CLUSTER", 0x0000_2000_0000_0000),
    ("DOCUMENT", 0x0000_4000_0000_0000),
    ("ZONE", 0x0000_8000_0000_0000),
    ("SECGROUP", 0x0001_0000_0000_0000),
    ("VDC", 0x0002_0000_0000_0000),
    ("VROUTER", 0x0004_0000_0000_0000),
    ("MARKETPLACE", 0x0008_0000_0000_0000),
    ("MARKETPLACEAPP", 0x0010_0000_0000_0000),
    ("VMGROUP", 0x0020_0000_0000_0000),
    ("VNTEMPLATE", 0x0040_0000_0000_0000),
    ("BACKUPJOB", 0x0100_0000_0000_0000),
];

pub const RIGHTS: &[(&str, u64)] = &[("USE", 0x1), ("MANAGE", 0x2), ("ADMIN", 0x4), ("CREATE", 0x8)];

fn acl_error(field: &str, message: String) -> Error {
    Error::validation(format!("acl {}", field), message)
}

/// Parse an id-spec: `#5`, `@1`, `%100` or `*`.
fn parse_id_spec(field: &str, s: &str) -> Result<u64> {
    let s = s.trim();
    if s == "*" {
        return Ok(ALL_ID);
    }
    let mut chars = s.chars();
    let prefix = match chars.next() {
        Some('#') => INDIVIDUAL_ID,
        Some('@') => GROUP_ID,
        Some('%') => CLUSTER_ID,
        _ => {
            return Err(acl_error(
                field,
                format!("\"{}\" must be #id, @gid, %cid or *", s),
            ))
        }
    };
    let id: u32 = chars
        .as_str()
        .parse()
        .map_err(|_| acl_error(field, format!("\"{}\" has a non-numeric id", s)))?;
    Ok(prefix | u64::from(id))
}

fn format_id_spec(field: &str, mask: u64) -> Result<String> {
    let id = mask & ID_MASK;
    match mask & SPEC_MASK {
        ALL_ID => Ok("*".to_string()),
        INDIVIDUAL_ID => Ok(format!("#{}", id)),
        GROUP_ID => Ok(format!("@{}", id)),
        CLUSTER_ID => Ok(format!("%{}", id)),
        _ => Err(acl_error(field, format!("{:#x} has no id-spec", mask))),
    }
}

/// Encode the user component.
pub fn parse_users(s: &str) -> Result<u64> {
    parse_id_spec("user", s)
}

pub fn format_users(mask: u64) -> Result<String> {
    format_id_spec("user", mask)
}

/// Encode the resource component, `TYPE[+TYPE...]/<id-spec>`.
pub fn parse_resources(s: &str) -> Result<u64> {
    let (types, spec) = s
        .trim()
        .split_once('/')
        .ok_or_else(|| acl_error("resource", format!("\"{}\" lacks a /<id-spec>", s)))?;
    let mut mask = 0u64;
    for name in types.split('+') {
        let name = name.trim().to_uppercase();
        let bit = RESOURCE_TYPES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, b)| *b)
            .ok_or_else(|| acl_error("resource", format!("unknown resource type \"{}\"", name)))?;
        mask |= bit;
    }
    Ok(mask | parse_id_spec("resource", spec)?)
}

pub fn format_resources(mask: u64) -> Result<String> {
    let types: Vec<&str> = RESOURCE_TYPES
        .iter()
        .filter(|(_, bit)| mask & bit != 0)
        .map(|(name, _)| *name)
        .collect();
    if types.is_empty() {
        return Err(acl_error("resource", format!("{:#x} names no resource type", mask)));
    }
    Ok(format!(
        "{}/{}",
        types.join("+"),
        format_id_spec("resource", mask & (SPEC_MASK | ID_MASK))?
    ))
}

/// Encode the rights component, `RIGHT[+RIGHT...]`.
pub fn parse_rights(s: &str) -> Result<u64> {
    let mut mask = 0u64;
    for name in s.trim().split('+') {
        let name = name.trim().to_uppercase();
        let bit = RIGHTS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, b)| *b)
            .ok_or_else(|| acl_error("rights", format!("unknown right \"{}\"", name)))?;
        mask |= bit;
    }
    Ok(mask)
}

pub fn format_rights(mask: u64) -> Result<String> {
    let names: Vec<&str> = RIGHTS
        .iter()
        .filter(|(_, bit)| mask & bit != 0)
        .map(|(name, _)| *name)
        .collect();
    if names.is_empty() {
        return Err(acl_error("rights", format!("{:#x} grants nothing", mask)));
    }
    Ok(names.join("+"))
}

pub fn parse_zone(s: &str) -> Result<u64> {
    let spec = parse_id_spec("zone", s)?;
    if spec & (GROUP_ID | CLUSTER_ID) != 0 {
        return Err(acl_error("zone", format!("\"{}\" must be #id or *", s)));
    }
    Ok(spec)
}

pub fn format_zone(mask: u64) -> Result<String> {
    format_id_spec("zone", mask)
}
