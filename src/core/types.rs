//! OF-001: Declaration, state lock, and plan types.
//!
//! Defines the YAML schema for declarations (resources, data sources, policy)
//! and state locks. All persisted types derive Serialize/Deserialize for YAML
//! roundtripping.

use crate::api::ObjectKind;
use crate::config::ProviderConfig;
use crate::template::tags::TagMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared attributes of one resource, in declaration order.
pub type Spec = IndexMap<String, serde_yaml_ng::Value>;

/// Attributes read back from the remote object.
pub type Attributes = IndexMap<String, serde_yaml_ng::Value>;

// ============================================================================
// Top-level declaration
// ============================================================================

/// Root document — the desired state of an OpenNebula deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Declaration {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Deployment name; also names the state lock
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Global parameters (referenced as `{{params.key}}`)
    #[serde(default)]
    pub params: IndexMap<String, serde_yaml_ng::Value>,

    /// Endpoint, credentials, timeouts
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Resource declarations (order-preserving)
    #[serde(default)]
    pub resources: IndexMap<String, ResourceDecl>,

    /// Read-only lookups of existing objects
    #[serde(default)]
    pub data: IndexMap<String, DataDecl>,

    #[serde(default)]
    pub policy: Policy,
}

// ============================================================================
// Resources
// ============================================================================

/// A single managed resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    #[serde(rename = "type")]
    pub kind: ResourceKind,

    /// Resources that must be applied first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// `present` (default) or `absent`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Kind-specific attributes
    #[serde(flatten)]
    pub spec: Spec,
}

impl ResourceDecl {
    pub fn is_absent(&self) -> bool {
        self.state.as_deref() == Some("absent")
    }
}

/// Resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cluster,
    Datastore,
    Host,
    Image,
    Template,
    VirtualMachine,
    SecurityGroup,
    Marketplace,
    VirtualRouter,
    GroupQuotas,
    Acl,
    Vdc,
    VmGroup,
}

impl ResourceKind {
    /// Remote object kind the resource manages.
    pub fn object_kind(self) -> ObjectKind {
        match self {
            Self::Cluster => ObjectKind::Cluster,
            Self::Datastore => ObjectKind::Datastore,
            Self::Host => ObjectKind::Host,
            Self::Image => ObjectKind::Image,
            Self::Template => ObjectKind::Template,
            Self::VirtualMachine => ObjectKind::VirtualMachine,
            Self::SecurityGroup => ObjectKind::SecurityGroup,
            Self::Marketplace => ObjectKind::Marketplace,
            Self::VirtualRouter => ObjectKind::VirtualRouter,
            Self::GroupQuotas => ObjectKind::Group,
            Self::Acl => ObjectKind::Acl,
            Self::Vdc => ObjectKind::Vdc,
            Self::VmGroup => ObjectKind::VmGroup,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cluster => "cluster",
            Self::Datastore => "datastore",
            Self::Host => "host",
            Self::Image => "image",
            Self::Template => "template",
            Self::VirtualMachine => "virtual_machine",
            Self::SecurityGroup => "security_group",
            Self::Marketplace => "marketplace",
            Self::VirtualRouter => "virtual_router",
            Self::GroupQuotas => "group_quotas",
            Self::Acl => "acl",
            Self::Vdc => "vdc",
            Self::VmGroup => "vm_group",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Data sources
// ============================================================================

/// Lookup of exactly one existing object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataDecl {
    #[serde(rename = "type")]
    pub kind: ObjectKind,

    #[serde(default)]
    pub id: Option<u32>,

    #[serde(default)]
    pub name: Option<String>,

    /// Every listed tag must match
    #[serde(default)]
    pub tags: TagMap,
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Read every locked resource before planning
    #[serde(default = "default_true")]
    pub refresh: bool,

    /// Persist the state lock after apply
    #[serde(default = "default_true")]
    pub lock_file: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            refresh: true,
            lock_file: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    StopOnFirst,
    /// Keep going, skipping resources that depend on a failed one
    ContinueIndependent,
}

// ============================================================================
// State / Lock file
// ============================================================================

/// Per-declaration state lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLock {
    pub schema: String,

    /// Declaration name
    pub name: String,

    /// RFC 3339 timestamp
    pub generated_at: String,

    pub generator: String,

    /// Per-resource state
    pub resources: IndexMap<String, ResourceLock>,
}

/// Per-resource lock entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    #[serde(rename = "type")]
    pub kind: ResourceKind,

    pub status: ResourceStatus,

    /// Remote object id, once allocated
    #[serde(default)]
    pub remote_id: Option<u32>,

    #[serde(default)]
    pub applied_at: Option<String>,

    #[serde(default)]
    pub duration_seconds: Option<f64>,

    /// BLAKE3 hash of the resolved spec
    #[serde(default)]
    pub hash: String,

    /// Explicit and reference-derived dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Resolved spec last applied
    #[serde(default)]
    pub spec: Spec,

    /// Attributes last read back
    #[serde(default)]
    pub attributes: Attributes,
}

/// Resource convergence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Converged,
    Failed,
    /// Allocated, but configuring it failed; replaced on the next apply
    Tainted,
    Drifted,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "CONVERGED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Tainted => write!(f, "TAINTED"),
            Self::Drifted => write!(f, "DRIFTED"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Replace,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Replace => write!(f, "REPLACE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub action: PlanAction,
    /// Attributes whose value changed
    pub changed: Vec<String>,
    pub description: String,
}

/// Full execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub name: String,

    /// Destroys first (reverse dependency order), then everything else in
    /// execution order
    pub changes: Vec<PlannedChange>,

    /// Topological execution order (resource IDs)
    pub execution_order: Vec<String>,

    pub to_create: u32,
    pub to_update: u32,
    pub to_replace: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

impl ExecutionPlan {
    pub fn has_changes(&self) -> bool {
        self.to_create + self.to_update + self.to_replace + self.to_destroy > 0
    }
}

// ============================================================================
// Apply result
// ============================================================================

/// A resource that failed to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFailure {
    pub resource_id: String,
    pub error: String,
}

/// Result of one apply or destroy run.
#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    pub name: String,
    pub created: u32,
    pub updated: u32,
    pub replaced: u32,
    pub destroyed: u32,
    pub unchanged: u32,
    pub failed: u32,
    /// Not attempted because a dependency failed or the run stopped
    pub skipped: u32,
    pub failures: Vec<ResourceFailure>,
    pub total_duration: std::time::Duration,
}

impl ApplyResult {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

// ============================================================================
// Value helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for reference substitution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of001_declaration_parse() {
        let yaml = r#"
version: "1.0"
name: lab
params:
  owner: ops
provider:
  endpoint: http://one.example:2633/RPC2
  username: oneadmin
resources:
  c1:
    type: cluster
    name: lab-cluster
    tags:
      owner: "{{params.owner}}"
  img:
    type: image
    depends_on: [c1]
    name: base
    datastore_id: 1
    size: 1024
data:
  users:
    type: group
    name: users
policy:
  failure: continue_independent
  refresh: false
"#;
        let decl: Declaration = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(decl.name, "lab");
        assert_eq!(decl.resources.len(), 2);
        assert_eq!(decl.resources["c1"].kind, ResourceKind::Cluster);
        assert_eq!(decl.resources["img"].depends_on, vec!["c1"]);
        assert_eq!(
            decl.resources["img"].spec["size"],
            serde_yaml_ng::Value::from(1024)
        );
        assert!(!decl.resources["img"].spec.contains_key("type"));
        assert_eq!(decl.data["users"].kind, ObjectKind::Group);
        assert_eq!(decl.policy.failure, FailurePolicy::ContinueIndependent);
        assert!(!decl.policy.refresh);
        assert!(decl.policy.lock_file);
    }

    #[test]
    fn test_of001_unknown_kind_rejected() {
        let yaml = "type: bucket\nname: x\n";
        assert!(serde_yaml_ng::from_str::<ResourceDecl>(yaml).is_err());
    }

    #[test]
    fn test_of001_resource_kind_mapping() {
        assert_eq!(ResourceKind::GroupQuotas.object_kind(), ObjectKind::Group);
        assert_eq!(ResourceKind::VirtualMachine.to_string(), "virtual_machine");
        let kind: ResourceKind = serde_yaml_ng::from_str("vm_group").unwrap();
        assert_eq!(kind, ResourceKind::VmGroup);
    }

    #[test]
    fn test_of001_policy_defaults() {
        let p = Policy::default();
        assert_eq!(p.failure, FailurePolicy::StopOnFirst);
        assert!(p.refresh);
        assert!(p.lock_file);
    }

    #[test]
    fn test_of001_absent_state() {
        let r: ResourceDecl = serde_yaml_ng::from_str("type: acl\nstate: absent\n").unwrap();
        assert!(r.is_absent());
        assert!(r.spec.is_empty());
    }

    #[test]
    fn test_of001_state_lock_roundtrip() {
        let mut spec = Spec::new();
        spec.insert("name".to_string(), "c1".into());
        let lock = StateLock {
            schema: "1.0".to_string(),
            name: "lab".to_string(),
            generated_at: "2026-02-16T14:00:00Z".to_string(),
            generator: "oneform 0.3.0".to_string(),
            resources: IndexMap::from([(
                "c1".to_string(),
                ResourceLock {
                    kind: ResourceKind::Cluster,
                    status: ResourceStatus::Converged,
                    remote_id: Some(100),
                    applied_at: Some("2026-02-16T14:00:01Z".to_string()),
                    duration_seconds: Some(0.2),
                    hash: "blake3:abc123".to_string(),
                    depends_on: vec![],
                    spec: spec.clone(),
                    attributes: spec,
                },
            )]),
        };
        let yaml = serde_yaml_ng::to_string(&lock).unwrap();
        let lock2: StateLock = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(lock2.resources["c1"].remote_id, Some(100));
        assert_eq!(lock2.resources["c1"].status, ResourceStatus::Converged);
    }

    #[test]
    fn test_of001_display() {
        assert_eq!(PlanAction::Replace.to_string(), "REPLACE");
        assert_eq!(PlanAction::NoOp.to_string(), "NO-OP");
        assert_eq!(ResourceStatus::Tainted.to_string(), "TAINTED");
    }

    #[test]
    fn test_of001_yaml_value_to_string() {
        assert_eq!(yaml_value_to_string(&"hello".into()), "hello");
        assert_eq!(yaml_value_to_string(&serde_yaml_ng::Value::from(42)), "42");
        assert_eq!(yaml_value_to_string(&serde_yaml_ng::Value::Bool(true)), "true");
        assert_eq!(yaml_value_to_string(&serde_yaml_ng::Value::Null), "");
        let seq: serde_yaml_ng::Value = serde_yaml_ng::from_str("[1, 2]").unwrap();
        assert_eq!(yaml_value_to_string(&seq), "[1,2]");
    }
}
