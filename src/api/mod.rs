//! OF-030: Cloud API seam.
//!
//! [`CloudApi`] is the surface of the OpenNebula client the resource
//! handlers drive. Templates cross it as text. [`memory::MemoryCloud`] is an
//! in-memory endpoint behaving like a mocked OpenNebula front-end.

pub mod acl;
pub mod memory;

use crate::error::ApiError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Remote object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Cluster,
    Datastore,
    Host,
    Image,
    Template,
    VirtualMachine,
    VirtualNetwork,
    SecurityGroup,
    Marketplace,
    VirtualRouter,
    Group,
    User,
    Acl,
    Vdc,
    VmGroup,
    Zone,
}

impl ObjectKind {
    /// Key under which a cluster or VDC lists members of this kind.
    pub fn members_key(self) -> Option<&'static str> {
        match self {
            Self::Cluster => Some("CLUSTERS"),
            Self::Datastore => Some("DATASTORES"),
            Self::Host => Some("HOSTS"),
            Self::VirtualNetwork => Some("VNETS"),
            Self::Group => Some("GROUPS"),
            _ => None,
        }
    }

    /// Key under which a VDC lists members of this kind in `zone`.
    pub fn zone_members_key(self, zone: u32) -> Option<String> {
        self.members_key().map(|key| format!("ZONE{}_{}", zone, key))
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cluster => "cluster",
            Self::Datastore => "datastore",
            Self::Host => "host",
            Self::Image => "image",
            Self::Template => "template",
            Self::VirtualMachine => "virtual machine",
            Self::VirtualNetwork => "virtual network",
            Self::SecurityGroup => "security group",
            Self::Marketplace => "marketplace",
            Self::VirtualRouter => "virtual router",
            Self::Group => "group",
            Self::User => "user",
            Self::Acl => "acl rule",
            Self::Vdc => "vdc",
            Self::VmGroup => "vm group",
            Self::Zone => "zone",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Permissions and locks
// ============================================================================

/// Use/manage/admin bits for owner, group and others.
///
/// Rendered as three octal digits, one per class, with use=4, manage=2,
/// admin=1 (so `"640"` is owner use+manage, group use).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub owner: u8,
    pub group: u8,
    pub other: u8,
}

impl Permissions {
    pub fn from_octal(s: &str) -> Result<Self, String> {
        let digits: Vec<u8> = s
            .chars()
            .map(|c| c.to_digit(8).map(|d| d as u8))
            .collect::<Option<_>>()
            .ok_or_else(|| format!("\"{}\" is not an octal permission string", s))?;
        match digits.as_slice() {
            [owner, group, other] => Ok(Self {
                owner: *owner,
                group: *group,
                other: *other,
            }),
            _ => Err(format!("\"{}\" must have exactly three octal digits", s)),
        }
    }

    pub fn to_octal(&self) -> String {
        format!("{}{}{}", self.owner, self.group, self.other)
    }
}

/// Object lock levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockLevel {
    Use,
    Manage,
    Admin,
    All,
}

impl LockLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "USE" => Some(Self::Use),
            "MANAGE" => Some(Self::Manage),
            "ADMIN" => Some(Self::Admin),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Use => write!(f, "USE"),
            Self::Manage => write!(f, "MANAGE"),
            Self::Admin => write!(f, "ADMIN"),
            Self::All => write!(f, "ALL"),
        }
    }
}

// ============================================================================
// Remote state enums
// ============================================================================

macro_rules! state_enum {
    ($name:ident { $($variant:ident = $value:literal => $label:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn code(self) -> i32 {
                self as i32
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.name())
            }
        }
    };
}

state_enum!(HostState {
    Init = 0 => "INIT",
    MonitoringMonitored = 1 => "MONITORING_MONITORED",
    Monitored = 2 => "MONITORED",
    Error = 3 => "ERROR",
    Disabled = 4 => "DISABLED",
    MonitoringError = 5 => "MONITORING_ERROR",
    MonitoringInit = 6 => "MONITORING_INIT",
    MonitoringDisabled = 7 => "MONITORING_DISABLED",
    Offline = 8 => "OFFLINE",
});

state_enum!(ImageState {
    Init = 0 => "INIT",
    Ready = 1 => "READY",
    Used = 2 => "USED",
    Disabled = 3 => "DISABLED",
    Locked = 4 => "LOCKED",
    Error = 5 => "ERROR",
    Clone = 6 => "CLONE",
    Delete = 7 => "DELETE",
    UsedPers = 8 => "USED_PERS",
    LockedUsed = 9 => "LOCKED_USED",
    LockedUsedPers = 10 => "LOCKED_USED_PERS",
});

state_enum!(MarketplaceState {
    Enabled = 0 => "ENABLED",
    Disabled = 1 => "DISABLED",
});

state_enum!(DatastoreState {
    Ready = 0 => "READY",
    Disabled = 1 => "DISABLED",
});

state_enum!(VmState {
    Init = 0 => "INIT",
    Pending = 1 => "PENDING",
    Hold = 2 => "HOLD",
    Active = 3 => "ACTIVE",
    Stopped = 4 => "STOPPED",
    Suspended = 5 => "SUSPENDED",
    Done = 6 => "DONE",
    Poweroff = 8 => "POWEROFF",
    Undeployed = 9 => "UNDEPLOYED",
    Cloning = 10 => "CLONING",
    CloningFailure = 11 => "CLONING_FAILURE",
});

state_enum!(LcmState {
    LcmInit = 0 => "LCM_INIT",
    Prolog = 1 => "PROLOG",
    Boot = 2 => "BOOT",
    Running = 3 => "RUNNING",
    Migrate = 4 => "MIGRATE",
    Shutdown = 12 => "SHUTDOWN",
    ShutdownPoweroff = 18 => "SHUTDOWN_POWEROFF",
    BootFailure = 36 => "BOOT_FAILURE",
    PrologFailure = 39 => "PROLOG_FAILURE",
});

// ============================================================================
// Objects, requests and actions
// ============================================================================

/// A remote object as returned by `info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteObject {
    pub id: u32,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
    pub permissions: Permissions,
    pub lock: Option<LockLevel>,
    pub state: i32,
    pub lcm_state: i32,
    /// Body scalars outside the template (TYPE, IM_MAD, PERSISTENT, ...)
    pub attrs: IndexMap<String, String>,
    /// Related object ids (HOSTS, DATASTORES, VNETS, GROUPS, ...)
    pub members: IndexMap<String, Vec<u32>>,
    /// Template text
    pub template: String,
    /// Quota template text (groups)
    pub quotas: String,
}

impl RemoteObject {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn members(&self, key: &str) -> &[u32] {
        self.members.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Allocation requests.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocateRequest {
    /// Objects created from a template carrying their `NAME`.
    Template {
        template: String,
        cluster_id: Option<u32>,
        datastore_id: Option<u32>,
    },
    /// Objects created from a bare name (clusters, groups).
    Named { name: String },
    Host {
        name: String,
        im_mad: String,
        vm_mad: String,
        cluster_id: Option<u32>,
    },
    /// Image clone.
    Clone {
        source: u32,
        name: String,
        datastore_id: Option<u32>,
    },
    /// Instantiate a VM template.
    Instantiate {
        template_id: u32,
        name: String,
        hold: bool,
        extra: String,
    },
    Acl {
        user: u64,
        resource: u64,
        rights: u64,
        zone: Option<u64>,
    },
}

/// Template update mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Replace,
    Merge,
}

/// VM lifecycle actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Terminate,
    TerminateHard,
    Poweroff,
    PoweroffHard,
    Resume,
    Hold,
    Release,
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Terminate => "terminate",
            Self::TerminateHard => "terminate-hard",
            Self::Poweroff => "poweroff",
            Self::PoweroffHard => "poweroff-hard",
            Self::Resume => "resume",
            Self::Hold => "hold",
            Self::Release => "release",
        };
        write!(f, "{}", s)
    }
}

/// Kind-specific actions.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Enable or disable (hosts, datastores, marketplaces, images).
    Enable(bool),
    /// Image persistence.
    Persistent(bool),
    /// Image type change.
    ChangeType(String),
    /// Cluster/VDC membership.
    AddMember { member: ObjectKind, id: u32 },
    RemoveMember { member: ObjectKind, id: u32 },
    /// VDC per-zone resources.
    AddZoneMember { zone: u32, member: ObjectKind, id: u32 },
    RemoveZoneMember { zone: u32, member: ObjectKind, id: u32 },
    Vm(VmAction),
    Resize {
        cpu: Option<f64>,
        vcpu: Option<u32>,
        memory: Option<u64>,
    },
    AttachDisk(String),
    DetachDisk(u32),
    AttachNic(String),
    DetachNic(u32),
    /// Replace VM configuration sections (CONTEXT, OS, GRAPHICS).
    UpdateConf(String),
    /// Replace a group's quota template.
    SetQuota(String),
    /// Propagate security group rules to VMs.
    CommitRules,
}

impl Action {
    pub fn label(&self) -> String {
        match self {
            Self::Enable(true) => "enable".to_string(),
            Self::Enable(false) => "disable".to_string(),
            Self::Persistent(_) => "persistent".to_string(),
            Self::ChangeType(_) => "chtype".to_string(),
            Self::AddMember { member, .. } => format!("add {}", member),
            Self::RemoveMember { member, .. } => format!("remove {}", member),
            Self::AddZoneMember { member, .. } => format!("add zone {}", member),
            Self::RemoveZoneMember { member, .. } => format!("remove zone {}", member),
            Self::Vm(a) => a.to_string(),
            Self::Resize { .. } => "resize".to_string(),
            Self::AttachDisk(_) => "disk-attach".to_string(),
            Self::DetachDisk(_) => "disk-detach".to_string(),
            Self::AttachNic(_) => "nic-attach".to_string(),
            Self::DetachNic(_) => "nic-detach".to_string(),
            Self::UpdateConf(_) => "updateconf".to_string(),
            Self::SetQuota(_) => "quota".to_string(),
            Self::CommitRules => "commit".to_string(),
        }
    }
}

/// The OpenNebula client surface used by resource handlers.
pub trait CloudApi {
    fn allocate(&self, kind: ObjectKind, request: AllocateRequest) -> Result<u32, ApiError>;

    fn info(&self, kind: ObjectKind, id: u32) -> Result<RemoteObject, ApiError>;

    fn list(&self, kind: ObjectKind) -> Result<Vec<RemoteObject>, ApiError>;

    fn update(
        &self,
        kind: ObjectKind,
        id: u32,
        template: &str,
        mode: UpdateMode,
    ) -> Result<(), ApiError>;

    fn rename(&self, kind: ObjectKind, id: u32, name: &str) -> Result<(), ApiError>;

    fn chmod(&self, kind: ObjectKind, id: u32, permissions: Permissions) -> Result<(), ApiError>;

    /// `None` leaves the owner or group unchanged.
    fn chown(
        &self,
        kind: ObjectKind,
        id: u32,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), ApiError>;

    fn lock(&self, kind: ObjectKind, id: u32, level: LockLevel) -> Result<(), ApiError>;

    fn unlock(&self, kind: ObjectKind, id: u32) -> Result<(), ApiError>;

    fn action(&self, kind: ObjectKind, id: u32, action: Action) -> Result<(), ApiError>;

    fn delete(&self, kind: ObjectKind, id: u32) -> Result<(), ApiError>;
}
