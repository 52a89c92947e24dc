//! Normalized value objects describing nodes, domains and storage.
//!
//! Every value here is a snapshot: produced by a collaborator, handed out by
//! the command layer, never patched in place. Unset string fields are empty
//! strings rather than `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Domain
// =============================================================================

/// Hypervisor flavour of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DomainType {
    #[default]
    Kvm,
    Xen,
}

impl DomainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Kvm => "kvm",
            DomainType::Xen => "xen",
        }
    }

    /// Parse the `domain@type` attribute value.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "kvm" => Some(DomainType::Kvm),
            "xen" => Some(DomainType::Xen),
            _ => None,
        }
    }
}

impl std::fmt::Display for DomainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live power state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainState {
    #[default]
    Nostate,
    Running,
    Idle,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Pmsuspended,
}

impl DomainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::Nostate => "NOSTATE",
            DomainState::Running => "RUNNING",
            DomainState::Idle => "IDLE",
            DomainState::Paused => "PAUSED",
            DomainState::Shutdown => "SHUTDOWN",
            DomainState::Shutoff => "SHUTOFF",
            DomainState::Crashed => "CRASHED",
            DomainState::Pmsuspended => "PMSUSPENDED",
        }
    }

    /// Whether the domain currently consumes host resources.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DomainState::Running | DomainState::Idle | DomainState::Paused | DomainState::Pmsuspended
        )
    }
}

/// Power state requested through `DOMAIN_STATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetState {
    Run,
    Pause,
    Shutdown,
    Restart,
}

impl TargetState {
    /// Every token accepted on the wire.
    pub const TOKENS: [&'static str; 4] = ["RUN", "PAUSE", "SHUTDOWN", "RESTART"];

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "RUN" => Some(TargetState::Run),
            "PAUSE" => Some(TargetState::Pause),
            "SHUTDOWN" => Some(TargetState::Shutdown),
            "RESTART" => Some(TargetState::Restart),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Run => "RUN",
            TargetState::Pause => "PAUSE",
            TargetState::Shutdown => "SHUTDOWN",
            TargetState::Restart => "RESTART",
        }
    }
}

/// How a domain boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMethod {
    /// Firmware boot governed by the `boot` device order
    Devices,
    /// Kernel loaded directly by the hypervisor
    DirectKernel,
    /// Kernel picked by a host-side bootloader (Xen PV)
    Bootloader,
    /// Both `kernel` and `bootloader` are set
    Conflicting,
}

/// Normalized view of one guest VM, independent of hypervisor dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Domain {
    pub domain_type: DomainType,
    pub name: String,
    pub uuid: String,
    /// `hvm` for full virtualization, `linux` (or `xen`) for Xen PV
    pub os_type: String,
    pub arch: String,

    // Direct kernel boot
    pub kernel: String,
    pub initrd: String,
    pub cmdline: String,

    // Xen PV bootloader
    pub bootloader: String,
    pub bootloader_args: String,

    /// Boot device order, e.g. `["cdrom", "hd"]`
    pub boot: Vec<String>,
    pub rtc_offset: String,

    pub disks: Vec<Disk>,
    pub interfaces: Vec<Interface>,
    pub graphics: Vec<Graphics>,
    /// Hosts this domain may be migrated to
    pub targethosts: Vec<String>,

    // Live data, filled in when the domain is known to a running node
    pub state: DomainState,
    #[serde(rename = "maxMem")]
    pub max_mem: u64,
    #[serde(rename = "curMem")]
    pub cur_mem: u64,
    pub vcpus: u32,
    /// CPU usage in percent over the last 10s, 60s and 5m
    pub cputime: [f64; 3],
    pub annotations: BTreeMap<String, String>,
    /// `None` when the node cannot take snapshots
    pub snapshots: Option<BTreeMap<String, DomainSnapshot>>,
    pub suspended: Option<bool>,
    /// Whether the node answered its last poll, set by `DOMAIN_INFO`
    pub available: Option<bool>,
}

impl Default for Domain {
    fn default() -> Self {
        Self {
            domain_type: DomainType::Kvm,
            name: String::new(),
            uuid: String::new(),
            os_type: "hvm".to_string(),
            arch: String::new(),
            kernel: String::new(),
            initrd: String::new(),
            cmdline: String::new(),
            bootloader: String::new(),
            bootloader_args: String::new(),
            boot: Vec::new(),
            rtc_offset: String::new(),
            disks: Vec::new(),
            interfaces: Vec::new(),
            graphics: Vec::new(),
            targethosts: Vec::new(),
            state: DomainState::Nostate,
            max_mem: 0,
            cur_mem: 0,
            vcpus: 1,
            cputime: [0.0; 3],
            annotations: BTreeMap::new(),
            snapshots: None,
            suspended: None,
            available: None,
        }
    }
}

impl Domain {
    /// Create an empty definition with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Classify the boot configuration.
    pub fn boot_method(&self) -> BootMethod {
        match (self.kernel.is_empty(), self.bootloader.is_empty()) {
            (false, false) => BootMethod::Conflicting,
            (false, true) => BootMethod::DirectKernel,
            (true, false) => BootMethod::Bootloader,
            (true, true) => BootMethod::Devices,
        }
    }

    /// Free-text description stored in the annotations.
    pub fn description(&self) -> &str {
        self.annotations
            .get("description")
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Disk device kinds.
pub mod disk_device {
    pub const DISK: &str = "disk";
    pub const CDROM: &str = "cdrom";
    pub const FLOPPY: &str = "floppy";
}

/// One block device attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Disk {
    /// file | block | dir | network
    #[serde(rename = "type")]
    pub disk_type: String,
    /// disk | cdrom | floppy
    pub device: String,
    pub driver: String,
    pub driver_type: String,
    /// Empty means "hypervisor default", not a cache mode
    pub driver_cache: String,
    /// Empty for removable media without a medium
    pub source: String,
    pub target_dev: String,
    pub target_bus: String,
    pub readonly: bool,
    /// Size in bytes of a volume to create on define
    pub size: Option<u64>,
    /// Pool to create the volume in
    pub pool: String,
}

impl Default for Disk {
    fn default() -> Self {
        Self {
            disk_type: "file".to_string(),
            device: disk_device::DISK.to_string(),
            driver: String::new(),
            driver_type: String::new(),
            driver_cache: String::new(),
            source: String::new(),
            target_dev: String::new(),
            target_bus: String::new(),
            readonly: false,
            size: None,
            pool: String::new(),
        }
    }
}

/// One virtual NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Interface {
    /// bridge | network | direct | ethernet | user
    #[serde(rename = "type")]
    pub iface_type: String,
    pub mac_address: String,
    /// Bridge or network name
    pub source: String,
    pub script: String,
    pub target: String,
    pub model: String,
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            iface_type: "bridge".to_string(),
            mac_address: String::new(),
            source: String::new(),
            script: String::new(),
            target: String::new(),
            model: String::new(),
        }
    }
}

/// Port value meaning "the hypervisor chooses".
pub const AUTOPORT: i32 = -1;

/// One remote display endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Graphics {
    /// vnc | spice | sdl | rdp | desktop
    #[serde(rename = "type")]
    pub graphics_type: String,
    /// `-1` when autoport governs
    pub port: i32,
    pub autoport: bool,
    pub listen: String,
    pub passwd: String,
    pub keymap: String,
}

impl Default for Graphics {
    fn default() -> Self {
        Self {
            graphics_type: "vnc".to_string(),
            port: AUTOPORT,
            autoport: true,
            listen: String::new(),
            passwd: String::new(),
            keymap: String::new(),
        }
    }
}

/// A named domain snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub name: String,
    pub ctime: DateTime<Utc>,
}

/// Condensed domain view returned by `DOMAIN_LIST`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSummary {
    pub uuid: String,
    pub name: String,
    pub state: DomainState,
    #[serde(rename = "maxMem")]
    pub max_mem: u64,
    pub vcpus: u32,
    pub cputime: f64,
    pub description: String,
    pub node_available: bool,
}

impl DomainSummary {
    pub fn of(domain: &Domain, node_available: bool) -> Self {
        Self {
            uuid: domain.uuid.clone(),
            name: domain.name.clone(),
            state: domain.state,
            max_mem: domain.max_mem,
            vcpus: domain.vcpus,
            cputime: domain.cputime[0],
            description: domain.description().to_string(),
            node_available,
        }
    }
}

/// Result of defining or cloning a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefineOutcome {
    pub uuid: String,
    /// Non-fatal problems, e.g. a volume that could not be created
    pub warnings: Vec<String>,
}

/// A guest configuration a node can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTemplate {
    pub arch: String,
    pub domain_type: String,
    pub os_type: String,
    pub emulator: String,
    pub machines: Vec<String>,
    pub loader: Option<String>,
    pub features: Vec<String>,
}

impl DomainTemplate {
    /// Whether `domain` can run with this template.
    pub fn matches(&self, domain: &Domain) -> bool {
        self.arch == domain.arch
            && self.domain_type == domain.domain_type.as_str()
            && self.os_type == domain.os_type
    }
}

// =============================================================================
// Storage
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub uuid: String,
    pub name: String,
    /// Bytes
    pub capacity: u64,
    /// Bytes
    pub available: u64,
    pub path: String,
    pub active: bool,
    #[serde(rename = "type")]
    pub pool_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    pub name: String,
    pub pool: String,
    pub path: String,
    pub capacity: u64,
    pub allocation: u64,
    /// disk | cdrom
    pub device: String,
}

// =============================================================================
// Node / Group
// =============================================================================

/// Opaque handle of a live hypervisor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// One hypervisor host's state at poll time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSnapshot {
    pub name: String,
    pub uri: String,
    #[serde(rename = "phyMem")]
    pub phy_mem: u64,
    #[serde(rename = "curMem")]
    pub cur_mem: u64,
    #[serde(rename = "maxMem")]
    pub max_mem: u64,
    pub cpu_usage: f64,
    pub cpus: u32,
    /// (NUMA nodes, sockets, cores, threads)
    pub cores: (u32, u32, u32, u32),
    pub storages: Vec<StoragePool>,
    /// Keyed by domain uuid
    pub domains: BTreeMap<String, Domain>,
    pub capabilities: Vec<DomainTemplate>,
    pub supports_snapshot: bool,
    pub supports_suspend: bool,
    pub last_try: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    /// `None` while the node is unreachable
    #[serde(skip)]
    pub conn: Option<ConnectionHandle>,
}

impl Default for NodeSnapshot {
    fn default() -> Self {
        Self {
            name: String::new(),
            uri: String::new(),
            phy_mem: 0,
            cur_mem: 0,
            max_mem: 0,
            cpu_usage: 0.0,
            cpus: 1,
            cores: (1, 1, 1, 1),
            storages: Vec::new(),
            domains: BTreeMap::new(),
            capabilities: Vec::new(),
            supports_snapshot: false,
            supports_suspend: false,
            last_try: None,
            last_update: None,
            conn: None,
        }
    }
}

impl NodeSnapshot {
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

/// Named collection of node URIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub nodes: Vec<String>,
}
