//! Data model: the entities and invariants of spec §3.
//!
//! These types double as internal state and as the JSON shape returned in
//! `response.data`, following the teacher's `RunState`/`RunEvent` convention
//! of deriving `Serialize`/`Deserialize` directly on the domain struct
//! (`persistence.rs` in the teacher).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `VirtualMachine.state` — spec §3 lists the exact lowerCamelCase values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VmState {
    PoweredOff,
    Saved,
    Aborted,
    Running,
    Paused,
    Stuck,
    Starting,
    Stopping,
    Restoring,
    Unknown,
}

impl VmState {
    pub fn can_delete(&self) -> bool {
        !matches!(self, VmState::Running | VmState::Paused)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, VmState::PoweredOff | VmState::Saved | VmState::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Efi,
}

impl Default for Firmware {
    fn default() -> Self {
        Firmware::Bios
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicMode {
    None,
    Nat,
    #[serde(rename = "natnetwork")]
    NatNetwork,
    Bridged,
    Intnet,
    Hostonly,
    Generic,
}

impl NicMode {
    /// spec §3: port forwards are only valid for these modes.
    pub fn allows_port_forwards(&self) -> bool {
        matches!(self, NicMode::Nat | NicMode::NatNetwork)
    }

    /// spec §4.G.2: `attachment_target` is required for modes whose meaning
    /// depends on an external name (bridge/host-only/NAT network/internal
    /// network); `nat` and `none` need nothing.
    pub fn requires_attachment_target(&self) -> bool {
        matches!(
            self,
            NicMode::Bridged | NicMode::Intnet | NicMode::Hostonly | NicMode::NatNetwork
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AdapterType {
    Am79C970A,
    Am79C973,
    #[serde(rename = "82540EM")]
    I82540Em,
    #[serde(rename = "82543GC")]
    I82543Gc,
    #[serde(rename = "82545EM")]
    I82545Em,
    Virtio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortForwardProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub name: String,
    pub protocol: PortForwardProtocol,
    pub host_port: u16,
    pub guest_port: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub guest_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nic {
    pub slot: u8,
    pub enabled: bool,
    pub mode: NicMode,
    pub adapter_type: AdapterType,
    pub mac: String,
    pub cable_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attachment_target: Option<String>,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    Ide,
    Sata,
    Scsi,
    Sas,
    Nvme,
    Floppy,
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediumType {
    Hdd,
    Dvd,
    Floppy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskAttachment {
    pub controller_name: String,
    pub port: u32,
    pub device: u32,
    pub medium_path: String,
    pub medium_type: MediumType,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageController {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ControllerType,
    pub port_count: u32,
    pub bootable: bool,
    pub use_host_io_cache: bool,
    #[serde(default)]
    pub attachments: Vec<DiskAttachment>,
}

/// A snapshot tree node (spec §3). `children` is kept ordered by `taken_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<String>,
    pub taken_at: String,
    pub includes_ram: bool,
    #[serde(default)]
    pub children: Vec<Snapshot>,
}

impl Snapshot {
    /// Depth-first search for a snapshot by name anywhere in this subtree.
    pub fn find_by_name<'a>(&'a self, name: &str) -> Option<&'a Snapshot> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_by_name(name))
    }

    pub fn find_by_name_mut<'a>(&'a mut self, name: &str) -> Option<&'a mut Snapshot> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_by_name_mut(name))
    }

    pub fn all_names(&self) -> Vec<String> {
        let mut out = vec![self.name.clone()];
        for c in &self.children {
            out.extend(c.all_names());
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostOnlyNetwork {
    pub name: String,
    pub ip: String,
    pub netmask: String,
    pub dhcp_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dhcp_range: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub os_type: String,
    pub memory_mb: u64,
    pub cpus: u32,
    #[serde(default)]
    pub firmware: Firmware,
    pub nics: Vec<Nic>,
    pub storage_controllers: HashMap<String, StorageController>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub snapshots: Option<Snapshot>,
    /// Name of the current (head) snapshot, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_snapshot: Option<String>,
    #[serde(default)]
    pub group_paths: Vec<String>,
}

/// A trimmed-down view returned from `vm_management.list` (spec §4.G.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub os_type: String,
    pub memory_mb: u64,
    pub cpus: u32,
    pub group_paths: Vec<String>,
}

impl From<&VirtualMachine> for VmSummary {
    fn from(vm: &VirtualMachine) -> Self {
        VmSummary {
            id: vm.id.clone(),
            name: vm.name.clone(),
            state: vm.state,
            os_type: vm.os_type.clone(),
            memory_mb: vm.memory_mb,
            cpus: vm.cpus,
            group_paths: vm.group_paths.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFormat {
    Ova,
    Ovf,
    DiskOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub vm_name: String,
    pub created_at: String,
    pub format: BackupFormat,
    pub path: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetrics {
    pub cpu_pct: f64,
    pub memory_used_mb: u64,
    pub memory_balloon_mb: u64,
    pub disk_read_bps: u64,
    pub disk_write_bps: u64,
    pub net_rx_bps: u64,
    pub net_tx_bps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Screenshot {
    /// Base64-encoded PNG bytes, per spec §4.G.5.
    pub png_base64: String,
    pub width: u32,
    pub height: u32,
    pub taken_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_state_json_casing_matches_spec() {
        assert_eq!(serde_json::to_string(&VmState::PoweredOff).unwrap(), "\"poweredOff\"");
        assert_eq!(serde_json::to_string(&VmState::Running).unwrap(), "\"running\"");
    }

    #[test]
    fn nic_mode_json_casing_matches_spec() {
        assert_eq!(serde_json::to_string(&NicMode::NatNetwork).unwrap(), "\"natnetwork\"");
        assert_eq!(serde_json::to_string(&NicMode::Hostonly).unwrap(), "\"hostonly\"");
    }

    #[test]
    fn nic_mode_invariants() {
        assert!(NicMode::Nat.allows_port_forwards());
        assert!(!NicMode::Bridged.allows_port_forwards());
        assert!(NicMode::Bridged.requires_attachment_target());
        assert!(!NicMode::Nat.requires_attachment_target());
    }

    #[test]
    fn snapshot_tree_find() {
        let tree = Snapshot {
            id: "1".into(),
            name: "root".into(),
            description: String::new(),
            parent_id: None,
            taken_at: "2024-01-01T00:00:00Z".into(),
            includes_ram: false,
            children: vec![Snapshot {
                id: "2".into(),
                name: "child".into(),
                description: String::new(),
                parent_id: Some("1".into()),
                taken_at: "2024-01-02T00:00:00Z".into(),
                includes_ram: false,
                children: vec![],
            }],
        };
        assert!(tree.find_by_name("child").is_some());
        assert!(tree.find_by_name("missing").is_none());
    }
}
