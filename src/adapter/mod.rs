//! The VBoxManage adapter (spec §4.A).
//!
//! `Adapter` is the trait every handler programs against; `vboxmanage`
//! holds the real subprocess-backed implementation and `fake` holds an
//! in-memory simulation used by tests, mirroring the teacher's
//! `VmmBackend` trait split between `KvmBackend` and `VzBackend`
//! (`backend/mod.rs`).

pub mod classify;
pub mod fake;
pub mod parse;
pub mod vboxmanage;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    Backup, BackupFormat, DiskAttachment, Firmware, HostOnlyNetwork, MediumType, Nic, NicMode,
    PortForward, Screenshot, Snapshot, StorageController, VirtualMachine, VmMetrics, VmSummary,
};

pub use fake::FakeAdapter;
pub use vboxmanage::VBoxManageAdapter;

/// Options for a single `run()` invocation (spec §4.A).
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<std::path::PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            stdin: None,
            env: Vec::new(),
            cwd: None,
        }
    }
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// The raw result of a `run()` invocation. No parsing is performed here.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout_text: String,
    pub stderr_text: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateVmSpec {
    pub vm_name: String,
    pub os_type: String,
    pub memory_mb: u64,
    pub cpus: u32,
    pub disk_size_gb: Option<u64>,
    pub firmware: Option<Firmware>,
    pub chipset: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VmPatch {
    pub memory_mb: Option<u64>,
    pub cpus: Option<u32>,
    pub description: Option<String>,
    pub nested_virt: Option<bool>,
    pub paravirt_provider: Option<String>,
    pub firmware: Option<Firmware>,
}

impl VmPatch {
    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none()
            && self.cpus.is_none()
            && self.description.is_none()
            && self.nested_virt.is_none()
            && self.paravirt_provider.is_none()
            && self.firmware.is_none()
    }

    /// Whether every field in this patch is one VirtualBox can apply while
    /// the VM is running (spec §4.G.2's "only fields VirtualBox allows
    /// live" carve-out; for `vm_management.modify` everything here requires
    /// `poweredOff` except none do today, so this always returns false for
    /// a non-empty VM patch — kept as an explicit decision point rather
    /// than silently assuming).
    pub fn live_safe(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct NicPatch {
    pub mode: Option<NicMode>,
    pub adapter_type: Option<crate::model::AdapterType>,
    pub cable_connected: Option<bool>,
    pub mac: Option<String>,
    pub attachment_target: Option<String>,
}

impl NicPatch {
    /// Fields VirtualBox allows to change while the VM is running.
    pub fn live_safe(&self) -> bool {
        self.mode.is_none()
            && self.adapter_type.is_none()
            && self.attachment_target.is_none()
            && self.mac.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    Full,
    Linked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVerb {
    Reset,
    Pause,
    Resume,
    AcpiPowerButton,
    PowerOff,
}

#[derive(Debug, Clone)]
pub struct StorageControllerSpec {
    pub name: String,
    pub kind: crate::model::ControllerType,
    pub port_count: Option<u32>,
    pub bootable: Option<bool>,
    pub use_host_io_cache: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CreateDiskSpec {
    pub path: String,
    pub size_gb: u64,
    pub format: DiskFormat,
    pub variant: DiskVariant,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Vdi,
    Vhd,
    Vmdk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskVariant {
    Standard,
    Fixed,
    Split2g,
    Diff,
}

#[derive(Debug, Clone)]
pub struct AttachDiskSpec {
    pub controller: String,
    pub port: u32,
    pub device: u32,
    pub medium_path: String,
    pub medium_type: MediumType,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct HostOnlyNetworkSpec {
    pub name: String,
    pub ip: String,
    pub netmask: String,
    pub dhcp_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub os: String,
    pub cpu_count: u32,
    pub memory_total_mb: u64,
    pub vbox_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsTypeInfo {
    pub id: String,
    pub description: String,
    pub is_64_bit: bool,
}

/// Every interaction with the host's `VBoxManage` binary goes through this
/// trait. Handlers never spawn processes directly (spec §4.A: "it is the
/// only component that spawns subprocesses").
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Resolve the `VBoxManage` binary path (config > env > platform default).
    async fn locate(&self) -> Result<std::path::PathBuf>;

    /// Run an arbitrary `VBoxManage` invocation. Escape hatch for operations
    /// not covered by a typed method; no parsing is performed.
    async fn run(&self, args: &[String], opts: RunOptions) -> Result<ExecResult>;

    async fn list_vms(&self) -> Result<Vec<VmSummary>>;
    async fn show_vm_info(&self, id_or_name: &str) -> Result<VirtualMachine>;
    async fn create_vm(&self, spec: &CreateVmSpec) -> Result<VirtualMachine>;
    async fn start_vm(&self, id: &str, headless: bool) -> Result<()>;
    async fn stop_vm(&self, id: &str, force: bool) -> Result<()>;
    async fn delete_vm(&self, id: &str, delete_files: bool) -> Result<()>;
    async fn clone_vm(
        &self,
        source_id: &str,
        new_name: &str,
        mode: CloneMode,
        snapshot_name: Option<&str>,
    ) -> Result<VirtualMachine>;
    async fn control_vm(&self, id: &str, verb: ControlVerb) -> Result<()>;
    async fn modify_vm(&self, id: &str, patch: &VmPatch) -> Result<()>;

    async fn configure_adapter(&self, id: &str, slot: u8, patch: &NicPatch) -> Result<()>;
    async fn list_adapters(&self, id: &str) -> Result<Vec<Nic>>;
    async fn add_port_forwarding(&self, id: &str, slot: u8, rule: &PortForward) -> Result<()>;
    async fn remove_port_forwarding(&self, id: &str, slot: u8, name: &str) -> Result<()>;
    async fn list_port_forwarding(&self, id: &str, slot: u8) -> Result<Vec<PortForward>>;
    async fn set_bandwidth_limit(&self, id: &str, slot: u8, limit_kbps: Option<u32>) -> Result<()>;
    async fn set_promiscuous_mode(&self, id: &str, slot: u8, mode: &str) -> Result<()>;

    async fn list_networks(&self) -> Result<Vec<HostOnlyNetwork>>;
    async fn create_network(&self, spec: &HostOnlyNetworkSpec) -> Result<HostOnlyNetwork>;
    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn list_controllers(&self, id: &str) -> Result<Vec<StorageController>>;
    async fn create_controller(&self, id: &str, spec: &StorageControllerSpec) -> Result<StorageController>;
    async fn remove_controller(&self, id: &str, name: &str) -> Result<()>;
    async fn list_disks(&self, id: &str) -> Result<Vec<DiskAttachment>>;
    async fn create_disk(&self, spec: &CreateDiskSpec) -> Result<String>;
    async fn attach_disk(&self, id: &str, spec: &AttachDiskSpec) -> Result<()>;
    async fn detach_disk(&self, id: &str, controller: &str, port: u32, device: u32) -> Result<()>;
    async fn mount_iso(&self, id: &str, controller: &str, port: u32, device: u32, iso_path: &str) -> Result<()>;
    async fn unmount_iso(&self, id: &str, controller: &str, port: u32, device: u32) -> Result<()>;
    async fn resize_disk(&self, path: &str, size_gb: u64) -> Result<()>;
    async fn clone_disk(&self, source_path: &str, dest_path: &str) -> Result<String>;

    async fn snapshot_take(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        include_ram: bool,
    ) -> Result<Snapshot>;
    async fn snapshot_restore(&self, id: &str, name: &str) -> Result<()>;
    async fn snapshot_delete(&self, id: &str, name: &str) -> Result<()>;
    /// Returns the snapshot tree root and the name of the current snapshot.
    async fn snapshot_list(&self, id: &str) -> Result<(Option<Snapshot>, Option<String>)>;

    async fn host_info(&self) -> Result<HostInfo>;
    async fn vbox_version(&self) -> Result<String>;
    async fn list_os_types(&self) -> Result<Vec<OsTypeInfo>>;
    async fn metrics_query(&self, id: &str) -> Result<VmMetrics>;
    async fn screenshot(&self, id: &str, width: Option<u32>, height: Option<u32>) -> Result<Screenshot>;

    async fn export_vm(&self, id: &str, path: &str, format: BackupFormat) -> Result<Backup>;
}
