//! An in-memory `Adapter` used by tests, grounded in the teacher's
//! `MockSandbox` (`sandbox/mod.rs`): state lives behind a `Mutex`, every
//! verb is simulated rather than shelled out, and callers can still reach
//! for the escape hatch (`run`) by queuing canned responses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::*;

use super::{
    Adapter, AttachDiskSpec, CloneMode, ControlVerb, CreateDiskSpec, CreateVmSpec, ExecResult,
    HostInfo, HostOnlyNetworkSpec, NicPatch, OsTypeInfo, RunOptions, StorageControllerSpec, VmPatch,
};

#[derive(Debug, Clone)]
struct FakeVm {
    vm: VirtualMachine,
    disks: Vec<(String, u64)>,
}

/// Queue canned raw responses for `run()` via [`FakeAdapter::queue_raw`];
/// everything else is simulated against an in-memory VM registry.
pub struct FakeAdapter {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    vms: HashMap<String, FakeVm>,
    networks: HashMap<String, HostOnlyNetwork>,
    queued_raw: Vec<ExecResult>,
    fail_next_start: bool,
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
        }
    }
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_raw(&self, result: ExecResult) {
        self.state.lock().unwrap().queued_raw.push(result);
    }

    /// Force the next `start_vm` call to fail as though VirtualBox reported
    /// the machine already locked, to exercise `Busy`-retry paths in tests.
    pub fn fail_next_start(&self) {
        self.state.lock().unwrap().fail_next_start = true;
    }

    fn find<'a>(state: &'a FakeState, id_or_name: &str) -> Option<&'a FakeVm> {
        state
            .vms
            .get(id_or_name)
            .or_else(|| state.vms.values().find(|v| v.vm.name == id_or_name))
    }

    fn find_id(state: &FakeState, id_or_name: &str) -> Result<String> {
        Self::find(state, id_or_name)
            .map(|v| v.vm.id.clone())
            .ok_or_else(|| Error::NotFound(format!("no such machine '{id_or_name}'")))
    }

    fn now_rfc3339() -> String {
        humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
    }
}

#[async_trait]
impl Adapter for FakeAdapter {
    async fn locate(&self) -> Result<std::path::PathBuf> {
        Ok(std::path::PathBuf::from("/fake/VBoxManage"))
    }

    async fn run(&self, _args: &[String], _opts: RunOptions) -> Result<ExecResult> {
        let mut state = self.state.lock().unwrap();
        state.queued_raw.pop().ok_or_else(|| {
            Error::Internal("FakeAdapter::run called with no queued response".into())
        })
    }

    async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state.vms.values().map(|v| VmSummary::from(&v.vm)).collect())
    }

    async fn show_vm_info(&self, id_or_name: &str) -> Result<VirtualMachine> {
        let state = self.state.lock().unwrap();
        Self::find(&state, id_or_name)
            .map(|v| v.vm.clone())
            .ok_or_else(|| Error::NotFound(format!("no such machine '{id_or_name}'")))
    }

    async fn create_vm(&self, spec: &CreateVmSpec) -> Result<VirtualMachine> {
        let mut state = self.state.lock().unwrap();
        if state.vms.values().any(|v| v.vm.name == spec.vm_name) {
            return Err(Error::AlreadyExists(format!(
                "a machine named '{}' already exists",
                spec.vm_name
            )));
        }
        let id = uuid::Uuid::now_v7().to_string();
        let vm = VirtualMachine {
            id: id.clone(),
            name: spec.vm_name.clone(),
            state: VmState::PoweredOff,
            os_type: spec.os_type.clone(),
            memory_mb: spec.memory_mb,
            cpus: spec.cpus,
            firmware: spec.firmware.unwrap_or_default(),
            nics: Vec::new(),
            storage_controllers: HashMap::new(),
            snapshots: None,
            current_snapshot: None,
            group_paths: Vec::new(),
        };
        state.vms.insert(id, FakeVm { vm: vm.clone(), disks: Vec::new() });
        Ok(vm)
    }

    async fn start_vm(&self, id: &str, _headless: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_start {
            state.fail_next_start = false;
            return Err(Error::Busy(format!("machine '{id}' is already locked for a session")));
        }
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        if !entry.vm.state.can_start() {
            return Err(Error::InvalidState(format!(
                "machine '{id}' is not in a startable state ({:?})",
                entry.vm.state
            )));
        }
        entry.vm.state = VmState::Running;
        Ok(())
    }

    async fn stop_vm(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        if entry.vm.state != VmState::Running && entry.vm.state != VmState::Paused {
            return Err(Error::InvalidState(format!("machine '{id}' is not currently running")));
        }
        entry.vm.state = if force { VmState::PoweredOff } else { VmState::Stopping };
        if !force {
            entry.vm.state = VmState::PoweredOff;
        }
        Ok(())
    }

    async fn delete_vm(&self, id: &str, _delete_files: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let vm_state = state.vms.get(&found_id).unwrap().vm.state;
        if !vm_state.can_delete() {
            return Err(Error::InvalidState(format!(
                "machine '{id}' cannot be deleted while {:?}",
                vm_state
            )));
        }
        state.vms.remove(&found_id);
        Ok(())
    }

    async fn clone_vm(
        &self,
        source_id: &str,
        new_name: &str,
        _mode: CloneMode,
        _snapshot_name: Option<&str>,
    ) -> Result<VirtualMachine> {
        let mut state = self.state.lock().unwrap();
        let source = Self::find(&state, source_id)
            .ok_or_else(|| Error::NotFound(format!("no such machine '{source_id}'")))?
            .vm
            .clone();
        if state.vms.values().any(|v| v.vm.name == new_name) {
            return Err(Error::AlreadyExists(format!("a machine named '{new_name}' already exists")));
        }
        let id = uuid::Uuid::now_v7().to_string();
        let mut cloned = source;
        cloned.id = id.clone();
        cloned.name = new_name.to_string();
        cloned.state = VmState::PoweredOff;
        state.vms.insert(id, FakeVm { vm: cloned.clone(), disks: Vec::new() });
        Ok(cloned)
    }

    async fn control_vm(&self, id: &str, verb: ControlVerb) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        match verb {
            ControlVerb::Pause => entry.vm.state = VmState::Paused,
            ControlVerb::Resume => entry.vm.state = VmState::Running,
            ControlVerb::Reset | ControlVerb::AcpiPowerButton | ControlVerb::PowerOff => {
                if entry.vm.state != VmState::Running && entry.vm.state != VmState::Paused {
                    return Err(Error::InvalidState(format!("machine '{id}' is not currently running")));
                }
                if matches!(verb, ControlVerb::PowerOff | ControlVerb::AcpiPowerButton) {
                    entry.vm.state = VmState::PoweredOff;
                }
            }
        }
        Ok(())
    }

    async fn modify_vm(&self, id: &str, patch: &VmPatch) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        if let Some(mem) = patch.memory_mb {
            entry.vm.memory_mb = mem;
        }
        if let Some(cpus) = patch.cpus {
            entry.vm.cpus = cpus;
        }
        if let Some(fw) = patch.firmware {
            entry.vm.firmware = fw;
        }
        Ok(())
    }

    async fn configure_adapter(&self, id: &str, slot: u8, patch: &NicPatch) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        if let Some(nic) = entry.vm.nics.iter_mut().find(|n| n.slot == slot) {
            if let Some(mode) = patch.mode {
                nic.mode = mode;
            }
            if let Some(at) = patch.adapter_type {
                nic.adapter_type = at;
            }
            if let Some(c) = patch.cable_connected {
                nic.cable_connected = c;
            }
            if let Some(mac) = &patch.mac {
                nic.mac = mac.clone();
            }
            if let Some(target) = &patch.attachment_target {
                nic.attachment_target = Some(target.clone());
            }
        } else {
            entry.vm.nics.push(Nic {
                slot,
                enabled: true,
                mode: patch.mode.unwrap_or(NicMode::None),
                adapter_type: patch.adapter_type.unwrap_or(AdapterType::Am79C973),
                mac: patch.mac.clone().unwrap_or_else(|| "080027000000".into()),
                cable_connected: patch.cable_connected.unwrap_or(true),
                attachment_target: patch.attachment_target.clone(),
                port_forwards: Vec::new(),
            });
        }
        Ok(())
    }

    async fn list_adapters(&self, id: &str) -> Result<Vec<Nic>> {
        Ok(self.show_vm_info(id).await?.nics)
    }

    async fn add_port_forwarding(&self, id: &str, slot: u8, rule: &PortForward) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        let nic = entry
            .vm
            .nics
            .iter_mut()
            .find(|n| n.slot == slot)
            .ok_or_else(|| Error::NotFound(format!("no NIC at slot {slot}")))?;
        if !nic.mode.allows_port_forwards() {
            return Err(Error::InvalidState(format!(
                "NIC {slot} mode {:?} does not support port forwarding",
                nic.mode
            )));
        }
        if nic.port_forwards.iter().any(|p| p.name == rule.name) {
            return Err(Error::AlreadyExists(format!("port forward '{}' already exists", rule.name)));
        }
        nic.port_forwards.push(rule.clone());
        Ok(())
    }

    async fn remove_port_forwarding(&self, id: &str, slot: u8, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        let nic = entry
            .vm
            .nics
            .iter_mut()
            .find(|n| n.slot == slot)
            .ok_or_else(|| Error::NotFound(format!("no NIC at slot {slot}")))?;
        let before = nic.port_forwards.len();
        nic.port_forwards.retain(|p| p.name != name);
        if nic.port_forwards.len() == before {
            return Err(Error::NotFound(format!("port forward '{name}' not found")));
        }
        Ok(())
    }

    async fn list_port_forwarding(&self, id: &str, slot: u8) -> Result<Vec<PortForward>> {
        let state = self.state.lock().unwrap();
        let found = Self::find(&state, id).ok_or_else(|| Error::NotFound(format!("no such machine '{id}'")))?;
        Ok(found
            .vm
            .nics
            .iter()
            .find(|n| n.slot == slot)
            .map(|n| n.port_forwards.clone())
            .unwrap_or_default())
    }

    async fn set_bandwidth_limit(&self, _id: &str, _slot: u8, _limit_kbps: Option<u32>) -> Result<()> {
        Ok(())
    }

    async fn set_promiscuous_mode(&self, _id: &str, _slot: u8, _mode: &str) -> Result<()> {
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<HostOnlyNetwork>> {
        let state = self.state.lock().unwrap();
        Ok(state.networks.values().cloned().collect())
    }

    async fn create_network(&self, spec: &HostOnlyNetworkSpec) -> Result<HostOnlyNetwork> {
        let mut state = self.state.lock().unwrap();
        if state.networks.contains_key(&spec.name) {
            return Err(Error::AlreadyExists(format!("network '{}' already exists", spec.name)));
        }
        let net = HostOnlyNetwork {
            name: spec.name.clone(),
            ip: spec.ip.clone(),
            netmask: spec.netmask.clone(),
            dhcp_enabled: spec.dhcp_enabled,
            dhcp_range: None,
        };
        state.networks.insert(spec.name.clone(), net.clone());
        Ok(net)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("no such network '{name}'")))
    }

    async fn list_controllers(&self, id: &str) -> Result<Vec<StorageController>> {
        Ok(self.show_vm_info(id).await?.storage_controllers.into_values().collect())
    }

    async fn create_controller(&self, id: &str, spec: &StorageControllerSpec) -> Result<StorageController> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        if entry.vm.storage_controllers.contains_key(&spec.name) {
            return Err(Error::AlreadyExists(format!("controller '{}' already exists", spec.name)));
        }
        let controller = StorageController {
            name: spec.name.clone(),
            kind: spec.kind,
            port_count: spec.port_count.unwrap_or(2),
            bootable: spec.bootable.unwrap_or(true),
            use_host_io_cache: spec.use_host_io_cache.unwrap_or(false),
            attachments: Vec::new(),
        };
        entry.vm.storage_controllers.insert(spec.name.clone(), controller.clone());
        Ok(controller)
    }

    async fn remove_controller(&self, id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        entry
            .vm
            .storage_controllers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("no such controller '{name}'")))
    }

    async fn list_disks(&self, id: &str) -> Result<Vec<DiskAttachment>> {
        Ok(self
            .show_vm_info(id)
            .await?
            .storage_controllers
            .into_values()
            .flat_map(|c| c.attachments)
            .collect())
    }

    async fn create_disk(&self, spec: &CreateDiskSpec) -> Result<String> {
        let _ = &spec.parent;
        Ok(spec.path.clone())
    }

    async fn attach_disk(&self, id: &str, spec: &AttachDiskSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        let controller = entry
            .vm
            .storage_controllers
            .get_mut(&spec.controller)
            .ok_or_else(|| Error::NotFound(format!("no such controller '{}'", spec.controller)))?;
        if controller
            .attachments
            .iter()
            .any(|a| a.port == spec.port && a.device == spec.device)
        {
            return Err(Error::AlreadyExists(format!(
                "port {} device {} already has an attachment",
                spec.port, spec.device
            )));
        }
        controller.attachments.push(DiskAttachment {
            controller_name: spec.controller.clone(),
            port: spec.port,
            device: spec.device,
            medium_path: spec.medium_path.clone(),
            medium_type: spec.medium_type,
            read_only: spec.read_only,
        });
        entry.disks.push((spec.medium_path.clone(), 0));
        Ok(())
    }

    async fn detach_disk(&self, id: &str, controller: &str, port: u32, device: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        let ctrl = entry
            .vm
            .storage_controllers
            .get_mut(controller)
            .ok_or_else(|| Error::NotFound(format!("no such controller '{controller}'")))?;
        let before = ctrl.attachments.len();
        ctrl.attachments.retain(|a| !(a.port == port && a.device == device));
        if ctrl.attachments.len() == before {
            return Err(Error::NotFound(format!("no attachment at port {port} device {device}")));
        }
        Ok(())
    }

    async fn mount_iso(&self, id: &str, controller: &str, port: u32, device: u32, iso_path: &str) -> Result<()> {
        self.attach_disk(
            id,
            &AttachDiskSpec {
                controller: controller.to_string(),
                port,
                device,
                medium_path: iso_path.to_string(),
                medium_type: MediumType::Dvd,
                read_only: true,
            },
        )
        .await
    }

    async fn unmount_iso(&self, id: &str, controller: &str, port: u32, device: u32) -> Result<()> {
        self.detach_disk(id, controller, port, device).await
    }

    async fn resize_disk(&self, _path: &str, _size_gb: u64) -> Result<()> {
        Ok(())
    }

    async fn clone_disk(&self, _source_path: &str, dest_path: &str) -> Result<String> {
        Ok(dest_path.to_string())
    }

    async fn snapshot_take(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        include_ram: bool,
    ) -> Result<Snapshot> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        if let Some(root) = &entry.vm.snapshots {
            if root.find_by_name(name).is_some() {
                return Err(Error::AlreadyExists(format!("snapshot '{name}' already exists")));
            }
        }
        let snap = Snapshot {
            id: uuid::Uuid::now_v7().to_string(),
            name: name.to_string(),
            description: description.unwrap_or_default().to_string(),
            parent_id: entry.vm.current_snapshot.clone(),
            taken_at: Self::now_rfc3339(),
            includes_ram: include_ram,
            children: Vec::new(),
        };
        match &mut entry.vm.snapshots {
            None => entry.vm.snapshots = Some(snap.clone()),
            Some(root) => {
                if let Some(current_name) = &entry.vm.current_snapshot {
                    if let Some(parent) = root.find_by_name_mut(current_name) {
                        parent.children.push(snap.clone());
                    } else {
                        root.children.push(snap.clone());
                    }
                } else {
                    root.children.push(snap.clone());
                }
            }
        }
        entry.vm.current_snapshot = Some(name.to_string());
        Ok(snap)
    }

    async fn snapshot_restore(&self, id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        let exists = entry
            .vm
            .snapshots
            .as_ref()
            .map(|root| root.find_by_name(name).is_some())
            .unwrap_or(false);
        if !exists {
            return Err(Error::NotFound(format!("no such snapshot '{name}'")));
        }
        entry.vm.current_snapshot = Some(name.to_string());
        entry.vm.state = VmState::PoweredOff;
        Ok(())
    }

    async fn snapshot_delete(&self, id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let found_id = Self::find_id(&state, id)?;
        let entry = state.vms.get_mut(&found_id).unwrap();
        fn remove_named(node: &mut Snapshot, name: &str) -> bool {
            if let Some(pos) = node.children.iter().position(|c| c.name == name) {
                node.children.remove(pos);
                return true;
            }
            node.children.iter_mut().any(|c| remove_named(c, name))
        }
        match &mut entry.vm.snapshots {
            Some(root) if root.name == name => {
                entry.vm.snapshots = None;
            }
            Some(root) => {
                if !remove_named(root, name) {
                    return Err(Error::NotFound(format!("no such snapshot '{name}'")));
                }
            }
            None => return Err(Error::NotFound(format!("no such snapshot '{name}'"))),
        }
        if entry.vm.current_snapshot.as_deref() == Some(name) {
            entry.vm.current_snapshot = None;
        }
        Ok(())
    }

    async fn snapshot_list(&self, id: &str) -> Result<(Option<Snapshot>, Option<String>)> {
        let state = self.state.lock().unwrap();
        let found = Self::find(&state, id).ok_or_else(|| Error::NotFound(format!("no such machine '{id}'")))?;
        Ok((found.vm.snapshots.clone(), found.vm.current_snapshot.clone()))
    }

    async fn host_info(&self) -> Result<HostInfo> {
        Ok(HostInfo {
            os: std::env::consts::OS.to_string(),
            cpu_count: 4,
            memory_total_mb: 16384,
            vbox_version: "7.0.0_FAKE".to_string(),
        })
    }

    async fn vbox_version(&self) -> Result<String> {
        Ok("7.0.0_FAKE".to_string())
    }

    async fn list_os_types(&self) -> Result<Vec<OsTypeInfo>> {
        Ok(vec![
            OsTypeInfo { id: "Ubuntu_64".into(), description: "Ubuntu (64-bit)".into(), is_64_bit: true },
            OsTypeInfo { id: "Windows11_64".into(), description: "Windows 11 (64-bit)".into(), is_64_bit: true },
        ])
    }

    async fn metrics_query(&self, id: &str) -> Result<VmMetrics> {
        let state = self.state.lock().unwrap();
        Self::find_id(&state, id)?;
        Ok(VmMetrics {
            cpu_pct: 1.5,
            memory_used_mb: 512,
            memory_balloon_mb: 0,
            disk_read_bps: 0,
            disk_write_bps: 0,
            net_rx_bps: 0,
            net_tx_bps: 0,
        })
    }

    async fn screenshot(&self, id: &str, width: Option<u32>, height: Option<u32>) -> Result<Screenshot> {
        let state = self.state.lock().unwrap();
        Self::find_id(&state, id)?;
        Ok(Screenshot {
            png_base64: String::new(),
            width: width.unwrap_or(800),
            height: height.unwrap_or(600),
            taken_at: Self::now_rfc3339(),
        })
    }

    async fn export_vm(&self, id: &str, path: &str, format: BackupFormat) -> Result<Backup> {
        let state = self.state.lock().unwrap();
        Self::find_id(&state, id)?;
        Ok(Backup {
            id: uuid::Uuid::now_v7().to_string(),
            vm_name: id.to_string(),
            created_at: Self::now_rfc3339(),
            format,
            path: path.to_string(),
            metadata: serde_json::Value::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> CreateVmSpec {
        CreateVmSpec {
            vm_name: name.to_string(),
            os_type: "Ubuntu_64".to_string(),
            memory_mb: 2048,
            cpus: 2,
            disk_size_gb: None,
            firmware: None,
            chipset: None,
        }
    }

    #[tokio::test]
    async fn create_then_start_then_stop() {
        let adapter = FakeAdapter::new();
        let vm = adapter.create_vm(&spec("t1")).await.unwrap();
        assert_eq!(vm.state, VmState::PoweredOff);
        adapter.start_vm(&vm.id, true).await.unwrap();
        assert_eq!(adapter.show_vm_info(&vm.id).await.unwrap().state, VmState::Running);
        adapter.stop_vm(&vm.id, true).await.unwrap();
        assert_eq!(adapter.show_vm_info(&vm.id).await.unwrap().state, VmState::PoweredOff);
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let adapter = FakeAdapter::new();
        adapter.create_vm(&spec("dup")).await.unwrap();
        let err = adapter.create_vm(&spec("dup")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn delete_running_vm_rejected() {
        let adapter = FakeAdapter::new();
        let vm = adapter.create_vm(&spec("busy-vm")).await.unwrap();
        adapter.start_vm(&vm.id, true).await.unwrap();
        let err = adapter.delete_vm(&vm.id, true).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let adapter = FakeAdapter::new();
        let vm = adapter.create_vm(&spec("snap-vm")).await.unwrap();
        adapter.snapshot_take(&vm.id, "base", None, false).await.unwrap();
        let (tree, current) = adapter.snapshot_list(&vm.id).await.unwrap();
        assert!(tree.is_some());
        assert_eq!(current.as_deref(), Some("base"));
        adapter.snapshot_restore(&vm.id, "base").await.unwrap();
        adapter.snapshot_delete(&vm.id, "base").await.unwrap();
        let (tree, current) = adapter.snapshot_list(&vm.id).await.unwrap();
        assert!(tree.is_none());
        assert!(current.is_none());
    }

    #[tokio::test]
    async fn fail_next_start_simulates_busy() {
        let adapter = FakeAdapter::new();
        let vm = adapter.create_vm(&spec("lockable")).await.unwrap();
        adapter.fail_next_start();
        let err = adapter.start_vm(&vm.id, true).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);
        adapter.start_vm(&vm.id, true).await.unwrap();
    }
}
