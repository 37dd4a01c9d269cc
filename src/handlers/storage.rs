//! `storage_management` (spec §4.G.3).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::adapter::{AttachDiskSpec, CreateDiskSpec, DiskFormat, DiskVariant, StorageControllerSpec};
use crate::context::AppContext;
use crate::dispatch::{parse_action, HandlerOutput};
use crate::error::{Error, Result};
use crate::locks::LockMode;
use crate::model::{ControllerType, MediumType, VmState};

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum StorageAction {
    ListControllers {
        vm_name: String,
    },
    CreateController {
        vm_name: String,
        controller_name: String,
        #[serde(rename = "type")]
        kind: ControllerType,
        port_count: Option<u32>,
        bootable: Option<bool>,
        use_host_io_cache: Option<bool>,
    },
    RemoveController {
        vm_name: String,
        controller_name: String,
    },
    ListDisks {
        vm_name: String,
    },
    CreateDisk {
        path: String,
        size_gb: u64,
        format: DiskFormatArg,
        variant: DiskVariantArg,
        parent: Option<String>,
    },
    AttachDisk {
        vm_name: String,
        disk_path: String,
        controller: String,
        port: u32,
        device: u32,
        medium_type: MediumType,
        #[serde(default)]
        read_only: bool,
    },
    DetachDisk {
        vm_name: String,
        controller: String,
        port: u32,
        device: u32,
    },
    MountIso {
        vm_name: String,
        controller: String,
        port: u32,
        device: u32,
        iso_path: String,
    },
    UnmountIso {
        vm_name: String,
        controller: String,
        port: u32,
        device: u32,
    },
    ResizeDisk {
        path: String,
        size_gb: u64,
    },
    CloneDisk {
        source_path: String,
        dest_path: String,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFormatArg {
    Vdi,
    Vhd,
    Vmdk,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskVariantArg {
    Standard,
    Fixed,
    Split2g,
    Diff,
}

/// Controllers that support hot mount/unmount of removable media while the
/// VM is running (spec §4.G.3: "allowed while VM running iff the
/// controller supports it — SATA/IDE").
fn supports_hot_media(kind: ControllerType) -> bool {
    matches!(kind, ControllerType::Sata | ControllerType::Ide)
}

pub async fn dispatch(ctx: &Arc<AppContext>, args: serde_json::Value) -> Result<HandlerOutput> {
    let action: StorageAction = parse_action(args)?;
    match action {
        StorageAction::ListControllers { vm_name } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Read, ctx.default_timeout()).await?;
            let controllers = ctx.adapter.list_controllers(&vm_name).await?;
            Ok(HandlerOutput::immediate(json!(controllers)))
        }
        StorageAction::CreateController {
            vm_name,
            controller_name,
            kind,
            port_count,
            bootable,
            use_host_io_cache,
        } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            let info = ctx.adapter.show_vm_info(&vm_name).await?;
            if info.state != VmState::PoweredOff {
                return Err(Error::InvalidState(format!("VM '{vm_name}' must be poweredOff to add a controller")));
            }
            let controller = ctx
                .adapter
                .create_controller(
                    &vm_name,
                    &StorageControllerSpec {
                        name: controller_name,
                        kind,
                        port_count,
                        bootable,
                        use_host_io_cache,
                    },
                )
                .await?;
            Ok(HandlerOutput::immediate(json!(controller)))
        }
        StorageAction::RemoveController { vm_name, controller_name } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            ctx.adapter.remove_controller(&vm_name, &controller_name).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name, "controller_name": controller_name})))
        }
        StorageAction::ListDisks { vm_name } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Read, ctx.default_timeout()).await?;
            let disks = ctx.adapter.list_disks(&vm_name).await?;
            Ok(HandlerOutput::immediate(json!(disks)))
        }
        StorageAction::CreateDisk { path, size_gb, format, variant, parent } => {
            if matches!(variant, DiskVariantArg::Diff) && parent.is_none() {
                return Err(Error::Validation("variant 'diff' requires 'parent'".into()));
            }
            if size_gb == 0 {
                return Err(Error::Validation("size_gb must be >= 1".into()));
            }
            let format = match format {
                DiskFormatArg::Vdi => DiskFormat::Vdi,
                DiskFormatArg::Vhd => DiskFormat::Vhd,
                DiskFormatArg::Vmdk => DiskFormat::Vmdk,
            };
            let variant = match variant {
                DiskVariantArg::Standard => DiskVariant::Standard,
                DiskVariantArg::Fixed => DiskVariant::Fixed,
                DiskVariantArg::Split2g => DiskVariant::Split2g,
                DiskVariantArg::Diff => DiskVariant::Diff,
            };
            let created_path = ctx
                .adapter
                .create_disk(&CreateDiskSpec { path, size_gb, format, variant, parent })
                .await?;
            Ok(HandlerOutput::immediate(json!({"path": created_path})))
        }
        StorageAction::AttachDisk {
            vm_name,
            disk_path,
            controller,
            port,
            device,
            medium_type,
            read_only,
        } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            let existing = ctx.adapter.list_disks(&vm_name).await?;
            if existing.iter().any(|d| d.controller_name == controller && d.port == port && d.device == device) {
                return Err(Error::AlreadyExists(format!(
                    "controller '{controller}' port {port} device {device} already has an attachment"
                )));
            }
            ctx.adapter
                .attach_disk(
                    &vm_name,
                    &AttachDiskSpec {
                        controller,
                        port,
                        device,
                        medium_path: disk_path,
                        medium_type,
                        read_only,
                    },
                )
                .await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name})))
        }
        StorageAction::DetachDisk { vm_name, controller, port, device } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            ctx.adapter.detach_disk(&vm_name, &controller, port, device).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name})))
        }
        StorageAction::MountIso { vm_name, controller, port, device, iso_path } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            let info = ctx.adapter.show_vm_info(&vm_name).await?;
            if info.state == VmState::Running {
                let ctrl = info.storage_controllers.get(&controller);
                let hot_ok = ctrl.map(|c| supports_hot_media(c.kind)).unwrap_or(false);
                if !hot_ok {
                    return Err(Error::InvalidState(format!(
                        "controller '{controller}' does not support mounting media while running"
                    )));
                }
            }
            ctx.adapter.mount_iso(&vm_name, &controller, port, device, &iso_path).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name})))
        }
        StorageAction::UnmountIso { vm_name, controller, port, device } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            let info = ctx.adapter.show_vm_info(&vm_name).await?;
            if info.state == VmState::Running {
                let ctrl = info.storage_controllers.get(&controller);
                let hot_ok = ctrl.map(|c| supports_hot_media(c.kind)).unwrap_or(false);
                if !hot_ok {
                    return Err(Error::InvalidState(format!(
                        "controller '{controller}' does not support unmounting media while running"
                    )));
                }
            }
            ctx.adapter.unmount_iso(&vm_name, &controller, port, device).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name})))
        }
        StorageAction::ResizeDisk { path, size_gb } => {
            if size_gb == 0 {
                return Err(Error::Validation("size_gb must be >= 1".into()));
            }
            ctx.adapter.resize_disk(&path, size_gb).await?;
            Ok(HandlerOutput::immediate(json!({"path": path})))
        }
        StorageAction::CloneDisk { source_path, dest_path } => {
            let path = ctx.adapter.clone_disk(&source_path, &dest_path).await?;
            Ok(HandlerOutput::immediate(json!({"path": path})))
        }
    }
}
