//! Hot mount/unmount of removable media is only allowed while a VM is
//! running on a controller that supports it (spec §4.G.3: "allowed while VM
//! running iff the controller supports it — SATA/IDE"). `mount_iso` and
//! `unmount_iso` share the same precondition.

use std::sync::Arc;

use serde_json::json;

use virtualization_mcp::adapter::{Adapter, FakeAdapter};
use virtualization_mcp::config::Config;
use virtualization_mcp::context::AppContext;
use virtualization_mcp::dispatch::dispatch;

fn test_ctx() -> Arc<AppContext> {
    let adapter: Arc<dyn Adapter> = Arc::new(FakeAdapter::new());
    AppContext::new(Config::default(), adapter)
}

async fn poll_job_until_terminal(ctx: &Arc<AppContext>, job_id: &str) -> serde_json::Value {
    for _ in 0..200 {
        let resp = dispatch(ctx, "job_get", json!({"job_id": job_id})).await;
        let record = resp.data.unwrap();
        let status = record["status"].as_str().unwrap();
        if status != "queued" && status != "running" {
            return record;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

async fn make_running_vm_with_controller(ctx: &Arc<AppContext>, vm_name: &str, controller_name: &str, kind: &str) {
    dispatch(
        ctx,
        "vm_management",
        json!({"action": "create", "vm_name": vm_name, "os_type": "Ubuntu_64", "memory_mb": 1024, "cpus": 1}),
    )
    .await;
    let create_ctrl = dispatch(
        ctx,
        "storage_management",
        json!({"action": "create_controller", "vm_name": vm_name, "controller_name": controller_name, "type": kind}),
    )
    .await;
    assert!(create_ctrl.success, "create_controller failed: {:?}", create_ctrl.error);

    let start = dispatch(ctx, "vm_management", json!({"action": "start", "vm_name": vm_name})).await;
    let job_id = start.metadata.job_id.clone().expect("start is a job");
    let record = poll_job_until_terminal(ctx, &job_id).await;
    assert_eq!(record["status"], "succeeded");
}

#[tokio::test]
async fn mount_iso_on_usb_while_running_is_rejected() {
    let ctx = test_ctx();
    make_running_vm_with_controller(&ctx, "usb-vm", "usb-ctrl", "usb").await;

    let mount = dispatch(
        &ctx,
        "storage_management",
        json!({"action": "mount_iso", "vm_name": "usb-vm", "controller": "usb-ctrl", "port": 0, "device": 0, "iso_path": "/isos/x.iso"}),
    )
    .await;
    assert!(!mount.success, "mounting on USB while running should be rejected");
    assert_eq!(mount.error.unwrap().kind, virtualization_mcp::error::ErrorKind::InvalidState);
}

#[tokio::test]
async fn unmount_iso_on_usb_while_running_is_rejected() {
    let ctx = test_ctx();
    make_running_vm_with_controller(&ctx, "usb-vm2", "usb-ctrl", "usb").await;

    let unmount = dispatch(
        &ctx,
        "storage_management",
        json!({"action": "unmount_iso", "vm_name": "usb-vm2", "controller": "usb-ctrl", "port": 0, "device": 0}),
    )
    .await;
    assert!(!unmount.success, "unmounting on USB while running should be rejected");
    assert_eq!(unmount.error.unwrap().kind, virtualization_mcp::error::ErrorKind::InvalidState);
}

#[tokio::test]
async fn unmount_iso_on_sata_while_running_is_allowed() {
    let ctx = test_ctx();
    make_running_vm_with_controller(&ctx, "sata-vm", "sata-ctrl", "sata").await;

    let mount = dispatch(
        &ctx,
        "storage_management",
        json!({"action": "mount_iso", "vm_name": "sata-vm", "controller": "sata-ctrl", "port": 0, "device": 0, "iso_path": "/isos/x.iso"}),
    )
    .await;
    assert!(mount.success, "mounting on SATA while running should be allowed: {:?}", mount.error);

    let unmount = dispatch(
        &ctx,
        "storage_management",
        json!({"action": "unmount_iso", "vm_name": "sata-vm", "controller": "sata-ctrl", "port": 0, "device": 0}),
    )
    .await;
    assert!(unmount.success, "unmounting on SATA while running should be allowed: {:?}", unmount.error);
}
