//! Scenario S2: take a snapshot, change VM state, restore it, and confirm
//! the original state comes back.

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

async fn poll_job(ctx: &Arc<AppContext>, job_id: &str) -> serde_json::Value {
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

#[tokio::test]
async fn snapshot_create_modify_restore_round_trip() {
    let ctx = test_ctx();

    dispatch(
        &ctx,
        "vm_management",
        json!({"action": "create", "vm_name": "snap-target", "os_type": "Ubuntu_64", "memory_mb": 1024, "cpus": 1}),
    )
    .await;

    let snap = dispatch(
        &ctx,
        "snapshot_management",
        json!({"action": "create", "vm_name": "snap-target", "snapshot_name": "clean-base"}),
    )
    .await;
    assert!(snap.success, "snapshot create failed: {:?}", snap.error);

    // Mutate state after the snapshot: bump memory while poweredOff.
    let modify = dispatch(
        &ctx,
        "vm_management",
        json!({"action": "modify", "vm_name": "snap-target", "patch": {"memory_mb": 4096}}),
    )
    .await;
    assert!(modify.success, "modify failed: {:?}", modify.error);
    let info = dispatch(&ctx, "vm_management", json!({"action": "info", "vm_name": "snap-target"})).await;
    assert_eq!(info.data.unwrap()["memory_mb"], 4096);

    let restore = dispatch(
        &ctx,
        "snapshot_management",
        json!({"action": "restore", "vm_name": "snap-target", "snapshot_name": "clean-base"}),
    )
    .await;
    assert!(restore.success, "restore dispatch failed: {:?}", restore.error);
    let job_id = restore.metadata.job_id.expect("restore is a job");
    let record = poll_job(&ctx, &job_id).await;
    assert_eq!(record["status"], "succeeded", "restore job record: {record:?}");

    let info = dispatch(&ctx, "vm_management", json!({"action": "info", "vm_name": "snap-target"})).await;
    assert_eq!(info.data.unwrap()["current_snapshot"], "clean-base");

    let list = dispatch(&ctx, "snapshot_management", json!({"action": "list", "vm_name": "snap-target"})).await;
    assert!(list.success);
    assert_eq!(list.data.unwrap()["current"], "clean-base");
}

#[tokio::test]
async fn duplicate_snapshot_name_rejected() {
    let ctx = test_ctx();
    dispatch(
        &ctx,
        "vm_management",
        json!({"action": "create", "vm_name": "dup-snap", "os_type": "Ubuntu_64", "memory_mb": 1024, "cpus": 1}),
    )
    .await;
    let first = dispatch(
        &ctx,
        "snapshot_management",
        json!({"action": "create", "vm_name": "dup-snap", "snapshot_name": "base"}),
    )
    .await;
    assert!(first.success);
    let second = dispatch(
        &ctx,
        "snapshot_management",
        json!({"action": "create", "vm_name": "dup-snap", "snapshot_name": "base"}),
    )
    .await;
    assert!(!second.success);
    assert_eq!(second.error.unwrap().kind, virtualization_mcp::error::ErrorKind::AlreadyExists);
}
