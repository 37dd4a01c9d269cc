//! Scenario S1: a VM's full lifecycle through the dispatcher, end to end
//! against the `FakeAdapter` — create, start as a job, poll it to
//! completion, inspect, stop, delete, and confirm it drops out of `list`.

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
        assert!(resp.success, "job_get failed: {:?}", resp.error);
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
async fn full_vm_lifecycle() {
    let ctx = test_ctx();

    let created = dispatch(
        &ctx,
        "vm_management",
        json!({
            "action": "create",
            "vm_name": "lifecycle-vm",
            "os_type": "Ubuntu_64",
            "memory_mb": 2048,
            "cpus": 2,
        }),
    )
    .await;
    assert!(created.success, "create failed: {:?}", created.error);
    assert_eq!(created.metadata.job_id, None, "create is expected to be immediate");
    let vm_name = created.data.unwrap()["name"].as_str().unwrap().to_string();
    assert_eq!(vm_name, "lifecycle-vm");

    let start = dispatch(&ctx, "vm_management", json!({"action": "start", "vm_name": vm_name})).await;
    assert!(start.success, "start failed: {:?}", start.error);
    let job_id = start.metadata.job_id.clone().expect("start is a job");
    let record = poll_job_until_terminal(&ctx, &job_id).await;
    assert_eq!(record["status"], "succeeded");

    let info = dispatch(&ctx, "vm_management", json!({"action": "info", "vm_name": vm_name})).await;
    assert!(info.success, "info failed: {:?}", info.error);
    assert_eq!(info.data.unwrap()["state"], "running");

    let stop = dispatch(&ctx, "vm_management", json!({"action": "stop", "vm_name": vm_name, "force": true})).await;
    assert!(stop.success, "stop failed: {:?}", stop.error);
    assert_eq!(stop.metadata.job_id, None, "stop is immediate, not job-tracked");

    let delete = dispatch(&ctx, "vm_management", json!({"action": "delete", "vm_name": vm_name})).await;
    assert!(delete.success, "delete failed: {:?}", delete.error);

    let list = dispatch(&ctx, "vm_management", json!({"action": "list"})).await;
    assert!(list.success);
    let vms = list.data.unwrap();
    let names: Vec<&str> = vms.as_array().unwrap().iter().map(|v| v["name"].as_str().unwrap()).collect();
    assert!(!names.contains(&vm_name.as_str()));
}

#[tokio::test]
async fn deleting_a_running_vm_is_rejected() {
    let ctx = test_ctx();
    dispatch(
        &ctx,
        "vm_management",
        json!({"action": "create", "vm_name": "guarded", "os_type": "Ubuntu_64", "memory_mb": 1024, "cpus": 1}),
    )
    .await;
    let start = dispatch(&ctx, "vm_management", json!({"action": "start", "vm_name": "guarded"})).await;
    let job_id = start.metadata.job_id.unwrap();
    poll_job_until_terminal(&ctx, &job_id).await;

    let delete = dispatch(&ctx, "vm_management", json!({"action": "delete", "vm_name": "guarded"})).await;
    assert!(!delete.success);
    assert_eq!(delete.error.unwrap().kind, virtualization_mcp::error::ErrorKind::InvalidState);
}
