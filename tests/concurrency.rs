//! Scenario S3: per-VM operations serialize against each other while
//! operations on distinct VMs proceed in parallel (spec §5.1).

use std::sync::Arc;
use std::time::Duration;

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
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn two_writers_on_the_same_vm_do_not_corrupt_state() {
    let ctx = test_ctx();
    dispatch(
        &ctx,
        "vm_management",
        json!({"action": "create", "vm_name": "contended", "os_type": "Ubuntu_64", "memory_mb": 1024, "cpus": 1}),
    )
    .await;

    let ctx_a = ctx.clone();
    let ctx_b = ctx.clone();
    let a = tokio::spawn(async move {
        dispatch(
            &ctx_a,
            "vm_management",
            json!({"action": "modify", "vm_name": "contended", "patch": {"memory_mb": 2048}}),
        )
        .await
    });
    let b = tokio::spawn(async move {
        dispatch(
            &ctx_b,
            "vm_management",
            json!({"action": "modify", "vm_name": "contended", "patch": {"cpus": 4}}),
        )
        .await
    });
    let (ra, rb) = tokio::join!(a, b);
    assert!(ra.unwrap().success);
    assert!(rb.unwrap().success);

    let info = dispatch(&ctx, "vm_management", json!({"action": "info", "vm_name": "contended"})).await;
    let data = info.data.unwrap();
    assert_eq!(data["memory_mb"], 2048);
    assert_eq!(data["cpus"], 4);
}

#[tokio::test]
async fn independent_vms_start_concurrently() {
    let ctx = test_ctx();
    for name in ["vm-x", "vm-y"] {
        dispatch(
            &ctx,
            "vm_management",
            json!({"action": "create", "vm_name": name, "os_type": "Ubuntu_64", "memory_mb": 512, "cpus": 1}),
        )
        .await;
    }

    let ctx_x = ctx.clone();
    let ctx_y = ctx.clone();
    let started = tokio::time::Instant::now();
    let (start_x, start_y) = tokio::join!(
        dispatch(&ctx_x, "vm_management", json!({"action": "start", "vm_name": "vm-x"})),
        dispatch(&ctx_y, "vm_management", json!({"action": "start", "vm_name": "vm-y"})),
    );
    let dispatch_elapsed = started.elapsed();
    assert!(dispatch_elapsed < Duration::from_secs(1), "submitting two independent jobs should not block on each other");

    let job_x = start_x.metadata.job_id.unwrap();
    let job_y = start_y.metadata.job_id.unwrap();
    let (rec_x, rec_y) = tokio::join!(poll_job(&ctx, &job_x), poll_job(&ctx, &job_y));
    assert_eq!(rec_x["status"], "succeeded");
    assert_eq!(rec_y["status"], "succeeded");
}
