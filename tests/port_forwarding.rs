//! Scenario S4: adding a NAT port-forwarding rule succeeds once and is
//! rejected as a duplicate on retry (spec §4.G.2 idempotency table).

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

async fn make_vm_with_nat_adapter(ctx: &Arc<AppContext>, vm_name: &str) {
    dispatch(
        ctx,
        "vm_management",
        json!({"action": "create", "vm_name": vm_name, "os_type": "Ubuntu_64", "memory_mb": 1024, "cpus": 1}),
    )
    .await;
    let configure = dispatch(
        ctx,
        "network_management",
        json!({"action": "configure_adapter", "vm_name": vm_name, "adapter_slot": 1, "mode": "nat"}),
    )
    .await;
    assert!(configure.success, "configure_adapter failed: {:?}", configure.error);
}

#[tokio::test]
async fn add_port_forward_then_reject_duplicate() {
    let ctx = test_ctx();
    make_vm_with_nat_adapter(&ctx, "nat-vm").await;

    let rule = json!({"name": "ssh", "protocol": "tcp", "host_port": 2222, "guest_port": 22});
    let first = dispatch(
        &ctx,
        "network_management",
        json!({"action": "add_port_forwarding", "vm_name": "nat-vm", "adapter_slot": 1, "rule": rule}),
    )
    .await;
    assert!(first.success, "first add_port_forwarding failed: {:?}", first.error);

    let second = dispatch(
        &ctx,
        "network_management",
        json!({"action": "add_port_forwarding", "vm_name": "nat-vm", "adapter_slot": 1, "rule": rule}),
    )
    .await;
    assert!(!second.success, "duplicate port forward should be rejected");
    assert_eq!(second.error.unwrap().kind, virtualization_mcp::error::ErrorKind::AlreadyExists);

    let list = dispatch(
        &ctx,
        "network_management",
        json!({"action": "list_port_forwarding", "vm_name": "nat-vm", "adapter_slot": 1}),
    )
    .await;
    assert!(list.success);
    assert_eq!(list.data.unwrap().as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn port_forward_on_bridged_adapter_is_rejected() {
    let ctx = test_ctx();
    dispatch(
        &ctx,
        "vm_management",
        json!({"action": "create", "vm_name": "bridged-vm", "os_type": "Ubuntu_64", "memory_mb": 1024, "cpus": 1}),
    )
    .await;
    let configure = dispatch(
        &ctx,
        "network_management",
        json!({
            "action": "configure_adapter",
            "vm_name": "bridged-vm",
            "adapter_slot": 1,
            "mode": "bridged",
            "attachment_target": "eth0",
        }),
    )
    .await;
    assert!(configure.success, "configure_adapter failed: {:?}", configure.error);

    let rule = json!({"name": "web", "protocol": "tcp", "host_port": 8080, "guest_port": 80});
    let add = dispatch(
        &ctx,
        "network_management",
        json!({"action": "add_port_forwarding", "vm_name": "bridged-vm", "adapter_slot": 1, "rule": rule}),
    )
    .await;
    assert!(!add.success);
    assert_eq!(add.error.unwrap().kind, virtualization_mcp::error::ErrorKind::InvalidState);
}
