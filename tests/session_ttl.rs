//! Scenario S6: session bookkeeping through `session_get`/`session_end`
//! dispatch, plus the TTL sweeper reaping an idle session out from under a
//! later `session_get` call.

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

#[tokio::test]
async fn session_get_touches_and_session_end_removes() {
    let ctx = test_ctx();
    let info = ctx.sessions.create(Some("test-client".into())).await;

    let get = dispatch(&ctx, "session_get", json!({"session_id": info.session_id})).await;
    assert!(get.success, "session_get failed: {:?}", get.error);
    assert_eq!(get.data.as_ref().unwrap()["session_id"], info.session_id);

    let end = dispatch(&ctx, "session_end", json!({"session_id": info.session_id})).await;
    assert!(end.success, "session_end failed: {:?}", end.error);

    let after = dispatch(&ctx, "session_get", json!({"session_id": info.session_id})).await;
    assert!(!after.success, "session should be gone after session_end");
    assert_eq!(after.error.unwrap().kind, virtualization_mcp::error::ErrorKind::NotFound);
}

#[tokio::test]
async fn idle_session_is_reaped_by_the_ttl_sweeper() {
    let adapter: Arc<dyn Adapter> = Arc::new(FakeAdapter::new());
    let mut config = Config::default();
    config.session_ttl_seconds = 0;
    let ctx = AppContext::new(config, adapter);

    let info = ctx.sessions.create(None).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    ctx.sessions.spawn_sweeper(Duration::from_millis(5));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let get = dispatch(&ctx, "session_get", json!({"session_id": info.session_id})).await;
    assert!(!get.success, "expired session should have been swept");
    assert_eq!(get.error.unwrap().kind, virtualization_mcp::error::ErrorKind::NotFound);
}

#[tokio::test]
async fn session_get_does_not_extend_ttl() {
    let adapter: Arc<dyn Adapter> = Arc::new(FakeAdapter::new());
    let mut config = Config::default();
    config.session_ttl_seconds = 1;
    let ctx = AppContext::new(config, adapter);

    let info = ctx.sessions.create(None).await;
    ctx.sessions.spawn_sweeper(Duration::from_millis(10));

    // Repeated session_get calls must not count as activity (spec: `get`
    // "does not touch"), so the session is reaped at its original TTL
    // regardless of how often it's polled.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let get = dispatch(&ctx, "session_get", json!({"session_id": info.session_id})).await;
        assert!(get.success, "session_get failed before expiry: {:?}", get.error);
    }

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let after = dispatch(&ctx, "session_get", json!({"session_id": info.session_id})).await;
    assert!(!after.success, "session should have expired despite being repeatedly read via session_get");
}

#[tokio::test]
async fn touch_keeps_session_alive_across_sweeps() {
    let adapter: Arc<dyn Adapter> = Arc::new(FakeAdapter::new());
    let mut config = Config::default();
    config.session_ttl_seconds = 1;
    let ctx = AppContext::new(config, adapter);

    let info = ctx.sessions.create(None).await;
    ctx.sessions.spawn_sweeper(Duration::from_millis(10));

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ctx.sessions.touch(&info.session_id).await.is_ok(), "session should stay alive while actively touched");
    }
}
