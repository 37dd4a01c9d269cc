//! `snapshot_management` (spec §4.G.4).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::context::AppContext;
use crate::dispatch::{parse_action, HandlerOutput};
use crate::error::{Error, Result};
use crate::jobs::JobStatus;
use crate::locks::LockMode;
use crate::model::VmState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum SnapshotAction {
    List {
        vm_name: String,
    },
    Create {
        vm_name: String,
        snapshot_name: String,
        description: Option<String>,
        #[serde(default)]
        include_ram: bool,
    },
    Restore {
        vm_name: String,
        snapshot_name: String,
    },
    Delete {
        vm_name: String,
        snapshot_name: String,
    },
}

pub async fn dispatch(ctx: &Arc<AppContext>, args: serde_json::Value) -> Result<HandlerOutput> {
    let action: SnapshotAction = parse_action(args)?;
    match action {
        SnapshotAction::List { vm_name } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Read, ctx.default_timeout()).await?;
            let (tree, current) = ctx.adapter.snapshot_list(&vm_name).await?;
            Ok(HandlerOutput::immediate(json!({"tree": tree, "current": current})))
        }
        SnapshotAction::Create { vm_name, snapshot_name, description, include_ram } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            let info = ctx.adapter.show_vm_info(&vm_name).await?;
            if include_ram && info.state != VmState::Running && info.state != VmState::Paused {
                return Err(Error::Validation(
                    "include_ram is only meaningful when the VM is running or paused".into(),
                ));
            }
            let (tree, _) = ctx.adapter.snapshot_list(&vm_name).await?;
            if tree.map(|t| t.find_by_name(&snapshot_name).is_some()).unwrap_or(false) {
                return Err(Error::AlreadyExists(format!("snapshot '{snapshot_name}' already exists")));
            }
            let snap = ctx
                .adapter
                .snapshot_take(&vm_name, &snapshot_name, description.as_deref(), include_ram)
                .await?;
            Ok(HandlerOutput::immediate(json!(snap)))
        }
        SnapshotAction::Restore { vm_name, snapshot_name } => {
            let (job_id, handle) = ctx.jobs.submit("snapshot_management.restore").await;
            let ctx_bg = ctx.clone();
            let timeout = ctx.long_timeout();
            tokio::spawn(async move {
                ctx_bg.jobs.mark_running(&job_id).await;
                let guard = match ctx_bg.locks.acquire(&vm_name, LockMode::Write, timeout).await {
                    Ok(g) => g,
                    Err(e) => {
                        ctx_bg
                            .jobs
                            .complete(&job_id, JobStatus::Failed, None, Some(json!({"message": e.to_string()})))
                            .await;
                        return;
                    }
                };
                if handle.is_cancelled() {
                    ctx_bg.jobs.complete(&job_id, JobStatus::Cancelled, None, None).await;
                    return;
                }
                let outcome: Result<serde_json::Value> = async {
                    let info = ctx_bg.adapter.show_vm_info(&vm_name).await?;
                    if info.state != VmState::PoweredOff {
                        return Err(Error::InvalidState(format!(
                            "VM '{vm_name}' must be poweredOff to restore a snapshot"
                        )));
                    }
                    ctx_bg.adapter.snapshot_restore(&vm_name, &snapshot_name).await?;
                    Ok(json!({"vm_name": vm_name, "snapshot_name": snapshot_name}))
                }
                .await;
                drop(guard);
                match outcome {
                    Ok(v) => ctx_bg.jobs.complete(&job_id, JobStatus::Succeeded, Some(v), None).await,
                    Err(e) => {
                        ctx_bg
                            .jobs
                            .complete(&job_id, JobStatus::Failed, None, Some(json!({"kind": e.kind(), "message": e.to_string()})))
                            .await
                    }
                }
            });
            Ok(HandlerOutput::job(job_id))
        }
        SnapshotAction::Delete { vm_name, snapshot_name } => {
            let (job_id, handle) = ctx.jobs.submit("snapshot_management.delete").await;
            let ctx_bg = ctx.clone();
            let timeout = ctx.long_timeout();
            tokio::spawn(async move {
                ctx_bg.jobs.mark_running(&job_id).await;
                let guard = match ctx_bg.locks.acquire(&vm_name, LockMode::Write, timeout).await {
                    Ok(g) => g,
                    Err(e) => {
                        ctx_bg
                            .jobs
                            .complete(&job_id, JobStatus::Failed, None, Some(json!({"message": e.to_string()})))
                            .await;
                        return;
                    }
                };
                if handle.is_cancelled() {
                    ctx_bg.jobs.complete(&job_id, JobStatus::Cancelled, None, None).await;
                    return;
                }
                handle.report_progress(10.0).await;
                let outcome = ctx_bg.adapter.snapshot_delete(&vm_name, &snapshot_name).await;
                drop(guard);
                match outcome {
                    Ok(()) => {
                        ctx_bg
                            .jobs
                            .complete(&job_id, JobStatus::Succeeded, Some(json!({"vm_name": vm_name, "snapshot_name": snapshot_name})), None)
                            .await
                    }
                    Err(e) => {
                        ctx_bg
                            .jobs
                            .complete(&job_id, JobStatus::Failed, None, Some(json!({"kind": e.kind(), "message": e.to_string()})))
                            .await
                    }
                }
            });
            Ok(HandlerOutput::job(job_id))
        }
    }
}
