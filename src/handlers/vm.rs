//! `vm_management` (spec §4.G.1).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::adapter::{CloneMode, ControlVerb, CreateVmSpec, VmPatch};
use crate::context::AppContext;
use crate::dispatch::{parse_action, HandlerOutput};
use crate::error::{Error, Result};
use crate::jobs::JobStatus;
use crate::locks::LockMode;
use crate::model::{Firmware, VmState};

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum VmAction {
    List,
    Info {
        vm_name: String,
    },
    Create {
        vm_name: String,
        os_type: String,
        memory_mb: u64,
        cpus: u32,
        disk_size_gb: Option<u64>,
        firmware: Option<Firmware>,
        chipset: Option<String>,
    },
    Start {
        vm_name: String,
        #[serde(default = "default_true")]
        headless: bool,
        #[serde(default)]
        gui: bool,
    },
    Stop {
        vm_name: String,
        #[serde(default)]
        force: bool,
    },
    Delete {
        vm_name: String,
        #[serde(default = "default_true")]
        delete_files: bool,
    },
    Clone {
        source_vm: String,
        new_name: String,
        mode: CloneModeArg,
        snapshot_name: Option<String>,
    },
    Reset {
        vm_name: String,
    },
    Pause {
        vm_name: String,
    },
    Resume {
        vm_name: String,
    },
    Modify {
        vm_name: String,
        patch: VmPatchArg,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneModeArg {
    Full,
    Linked,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VmPatchArg {
    pub memory_mb: Option<u64>,
    pub cpus: Option<u32>,
    pub description: Option<String>,
    pub nested_virt: Option<bool>,
    pub paravirt_provider: Option<String>,
    pub firmware: Option<Firmware>,
}

impl From<VmPatchArg> for VmPatch {
    fn from(p: VmPatchArg) -> Self {
        VmPatch {
            memory_mb: p.memory_mb,
            cpus: p.cpus,
            description: p.description,
            nested_virt: p.nested_virt,
            paravirt_provider: p.paravirt_provider,
            firmware: p.firmware,
        }
    }
}

pub async fn dispatch(ctx: &Arc<AppContext>, args: serde_json::Value) -> Result<HandlerOutput> {
    let action: VmAction = parse_action(args)?;
    match action {
        VmAction::List => {
            let vms = ctx.adapter.list_vms().await?;
            Ok(HandlerOutput::immediate(json!(vms)))
        }
        VmAction::Info { vm_name } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Read, ctx.default_timeout()).await?;
            let vm = ctx.adapter.show_vm_info(&vm_name).await?;
            Ok(HandlerOutput::immediate(json!(vm)))
        }
        VmAction::Create {
            vm_name,
            os_type,
            memory_mb,
            cpus,
            disk_size_gb,
            firmware,
            chipset,
        } => {
            if memory_mb == 0 || cpus == 0 {
                return Err(Error::Validation("memory_mb and cpus must be >= 1".into()));
            }
            let vm = ctx
                .adapter
                .create_vm(&CreateVmSpec {
                    vm_name,
                    os_type,
                    memory_mb,
                    cpus,
                    disk_size_gb,
                    firmware,
                    chipset,
                })
                .await?;
            Ok(HandlerOutput::immediate(json!(vm)))
        }
        VmAction::Start { vm_name, headless, gui } => {
            if headless && gui {
                return Err(Error::Validation("headless and gui are mutually exclusive".into()));
            }
            run_as_job(ctx, "vm_management.start", vm_name, LockMode::Write, move |ctx, vm_name| {
                Box::pin(async move {
                    let info = ctx.adapter.show_vm_info(&vm_name).await?;
                    if !info.state.can_start() {
                        return Err(Error::InvalidState(format!(
                            "VM '{vm_name}' is {:?}, cannot start",
                            info.state
                        )));
                    }
                    ctx.adapter.start_vm(&vm_name, !gui).await?;
                    Ok(json!({"vm_name": vm_name, "state": VmState::Running}))
                })
            })
            .await
        }
        VmAction::Stop { vm_name, force } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            let info = ctx.adapter.show_vm_info(&vm_name).await?;
            if info.state != VmState::Running && info.state != VmState::Paused {
                return Err(Error::InvalidState(format!("VM '{vm_name}' is not currently running")));
            }
            let stop_timeout = std::time::Duration::from_secs(ctx.config.graceful_stop_timeout_seconds);
            let fut = ctx.adapter.stop_vm(&vm_name, force);
            if force {
                fut.await?;
            } else {
                tokio::time::timeout(stop_timeout, fut)
                    .await
                    .map_err(|_| Error::Timeout {
                        after_ms: stop_timeout.as_millis() as u64,
                        operation: format!("graceful stop of '{vm_name}'"),
                    })??;
            }
            ctx.pool.close(&vm_name).await;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name})))
        }
        VmAction::Delete { vm_name, delete_files } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            let info = ctx.adapter.show_vm_info(&vm_name).await?;
            if !info.state.can_delete() {
                return Err(Error::InvalidState(format!(
                    "VM '{vm_name}' cannot be deleted while {:?}",
                    info.state
                )));
            }
            ctx.adapter.delete_vm(&vm_name, delete_files).await?;
            ctx.pool.close(&vm_name).await;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name})))
        }
        VmAction::Clone {
            source_vm,
            new_name,
            mode,
            snapshot_name,
        } => {
            let clone_mode = match mode {
                CloneModeArg::Full => CloneMode::Full,
                CloneModeArg::Linked => CloneMode::Linked,
            };
            if clone_mode == CloneMode::Linked && snapshot_name.is_none() {
                let _pre = ctx.locks.acquire(&source_vm, LockMode::Write, ctx.default_timeout()).await?;
                ctx.adapter
                    .snapshot_take(&source_vm, &format!("linked-clone-base-{new_name}"), None, false)
                    .await?;
            }
            run_as_job(ctx, "vm_management.clone", source_vm, LockMode::Read, move |ctx, source_vm| {
                Box::pin(async move {
                    let vm = ctx
                        .adapter
                        .clone_vm(&source_vm, &new_name, clone_mode, snapshot_name.as_deref())
                        .await?;
                    Ok(json!(vm))
                })
            })
            .await
        }
        VmAction::Reset { vm_name } => control_verb(ctx, vm_name, ControlVerb::Reset, &[VmState::Running]).await,
        VmAction::Pause { vm_name } => control_verb(ctx, vm_name, ControlVerb::Pause, &[VmState::Running]).await,
        VmAction::Resume { vm_name } => control_verb(ctx, vm_name, ControlVerb::Resume, &[VmState::Paused]).await,
        VmAction::Modify { vm_name, patch } => {
            let patch: VmPatch = patch.into();
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            if !patch.is_empty() && !patch.live_safe() {
                let info = ctx.adapter.show_vm_info(&vm_name).await?;
                if info.state != VmState::PoweredOff {
                    return Err(Error::InvalidState(format!(
                        "VM '{vm_name}' must be poweredOff to apply this modification"
                    )));
                }
            }
            ctx.adapter.modify_vm(&vm_name, &patch).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name})))
        }
    }
}

async fn control_verb(
    ctx: &Arc<AppContext>,
    vm_name: String,
    verb: ControlVerb,
    required_states: &[VmState],
) -> Result<HandlerOutput> {
    let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
    let info = ctx.adapter.show_vm_info(&vm_name).await?;
    if !required_states.contains(&info.state) {
        return Err(Error::InvalidState(format!(
            "VM '{vm_name}' is {:?}, requires one of {:?}",
            info.state, required_states
        )));
    }
    ctx.adapter.control_vm(&vm_name, verb).await?;
    Ok(HandlerOutput::immediate(json!({"vm_name": vm_name})))
}

type BoxFut<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = Result<serde_json::Value>> + Send + 'a>>;

/// Submit `body` as a tracked job: acquire the VM lock, run the work,
/// release on completion or cancellation. The lock is held only across the
/// adapter call, never across the job's full lifetime in the registry
/// (spec §5: "must not hold a VM lock across arbitrary sleeps").
async fn run_as_job<F>(
    ctx: &Arc<AppContext>,
    kind: &str,
    vm_name: String,
    mode: LockMode,
    body: F,
) -> Result<HandlerOutput>
where
    F: FnOnce(Arc<AppContext>, String) -> BoxFut<'static> + Send + 'static,
{
    let (job_id, handle) = ctx.jobs.submit(kind).await;
    let ctx_bg = ctx.clone();
    let timeout = ctx.long_timeout();
    tokio::spawn(async move {
        ctx_bg.jobs.mark_running(&job_id).await;
        let guard = match ctx_bg.locks.acquire(&vm_name, mode, timeout).await {
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
        let work = body(ctx_bg.clone(), vm_name);
        let outcome = tokio::time::timeout(timeout, work).await;
        drop(guard);
        match outcome {
            Ok(Ok(value)) => {
                ctx_bg.jobs.complete(&job_id, JobStatus::Succeeded, Some(value), None).await;
            }
            Ok(Err(e)) => {
                ctx_bg
                    .jobs
                    .complete(&job_id, JobStatus::Failed, None, Some(json!({"kind": e.kind(), "message": e.to_string()})))
                    .await;
            }
            Err(_) => {
                ctx_bg
                    .jobs
                    .complete(&job_id, JobStatus::TimedOut, None, Some(json!({"message": "operation timed out"})))
                    .await;
            }
        }
    });
    Ok(HandlerOutput::job(job_id))
}
