//! `system_management` (spec §4.G.5).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::context::AppContext;
use crate::dispatch::{parse_action, HandlerOutput};
use crate::error::{Error, Result};
use crate::locks::LockMode;
use crate::model::VmState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum SystemAction {
    HostInfo,
    VboxVersion,
    Ostypes,
    Metrics {
        vm_name: String,
        sample_window_ms: Option<u64>,
    },
    Screenshot {
        vm_name: String,
        width: Option<u32>,
        height: Option<u32>,
    },
}

pub async fn dispatch(ctx: &Arc<AppContext>, args: serde_json::Value) -> Result<HandlerOutput> {
    let action: SystemAction = parse_action(args)?;
    match action {
        SystemAction::HostInfo => {
            let info = ctx.adapter.host_info().await?;
            Ok(HandlerOutput::immediate(json!(info)))
        }
        SystemAction::VboxVersion => {
            let version = ctx.adapter.vbox_version().await?;
            Ok(HandlerOutput::immediate(json!({"version": version})))
        }
        SystemAction::Ostypes => {
            let types = ctx.adapter.list_os_types().await?;
            Ok(HandlerOutput::immediate(json!(types)))
        }
        SystemAction::Metrics { vm_name, sample_window_ms: _ } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Read, ctx.default_timeout()).await?;
            let info = ctx.adapter.show_vm_info(&vm_name).await?;
            if info.state != VmState::Running {
                return Err(Error::InvalidState(format!("VM '{vm_name}' is not running")));
            }
            let metrics = ctx.adapter.metrics_query(&vm_name).await?;
            Ok(HandlerOutput::immediate(json!(metrics)))
        }
        SystemAction::Screenshot { vm_name, width, height } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Read, ctx.default_timeout()).await?;
            let info = ctx.adapter.show_vm_info(&vm_name).await?;
            if info.state != VmState::Running {
                return Err(Error::InvalidState(format!("VM '{vm_name}' is not running")));
            }
            let shot = ctx.adapter.screenshot(&vm_name, width, height).await?;
            Ok(HandlerOutput::immediate(json!(shot)))
        }
    }
}
