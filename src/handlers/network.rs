//! `network_management` (spec §4.G.2).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::adapter::{HostOnlyNetworkSpec, NicPatch};
use crate::context::AppContext;
use crate::dispatch::{parse_action, HandlerOutput};
use crate::error::{Error, Result};
use crate::locks::LockMode;
use crate::model::{AdapterType, NicMode, PortForward, VmState};

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum NetworkAction {
    ListNetworks,
    CreateNetwork {
        name: String,
        ip: String,
        netmask: String,
        #[serde(default)]
        dhcp_enabled: bool,
    },
    RemoveNetwork {
        name: String,
    },
    ListAdapters {
        vm_name: String,
    },
    ConfigureAdapter {
        vm_name: String,
        adapter_slot: u8,
        mode: Option<NicMode>,
        adapter_type: Option<AdapterType>,
        cable_connected: Option<bool>,
        mac: Option<String>,
        attachment_target: Option<String>,
    },
    AddPortForwarding {
        vm_name: String,
        adapter_slot: u8,
        rule: PortForward,
    },
    RemovePortForwarding {
        vm_name: String,
        adapter_slot: u8,
        name: String,
    },
    ListPortForwarding {
        vm_name: String,
        adapter_slot: u8,
    },
    SetBandwidthLimit {
        vm_name: String,
        adapter_slot: u8,
        limit_kbps: Option<u32>,
    },
    SetPromiscuousMode {
        vm_name: String,
        adapter_slot: u8,
        mode: String,
    },
}

fn validate_slot(slot: u8) -> Result<()> {
    if !(1..=8).contains(&slot) {
        return Err(Error::Validation(format!("adapter_slot must be in 1..8, got {slot}")));
    }
    Ok(())
}

pub async fn dispatch(ctx: &Arc<AppContext>, args: serde_json::Value) -> Result<HandlerOutput> {
    let action: NetworkAction = parse_action(args)?;
    match action {
        NetworkAction::ListNetworks => {
            let nets = ctx.adapter.list_networks().await?;
            Ok(HandlerOutput::immediate(json!(nets)))
        }
        NetworkAction::CreateNetwork { name, ip, netmask, dhcp_enabled } => {
            if let Some(existing) = ctx.adapter.list_networks().await?.into_iter().find(|n| n.name == name) {
                if existing.ip != ip || existing.netmask != netmask {
                    return Err(Error::AlreadyExists(format!(
                        "network '{name}' already exists with different settings"
                    )));
                }
                // Exact match: creating a network is idempotent (spec §4.G.2),
                // so hand back the existing one instead of re-calling the
                // adapter, which would reject the duplicate name outright.
                return Ok(HandlerOutput::immediate(json!(existing)));
            }
            let net = ctx
                .adapter
                .create_network(&HostOnlyNetworkSpec { name, ip, netmask, dhcp_enabled })
                .await?;
            Ok(HandlerOutput::immediate(json!(net)))
        }
        NetworkAction::RemoveNetwork { name } => {
            ctx.adapter.remove_network(&name).await?;
            Ok(HandlerOutput::immediate(json!({"name": name})))
        }
        NetworkAction::ListAdapters { vm_name } => {
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Read, ctx.default_timeout()).await?;
            let nics = ctx.adapter.list_adapters(&vm_name).await?;
            Ok(HandlerOutput::immediate(json!(nics)))
        }
        NetworkAction::ConfigureAdapter {
            vm_name,
            adapter_slot,
            mode,
            adapter_type,
            cable_connected,
            mac,
            attachment_target,
        } => {
            validate_slot(adapter_slot)?;
            if let Some(m) = mode {
                if m.requires_attachment_target() && attachment_target.is_none() {
                    return Err(Error::Validation(format!(
                        "mode {m:?} requires attachment_target"
                    )));
                }
            }
            let patch = NicPatch {
                mode,
                adapter_type,
                cable_connected,
                mac,
                attachment_target,
            };
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            let info = ctx.adapter.show_vm_info(&vm_name).await?;
            if info.state == VmState::Running && !patch.live_safe() {
                return Err(Error::InvalidState(format!(
                    "VM '{vm_name}' is running; only cable state and bandwidth limit can change live"
                )));
            }
            ctx.adapter.configure_adapter(&vm_name, adapter_slot, &patch).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name, "adapter_slot": adapter_slot})))
        }
        NetworkAction::AddPortForwarding { vm_name, adapter_slot, rule } => {
            validate_slot(adapter_slot)?;
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            let nics = ctx.adapter.list_adapters(&vm_name).await?;
            let nic = nics
                .iter()
                .find(|n| n.slot == adapter_slot)
                .ok_or_else(|| Error::NotFound(format!("no adapter at slot {adapter_slot}")))?;
            if !nic.mode.allows_port_forwards() {
                return Err(Error::InvalidState(format!(
                    "adapter {adapter_slot} mode {:?} does not support port forwarding",
                    nic.mode
                )));
            }
            if nic.port_forwards.iter().any(|p| p.name == rule.name) {
                return Err(Error::AlreadyExists(format!("port forward '{}' already exists", rule.name)));
            }
            ctx.adapter.add_port_forwarding(&vm_name, adapter_slot, &rule).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name, "rule": rule})))
        }
        NetworkAction::RemovePortForwarding { vm_name, adapter_slot, name } => {
            validate_slot(adapter_slot)?;
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            ctx.adapter.remove_port_forwarding(&vm_name, adapter_slot, &name).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name, "name": name})))
        }
        NetworkAction::ListPortForwarding { vm_name, adapter_slot } => {
            validate_slot(adapter_slot)?;
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Read, ctx.default_timeout()).await?;
            let rules = ctx.adapter.list_port_forwarding(&vm_name, adapter_slot).await?;
            Ok(HandlerOutput::immediate(json!(rules)))
        }
        NetworkAction::SetBandwidthLimit { vm_name, adapter_slot, limit_kbps } => {
            validate_slot(adapter_slot)?;
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            ctx.adapter.set_bandwidth_limit(&vm_name, adapter_slot, limit_kbps).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name, "adapter_slot": adapter_slot})))
        }
        NetworkAction::SetPromiscuousMode { vm_name, adapter_slot, mode } => {
            validate_slot(adapter_slot)?;
            let _guard = ctx.locks.acquire(&vm_name, LockMode::Write, ctx.default_timeout()).await?;
            ctx.adapter.set_promiscuous_mode(&vm_name, adapter_slot, &mode).await?;
            Ok(HandlerOutput::immediate(json!({"vm_name": vm_name, "adapter_slot": adapter_slot})))
        }
    }
}
