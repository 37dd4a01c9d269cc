//! Meta-tools: `job_get`, `job_list`, `job_cancel`, `session_get`,
//! `session_end` (SPEC_FULL.md §4.F supplement). These share the same
//! envelope as the five portmanteaus but each only has one action, so
//! there's no `action` tag to parse — the whole payload is the argument.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::context::AppContext;
use crate::dispatch::{parse_action, HandlerOutput};
use crate::error::Result;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobIdArg {
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionIdArg {
    session_id: String,
}

pub async fn job_get(ctx: &Arc<AppContext>, args: serde_json::Value) -> Result<HandlerOutput> {
    let arg: JobIdArg = parse_action(args)?;
    let record = ctx.jobs.get(&arg.job_id).await?;
    Ok(HandlerOutput::immediate(json!(record)))
}

pub async fn job_list(ctx: &Arc<AppContext>) -> Result<HandlerOutput> {
    let records = ctx.jobs.list().await;
    Ok(HandlerOutput::immediate(json!(records)))
}

pub async fn job_cancel(ctx: &Arc<AppContext>, args: serde_json::Value) -> Result<HandlerOutput> {
    let arg: JobIdArg = parse_action(args)?;
    let record = ctx.jobs.cancel(&arg.job_id).await?;
    Ok(HandlerOutput::immediate(json!(record)))
}

pub async fn session_get(ctx: &Arc<AppContext>, args: serde_json::Value) -> Result<HandlerOutput> {
    let arg: SessionIdArg = parse_action(args)?;
    let info = ctx.sessions.get(&arg.session_id).await?;
    Ok(HandlerOutput::immediate(json!(info)))
}

pub async fn session_end(ctx: &Arc<AppContext>, args: serde_json::Value) -> Result<HandlerOutput> {
    let arg: SessionIdArg = parse_action(args)?;
    ctx.sessions.end(&arg.session_id).await?;
    Ok(HandlerOutput::immediate(json!({"session_id": arg.session_id})))
}
