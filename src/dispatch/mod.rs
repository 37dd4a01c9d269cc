//! Tool Registry & Dispatcher (spec §4.F).
//!
//! The Dispatcher is the only place that produces the canonical response
//! envelope. Grounded in the teacher's `daemon.rs::route_request`: a flat
//! match over tool name, each arm delegating to one handler module, with a
//! single place that measures duration and builds the outer shape.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, instrument};

use crate::context::AppContext;
use crate::error::{Error, ErrorKind};
use crate::handlers::{meta, network, snapshot, storage, system, vm};

/// What a handler hands back to the Dispatcher before it's wrapped in the
/// envelope: the `data` payload, and — for actions the spec models as a Job
/// — the id a client polls via `job_get`.
pub struct HandlerOutput {
    pub data: Value,
    pub job_id: Option<String>,
}

impl HandlerOutput {
    pub fn immediate(data: Value) -> Self {
        Self { data, job_id: None }
    }

    pub fn job(job_id: String) -> Self {
        Self {
            data: Value::Null,
            job_id: Some(job_id),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub tool: String,
    pub action: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub metadata: Metadata,
}

/// Every tool registered with the server, mirroring the teacher's explicit
/// startup table rather than decorator-driven registration (spec §9).
pub const TOOL_NAMES: &[&str] = &[
    "vm_management",
    "network_management",
    "storage_management",
    "snapshot_management",
    "system_management",
    "job_get",
    "job_list",
    "job_cancel",
    "session_get",
    "session_end",
];

/// Validate `tool_name` against the registry, extract the `action`
/// discriminator for the envelope, route to the handler, and build the
/// canonical response. Never returns `Err` — every failure mode is folded
/// into `Response.error`.
#[instrument(skip(ctx, args), fields(tool = tool_name))]
pub async fn dispatch(ctx: &Arc<AppContext>, tool_name: &str, args: Value) -> Response {
    let started = Instant::now();
    let action = args
        .get("action")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    if !TOOL_NAMES.contains(&tool_name) {
        return Response {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind: ErrorKind::Validation,
                message: format!("unknown tool '{tool_name}'"),
                details: Some(serde_json::json!({"tool": tool_name})),
            }),
            metadata: Metadata {
                tool: tool_name.to_string(),
                action,
                duration_ms: started.elapsed().as_millis() as u64,
                job_id: None,
            },
        };
    }

    let result = route(ctx, tool_name, &args).await;

    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(output) => Response {
            success: true,
            data: Some(output.data),
            error: None,
            metadata: Metadata {
                tool: tool_name.to_string(),
                action,
                duration_ms,
                job_id: output.job_id,
            },
        },
        Err(err) => {
            if err.kind() == ErrorKind::Internal {
                error!(correlation_id = %uuid::Uuid::now_v7(), error = %err, "internal error in handler");
            }
            Response {
                success: false,
                data: None,
                error: Some(error_body(&err, tool_name, &action)),
                metadata: Metadata {
                    tool: tool_name.to_string(),
                    action,
                    duration_ms,
                    job_id: None,
                },
            }
        }
    }
}

async fn route(ctx: &Arc<AppContext>, tool_name: &str, args: &Value) -> crate::error::Result<HandlerOutput> {
    match tool_name {
        "vm_management" => vm::dispatch(ctx, args.clone()).await,
        "network_management" => network::dispatch(ctx, args.clone()).await,
        "storage_management" => storage::dispatch(ctx, args.clone()).await,
        "snapshot_management" => snapshot::dispatch(ctx, args.clone()).await,
        "system_management" => system::dispatch(ctx, args.clone()).await,
        "job_get" => meta::job_get(ctx, args.clone()).await,
        "job_list" => meta::job_list(ctx).await,
        "job_cancel" => meta::job_cancel(ctx, args.clone()).await,
        "session_get" => meta::session_get(ctx, args.clone()).await,
        "session_end" => meta::session_end(ctx, args.clone()).await,
        _ => unreachable!("tool_name validated against TOOL_NAMES above"),
    }
}

/// Build the client-visible error body, always anchored with which tool and
/// action produced it (spec §7: "handlers may add context... into
/// error.details"), plus the offending field name when the underlying
/// message names one (spec §4.F: "On schema failure... details include the
/// offending field(s)").
fn error_body(err: &Error, tool_name: &str, action: &str) -> ErrorBody {
    let mut details = serde_json::Map::new();
    details.insert("tool".to_string(), Value::String(tool_name.to_string()));
    if !action.is_empty() {
        details.insert("action".to_string(), Value::String(action.to_string()));
    }
    if let Some(field) = extract_offending_field(&err.to_string()) {
        details.insert("field".to_string(), Value::String(field));
    }
    ErrorBody {
        kind: err.kind(),
        message: err.to_string(),
        details: Some(Value::Object(details)),
    }
}

/// Pull a field name out of a `serde_json` schema-failure message (e.g.
/// `missing field \`vm_name\``, `unknown field \`foo\``, `unknown variant
/// \`bogus\``). Returns `None` for error messages that don't name a field.
fn extract_offending_field(message: &str) -> Option<String> {
    for marker in ["missing field `", "unknown field `", "unknown variant `"] {
        let Some(pos) = message.find(marker) else { continue };
        let rest = &message[pos + marker.len()..];
        if let Some(end) = rest.find('`') {
            return Some(rest[..end].to_string());
        }
    }
    None
}

/// Parse `args` into a handler's tagged-union action type. A parse failure
/// (missing `action`, unknown action, wrong field types, unknown fields) is
/// always a `Validation` error, never `Unparseable` — that kind is reserved
/// for malformed VirtualBox output, not malformed client input.
pub fn parse_action<T: serde::de::DeserializeOwned>(args: Value) -> crate::error::Result<T> {
    serde_json::from_value(args).map_err(|e| Error::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_tool_name() {
        assert!(!TOOL_NAMES.contains(&"not_a_real_tool"));
    }

    #[test]
    fn extracts_missing_field_name() {
        let err = Error::Validation("missing field `vm_name` at line 1 column 20".to_string());
        assert_eq!(extract_offending_field(&err.to_string()), Some("vm_name".to_string()));
    }

    #[test]
    fn extracts_unknown_field_name() {
        let err = Error::Validation("unknown field `bogus`, expected one of `vm_name`, `action`".to_string());
        assert_eq!(extract_offending_field(&err.to_string()), Some("bogus".to_string()));
    }

    #[test]
    fn no_field_name_when_message_does_not_name_one() {
        let err = Error::Validation("memory_mb and cpus must be >= 1".to_string());
        assert_eq!(extract_offending_field(&err.to_string()), None);
    }

    #[tokio::test]
    async fn error_details_always_carry_tool_and_action() {
        let ctx = crate::context::AppContext::new(
            crate::config::Config::default(),
            std::sync::Arc::new(crate::adapter::FakeAdapter::new()),
        );
        let resp = dispatch(&ctx, "vm_management", serde_json::json!({"action": "info", "vm_name": "nope"})).await;
        let details = resp.error.unwrap().details.unwrap();
        assert_eq!(details["tool"], "vm_management");
        assert_eq!(details["action"], "info");
    }
}
