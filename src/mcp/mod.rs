//! The stdio MCP transport (spec §4.H: "interface only" — this crate
//! implements just enough framing to drive the Dispatcher from `serve`).
//!
//! Newline-delimited JSON-RPC 2.0 over stdin/stdout, the same shape the
//! teacher's guest control channel uses for its line-oriented protocol
//! (`backend/control_channel.rs`) before handing bytes off to `serde_json`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::context::AppContext;
use crate::dispatch;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    jsonrpc: &'static str,
    id: Value,
    error: RpcErrorBody,
}

#[derive(Debug, Serialize)]
struct RpcErrorBody {
    code: i32,
    message: String,
}

/// `tools/call` params: `{name: <tool name>, arguments: {...}}`, matching
/// the MCP `CallToolRequest` shape.
#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Run the stdio loop until stdin closes or `shutdown` fires. Every line is
/// one JSON-RPC request; every response is flushed immediately since MCP
/// clients read line-by-line too.
pub async fn serve_stdio(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("mcp stdio loop observed shutdown signal");
                    break;
                }
                continue;
            }
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            debug!("stdin closed, ending mcp stdio loop");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response_json = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(req) => handle_request(&ctx, req).await,
            Err(e) => {
                warn!(error = %e, "failed to parse JSON-RPC request");
                serde_json::to_string(&RpcError {
                    jsonrpc: "2.0",
                    id: Value::Null,
                    error: RpcErrorBody {
                        code: -32700,
                        message: format!("parse error: {e}"),
                    },
                })
                .expect("RpcError always serializes")
            }
        };

        stdout.write_all(response_json.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle_request(ctx: &Arc<AppContext>, req: RpcRequest) -> String {
    match req.method.as_str() {
        "tools/call" => {
            let params: CallToolParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => {
                    return serde_json::to_string(&RpcError {
                        jsonrpc: "2.0",
                        id: req.id,
                        error: RpcErrorBody {
                            code: -32602,
                            message: format!("invalid params: {e}"),
                        },
                    })
                    .expect("RpcError always serializes");
                }
            };
            let response = dispatch::dispatch(ctx, &params.name, params.arguments).await;
            serde_json::to_string(&RpcResponse {
                jsonrpc: "2.0",
                id: req.id,
                result: serde_json::to_value(response).unwrap_or(Value::Null),
            })
            .expect("RpcResponse always serializes")
        }
        "tools/list" => serde_json::to_string(&RpcResponse {
            jsonrpc: "2.0",
            id: req.id,
            result: serde_json::json!({ "tools": dispatch::TOOL_NAMES }),
        })
        .expect("RpcResponse always serializes"),
        other => serde_json::to_string(&RpcError {
            jsonrpc: "2.0",
            id: req.id,
            error: RpcErrorBody {
                code: -32601,
                message: format!("unknown method '{other}'"),
            },
        })
        .expect("RpcError always serializes"),
    }
}
