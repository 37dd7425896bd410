//! Line-framed JSON-RPC surface over stdio for external multi-agent hosts.
//!
//! Exposes the tool registry directly, with the same schemas and the same
//! policy and audit trail as the HTTP loop; entries carry `transport: "mcp"`
//! so the two surfaces can be told apart. A policy-blocked call replies with
//! a human-readable text result, never a JSON-RPC error.

use crate::audit::{AuditEntry, AuditEvent};
use crate::error::Result;
use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId, RpcError};
use crate::runtime::router::argument_checks;
use crate::runtime::Runtime;
use crate::tools::ToolContext;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Read requests from stdin until EOF, one JSON-RPC message per line.
pub async fn serve_stdio(runtime: Arc<Runtime>) -> Result<()> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut writer = BufWriter::new(tokio::io::stdout());
    info!("stdio surface ready");

    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            info!("stdin closed, shutting down stdio surface");
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcMessage>(trimmed) {
            Ok(JsonRpcMessage::Request(request)) => {
                Some(handle_request(&runtime, request).await)
            }
            Ok(JsonRpcMessage::Notification(notification)) => {
                debug!(method = %notification.method, "notification");
                None
            }
            Ok(JsonRpcMessage::Response(_)) => {
                warn!("ignoring unexpected response message");
                None
            }
            // No id could be parsed out of the line, so the error reply
            // carries a null id.
            Err(e) => Some(JsonRpcResponse::error(
                RequestId::Null,
                RpcError::parse_error(e.to_string()),
            )),
        };

        if let Some(response) = response {
            let mut out = serde_json::to_string(&response)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
            writer.flush().await?;
        }
    }

    Ok(())
}

async fn handle_request(
    runtime: &Runtime,
    request: JsonRpcRequest<Value>,
) -> JsonRpcResponse<Value> {
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => {
            let snapshot = runtime.snapshot().await;
            JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": snapshot.manifest.app.name,
                        "version": snapshot.manifest.app.version,
                    },
                }),
            )
        }
        "tools/list" => {
            let tools: Vec<Value> = runtime
                .tools
                .definitions()
                .into_iter()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "description": spec.description,
                        "inputSchema": spec.input_schema,
                    })
                })
                .collect();
            JsonRpcResponse::success(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            let params: CallParams = match request
                .params
                .ok_or_else(|| RpcError::invalid_params("missing params"))
                .and_then(|p| {
                    serde_json::from_value(p).map_err(|e| RpcError::invalid_params(e.to_string()))
                }) {
                Ok(params) => params,
                Err(error) => return JsonRpcResponse::error(id, error),
            };
            let result = call_tool(runtime, &params.name, params.arguments.unwrap_or(json!({}))).await;
            match result {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(error) => JsonRpcResponse::error(id, error),
            }
        }
        other => JsonRpcResponse::error(id, RpcError::method_not_found(other)),
    }
}

/// One policy-checked, audited tool execution. Denials and tool failures
/// become text results the host can show its model.
async fn call_tool(runtime: &Runtime, name: &str, arguments: Value) -> std::result::Result<Value, RpcError> {
    let snapshot = runtime.snapshot().await;
    let manifest = snapshot.manifest.clone();
    let policy = snapshot.policy.clone();
    let request_id = Uuid::new_v4();
    let policy_mode = manifest.runtime.policy_mode.as_str();

    let new_entry = |event: AuditEvent| {
        AuditEntry::new(
            request_id,
            event,
            manifest.app.name.clone(),
            manifest.models.default.clone(),
            policy_mode,
        )
        .with_detail("transport", "mcp")
    };
    let append = |entry: AuditEntry| async move {
        runtime
            .audit
            .append(entry)
            .await
            .map_err(|e| RpcError::internal_error(e.to_string()))
    };

    let mut decision = policy.check_tool(name);
    if decision.is_allow() {
        if let Some(sub) = argument_checks(&policy, name, &arguments) {
            if !sub.is_allow() {
                decision = sub;
            }
        }
    }

    if !decision.is_allow() {
        append(
            new_entry(AuditEvent::PolicyBlock)
                .with_detail("tool", name)
                .with_detail("rule", decision.rule.clone())
                .with_detail("reason", decision.reason.clone())
                .with_detail("arguments", arguments.clone()),
        )
        .await?;
        return Ok(text_result(
            format!("Tool call denied by policy: {}", decision.reason),
            true,
        ));
    }

    append(
        new_entry(AuditEvent::ToolCall)
            .with_detail("tool", name)
            .with_detail("arguments", arguments.clone()),
    )
    .await?;

    let ctx = ToolContext {
        manifest: manifest.clone(),
        policy: policy.clone(),
        embedder: runtime.embedder.clone(),
        vectors: runtime.vectors.clone(),
        cancel: CancellationToken::new(),
    };
    match runtime.tools.call(&ctx, name, &arguments).await {
        Ok(output) => {
            let rendered = output.render();
            append(
                new_entry(AuditEvent::ToolResult)
                    .with_detail("tool", name)
                    .with_detail("success", true),
            )
            .await?;
            Ok(text_result(rendered, false))
        }
        Err(e) => {
            append(
                new_entry(AuditEvent::ToolResult)
                    .with_detail("tool", name)
                    .with_detail("success", false),
            )
            .await?;
            Ok(text_result(e.to_string(), true))
        }
    }
}

fn text_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}
