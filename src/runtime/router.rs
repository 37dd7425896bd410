//! The policy-mediated tool-calling loop.
//!
//! One request = one router run: mint a request id, bracket everything with
//! `request.start`/`request.end`, and between them alternate adapter
//! exchanges with policy-checked tool executions. Audit entries for a
//! request are strictly ordered; `tool.result` never precedes its
//! `tool.call`. Policy denials and tool failures feed back into the
//! conversation; only adapter and audit failures fail the request.

use crate::audit::{AuditEntry, AuditEvent};
use crate::error::{Error, Result, ToolError};
use crate::policy::{PolicyDecision, PolicyEngine, VectorOp};
use crate::protocol::{ChatRequest, ChatResponse, Choice, Message, Role, Trace};
use crate::runtime::Runtime;
use crate::tools::ToolContext;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hard ceiling on adapter-call/tool-batch rounds per request.
pub const MAX_ITERATIONS: usize = 5;
/// Soft per-tool deadline.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

const PROMPT_SNIPPET_MAX: usize = 2000;
const RESULT_SNIPPET_MAX: usize = 500;

enum Ending {
    MaxIterations,
    Cancelled,
}

impl Ending {
    fn reason(&self) -> &'static str {
        match self {
            Self::MaxIterations => "max_iterations",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Run one chat request through the loop. The request is assumed validated
/// by the transport.
pub async fn run_chat(
    runtime: &Runtime,
    request: ChatRequest,
    cancel: CancellationToken,
) -> Result<ChatResponse> {
    let snapshot = runtime.snapshot().await;
    let manifest = snapshot.manifest.clone();
    let policy = snapshot.policy.clone();

    let request_id = Uuid::new_v4();
    let started = Instant::now();
    // Per-request hard deadline, manifest-configurable (default 120 s).
    let deadline = started + Duration::from_secs(manifest.runtime.request_timeout_seconds);
    let model_id = manifest.resolve_model(&request.model).to_string();
    let policy_mode = manifest.runtime.policy_mode.as_str();
    let redact_prompt = manifest.audit.redact_prompt;
    let redact_outputs = manifest.audit.redact_tool_outputs;

    let new_entry = |event: AuditEvent| {
        AuditEntry::new(
            request_id,
            event,
            manifest.app.name.clone(),
            model_id.clone(),
            policy_mode,
        )
    };

    let mut tool_defs = runtime.tools.definitions();
    if let Some(extra) = &request.tools {
        tool_defs.extend(extra.iter().cloned());
    }

    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.content.clone())
        .unwrap_or_default();
    runtime
        .audit
        .append(
            new_entry(AuditEvent::RequestStart)
                .with_detail("message_count", request.messages.len())
                .with_detail("prompt", redacted(&prompt, redact_prompt, PROMPT_SNIPPET_MAX)),
        )
        .await?;

    let ctx = ToolContext {
        manifest: manifest.clone(),
        policy: policy.clone(),
        embedder: runtime.embedder.clone(),
        vectors: runtime.vectors.clone(),
        cancel: cancel.clone(),
    };

    let mut messages = request.messages;
    let mut tools_used: BTreeSet<String> = BTreeSet::new();
    let mut tables_queried: BTreeSet<String> = BTreeSet::new();

    let mut ending = Ending::MaxIterations;
    'rounds: for round in 0..MAX_ITERATIONS {
        if cancel.is_cancelled() {
            ending = Ending::Cancelled;
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            ending = Ending::Cancelled;
            break;
        }

        let reply = match tokio::time::timeout(
            remaining,
            runtime.adapter.chat(&messages, &tool_defs, &model_id),
        )
        .await
        {
            Err(_) => {
                ending = Ending::Cancelled;
                break;
            }
            Ok(Err(e)) => {
                warn!(%request_id, error = %e, "adapter failure");
                runtime
                    .audit
                    .append(
                        new_entry(AuditEvent::RequestEnd)
                            .with_detail("terminated_reason", "adapter_error")
                            .with_detail("error", e.to_string())
                            .with_detail("tools_used", used_json(&tools_used))
                            .with_detail("duration_seconds", started.elapsed().as_secs_f64()),
                    )
                    .await?;
                return Err(Error::AdapterRequest {
                    request_id,
                    source: e,
                });
            }
            Ok(Ok(reply)) => reply,
        };

        if !reply.has_tool_calls() {
            let content = reply.content.clone().unwrap_or_default();
            runtime
                .audit
                .append(
                    new_entry(AuditEvent::RequestEnd)
                        .with_detail("tools_used", used_json(&tools_used))
                        .with_detail("duration_seconds", started.elapsed().as_secs_f64())
                        .with_detail(
                            "completion",
                            redacted(&content, redact_prompt, PROMPT_SNIPPET_MAX),
                        ),
                )
                .await?;
            return Ok(build_response(
                request_id,
                &model_id,
                Message::assistant(content),
                "stop",
                tools_used,
                tables_queried,
                policy_mode,
            ));
        }

        let calls = reply.tool_calls.clone().unwrap_or_default();
        debug!(%request_id, round, calls = calls.len(), "tool batch");
        messages.push(reply);

        for call in &calls {
            // Cancellation between suspension points: in-flight executions
            // finish and are logged, new calls are not issued.
            if cancel.is_cancelled() {
                ending = Ending::Cancelled;
                break 'rounds;
            }

            let mut decision = policy.check_tool(&call.name);
            if decision.is_allow() {
                if let Some(sub) = argument_checks(&policy, &call.name, &call.arguments) {
                    if !sub.is_allow() {
                        decision = sub;
                    }
                }
            }

            if !decision.is_allow() {
                runtime
                    .audit
                    .append(
                        new_entry(AuditEvent::PolicyBlock)
                            .with_detail("tool", call.name.clone())
                            .with_detail("rule", decision.rule.clone())
                            .with_detail("reason", decision.reason.clone())
                            .with_detail("arguments", argument_detail(&call.arguments, redact_outputs)),
                    )
                    .await?;
                messages.push(Message::tool(
                    &call.id,
                    format!("Tool call denied by policy: {}", decision.reason),
                ));
                continue;
            }

            runtime
                .audit
                .append(
                    new_entry(AuditEvent::ToolCall)
                        .with_detail("tool", call.name.clone())
                        .with_detail("arguments", argument_detail(&call.arguments, redact_outputs)),
                )
                .await?;

            let tool_deadline = TOOL_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
            let result = match tokio::time::timeout(
                tool_deadline,
                runtime.tools.call(&ctx, &call.name, &call.arguments),
            )
            .await
            {
                Err(_) => Err(ToolError::Timeout(TOOL_TIMEOUT.as_secs())),
                Ok(result) => result,
            };

            match result {
                Ok(output) => {
                    tools_used.insert(call.name.clone());
                    tables_queried.extend(output.tables.iter().cloned());
                    let rendered = output.render();
                    runtime
                        .audit
                        .append(
                            new_entry(AuditEvent::ToolResult)
                                .with_detail("tool", call.name.clone())
                                .with_detail("success", true)
                                .with_detail(
                                    "summary",
                                    redacted(&rendered, redact_outputs, RESULT_SNIPPET_MAX),
                                ),
                        )
                        .await?;
                    messages.push(Message::tool(&call.id, rendered));
                }
                Err(e) => {
                    let text = e.to_string();
                    runtime
                        .audit
                        .append(
                            new_entry(AuditEvent::ToolResult)
                                .with_detail("tool", call.name.clone())
                                .with_detail("success", false)
                                .with_detail(
                                    "summary",
                                    redacted(&text, redact_outputs, RESULT_SNIPPET_MAX),
                                ),
                        )
                        .await?;
                    messages.push(Message::tool(&call.id, text));
                }
            }
        }
    }

    let reason = ending.reason();
    runtime
        .audit
        .append(
            new_entry(AuditEvent::RequestEnd)
                .with_detail("terminated_reason", reason)
                .with_detail("tools_used", used_json(&tools_used))
                .with_detail("duration_seconds", started.elapsed().as_secs_f64()),
        )
        .await?;

    // Best effort: the last assistant text if the model produced any.
    let content = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && m.content.is_some())
        .and_then(|m| m.content.clone())
        .unwrap_or_else(|| format!("Request terminated: {}", reason));
    Ok(build_response(
        request_id,
        &model_id,
        Message::assistant(content),
        reason,
        tools_used,
        tables_queried,
        policy_mode,
    ))
}

/// Tool-specific sub-checks on the arguments the model supplied. Missing or
/// mistyped fields fall through to schema validation inside the tool.
pub(crate) fn argument_checks(
    policy: &PolicyEngine,
    tool: &str,
    args: &Value,
) -> Option<PolicyDecision> {
    let str_arg = |key: &str| args.get(key).and_then(|v| v.as_str());
    match tool {
        "sql_query" => str_arg("db_path").map(|p| policy.check_sqlite(Path::new(p))),
        "read_file" => str_arg("path").map(|p| policy.check_read(Path::new(p))),
        "write_file" => str_arg("path").map(|p| policy.check_write(Path::new(p))),
        "vector_search" => str_arg("collection").map(|c| policy.check_vector(c, VectorOp::Read)),
        "vector_manage" => str_arg("collection").map(|c| policy.check_vector(c, VectorOp::Write)),
        _ => None,
    }
}

fn build_response(
    request_id: Uuid,
    model_id: &str,
    message: Message,
    finish_reason: &str,
    tools_used: BTreeSet<String>,
    tables_queried: BTreeSet<String>,
    policy_mode: &str,
) -> ChatResponse {
    ChatResponse {
        id: format!("chatcmpl-{}", request_id.simple()),
        object: "chat.completion".to_string(),
        model: model_id.to_string(),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: finish_reason.to_string(),
        }],
        trace: Trace {
            request_id,
            tools_used,
            tables_queried,
            policy_mode: policy_mode.to_string(),
            model: model_id.to_string(),
        },
    }
}

fn used_json(tools_used: &BTreeSet<String>) -> Value {
    serde_json::to_value(tools_used).unwrap_or_else(|_| Value::Array(Vec::new()))
}

fn argument_detail(args: &Value, redact: bool) -> Value {
    if redact {
        Value::String("[redacted]".to_string())
    } else {
        args.clone()
    }
}

fn redacted(text: &str, redact: bool, max: usize) -> Value {
    if redact {
        return Value::String("[redacted]".to_string());
    }
    Value::String(snippet(text, max))
}

/// Truncate on a char boundary, marking the cut.
fn snippet(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
