//! End-to-end router scenarios driven by scripted model adapters.

use async_trait::async_trait;
use domekit::adapter::ModelAdapter;
use domekit::audit::{AuditEntry, AuditEvent, AuditLog};
use domekit::error::{AdapterError, Error, ToolError};
use domekit::manifest::Manifest;
use domekit::protocol::{ChatRequest, Message, Role, ToolCall, ToolSpec};
use domekit::runtime::{run_chat, Runtime};
use domekit::tools::ToolRegistry;
use domekit::vector::MemoryVectorStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Replies with the given tool call on a fresh conversation; once a
/// tool-role message is present, echoes its content back as assistant text.
struct EchoAdapter {
    call: ToolCall,
    exchanges: AtomicUsize,
}

impl EchoAdapter {
    fn new(name: &str, arguments: Value) -> Self {
        Self {
            call: ToolCall {
                id: "call_0".to_string(),
                name: name.to_string(),
                arguments,
            },
            exchanges: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelAdapter for EchoAdapter {
    async fn chat(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
        _model: &str,
    ) -> Result<Message, AdapterError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        match messages.iter().rev().find(|m| m.role == Role::Tool) {
            Some(tool_reply) => Ok(Message::assistant(
                tool_reply.content.clone().unwrap_or_default(),
            )),
            None => Ok(Message::assistant_tool_calls(vec![self.call.clone()])),
        }
    }
}

/// Always requests the same tool call, never converging.
struct RepeatAdapter {
    call: ToolCall,
    exchanges: AtomicUsize,
}

#[async_trait]
impl ModelAdapter for RepeatAdapter {
    async fn chat(
        &self,
        _messages: &[Message],
        _tools: &[ToolSpec],
        _model: &str,
    ) -> Result<Message, AdapterError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(Message::assistant_tool_calls(vec![self.call.clone()]))
    }
}

struct FailingAdapter;

#[async_trait]
impl ModelAdapter for FailingAdapter {
    async fn chat(
        &self,
        _messages: &[Message],
        _tools: &[ToolSpec],
        _model: &str,
    ) -> Result<Message, AdapterError> {
        Err(AdapterError::Unreachable("connection refused".to_string()))
    }
}

struct NoEmbedder;

#[async_trait]
impl domekit::embedding::Embedder for NoEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ToolError> {
        Err(ToolError::Embedding("not configured in this test".into()))
    }
}

fn build_runtime(
    yaml: &str,
    audit: Arc<AuditLog>,
    adapter: Arc<dyn ModelAdapter>,
) -> Arc<Runtime> {
    let manifest = Manifest::from_yaml(yaml).unwrap();
    Runtime::with_parts(
        manifest,
        audit,
        adapter,
        Arc::new(NoEmbedder),
        Arc::new(MemoryVectorStore::new()),
        Arc::new(ToolRegistry::builtin()),
    )
    .unwrap()
}

fn chat_request(model: &str, prompt: &str) -> ChatRequest {
    serde_json::from_value(json!({
        "model": model,
        "messages": [ { "role": "user", "content": prompt } ],
    }))
    .unwrap()
}

fn fixture_db(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("h.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
         INSERT INTO t (v) VALUES ('a'), ('b'), ('c');",
    )
    .unwrap();
    path
}

fn events_of(entries: &[AuditEntry]) -> Vec<AuditEvent> {
    entries.iter().map(|e| e.event).collect()
}

/// Invariant: every `tool.call` has a matching later `tool.result`, unless
/// the request ended in cancellation or adapter failure.
fn assert_calls_resolved(entries: &[AuditEntry]) {
    let calls = entries
        .iter()
        .filter(|e| e.event == AuditEvent::ToolCall)
        .count();
    let results = entries
        .iter()
        .filter(|e| e.event == AuditEvent::ToolResult)
        .count();
    let terminated = entries.iter().any(|e| {
        e.event == AuditEvent::RequestEnd
            && matches!(
                e.detail.get("terminated_reason").and_then(|v| v.as_str()),
                Some("cancelled") | Some("adapter_error")
            )
    });
    assert!(calls == results || terminated, "unresolved tool.call entries");
    for (i, entry) in entries.iter().enumerate() {
        if entry.event == AuditEvent::ToolResult {
            assert!(
                entries[..i].iter().any(|e| e.event == AuditEvent::ToolCall),
                "tool.result before any tool.call"
            );
        }
    }
}

#[tokio::test]
async fn allowed_sql_flows_through_tool_and_back() {
    let dir = tempfile::tempdir().unwrap();
    let db = fixture_db(dir.path());
    let yaml = format!(
        "app:\n  name: demo\npolicy:\n  tools:\n    allow: [sql_query]\n  data:\n    sqlite:\n      allow: [\"{}\"]\n",
        db.display()
    );
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let adapter = Arc::new(EchoAdapter::new(
        "sql_query",
        json!({ "db_path": db.display().to_string(), "query": "SELECT COUNT(*) AS c FROM t" }),
    ));
    let runtime = build_runtime(&yaml, audit.clone(), adapter);

    let response = run_chat(
        &runtime,
        chat_request("llama3.1:8b", "count rows"),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let content = response.choices[0].message.content.as_deref().unwrap();
    assert!(content.contains('3'), "expected the count in {:?}", content);
    assert_eq!(
        response.trace.tools_used.iter().collect::<Vec<_>>(),
        vec!["sql_query"]
    );
    assert!(response.trace.tables_queried.contains("t"));

    let entries = audit.by_request(response.trace.request_id).await.unwrap();
    assert_eq!(
        events_of(&entries),
        vec![
            AuditEvent::RequestStart,
            AuditEvent::ToolCall,
            AuditEvent::ToolResult,
            AuditEvent::RequestEnd,
        ]
    );
    assert_calls_resolved(&entries);
}

#[tokio::test]
async fn denied_sql_path_is_blocked_without_io() {
    let dir = tempfile::tempdir().unwrap();
    let db = fixture_db(dir.path());
    let yaml = format!(
        "app:\n  name: demo\npolicy:\n  tools:\n    allow: [sql_query]\n  data:\n    sqlite:\n      allow: [\"{}\"]\n",
        db.display()
    );
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let adapter = Arc::new(EchoAdapter::new(
        "sql_query",
        json!({ "db_path": "/etc/passwd", "query": "SELECT 1" }),
    ));
    let runtime = build_runtime(&yaml, audit.clone(), adapter);

    let response = run_chat(
        &runtime,
        chat_request("llama3.1:8b", "read the passwd file"),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // The denial text travelled through the model back to the user.
    let content = response.choices[0].message.content.as_deref().unwrap();
    assert!(content.contains("denied by policy"), "got {:?}", content);
    assert!(response.trace.tools_used.is_empty());

    let entries = audit.by_request(response.trace.request_id).await.unwrap();
    assert_eq!(
        events_of(&entries),
        vec![
            AuditEvent::RequestStart,
            AuditEvent::PolicyBlock,
            AuditEvent::RequestEnd,
        ]
    );
}

#[tokio::test]
async fn path_traversal_is_blocked_with_filesystem_rule() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    let yaml = format!(
        "app:\n  name: demo\npolicy:\n  tools:\n    allow: [read_file]\n  data:\n    filesystem:\n      allow_read: [\"{}/\"]\n",
        data.display()
    );
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let sneaky = format!("{}/../../etc/shadow", data.display());
    let adapter = Arc::new(EchoAdapter::new("read_file", json!({ "path": sneaky })));
    let runtime = build_runtime(&yaml, audit.clone(), adapter);

    let response = run_chat(
        &runtime,
        chat_request("llama3.1:8b", "read the shadow file"),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let entries = audit.by_request(response.trace.request_id).await.unwrap();
    let block = entries
        .iter()
        .find(|e| e.event == AuditEvent::PolicyBlock)
        .expect("expected a policy.block entry");
    assert_eq!(block.detail["rule"], json!("filesystem.read"));
    assert_eq!(block.detail["tool"], json!("read_file"));
}

#[tokio::test]
async fn iteration_cap_stops_a_looping_model() {
    let dir = tempfile::tempdir().unwrap();
    let db = fixture_db(dir.path());
    let yaml = format!(
        "app:\n  name: demo\npolicy:\n  tools:\n    allow: [sql_query]\n  data:\n    sqlite:\n      allow: [\"{}\"]\n",
        db.display()
    );
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let adapter = Arc::new(RepeatAdapter {
        call: ToolCall {
            id: "call_0".to_string(),
            name: "sql_query".to_string(),
            arguments: json!({ "db_path": db.display().to_string(), "query": "SELECT 1" }),
        },
        exchanges: AtomicUsize::new(0),
    });
    let counter = adapter.clone();
    let runtime = build_runtime(&yaml, audit.clone(), adapter);

    let response = run_chat(
        &runtime,
        chat_request("llama3.1:8b", "loop forever"),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(counter.exchanges.load(Ordering::SeqCst), 5);
    assert_eq!(response.choices[0].finish_reason, "max_iterations");

    let entries = audit.by_request(response.trace.request_id).await.unwrap();
    let end = entries.last().unwrap();
    assert_eq!(end.event, AuditEvent::RequestEnd);
    assert_eq!(end.detail["terminated_reason"], json!("max_iterations"));
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.event == AuditEvent::ToolCall)
            .count(),
        5
    );
    assert_calls_resolved(&entries);
}

#[tokio::test]
async fn adapter_failure_surfaces_after_request_end() {
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let runtime = build_runtime(
        "app:\n  name: demo\n",
        audit.clone(),
        Arc::new(FailingAdapter),
    );

    let err = run_chat(
        &runtime,
        chat_request("llama3.1:8b", "hello"),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    let request_id = match err {
        Error::AdapterRequest { request_id, .. } => request_id,
        other => panic!("expected adapter failure, got {:?}", other),
    };
    let entries = audit.by_request(request_id).await.unwrap();
    assert_eq!(entries.last().unwrap().event, AuditEvent::RequestEnd);
    assert_eq!(
        entries.last().unwrap().detail["terminated_reason"],
        json!("adapter_error")
    );
}

#[tokio::test]
async fn cancelled_request_ends_without_new_tool_calls() {
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let runtime = build_runtime(
        "app:\n  name: demo\n",
        audit.clone(),
        Arc::new(FailingAdapter),
    );

    let token = CancellationToken::new();
    token.cancel();
    let response = run_chat(&runtime, chat_request("llama3.1:8b", "hello"), token)
        .await
        .unwrap();
    assert_eq!(response.choices[0].finish_reason, "cancelled");

    let entries = audit.by_request(response.trace.request_id).await.unwrap();
    assert_eq!(
        events_of(&entries),
        vec![AuditEvent::RequestStart, AuditEvent::RequestEnd]
    );
    assert_eq!(
        entries.last().unwrap().detail["terminated_reason"],
        json!("cancelled")
    );
}

#[tokio::test]
async fn live_tail_preserves_per_request_order_across_concurrent_requests() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("a.txt"), "alpha").unwrap();
    std::fs::write(data.join("b.txt"), "beta").unwrap();
    let yaml = format!(
        "app:\n  name: demo\npolicy:\n  tools:\n    allow: [read_file]\n  data:\n    filesystem:\n      allow_read: [\"{}/\"]\n",
        data.display()
    );
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let mut rx = audit.subscribe(64).await;

    let runtime_a = build_runtime(
        &yaml,
        audit.clone(),
        Arc::new(EchoAdapter::new(
            "read_file",
            json!({ "path": data.join("a.txt").display().to_string() }),
        )),
    );
    let runtime_b = build_runtime(
        &yaml,
        audit.clone(),
        Arc::new(EchoAdapter::new(
            "read_file",
            json!({ "path": data.join("b.txt").display().to_string() }),
        )),
    );

    let task_a = tokio::spawn({
        let runtime = runtime_a.clone();
        async move {
            run_chat(
                &runtime,
                chat_request("llama3.1:8b", "read a"),
                CancellationToken::new(),
            )
            .await
            .unwrap()
        }
    });
    let task_b = tokio::spawn({
        let runtime = runtime_b.clone();
        async move {
            run_chat(
                &runtime,
                chat_request("llama3.1:8b", "read b"),
                CancellationToken::new(),
            )
            .await
            .unwrap()
        }
    });
    let response_a = task_a.await.unwrap();
    let response_b = task_b.await.unwrap();

    let mut received = Vec::new();
    for _ in 0..8 {
        let entry = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("subscriber timed out")
            .expect("subscriber dropped");
        received.push(entry);
    }

    let expected = vec![
        AuditEvent::RequestStart,
        AuditEvent::ToolCall,
        AuditEvent::ToolResult,
        AuditEvent::RequestEnd,
    ];
    for id in [response_a.trace.request_id, response_b.trace.request_id] {
        let per_request: Vec<AuditEvent> = received
            .iter()
            .filter(|e| e.request_id == id)
            .map(|e| e.event)
            .collect();
        assert_eq!(per_request, expected, "order broken for request {}", id);
    }
}

#[tokio::test]
async fn developer_mode_bypasses_tool_allow_list() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("a.txt"), "alpha").unwrap();
    // Nothing is allow-listed; developer mode lets it all through anyway.
    let yaml = "app:\n  name: demo\nruntime:\n  policy_mode: developer\n";
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let adapter = Arc::new(EchoAdapter::new(
        "read_file",
        json!({ "path": data.join("a.txt").display().to_string() }),
    ));
    let runtime = build_runtime(yaml, audit.clone(), adapter);

    let response = run_chat(
        &runtime,
        chat_request("llama3.1:8b", "read it"),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(
        response.choices[0].message.content.as_deref(),
        Some("alpha")
    );
    let entries = audit.by_request(response.trace.request_id).await.unwrap();
    assert!(entries.iter().all(|e| e.event != AuditEvent::PolicyBlock));
}

#[tokio::test]
async fn unknown_request_id_has_no_entries() {
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    assert!(audit.by_request(Uuid::new_v4()).await.unwrap().is_empty());
}
