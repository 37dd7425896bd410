//! HTTP surface: the chat-completions endpoint plus the domekit
//! observability endpoints, served with axum.

use crate::audit::{alerts, metrics, AuditEvent, QueryFilter};
use crate::error::Error;
use crate::protocol::{ChatRequest, ChatResponse};
use crate::runtime::{run_chat, Runtime};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Buffer for the SSE live tail; a client that lags this far behind is
/// disconnected rather than served a gappy stream.
const STREAM_BUFFER: usize = 256;

/// Cap on concurrently processed requests across the whole surface.
const MAX_CONCURRENT_REQUESTS: usize = 64;

struct ApiError {
    status: StatusCode,
    message: String,
    request_id: Option<Uuid>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            request_id: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            request_id: None,
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::AdapterRequest { request_id, source } => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: source.to_string(),
                request_id: Some(request_id),
            },
            Error::InvalidRequest(message) => Self::bad_request(message),
            other => Self::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.message });
        if let Some(request_id) = self.request_id {
            body["request_id"] = json!(request_id);
        }
        (self.status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/domekit/health", get(health))
        .route("/v1/domekit/audit/logs", get(audit_logs))
        .route("/v1/domekit/audit/stream", get(audit_stream))
        .route("/v1/domekit/audit/:request_id", get(audit_by_request))
        .route("/v1/domekit/security/alerts", get(security_alerts))
        .route("/v1/domekit/metrics", get(metrics_report))
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::GlobalConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .with_state(runtime)
}

/// Bind and serve until the process exits.
pub async fn serve_http(runtime: Arc<Runtime>, addr: SocketAddr) -> crate::error::Result<()> {
    let app = router(runtime);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::transport(format!("failed to bind {}: {}", addr, e)))?;
    info!(%addr, "http surface listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::transport(e.to_string()))
}

async fn chat_completions(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    request.validate().map_err(ApiError::bad_request)?;

    // The router loop runs as its own task; if the client disconnects, the
    // dropped guard cancels the token and the loop winds down cleanly.
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    let child = token.clone();
    let rt = runtime.clone();
    let span = info_span!("chat_request", model = %request.model);
    let handle = tokio::spawn(async move { run_chat(&rt, request, child).await }.instrument(span));
    let result = handle
        .await
        .map_err(|e| ApiError::internal(format!("request task failed: {}", e)))?;
    let _ = guard.disarm();

    Ok(Json(result?))
}

async fn health(State(runtime): State<Arc<Runtime>>) -> Json<serde_json::Value> {
    let snapshot = runtime.snapshot().await;
    let manifest = &snapshot.manifest;
    let backend = runtime.adapter.probe().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": runtime.uptime_seconds(),
        "manifest": {
            "app": manifest.app.name,
            "app_version": manifest.app.version,
            "policy_mode": manifest.runtime.policy_mode.as_str(),
            "allowed_tools": manifest.policy.tools.allow,
            "model_backend": manifest.models.backend,
            "default_model": manifest.models.default,
        },
        "audit_log_size_bytes": runtime.audit.size_bytes().await,
        "audit_log_entries": runtime.audit.entry_count().await,
        "ollama": backend,
    }))
}

#[derive(Deserialize)]
struct LogsParams {
    event: Option<String>,
    since: Option<String>,
    until: Option<String>,
    request_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    100
}

fn parse_ts(raw: &str, field: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ApiError::bad_request(format!("invalid {}: {}", field, e)))
}

async fn audit_logs(
    State(runtime): State<Arc<Runtime>>,
    Query(params): Query<LogsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let event = match &params.event {
        Some(raw) => Some(
            AuditEvent::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown event '{}'", raw)))?,
        ),
        None => None,
    };
    let filter = QueryFilter {
        event,
        since: params.since.as_deref().map(|s| parse_ts(s, "since")).transpose()?,
        until: params.until.as_deref().map(|s| parse_ts(s, "until")).transpose()?,
        request_id: params.request_id,
        offset: params.offset,
        limit: Some(params.limit),
    };
    let (entries, total) = runtime.audit.query(&filter).await?;
    Ok(Json(json!({ "entries": entries, "total": total })))
}

async fn audit_by_request(
    State(runtime): State<Arc<Runtime>>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = runtime.audit.by_request(request_id).await?;
    Ok(Json(json!(entries)))
}

async fn audit_stream(
    State(runtime): State<Arc<Runtime>>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = runtime.audit.subscribe(STREAM_BUFFER).await;
    let stream = ReceiverStream::new(rx).map(|entry| {
        Ok(Event::default()
            .data(serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string())))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn security_alerts(
    State(runtime): State<Arc<Runtime>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = runtime.audit.read_all().await?;
    let alerts = alerts::scan(&entries);
    Ok(Json(json!({ "total": alerts.len(), "alerts": alerts })))
}

#[derive(Deserialize)]
struct MetricsParams {
    #[serde(default = "default_window")]
    window: u64,
    since: Option<String>,
    until: Option<String>,
}

fn default_window() -> u64 {
    60
}

async fn metrics_report(
    State(runtime): State<Arc<Runtime>>,
    Query(params): Query<MetricsParams>,
) -> Result<Json<metrics::MetricsReport>, ApiError> {
    let filter = QueryFilter {
        since: params.since.as_deref().map(|s| parse_ts(s, "since")).transpose()?,
        until: params.until.as_deref().map(|s| parse_ts(s, "until")).transpose()?,
        ..QueryFilter::default()
    };
    let (entries, _) = runtime.audit.query(&filter).await?;
    Ok(Json(metrics::aggregate(&entries, params.window)))
}
