use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Load-time manifest failures. Fatal at startup: the diagnostic is printed
/// and the process exits non-zero.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest{}: {message}", .location.as_ref().map(|l| format!(" at line {}, column {}", l.0, l.1)).unwrap_or_default())]
    Parse {
        message: String,
        location: Option<(usize, usize)>,
    },

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ManifestError {
    fn from(e: serde_yaml::Error) -> Self {
        let location = e.location().map(|l| (l.line(), l.column()));
        Self::Parse {
            message: e.to_string(),
            location,
        }
    }
}

/// Recoverable per-tool failures. Captured by the router, logged as a
/// `tool.result` with `success=false`, and surfaced to the model as the
/// tool-role message content.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("denied by policy: {0}")]
    Denied(String),

    #[error("file too large: {path} exceeds {max_bytes} bytes")]
    FileTooLarge { path: String, max_bytes: usize },

    #[error("sql error: {0}")]
    Sql(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("tool timed out after {0} seconds")]
    Timeout(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for ToolError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sql(e.to_string())
    }
}

/// Backend unreachable or malformed reply. The only tool-loop failure that
/// surfaces to the client (500 with the request id).
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("model backend unreachable: {0}")]
    Unreachable(String),

    #[error("model backend returned an error: {0}")]
    Backend(String),

    #[error("malformed backend reply: {0}")]
    MalformedReply(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::Unreachable(e.to_string())
        } else {
            Self::Backend(e.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("adapter error for request {request_id}: {source}")]
    AdapterRequest {
        request_id: uuid::Uuid,
        #[source]
        source: AdapterError,
    },

    #[error("audit log error: {0}")]
    Audit(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn audit<T: fmt::Display>(msg: T) -> Self {
        Self::Audit(msg.to_string())
    }

    pub fn transport<T: fmt::Display>(msg: T) -> Self {
        Self::Transport(msg.to_string())
    }

    pub fn invalid_request<T: fmt::Display>(msg: T) -> Self {
        Self::InvalidRequest(msg.to_string())
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Self::Internal(msg.to_string())
    }
}
