//! Model adapter: the uniform contract between the router and a model
//! backend.
//!
//! The adapter is purely a translator. It performs no policy checks and no
//! audit writes; those belong to the router.

pub mod fallback;
pub mod ollama;

pub use ollama::OllamaAdapter;

use crate::error::{AdapterError, Error};
use crate::manifest::Manifest;
use crate::protocol::{Message, ToolSpec};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Health-probe result for the backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStatus {
    pub reachable: bool,
    pub models: Vec<String>,
}

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Exchange the conversation for the model's next message: either text
    /// or structured tool calls.
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        model: &str,
    ) -> Result<Message, AdapterError>;

    /// Reachability probe for the health endpoint.
    async fn probe(&self) -> BackendStatus {
        BackendStatus::default()
    }
}

/// Build the adapter named by `models.backend`.
pub fn from_config(manifest: &Manifest) -> Result<Arc<dyn ModelAdapter>, Error> {
    match manifest.models.backend.as_str() {
        "ollama" => Ok(Arc::new(OllamaAdapter::new(&manifest.runtime.base_url)?)),
        other => Err(Error::internal(format!(
            "unknown model backend '{}'",
            other
        ))),
    }
}

/// Model families with native tool-calling support, by id prefix. Anything
/// else goes through the prompt-grammar fallback.
const NATIVE_TOOL_MODELS: &[&str] = &[
    "llama3.1",
    "llama3.2",
    "llama3.3",
    "llama4",
    "qwen2.5",
    "qwen3",
    "mistral-nemo",
    "mistral-small",
    "mistral-large",
    "firefunction",
    "command-r",
    "hermes3",
    "granite3",
    "gpt-oss",
];

pub fn supports_native_tools(model: &str) -> bool {
    NATIVE_TOOL_MODELS
        .iter()
        .any(|prefix| model.starts_with(prefix))
}
