//! Embedding backends for the vector tools.

use crate::error::{Error, ToolError};
use crate::manifest::{EmbeddingConfig, RuntimeConfig};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed each text into one vector, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ToolError>;
}

/// Build the embedder named by `embedding.backend`.
pub fn from_config(
    embedding: &EmbeddingConfig,
    runtime: &RuntimeConfig,
) -> Result<Arc<dyn Embedder>, Error> {
    match embedding.backend.as_str() {
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(
            &runtime.base_url,
            &embedding.model,
        )?)),
        other => Err(Error::internal(format!(
            "unknown embedding backend '{}'",
            other
        ))),
    }
}

/// Ollama `/api/embeddings` client.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingsReply {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str) -> Result<Self, Error> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::internal(format!("invalid base_url '{}': {}", base_url, e)))?;
        let endpoint = base
            .join("/api/embeddings")
            .map_err(|e| Error::internal(format!("invalid base_url '{}': {}", base_url, e)))?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ToolError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let response = self
                .client
                .post(self.endpoint.clone())
                .json(&serde_json::json!({ "model": self.model, "prompt": text }))
                .send()
                .await
                .map_err(|e| ToolError::Embedding(format!("backend unreachable: {}", e)))?;
            if !response.status().is_success() {
                return Err(ToolError::Embedding(format!(
                    "backend returned {}",
                    response.status()
                )));
            }
            let reply: EmbeddingsReply = response
                .json()
                .await
                .map_err(|e| ToolError::Embedding(format!("malformed reply: {}", e)))?;
            if reply.embedding.is_empty() {
                return Err(ToolError::Embedding("backend returned empty vector".into()));
            }
            out.push(reply.embedding);
        }
        Ok(out)
    }
}
