//! Vector store seam for the vector tools.
//!
//! The gateway is not a vector database; this module defines the contract
//! the tools program against plus the in-process `memory` backend the
//! default manifest selects.

use crate::error::{Error, ToolError};
use crate::manifest::VectorDbConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: Value,
    /// Similarity in `[0, 1]`, higher is closer.
    pub score: f64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Add documents; existing ids are replaced.
    async fn insert(&self, collection: &str, docs: Vec<Document>) -> Result<usize, ToolError>;

    /// Replace existing documents; unknown ids fail.
    async fn update(&self, collection: &str, docs: Vec<Document>) -> Result<usize, ToolError>;

    /// Remove ids, returning how many existed.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, ToolError>;

    /// Top-`k` hits by descending score, ties broken by ascending id.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>, ToolError>;

    /// Embedding dimension of a collection, if it exists.
    async fn dimension(&self, collection: &str) -> Option<usize>;
}

/// Build the store named by `vector_db.backend`.
pub fn from_config(config: &VectorDbConfig) -> Result<Arc<dyn VectorStore>, Error> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryVectorStore::new())),
        other => Err(Error::internal(format!(
            "unknown vector_db backend '{}'",
            other
        ))),
    }
}

struct Collection {
    dimension: usize,
    docs: BTreeMap<String, Document>,
}

/// Process-local store; collections are created on first insert and fix
/// their dimension from the first document.
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_dimension(collection: &Collection, doc: &Document) -> Result<(), ToolError> {
    if doc.embedding.len() != collection.dimension {
        return Err(ToolError::VectorStore(format!(
            "document '{}' has dimension {}, collection expects {}",
            doc.id,
            doc.embedding.len(),
            collection.dimension
        )));
    }
    Ok(())
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn insert(&self, collection: &str, docs: Vec<Document>) -> Result<usize, ToolError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let mut collections = self.collections.write().await;
        let entry = collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                dimension: docs[0].embedding.len(),
                docs: BTreeMap::new(),
            });
        for doc in &docs {
            check_dimension(entry, doc)?;
        }
        let count = docs.len();
        for doc in docs {
            entry.docs.insert(doc.id.clone(), doc);
        }
        Ok(count)
    }

    async fn update(&self, collection: &str, docs: Vec<Document>) -> Result<usize, ToolError> {
        let mut collections = self.collections.write().await;
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| ToolError::VectorStore(format!("unknown collection '{}'", collection)))?;
        for doc in &docs {
            if !entry.docs.contains_key(&doc.id) {
                return Err(ToolError::VectorStore(format!(
                    "unknown document id '{}'",
                    doc.id
                )));
            }
            check_dimension(entry, doc)?;
        }
        let count = docs.len();
        for doc in docs {
            entry.docs.insert(doc.id.clone(), doc);
        }
        Ok(count)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, ToolError> {
        let mut collections = self.collections.write().await;
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| ToolError::VectorStore(format!("unknown collection '{}'", collection)))?;
        let mut removed = 0;
        for id in ids {
            if entry.docs.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>, ToolError> {
        let collections = self.collections.read().await;
        let entry = collections
            .get(collection)
            .ok_or_else(|| ToolError::VectorStore(format!("unknown collection '{}'", collection)))?;
        if query.len() != entry.dimension {
            return Err(ToolError::VectorStore(format!(
                "query has dimension {}, collection expects {}",
                query.len(),
                entry.dimension
            )));
        }

        let mut hits: Vec<SearchHit> = entry
            .docs
            .values()
            .map(|doc| SearchHit {
                id: doc.id.clone(),
                text: doc.text.clone(),
                metadata: doc.metadata.clone(),
                score: similarity(query, &doc.embedding),
            })
            .collect();
        // Descending score; BTreeMap iteration already yields ascending ids,
        // and the sort is stable, so equal scores keep that order.
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn dimension(&self, collection: &str) -> Option<usize> {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.dimension)
    }
}

/// Cosine similarity shifted into `[0, 1]`.
fn similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, embedding: Vec<f32>) -> Document {
        Document {
            id: id.to_string(),
            text: format!("text-{}", id),
            metadata: json!({}),
            embedding,
        }
    }

    #[tokio::test]
    async fn search_orders_by_score_then_id() {
        let store = MemoryVectorStore::new();
        store
            .insert(
                "docs",
                vec![
                    doc("b", vec![1.0, 0.0]),
                    doc("a", vec![1.0, 0.0]),
                    doc("c", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.search("docs", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(
            hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert!(hits[0].score > hits[2].score);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    }

    #[tokio::test]
    async fn dimension_is_fixed_by_first_insert() {
        let store = MemoryVectorStore::new();
        store.insert("docs", vec![doc("a", vec![1.0, 0.0])]).await.unwrap();
        let err = store
            .insert("docs", vec![doc("b", vec![1.0, 0.0, 0.5])])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::VectorStore(_)));
        assert_eq!(store.dimension("docs").await, Some(2));
    }

    #[tokio::test]
    async fn update_requires_existing_ids() {
        let store = MemoryVectorStore::new();
        store.insert("docs", vec![doc("a", vec![1.0])]).await.unwrap();
        assert!(store.update("docs", vec![doc("a", vec![0.5])]).await.is_ok());
        assert!(store.update("docs", vec![doc("ghost", vec![0.5])]).await.is_err());
    }

    #[tokio::test]
    async fn delete_reports_removed_count() {
        let store = MemoryVectorStore::new();
        store
            .insert("docs", vec![doc("a", vec![1.0]), doc("b", vec![0.5])])
            .await
            .unwrap();
        let removed = store
            .delete("docs", &["a".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
