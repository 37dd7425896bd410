//! Vector search and collection-management tools.

use crate::error::ToolError;
use crate::policy::VectorOp;
use crate::tools::{Tool, ToolContext, ToolOutput};
use crate::vector::Document;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct VectorSearchTool;

#[derive(Deserialize)]
struct VectorSearchArgs {
    collection: String,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    query_vector: Option<Vec<f32>>,
    #[serde(default)]
    top_k: Option<usize>,
}

#[async_trait]
impl Tool for VectorSearchTool {
    fn name(&self) -> &str {
        "vector_search"
    }

    fn description(&self) -> &str {
        "Search an allow-listed vector collection by text or by vector"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "collection": {
                    "type": "string",
                    "description": "The collection to search"
                },
                "query": {
                    "type": "string",
                    "description": "Text to embed and search with"
                },
                "query_vector": {
                    "type": "array",
                    "items": { "type": "number" },
                    "description": "Pre-computed query embedding"
                },
                "top_k": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "How many hits to return"
                }
            },
            "required": ["collection"]
        })
    }

    fn permissions(&self) -> &[&str] {
        &["vector.read"]
    }

    async fn run(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let args: VectorSearchArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let decision = ctx.policy.check_vector(&args.collection, VectorOp::Read);
        if !decision.is_allow() {
            return Err(ToolError::Denied(decision.reason));
        }

        let query = match (&args.query, &args.query_vector) {
            (Some(_), Some(_)) => {
                return Err(ToolError::InvalidArguments(
                    "provide either 'query' or 'query_vector', not both".to_string(),
                ))
            }
            (Some(text), None) => ctx
                .embedder
                .embed(std::slice::from_ref(text))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ToolError::Embedding("no vector returned".to_string()))?,
            (None, Some(vector)) => {
                if let Some(dimension) = ctx.vectors.dimension(&args.collection).await {
                    if vector.len() != dimension {
                        return Err(ToolError::InvalidArguments(format!(
                            "query_vector has dimension {}, collection '{}' expects {}",
                            vector.len(),
                            args.collection,
                            dimension
                        )));
                    }
                }
                vector.clone()
            }
            (None, None) => {
                return Err(ToolError::InvalidArguments(
                    "one of 'query' or 'query_vector' is required".to_string(),
                ))
            }
        };

        let upper = ctx.manifest.vector_db.default_top_k.max(1);
        let top_k = args.top_k.unwrap_or(upper).clamp(1, upper);
        let hits = ctx.vectors.search(&args.collection, &query, top_k).await?;

        Ok(ToolOutput::json(json!({ "results": hits })))
    }
}

pub struct VectorManageTool;

#[derive(Deserialize)]
struct VectorManageArgs {
    collection: String,
    operation: ManageOp,
    #[serde(default)]
    documents: Option<Vec<DocumentInput>>,
    #[serde(default)]
    ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManageOp {
    Insert,
    Update,
    Delete,
}

#[derive(Deserialize)]
struct DocumentInput {
    #[serde(default)]
    id: Option<String>,
    text: String,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

#[async_trait]
impl Tool for VectorManageTool {
    fn name(&self) -> &str {
        "vector_manage"
    }

    fn description(&self) -> &str {
        "Insert, update or delete documents in an allow-listed vector collection"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "collection": {
                    "type": "string",
                    "description": "The collection to modify"
                },
                "operation": {
                    "type": "string",
                    "enum": ["insert", "update", "delete"],
                    "description": "What to do"
                },
                "documents": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "text": { "type": "string" },
                            "metadata": { "type": "object" },
                            "embedding": { "type": "array", "items": { "type": "number" } }
                        },
                        "required": ["text"]
                    }
                },
                "ids": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["collection", "operation"]
        })
    }

    fn permissions(&self) -> &[&str] {
        &["vector.write"]
    }

    async fn run(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let args: VectorManageArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let decision = ctx.policy.check_vector(&args.collection, VectorOp::Write);
        if !decision.is_allow() {
            return Err(ToolError::Denied(decision.reason));
        }

        let count = match args.operation {
            ManageOp::Insert => {
                let documents = args.documents.ok_or_else(|| {
                    ToolError::InvalidArguments("'insert' requires documents".to_string())
                })?;
                let docs = resolve_documents(ctx, documents, None).await?;
                ctx.vectors.insert(&args.collection, docs).await?
            }
            ManageOp::Update => {
                let documents = args.documents.ok_or_else(|| {
                    ToolError::InvalidArguments("'update' requires documents".to_string())
                })?;
                let ids = args.ids.ok_or_else(|| {
                    ToolError::InvalidArguments("'update' requires ids".to_string())
                })?;
                if ids.len() != documents.len() {
                    return Err(ToolError::InvalidArguments(format!(
                        "'update' got {} ids for {} documents",
                        ids.len(),
                        documents.len()
                    )));
                }
                let docs = resolve_documents(ctx, documents, Some(ids)).await?;
                ctx.vectors.update(&args.collection, docs).await?
            }
            ManageOp::Delete => {
                let ids = args.ids.ok_or_else(|| {
                    ToolError::InvalidArguments("'delete' requires ids".to_string())
                })?;
                ctx.vectors.delete(&args.collection, &ids).await?
            }
        };

        Ok(ToolOutput::json(json!({
            "operation": match args.operation {
                ManageOp::Insert => "insert",
                ManageOp::Update => "update",
                ManageOp::Delete => "delete",
            },
            "collection": args.collection,
            "count": count,
        })))
    }
}

/// Fill in ids and embeddings: explicit ids win, then per-document ids, then
/// fresh UUIDs; documents without a pre-computed embedding are embedded in
/// one batch.
async fn resolve_documents(
    ctx: &ToolContext,
    inputs: Vec<DocumentInput>,
    ids: Option<Vec<String>>,
) -> Result<Vec<Document>, ToolError> {
    let pending: Vec<String> = inputs
        .iter()
        .filter(|d| d.embedding.is_none())
        .map(|d| d.text.clone())
        .collect();
    let mut embedded = if pending.is_empty() {
        Vec::new()
    } else {
        ctx.embedder.embed(&pending).await?
    }
    .into_iter();

    let mut ids = ids.map(|v| v.into_iter());
    let mut out = Vec::with_capacity(inputs.len());
    for input in inputs {
        let id = ids
            .as_mut()
            .and_then(|it| it.next())
            .or(input.id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let embedding = match input.embedding {
            Some(e) => e,
            None => embedded
                .next()
                .ok_or_else(|| ToolError::Embedding("missing embedding".to_string()))?,
        };
        out.push(Document {
            id,
            text: input.text,
            metadata: input.metadata.unwrap_or_else(|| json!({})),
            embedding,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context_from_yaml;

    const YAML: &str = r#"
app:
  name: t
policy:
  data:
    vector:
      allow: ["docs*"]
      allow_write: ["docs*"]
"#;

    #[tokio::test]
    async fn insert_then_search_round_trip() {
        let ctx = context_from_yaml(YAML);

        let inserted = VectorManageTool
            .run(
                &ctx,
                json!({
                    "collection": "docs",
                    "operation": "insert",
                    "documents": [
                        { "id": "a", "text": "the dome stands" },
                        { "id": "b", "text": "unrelated text" },
                    ],
                }),
            )
            .await
            .unwrap();
        assert_eq!(inserted.content["count"], json!(2));

        let output = VectorSearchTool
            .run(
                &ctx,
                json!({ "collection": "docs", "query": "the dome stands", "top_k": 1 }),
            )
            .await
            .unwrap();
        let results = output.content["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], json!("a"));
    }

    #[tokio::test]
    async fn query_and_vector_are_exclusive() {
        let ctx = context_from_yaml(YAML);
        let err = VectorSearchTool
            .run(
                &ctx,
                json!({ "collection": "docs", "query": "x", "query_vector": [0.1] }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let err = VectorSearchTool
            .run(&ctx, json!({ "collection": "docs" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn query_vector_dimension_is_checked() {
        let ctx = context_from_yaml(YAML);
        VectorManageTool
            .run(
                &ctx,
                json!({
                    "collection": "docs",
                    "operation": "insert",
                    "documents": [ { "id": "a", "text": "x", "embedding": [0.1, 0.2] } ],
                }),
            )
            .await
            .unwrap();

        let err = VectorSearchTool
            .run(
                &ctx,
                json!({ "collection": "docs", "query_vector": [0.1, 0.2, 0.3] }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn write_needs_write_allow_list() {
        let yaml = r#"
app:
  name: t
policy:
  data:
    vector:
      allow: ["docs*"]
"#;
        let ctx = context_from_yaml(yaml);
        let err = VectorManageTool
            .run(
                &ctx,
                json!({
                    "collection": "docs",
                    "operation": "insert",
                    "documents": [ { "text": "x" } ],
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Denied(_)));
        // Reads stay allowed.
        assert!(ctx
            .policy
            .check_vector("docs", VectorOp::Read)
            .is_allow());
    }

    #[tokio::test]
    async fn delete_requires_ids() {
        let ctx = context_from_yaml(YAML);
        let err = VectorManageTool
            .run(
                &ctx,
                json!({ "collection": "docs", "operation": "delete" }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn top_k_clamps_to_configured_upper_bound() {
        let yaml = format!("{}vector_db:\n  default_top_k: 2\n", YAML.trim_start());
        let ctx = context_from_yaml(&yaml);
        VectorManageTool
            .run(
                &ctx,
                json!({
                    "collection": "docs",
                    "operation": "insert",
                    "documents": [
                        { "id": "a", "text": "one" },
                        { "id": "b", "text": "two" },
                        { "id": "c", "text": "three" },
                    ],
                }),
            )
            .await
            .unwrap();

        let output = VectorSearchTool
            .run(
                &ctx,
                json!({ "collection": "docs", "query": "one", "top_k": 50 }),
            )
            .await
            .unwrap();
        assert_eq!(output.content["results"].as_array().unwrap().len(), 2);
    }
}
