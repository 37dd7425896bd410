//! Built-in tools and the registry the router executes them through.
//!
//! Tools are a capability set, `definition()` plus `run()`, stored in a
//! registry keyed by name. Each tool enforces its own resource constraints
//! (row caps, byte caps, read-only database access) on top of the policy
//! checks the router already performed.

pub mod fs;
pub mod sql;
pub mod vector;

pub use fs::{ReadFileTool, WriteFileTool};
pub use sql::SqlQueryTool;
pub use vector::{VectorManageTool, VectorSearchTool};

use crate::embedding::Embedder;
use crate::error::ToolError;
use crate::manifest::Manifest;
use crate::policy::PolicyEngine;
use crate::protocol::ToolSpec;
use crate::vector::VectorStore;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared state a tool execution sees: the manifest snapshot its request is
/// pinned to, the compiled policy engine for that snapshot, and the vector
/// seams. The cancellation token covers long-running loops.
pub struct ToolContext {
    pub manifest: Arc<Manifest>,
    pub policy: Arc<PolicyEngine>,
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorStore>,
    pub cancel: CancellationToken,
}

/// What a tool hands back: the structured result the model will see, plus
/// the table names touched (SQL only) for the response trace.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: Value,
    pub tables: Vec<String>,
}

impl ToolOutput {
    pub fn json(content: Value) -> Self {
        Self {
            content,
            tables: Vec::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::json(Value::String(content.into()))
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    /// The content as the model sees it in the tool-role message.
    pub fn render(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    fn permissions(&self) -> &[&str] {
        &[]
    }

    async fn run(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError>;

    fn definition(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            permissions: self.permissions().iter().map(|p| p.to_string()).collect(),
        }
    }

    fn validate_input(&self, args: &Value) -> Result<(), ToolError> {
        let schema = self.input_schema();
        let compiled = JSONSchema::compile(&schema)
            .map_err(|e| ToolError::InvalidArguments(format!("schema compilation error: {}", e)))?;
        compiled.validate(args).map_err(|errors| {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            ToolError::InvalidArguments(messages.join(", "))
        })
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// All five built-ins.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SqlQueryTool)).expect("fresh registry");
        registry.register(Box::new(ReadFileTool)).expect("fresh registry");
        registry.register(Box::new(WriteFileTool)).expect("fresh registry");
        registry.register(Box::new(VectorSearchTool)).expect("fresh registry");
        registry.register(Box::new(VectorManageTool)).expect("fresh registry");
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::InvalidArguments(format!(
                "tool '{}' is already registered",
                name
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Definitions sorted by name for consistent ordering.
    pub fn definitions(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.definition()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate arguments against the tool's schema, then execute.
    pub async fn call(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: &Value,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.validate_input(args)?;
        tool.run(ctx, args.clone()).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::manifest::Manifest;
    use crate::vector::MemoryVectorStore;

    /// Deterministic embedder for tests: hashes bytes into a fixed-dimension
    /// vector so equal texts embed equally.
    pub struct StubEmbedder {
        pub dimension: usize,
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ToolError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; self.dimension];
                    for (i, byte) in text.bytes().enumerate() {
                        v[i % self.dimension] += f32::from(byte) / 255.0;
                    }
                    v
                })
                .collect())
        }
    }

    pub fn context_from_yaml(yaml: &str) -> ToolContext {
        let manifest = Arc::new(Manifest::from_yaml(yaml).unwrap());
        let policy = Arc::new(PolicyEngine::new(manifest.clone()).unwrap());
        ToolContext {
            manifest,
            policy,
            embedder: Arc::new(StubEmbedder { dimension: 8 }),
            vectors: Arc::new(MemoryVectorStore::new()),
            cancel: CancellationToken::new(),
        }
    }
}
