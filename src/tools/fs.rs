//! Filesystem tools with prefix-safe path resolution.

use crate::error::ToolError;
use crate::policy::paths;
use crate::tools::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct ReadFileTool;

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from an allow-listed location"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The path to the file to read"
                }
            },
            "required": ["path"]
        })
    }

    fn permissions(&self) -> &[&str] {
        &["filesystem.read"]
    }

    async fn run(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let args: ReadFileArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let decision = ctx.policy.check_read(args.path.as_ref());
        if !decision.is_allow() {
            return Err(ToolError::Denied(decision.reason));
        }
        let canonical =
            paths::canonicalize_lenient(args.path.as_ref()).map_err(ToolError::InvalidArguments)?;

        let max_bytes = ctx.manifest.tool_config(self.name()).max_bytes;
        let file = tokio::fs::File::open(&canonical).await?;
        let mut buf = Vec::with_capacity(max_bytes.min(64 * 1024));
        // Read one byte past the cap: if it arrives, the file is too large.
        let read = file.take(max_bytes as u64 + 1).read_to_end(&mut buf).await?;
        if read > max_bytes {
            return Err(ToolError::FileTooLarge {
                path: canonical.display().to_string(),
                max_bytes,
            });
        }

        Ok(ToolOutput::text(String::from_utf8_lossy(&buf).into_owned()))
    }
}

pub struct WriteFileTool;

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a text file to an allow-listed location"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The path to the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn permissions(&self) -> &[&str] {
        &["filesystem.write"]
    }

    async fn run(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let args: WriteFileArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let decision = ctx.policy.check_write(args.path.as_ref());
        if !decision.is_allow() {
            return Err(ToolError::Denied(decision.reason));
        }
        let canonical =
            paths::canonicalize_lenient(args.path.as_ref()).map_err(ToolError::InvalidArguments)?;

        let max_bytes = ctx.manifest.tool_config(self.name()).max_bytes;
        if args.content.len() > max_bytes {
            return Err(ToolError::FileTooLarge {
                path: canonical.display().to_string(),
                max_bytes,
            });
        }

        if let Some(parent) = canonical.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file and rename, so readers never observe
        // a half-written file.
        let file_name = canonical
            .file_name()
            .ok_or_else(|| ToolError::InvalidArguments("path has no file name".to_string()))?
            .to_string_lossy()
            .into_owned();
        let tmp = canonical.with_file_name(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        if let Err(e) = file.write_all(args.content.as_bytes()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        file.flush().await?;
        drop(file);
        if let Err(e) = tokio::fs::rename(&tmp, &canonical).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(ToolOutput::json(json!({
            "path": canonical.display().to_string(),
            "bytes_written": args.content.len(),
        })))
    }
}
