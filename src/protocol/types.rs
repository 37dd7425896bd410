use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn in a conversation. Which fields are required depends on the
/// role; `validate` enforces the combinations the router accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// The tool-role reply carrying one tool's output (or denial text) back
    /// to the model.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.role {
            Role::System | Role::User => {
                if self.content.is_none() {
                    return Err(format!("{:?} message requires content", self.role));
                }
                if self.tool_calls.is_some() || self.tool_call_id.is_some() {
                    return Err(format!("{:?} message cannot carry tool fields", self.role));
                }
            }
            Role::Assistant => {
                let has_calls = self
                    .tool_calls
                    .as_ref()
                    .map(|c| !c.is_empty())
                    .unwrap_or(false);
                if self.content.is_none() && !has_calls {
                    return Err("assistant message requires content or tool_calls".to_string());
                }
            }
            Role::Tool => {
                if self.tool_call_id.is_none() {
                    return Err("tool message requires tool_call_id".to_string());
                }
                if self.content.is_none() {
                    return Err("tool message requires content".to_string());
                }
            }
        }
        Ok(())
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }
}

/// The model's request to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool made visible to the model: name, description, JSON-schema subset
/// for the arguments, and the permission tags it exercises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Extra tool definitions supplied by the client, forwarded to the model
    /// alongside the built-in registry. Execution is still limited to
    /// registered tools under policy.
    #[serde(default)]
    pub tools: Option<Vec<ToolSpec>>,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.is_empty() {
            return Err("model must not be empty".to_string());
        }
        if self.messages.is_empty() {
            return Err("messages must not be empty".to_string());
        }
        for (i, message) in self.messages.iter().enumerate() {
            message
                .validate()
                .map_err(|e| format!("messages[{}]: {}", i, e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub trace: Trace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

/// Per-response metadata summarizing what the request touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub request_id: Uuid,
    pub tools_used: BTreeSet<String>,
    pub tables_queried: BTreeSet<String>,
    pub policy_mode: String,
    pub model: String,
}
