//! Ollama chat adapter (`/api/chat`, non-streaming).

use crate::adapter::{fallback, supports_native_tools, BackendStatus, ModelAdapter};
use crate::error::{AdapterError, Error};
use crate::protocol::{Message, Role, ToolCall, ToolSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub struct OllamaAdapter {
    client: reqwest::Client,
    base: Url,
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct WireResponse {
    message: WireMessage,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

impl OllamaAdapter {
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::internal(format!("invalid base_url '{}': {}", base_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AdapterError> {
        self.base
            .join(path)
            .map_err(|e| AdapterError::Backend(format!("invalid endpoint path: {}", e)))
    }

    fn wire_messages(messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                }
                .to_string(),
                content: m.content.clone().unwrap_or_default(),
                tool_calls: m.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|c| WireToolCall {
                            function: WireFunction {
                                name: c.name.clone(),
                                arguments: c.arguments.clone(),
                            },
                        })
                        .collect()
                }),
            })
            .collect()
    }

    fn tool_definitions(tools: &[ToolSpec]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect()
    }

    async fn exchange(&self, request: &WireRequest) -> Result<WireMessage, AdapterError> {
        let endpoint = self.endpoint("/api/chat")?;
        let response = self.client.post(endpoint).json(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Backend(format!("{}: {}", status, body)));
        }
        let reply: WireResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::MalformedReply(e.to_string()))?;
        Ok(reply.message)
    }
}

#[async_trait]
impl ModelAdapter for OllamaAdapter {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        model: &str,
    ) -> Result<Message, AdapterError> {
        let native = tools.is_empty() || supports_native_tools(model);
        debug!(model, native, "dispatching chat to backend");

        if native {
            let request = WireRequest {
                model: model.to_string(),
                messages: Self::wire_messages(messages),
                tools: (!tools.is_empty()).then(|| Self::tool_definitions(tools)),
                stream: false,
            };
            let reply = self.exchange(&request).await?;

            // The wire format carries no call ids; synthesize them so the
            // tool-role replies can reference their call.
            let tool_calls: Vec<ToolCall> = reply
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, c)| ToolCall {
                    id: format!("call_{}", i),
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect();

            if tool_calls.is_empty() {
                Ok(Message::assistant(reply.content))
            } else {
                Ok(Message::assistant_tool_calls(tool_calls))
            }
        } else {
            // Prompt-grammar fallback: inject the schemas into a system
            // prologue and parse the reply text for the grammar.
            let mut prompted = Vec::with_capacity(messages.len() + 1);
            prompted.push(Message::system(fallback::build_prologue(tools)));
            prompted.extend_from_slice(messages);

            let request = WireRequest {
                model: model.to_string(),
                messages: Self::wire_messages(&prompted),
                tools: None,
                stream: false,
            };
            let reply = self.exchange(&request).await?;

            match fallback::parse_tool_call(&reply.content) {
                Some(mut call) => {
                    call.id = "call_0".to_string();
                    Ok(Message::assistant_tool_calls(vec![call]))
                }
                None => Ok(Message::assistant(reply.content)),
            }
        }
    }

    async fn probe(&self) -> BackendStatus {
        let Ok(endpoint) = self.endpoint("/api/tags") else {
            return BackendStatus::default();
        };
        let response = self
            .client
            .get(endpoint)
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<TagsResponse>().await {
                Ok(tags) => BackendStatus {
                    reachable: true,
                    models: tags.models.into_iter().map(|m| m.name).collect(),
                },
                Err(_) => BackendStatus {
                    reachable: true,
                    models: Vec::new(),
                },
            },
            _ => BackendStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_carry_roles_and_calls() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("count rows"),
            Message::assistant_tool_calls(vec![ToolCall {
                id: "call_0".to_string(),
                name: "sql_query".to_string(),
                arguments: json!({ "db_path": "/tmp/h.db", "query": "SELECT 1" }),
            }]),
            Message::tool("call_0", "{\"columns\":[\"1\"]}"),
        ];
        let wire = OllamaAdapter::wire_messages(&messages);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[2].role, "assistant");
        assert_eq!(
            wire[2].tool_calls.as_ref().unwrap()[0].function.name,
            "sql_query"
        );
        assert_eq!(wire[3].role, "tool");
    }

    #[test]
    fn tool_definitions_use_function_envelope() {
        let defs = OllamaAdapter::tool_definitions(&[ToolSpec {
            name: "read_file".to_string(),
            description: "read".to_string(),
            input_schema: json!({ "type": "object" }),
            permissions: vec![],
        }]);
        assert_eq!(defs[0]["type"], json!("function"));
        assert_eq!(defs[0]["function"]["name"], json!("read_file"));
        assert_eq!(defs[0]["function"]["parameters"]["type"], json!("object"));
    }
}
