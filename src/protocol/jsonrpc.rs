//! JSON-RPC 2.0 frames for the line-delimited stdio surface.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The only protocol revision the surface speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Serde glue for the `jsonrpc` marker field: always emits `"2.0"` and
/// rejects anything else on the way in. The field itself carries no data,
/// so the frames store it as `()`.
mod version {
    use super::JSONRPC_VERSION;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(_: &(), serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<(), D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag == JSONRPC_VERSION {
            Ok(())
        } else {
            Err(D::Error::custom(format!(
                "unsupported jsonrpc version {:?}",
                tag
            )))
        }
    }
}

/// Request id: a number, a string, or null. Null ids only appear in error
/// replies to input the surface could not parse an id out of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Null,
    Num(i64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Num(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Num(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// JSON-RPC error object. The stdio surface reserves these for protocol
/// faults; policy blocks travel as ordinary text results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest<T> {
    #[serde(with = "version")]
    pub jsonrpc: (),
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<T>,
}

impl<T> JsonRpcRequest<T> {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<T>) -> Self {
        Self {
            jsonrpc: (),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification<T> {
    #[serde(with = "version")]
    pub jsonrpc: (),
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse<T> {
    #[serde(with = "version")]
    pub jsonrpc: (),
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl<T> JsonRpcResponse<T> {
    fn reply(id: RequestId, result: Option<T>, error: Option<RpcError>) -> Self {
        Self {
            jsonrpc: (),
            id,
            result,
            error,
        }
    }

    pub fn success(id: impl Into<RequestId>, result: T) -> Self {
        Self::reply(id.into(), Some(result), None)
    }

    pub fn error(id: impl Into<RequestId>, error: RpcError) -> Self {
        Self::reply(id.into(), None, Some(error))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest<serde_json::Value>),
    Notification(JsonRpcNotification<serde_json::Value>),
    Response(JsonRpcResponse<serde_json::Value>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        let message: JsonRpcMessage = serde_json::from_str(raw).unwrap();
        match &message {
            JsonRpcMessage::Request(req) => {
                assert_eq!(req.method, "tools/list");
                assert_eq!(req.id, RequestId::Num(1));
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn rejects_wrong_version() {
        let raw = r#"{"jsonrpc":"1.0","id":1,"method":"tools/list"}"#;
        assert!(serde_json::from_str::<JsonRpcRequest<serde_json::Value>>(raw).is_err());
    }

    #[test]
    fn version_marker_is_emitted() {
        let request: JsonRpcRequest<serde_json::Value> =
            JsonRpcRequest::new("a", "initialize", None);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jsonrpc"], serde_json::json!("2.0"));
        assert_eq!(json["id"], serde_json::json!("a"));
    }

    #[test]
    fn null_id_round_trips() {
        let response: JsonRpcResponse<serde_json::Value> =
            JsonRpcResponse::error(RequestId::Null, RpcError::parse_error("bad line"));
        let json = serde_json::to_value(&response).unwrap();
        assert!(json["id"].is_null());

        let parsed: JsonRpcResponse<serde_json::Value> =
            serde_json::from_value(json).unwrap();
        assert_eq!(parsed.id, RequestId::Null);
        assert_eq!(RequestId::Null.to_string(), "null");
    }

    #[test]
    fn error_response_carries_code() {
        let response: JsonRpcResponse<serde_json::Value> =
            JsonRpcResponse::error(7i64, RpcError::method_not_found("nope"));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], RpcError::METHOD_NOT_FOUND);
        assert!(json.get("result").is_none());
    }
}
