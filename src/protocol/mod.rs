//! Wire types: the chat-completions surface and the JSON-RPC frames used by
//! the stdio transport.

pub mod jsonrpc;
pub mod types;

pub use jsonrpc::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, RpcError,
};
pub use types::{ChatRequest, ChatResponse, Choice, Message, Role, ToolCall, ToolSpec, Trace};
