//! JSON-RPC 2.0 message shapes used by the tool-invocation protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version tag.
pub const JSONRPC_VERSION: &str = "2.0";

/// Tool-invocation protocol revision offered during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Outgoing request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    /// Creates a request.
    #[must_use]
    pub const fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Outgoing notification; no response is expected.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> JsonRpcNotification<'a> {
    /// Creates a notification.
    #[must_use]
    pub const fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Incoming response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    /// Returns whether this response answers request `id`.
    ///
    /// Error responses with a null id are attributed to the in-flight request.
    #[must_use]
    pub fn answers(&self, id: u64) -> bool {
        self.id.as_u64() == Some(id) || (self.id.is_null() && self.error.is_some())
    }

    /// Splits the response into its result or error object.
    ///
    /// A response carrying neither is treated as an empty result.
    pub fn into_outcome(self) -> Result<Value, JsonRpcErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Classification of one decoded frame from the tool process.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Response to a request.
    Response(JsonRpcResponse),
    /// Server notification.
    Notification {
        /// Method name.
        method: String,
    },
    /// Server-initiated request; this client serves none.
    Request {
        /// Method name.
        method: String,
    },
    /// JSON that is not a JSON-RPC message.
    Invalid(String),
}

impl Incoming {
    /// Classifies a decoded frame.
    #[must_use]
    pub fn classify(frame: Value) -> Self {
        if let Some(method) = frame.get("method").and_then(Value::as_str) {
            let method_name = method.to_owned();
            return if frame.get("id").is_some() {
                Self::Request {
                    method: method_name,
                }
            } else {
                Self::Notification {
                    method: method_name,
                }
            };
        }
        if frame.get("result").is_none() && frame.get("error").is_none() {
            return Self::Invalid("frame has neither method, result, nor error".to_owned());
        }
        serde_json::from_value(frame)
            .map_or_else(|err| Self::Invalid(err.to_string()), Self::Response)
    }
}
