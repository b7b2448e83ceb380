//! Error kinds surfaced by the protocol client.

use crate::tool_server::domain::ToolContent;
use crate::tool_server::transport::TransportError;
use thiserror::Error;

/// The peer violated the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A frame could not be decoded as JSON.
    #[error("malformed frame from tool process: {reason}")]
    MalformedFrame {
        /// Raw frame text.
        raw: String,
        /// Decoder error.
        reason: String,
    },

    /// A response did not have the expected shape.
    #[error("unexpected response to {method}: {reason}")]
    UnexpectedResponse {
        /// Request method.
        method: String,
        /// What was wrong.
        reason: String,
    },

    /// The peer answered a non-tool method with a JSON-RPC error.
    #[error("{method} failed with error {code}: {message}")]
    Rpc {
        /// Request method.
        method: String,
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
    },
}

/// A remote tool ran and reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tool '{tool}' failed: {message}")]
pub struct ToolExecutionError {
    /// Tool name.
    pub tool: String,
    /// Failure description reported by the tool.
    pub message: String,
    /// JSON-RPC error code, when the failure was an error response.
    pub code: Option<i64>,
    /// Content blocks returned with an `isError` result.
    pub content: Vec<ToolContent>,
}

/// Errors returned by [`ProtocolClient`](super::ProtocolClient).
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The remote tool failed.
    #[error(transparent)]
    ToolExecution(#[from] ToolExecutionError),
    /// The channel is broken, closed, or timed out.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The peer violated the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
