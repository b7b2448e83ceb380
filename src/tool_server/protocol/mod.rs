//! Tool-invocation protocol client.
//!
//! The client speaks JSON-RPC 2.0 over a [`ProcessTransport`] and implements
//! only the handshake, tool listing, tool invocation, and ping.
//!
//! [`ProcessTransport`]: crate::tool_server::transport::ProcessTransport

mod client;
mod error;
pub mod jsonrpc;

pub use client::{InitializeResult, ProtocolClient, ServerInfo};
pub use error::{ClientError, ProtocolError, ToolExecutionError};
