//! Request/response client for the tool-invocation protocol.

use super::error::{ClientError, ProtocolError, ToolExecutionError};
use super::jsonrpc::{
    Incoming, JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION,
};
use crate::tool_server::domain::{ServerId, ToolCallResult, ToolDescriptor};
use crate::tool_server::transport::{ProcessTransport, TransportError, TransportEvent};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

const CLIENT_NAME: &str = "quay";

/// Peer identity reported during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Result of the `initialize` handshake.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitializeResult {
    /// Protocol revision chosen by the server.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities.
    #[serde(default)]
    pub capabilities: Value,
    /// Server identity.
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolCallPayload {
    #[serde(default, rename = "isError")]
    is_error: bool,
    #[serde(flatten)]
    result: ToolCallResult,
}

/// Protocol client bound to one transport.
///
/// Calls are serialized: a request holds the client until its response (or a
/// transport failure) arrives. A caller that abandons a call, for example on
/// timeout, leaves a stale response behind; it is skipped by the next call.
pub struct ProtocolClient {
    server_id: ServerId,
    transport: Arc<ProcessTransport>,
    next_id: AtomicU64,
    call_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ProtocolClient {
    /// Creates a client over `transport`.
    #[must_use]
    pub fn new(server_id: ServerId, transport: Arc<ProcessTransport>) -> Self {
        Self {
            server_id,
            transport,
            next_id: AtomicU64::new(1),
            call_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Performs the capability handshake and sends `notifications/initialized`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the exchange fails or the reply is not an
    /// initialize result.
    pub async fn initialize(&self) -> Result<InitializeResult, ClientError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")},
        });
        let value = self.call("initialize", Some(params)).await?;
        let result: InitializeResult = decode("initialize", value)?;
        self.notify("notifications/initialized", None).await?;
        tracing::debug!(
            server = %self.server_id,
            protocol_version = %result.protocol_version,
            "handshake complete"
        );
        Ok(result)
    }

    /// Lists every tool, following pagination cursors.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when a page request fails, a page is malformed,
    /// or the server repeats a cursor.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|value| json!({ "cursor": value }));
            let page: ToolsPage = decode("tools/list", self.call("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor.filter(|next| !next.is_empty()) {
                Some(next) if cursor.as_ref() == Some(&next) => {
                    return Err(ProtocolError::UnexpectedResponse {
                        method: "tools/list".to_owned(),
                        reason: format!("cursor '{next}' repeated"),
                    }
                    .into());
                }
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    /// Invokes a tool.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ToolExecution`] when the tool reports failure
    /// (an `isError` result or an error response), and transport or protocol
    /// errors otherwise.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, ClientError> {
        let params = json!({"name": tool_name, "arguments": arguments});
        let response = self.request("tools/call", Some(params)).await?;
        let value = response.into_outcome().map_err(|error| ToolExecutionError {
            tool: tool_name.to_owned(),
            message: error.message,
            code: Some(error.code),
            content: Vec::new(),
        })?;

        let payload: ToolCallPayload = decode("tools/call", value)?;
        if payload.is_error {
            let text = payload.result.joined_text();
            let message = if text.trim().is_empty() {
                "tool reported an error".to_owned()
            } else {
                text
            };
            return Err(ToolExecutionError {
                tool: tool_name.to_owned(),
                message,
                code: None,
                content: payload.result.content().to_vec(),
            }
            .into());
        }
        Ok(payload.result)
    }

    /// Sends a liveness ping.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the ping is not answered successfully.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.call("ping", None).await.map(drop)
    }

    /// Sends a liveness ping unless another call holds the client.
    ///
    /// Returns `None` without sending anything while a call is in flight;
    /// that call is bounded by its own deadline.
    pub async fn ping_if_idle(&self) -> Option<Result<(), ClientError>> {
        let held = self.call_lock.try_lock().ok()?;
        let outcome = self.exchange(&held, "ping", None).await.and_then(|response| {
            response
                .into_outcome()
                .map(drop)
                .map_err(|error| ClientError::from(rpc_error("ping", error)))
        });
        Some(outcome)
    }

    /// Refuses further calls, waiting up to `grace` for an in-flight call.
    pub async fn close(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        if tokio::time::timeout(grace, self.call_lock.lock()).await.is_err() {
            tracing::debug!(server = %self.server_id, "closing client with a call still in flight");
        }
    }

    /// Returns whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.request(method, params)
            .await?
            .into_outcome()
            .map_err(|error| rpc_error(method, error).into())
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let _guard = self.call_lock.lock().await;
        self.ensure_open()?;
        self.transport
            .send(&JsonRpcNotification::new(method, params))
            .await?;
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, ClientError> {
        let held = self.call_lock.lock().await;
        self.exchange(&held, method, params).await
    }

    /// Sends one request and waits for its response. `_held` proves the
    /// caller owns the call lock.
    async fn exchange(
        &self,
        _held: &MutexGuard<'_, ()>,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, ClientError> {
        self.ensure_open()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.transport
            .send(&JsonRpcRequest::new(id, method, params))
            .await?;

        loop {
            match self.transport.recv().await {
                TransportEvent::Message(frame) => match Incoming::classify(frame) {
                    Incoming::Response(response) if response.answers(id) => return Ok(response),
                    Incoming::Response(_) => {
                        tracing::debug!(server = %self.server_id, method, "skipping stale response");
                    }
                    Incoming::Notification { method: notification } => {
                        tracing::debug!(server = %self.server_id, notification = %notification, "ignoring server notification");
                    }
                    Incoming::Request { method: request } => {
                        tracing::debug!(server = %self.server_id, request = %request, "ignoring server request");
                    }
                    Incoming::Invalid(reason) => {
                        return Err(ProtocolError::UnexpectedResponse {
                            method: method.to_owned(),
                            reason,
                        }
                        .into());
                    }
                },
                TransportEvent::Malformed { raw, reason } => {
                    return Err(ProtocolError::MalformedFrame { raw, reason }.into());
                }
                TransportEvent::Error(err) => return Err(err.into()),
                TransportEvent::Closed => return Err(TransportError::Closed.into()),
            }
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

fn rpc_error(method: &str, error: JsonRpcErrorObject) -> ProtocolError {
    ProtocolError::Rpc {
        method: method.to_owned(),
        code: error.code,
        message: error.message,
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|err| ProtocolError::UnexpectedResponse {
        method: method.to_owned(),
        reason: err.to_string(),
    })
}
