//! Scripted tool process served over in-memory stdio pipes.
//!
//! The process speaks the same newline-delimited JSON-RPC dialect as a real
//! tool server. Its file tools resolve container paths through the volume
//! bindings of the owning container, so tests exercise the same path mapping
//! a real bind mount would.

use crate::tool_server::domain::VolumeBinding;
use crate::tool_server::ports::ExecAttachment;
use crate::tool_server::protocol::jsonrpc::{JSONRPC_VERSION, PROTOCOL_VERSION, error_codes};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec};

const PIPE_CAPACITY: usize = 64 * 1024;
const SECOND_PAGE_CURSOR: &str = "page-2";

/// How the scripted process behaves once spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum ToolProcessBehaviour {
    #[default]
    Serve,
    ExitImmediately,
}

pub(super) struct ToolProcess {
    pub(super) volumes: Vec<VolumeBinding>,
    pub(super) behaviour: ToolProcessBehaviour,
    pub(super) responsive: Arc<AtomicBool>,
    pub(super) kill: watch::Receiver<bool>,
}

impl ToolProcess {
    /// Starts the process and returns the caller's ends of its stdio.
    pub(super) fn spawn(self) -> ExecAttachment {
        let (stdin_writer, stdin_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(self.run(stdin_reader, stdout_writer, stderr_writer));
        ExecAttachment {
            stdin: Box::pin(stdin_writer),
            stdout: Box::pin(stdout_reader),
            stderr: Box::pin(stderr_reader),
        }
    }

    async fn run(mut self, stdin: DuplexStream, mut stdout: DuplexStream, mut stderr: DuplexStream) {
        if write_line(&mut stderr, "fake tool server listening on stdio")
            .await
            .is_err()
        {
            return;
        }
        if self.behaviour == ToolProcessBehaviour::ExitImmediately {
            drop(write_line(&mut stderr, "fatal: configuration missing, exiting").await);
            return;
        }

        let mut lines = FramedRead::new(stdin, LinesCodec::new());
        loop {
            let next = tokio::select! {
                biased;
                _ = self.kill.changed() => break,
                next = lines.next() => next,
            };
            let Some(Ok(line)) = next else { break };

            let replies = self.handle(&line).await;
            for reply in replies {
                if write_line(&mut stdout, &reply.to_string()).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn handle(&self, line: &str) -> Vec<Value> {
        let Ok(message) = serde_json::from_str::<Value>(line) else {
            return vec![error_reply(&Value::Null, error_codes::INVALID_REQUEST, "parse error")];
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let Some(id) = message.get("id") else {
            // Notifications need no reply.
            return Vec::new();
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => vec![result_reply(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {"listChanged": false}},
                    "serverInfo": {"name": "quay-fake-tools", "version": "1.0.0"},
                }),
            )],
            "tools/list" => vec![result_reply(id, tool_page(params.get("cursor")))],
            "tools/call" => {
                let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                let log = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "method": "notifications/message",
                    "params": {"level": "info", "data": format!("calling {tool}")},
                });
                vec![log, self.call_tool(id, tool, &arguments).await]
            }
            "ping" if self.responsive.load(Ordering::SeqCst) => vec![result_reply(id, json!({}))],
            "ping" => Vec::new(),
            other => vec![error_reply(
                id,
                error_codes::METHOD_NOT_FOUND,
                &format!("method '{other}' not found"),
            )],
        }
    }

    async fn call_tool(&self, id: &Value, tool: &str, arguments: &Value) -> Value {
        let argument = |name: &str| arguments.get(name).and_then(Value::as_str);
        match tool {
            "echo" => result_reply(id, text_result(argument("text").unwrap_or_default(), false)),
            "read_file" => {
                let outcome = argument("path")
                    .ok_or_else(|| "missing 'path' argument".to_owned())
                    .and_then(|path| self.read_file(path));
                result_reply(id, outcome_result(&outcome))
            }
            "list_directory" => {
                let outcome = argument("path")
                    .ok_or_else(|| "missing 'path' argument".to_owned())
                    .and_then(|path| self.list_directory(path));
                result_reply(id, outcome_result(&outcome))
            }
            "sleep" => {
                let millis = arguments.get("millis").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                result_reply(id, text_result("awake", false))
            }
            "always_fails" => result_reply(id, text_result("tool failed on purpose", true)),
            other => error_reply(
                id,
                error_codes::INVALID_PARAMS,
                &format!("unknown tool: {other}"),
            ),
        }
    }

    /// Reads a text file. Content travels as a text block, so files that are
    /// not UTF-8 are refused rather than mangled.
    fn read_file(&self, path: &str) -> Result<String, String> {
        let (dir, relative) = self.resolve(path)?;
        let bytes = dir
            .read(&relative)
            .map_err(|err| format!("cannot read {path}: {err}"))?;
        String::from_utf8(bytes).map_err(|_| format!("cannot read {path}: not UTF-8 text"))
    }

    fn list_directory(&self, path: &str) -> Result<String, String> {
        let (dir, relative) = self.resolve(path)?;
        let entries = dir
            .read_dir(&relative)
            .map_err(|err| format!("cannot list {path}: {err}"))?;
        let mut names = Vec::new();
        for entry in entries {
            let name = entry
                .and_then(|item| item.file_name())
                .map_err(|err| format!("cannot list {path}: {err}"))?;
            names.push(name);
        }
        names.sort();
        Ok(names.join("\n"))
    }

    fn resolve(&self, path: &str) -> Result<(Dir, Utf8PathBuf), String> {
        let requested = Utf8Path::new(path);
        let (binding, relative) = self
            .volumes
            .iter()
            .find_map(|binding| {
                requested
                    .strip_prefix(binding.target())
                    .ok()
                    .map(|relative| (binding, relative))
            })
            .ok_or_else(|| format!("{path} is outside every mounted volume"))?;
        let dir = Dir::open_ambient_dir(binding.source(), ambient_authority())
            .map_err(|err| format!("cannot open volume {}: {err}", binding.target()))?;
        let relative_path = if relative.as_str().is_empty() {
            Utf8PathBuf::from(".")
        } else {
            relative.to_path_buf()
        };
        Ok((dir, relative_path))
    }
}

fn tool_page(cursor: Option<&Value>) -> Value {
    let schema = |property: &str, kind: &str| {
        json!({
            "type": "object",
            "properties": {property: {"type": kind}},
            "required": [property],
        })
    };
    if cursor.and_then(Value::as_str) == Some(SECOND_PAGE_CURSOR) {
        return json!({
            "tools": [
                {"name": "sleep", "description": "Waits before answering", "inputSchema": schema("millis", "integer")},
                {"name": "always_fails", "description": "Reports a tool failure"},
            ],
        });
    }
    json!({
        "tools": [
            {"name": "echo", "description": "Echoes its input", "inputSchema": schema("text", "string")},
            {"name": "read_file", "description": "Reads a file from a mounted volume", "inputSchema": schema("path", "string")},
            {"name": "list_directory", "description": "Lists a mounted directory", "inputSchema": schema("path", "string")},
        ],
        "nextCursor": SECOND_PAGE_CURSOR,
    })
}

fn outcome_result(outcome: &Result<String, String>) -> Value {
    match outcome {
        Ok(text) => text_result(text, false),
        Err(message) => text_result(message, true),
    }
}

fn text_result(text: &str, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": is_error})
}

fn result_reply(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result})
}

fn error_reply(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": {"code": code, "message": message}})
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
