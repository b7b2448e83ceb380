//! Newline-delimited JSON transport over an exec-attached tool process.
//!
//! Stdout carries the framed protocol stream and is decoded by a reader task
//! into a single ordered event queue. Stderr is diagnostic only: it is logged,
//! broadcast to subscribers, and kept in a bounded ring of recent lines.

mod codec;
mod error;

pub use error::TransportError;

use codec::{LineFrame, LineFrames};
use crate::tool_server::domain::{ContainerId, ServerId};
use crate::tool_server::ports::{ContainerRuntime, ExecAttachment, ExecReader, ExecWriter};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

/// Largest accepted stdout frame, in bytes.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Number of recent stderr lines retained for diagnostics.
pub const DEFAULT_DIAGNOSTIC_LINES: usize = 64;

const EVENT_QUEUE_CAPACITY: usize = 256;
const DIAGNOSTIC_CHANNEL_CAPACITY: usize = 128;

/// Limits applied to one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    /// Largest accepted stdout frame, in bytes.
    pub max_frame_bytes: usize,
    /// Number of recent stderr lines retained.
    pub diagnostic_lines: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            diagnostic_lines: DEFAULT_DIAGNOSTIC_LINES,
        }
    }
}

/// One item delivered from the tool process's stdout, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A decoded JSON frame.
    Message(Value),
    /// A frame that was not valid JSON.
    Malformed {
        /// Raw frame text.
        raw: String,
        /// Decoder error.
        reason: String,
    },
    /// The channel failed while reading.
    Error(TransportError),
    /// The tool process closed its stdout.
    Closed,
}

type DiagnosticRing = Arc<StdMutex<VecDeque<String>>>;

/// Framed bidirectional channel to a tool process.
pub struct ProcessTransport {
    server_id: ServerId,
    writer: Mutex<Option<ExecWriter>>,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    diagnostics: broadcast::Sender<String>,
    recent_diagnostics: DiagnosticRing,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl ProcessTransport {
    /// Spawns `entrypoint` inside the container and wires its stdio.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Attach`] when the exec session cannot be
    /// created.
    pub async fn attach<R>(
        runtime: &R,
        container_id: &ContainerId,
        entrypoint: &[String],
        server_id: ServerId,
        limits: TransportLimits,
    ) -> Result<Self, TransportError>
    where
        R: ContainerRuntime + ?Sized,
    {
        let attachment = runtime
            .exec_attach(container_id, entrypoint)
            .await
            .map_err(|source| TransportError::Attach {
                container_id: container_id.clone(),
                source,
            })?;
        tracing::debug!(server = %server_id, container = %container_id.short(), "attached to tool process");
        Ok(Self::from_attachment(server_id, attachment, limits))
    }

    /// Builds a transport over already-attached stdio handles.
    #[must_use]
    pub fn from_attachment(
        server_id: ServerId,
        attachment: ExecAttachment,
        limits: TransportLimits,
    ) -> Self {
        let ExecAttachment {
            stdin,
            stdout,
            stderr,
        } = attachment;

        let (event_sender, event_receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CHANNEL_CAPACITY);
        let recent_diagnostics: DiagnosticRing = Arc::new(StdMutex::new(VecDeque::new()));

        let stdout_task = tokio::spawn(pump_stdout(
            stdout,
            limits.max_frame_bytes,
            event_sender,
        ));
        let stderr_task = tokio::spawn(pump_stderr(
            server_id.clone(),
            stderr,
            limits,
            diagnostics.clone(),
            Arc::clone(&recent_diagnostics),
        ));

        Self {
            server_id,
            writer: Mutex::new(Some(stdin)),
            events: Mutex::new(event_receiver),
            diagnostics,
            recent_diagnostics,
            stdout_task,
            stderr_task,
        }
    }

    /// Returns the server this transport belongs to.
    #[must_use]
    pub const fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Writes one newline-terminated JSON frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after [`close`](Self::close) and
    /// [`TransportError::Write`] when the pipe is broken.
    pub async fn send<T>(&self, message: &T) -> Result<(), TransportError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let mut frame =
            serde_json::to_string(message).map_err(|err| TransportError::Encode(err.to_string()))?;
        frame.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(TransportError::write)?;
        writer.flush().await.map_err(TransportError::write)
    }

    /// Returns the next stdout event.
    ///
    /// Once the stream has ended every further call yields
    /// [`TransportEvent::Closed`].
    pub async fn recv(&self) -> TransportEvent {
        self.events
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed)
    }

    /// Closes stdin and stops the pump tasks. Idempotent.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(err) = writer.shutdown().await
        {
            tracing::debug!(server = %self.server_id, error = %err, "tool process stdin already closed");
        }
        self.stdout_task.abort();
        self.stderr_task.abort();
    }

    /// Returns the most recent stderr lines, oldest first.
    #[must_use]
    pub fn recent_diagnostics(&self) -> Vec<String> {
        self.recent_diagnostics
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribes to stderr lines emitted from now on.
    #[must_use]
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<String> {
        self.diagnostics.subscribe()
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.stdout_task.abort();
        self.stderr_task.abort();
    }
}

async fn pump_stdout(stdout: ExecReader, max_frame_bytes: usize, sender: mpsc::Sender<TransportEvent>) {
    let mut frames = FramedRead::new(stdout, LineFrames::new(max_frame_bytes));
    while let Some(frame) = frames.next().await {
        let event = match frame {
            Ok(LineFrame::Line(bytes)) => match decode_frame(&bytes) {
                Some(event) => event,
                None => continue,
            },
            Ok(LineFrame::Oversized) => TransportEvent::Error(TransportError::FrameTooLarge {
                max: max_frame_bytes,
            }),
            Err(err) => {
                if sender
                    .send(TransportEvent::Error(TransportError::read(err)))
                    .await
                    .is_err()
                {
                    return;
                }
                break;
            }
        };
        if sender.send(event).await.is_err() {
            return;
        }
    }
    drop(sender.send(TransportEvent::Closed).await);
}

/// Decodes one stdout frame. Blank frames yield `None`.
fn decode_frame(bytes: &[u8]) -> Option<TransportEvent> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.trim(),
        Err(err) => {
            return Some(TransportEvent::Malformed {
                raw: String::from_utf8_lossy(bytes).trim().to_owned(),
                reason: format!("frame is not valid UTF-8: {err}"),
            });
        }
    };
    if text.is_empty() {
        return None;
    }
    Some(match serde_json::from_str::<Value>(text) {
        Ok(message) => TransportEvent::Message(message),
        Err(err) => TransportEvent::Malformed {
            raw: text.to_owned(),
            reason: err.to_string(),
        },
    })
}

/// Drains stderr until the process closes it. Undecodable bytes are replaced
/// and overlong lines skipped so the process never blocks on a full pipe.
async fn pump_stderr(
    server_id: ServerId,
    stderr: ExecReader,
    limits: TransportLimits,
    diagnostics: broadcast::Sender<String>,
    recent: DiagnosticRing,
) {
    let mut lines = FramedRead::new(stderr, LineFrames::new(limits.max_frame_bytes));
    while let Some(line) = lines.next().await {
        let text = match line {
            Ok(LineFrame::Line(bytes)) => String::from_utf8_lossy(&bytes).trim_end().to_owned(),
            Ok(LineFrame::Oversized) => continue,
            Err(err) => {
                tracing::debug!(server = %server_id, error = %err, "tool process stderr failed");
                break;
            }
        };
        tracing::debug!(server = %server_id, line = %text, "tool process stderr");
        if let Ok(mut ring) = recent.lock() {
            if limits.diagnostic_lines > 0 && ring.len() >= limits.diagnostic_lines {
                ring.pop_front();
            }
            if limits.diagnostic_lines > 0 {
                ring.push_back(text.clone());
            }
        }
        // No subscribers is fine.
        drop(diagnostics.send(text));
    }
}
