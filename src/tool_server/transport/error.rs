//! Transport-level failures.

use crate::tool_server::domain::ContainerId;
use crate::tool_server::ports::ContainerRuntimeError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the framed process channel.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The exec session could not be attached.
    #[error("failed to attach to tool process in container {container_id}: {source}")]
    Attach {
        /// Target container.
        container_id: ContainerId,
        /// Engine failure.
        source: ContainerRuntimeError,
    },

    /// Writing to the tool process failed.
    #[error("failed to write to tool process: {0}")]
    Write(Arc<std::io::Error>),

    /// Reading from the tool process failed.
    #[error("failed to read from tool process: {0}")]
    Read(Arc<std::io::Error>),

    /// A message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// A frame exceeded the size limit.
    #[error("frame exceeded {max} bytes")]
    FrameTooLarge {
        /// Limit in bytes.
        max: usize,
    },

    /// No reply arrived in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The channel has been closed.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub(crate) fn write(err: std::io::Error) -> Self {
        Self::Write(Arc::new(err))
    }

    pub(crate) fn read(err: std::io::Error) -> Self {
        Self::Read(Arc::new(err))
    }
}
