//! Identifier types for tool servers and their containers.

use super::ToolServerDomainError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length for a server identifier.
const MAX_SERVER_ID_LENGTH: usize = 100;

/// Validated logical identifier of a tool server.
///
/// The identifier keys the manager registry and is stamped onto every managed
/// container as the logical-name label, so it must be usable in container
/// names and label values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Creates a validated server identifier.
    ///
    /// The input is trimmed and lowercased. Only characters in `[a-z0-9_-]`
    /// are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError`] when validation fails.
    pub fn new(value: impl Into<String>) -> Result<Self, ToolServerDomainError> {
        let normalized = value.into().trim().to_ascii_lowercase();

        if normalized.is_empty() {
            return Err(ToolServerDomainError::EmptyServerId);
        }

        let is_valid = normalized.chars().all(|character| {
            character.is_ascii_lowercase()
                || character.is_ascii_digit()
                || character == '_'
                || character == '-'
        });
        if !is_valid {
            return Err(ToolServerDomainError::InvalidServerId(normalized));
        }

        if normalized.len() > MAX_SERVER_ID_LENGTH {
            return Err(ToolServerDomainError::ServerIdTooLong(normalized));
        }

        Ok(Self(normalized))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ServerId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Opaque container handle assigned by the container engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Wraps an engine-assigned container identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError::EmptyContainerId`] when the value is
    /// empty after trimming.
    pub fn new(value: impl Into<String>) -> Result<Self, ToolServerDomainError> {
        let normalized = value.into().trim().to_owned();
        if normalized.is_empty() {
            return Err(ToolServerDomainError::EmptyContainerId);
        }
        Ok(Self(normalized))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened form suitable for log output.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}
