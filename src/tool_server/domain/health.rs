//! Tool-server health status domain types.

use super::{ParseHealthStatusError, ServerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health status of a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Health has not been checked yet.
    Unknown,
    /// The tool process answered its last liveness ping.
    Healthy,
    /// The tool process failed more liveness pings than its policy tolerates.
    Unhealthy,
}

impl HealthStatus {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<&str> for HealthStatus {
    type Error = ParseHealthStatusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "unknown" => Ok(Self::Unknown),
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            _ => Err(ParseHealthStatusError(value.to_owned())),
        }
    }
}

/// Timestamped health snapshot for a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    status: HealthStatus,
    checked_at: DateTime<Utc>,
    message: Option<String>,
}

impl HealthSnapshot {
    /// Creates a health snapshot.
    #[must_use]
    pub const fn new(status: HealthStatus, checked_at: DateTime<Utc>) -> Self {
        Self {
            status,
            checked_at,
            message: None,
        }
    }

    /// Creates an `unknown` health snapshot.
    #[must_use]
    pub const fn unknown(checked_at: DateTime<Utc>) -> Self {
        Self::new(HealthStatus::Unknown, checked_at)
    }

    /// Creates a `healthy` health snapshot.
    #[must_use]
    pub const fn healthy(checked_at: DateTime<Utc>) -> Self {
        Self::new(HealthStatus::Healthy, checked_at)
    }

    /// Creates an `unhealthy` health snapshot with details.
    #[must_use]
    pub fn unhealthy(checked_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, checked_at).with_message(message)
    }

    /// Adds an explanatory message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let normalized = message.into().trim().to_owned();
        if !normalized.is_empty() {
            self.message = Some(normalized);
        }
        self
    }

    /// Returns the health status.
    #[must_use]
    pub const fn status(&self) -> HealthStatus {
        self.status
    }

    /// Returns whether the status is healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy)
    }

    /// Returns the health check timestamp.
    #[must_use]
    pub const fn checked_at(&self) -> DateTime<Utc> {
        self.checked_at
    }

    /// Returns an optional health detail message.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Notification that a server's health status changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthChange {
    server_id: ServerId,
    previous: HealthStatus,
    current: HealthSnapshot,
}

impl HealthChange {
    /// Creates a health-change notification.
    #[must_use]
    pub const fn new(server_id: ServerId, previous: HealthStatus, current: HealthSnapshot) -> Self {
        Self {
            server_id,
            previous,
            current,
        }
    }

    /// Returns the server whose health changed.
    #[must_use]
    pub const fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Returns the status before the change.
    #[must_use]
    pub const fn previous(&self) -> HealthStatus {
        self.previous
    }

    /// Returns the snapshot after the change.
    #[must_use]
    pub const fn current(&self) -> &HealthSnapshot {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_snapshot_keeps_trimmed_message() {
        let snapshot = HealthSnapshot::unhealthy(Utc::now(), "  ping timed out ");
        assert_eq!(snapshot.status(), HealthStatus::Unhealthy);
        assert_eq!(snapshot.message(), Some("ping timed out"));
        assert!(!snapshot.is_healthy());
    }

    #[test]
    fn blank_messages_are_dropped() {
        let snapshot = HealthSnapshot::healthy(Utc::now()).with_message("   ");
        assert_eq!(snapshot.message(), None);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(HealthStatus::try_from(" Healthy "), Ok(HealthStatus::Healthy));
        assert!(HealthStatus::try_from("degraded").is_err());
    }
}
