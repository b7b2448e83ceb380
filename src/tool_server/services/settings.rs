//! Tunables for a [`ServerManager`](super::ServerManager).

use crate::tool_server::domain::{
    DEFAULT_NAMESPACE, HealthCheckPolicy, ManagementLabels, ToolServerDomainError,
};
use crate::tool_server::transport::{DEFAULT_DIAGNOSTIC_LINES, DEFAULT_MAX_FRAME_BYTES, TransportLimits};
use camino::Utf8Path;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading manager settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("failed to read settings file {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// I/O failure.
        source: std::io::Error,
    },
    /// The settings file is not valid JSON for these settings.
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        /// File path.
        path: String,
        /// Decoder failure.
        source: serde_json::Error,
    },
    /// A setting failed validation.
    #[error(transparent)]
    Invalid(#[from] ToolServerDomainError),
}

/// Manager configuration with per-field defaults.
///
/// Every field may be omitted from a settings file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Namespace stamped onto every managed container.
    pub label_namespace: String,
    /// Readiness attempts before giving up.
    pub readiness_attempts: u32,
    /// Fixed delay between readiness attempts, in milliseconds.
    pub readiness_backoff_ms: u64,
    /// No-op command executed to confirm the exec channel works.
    pub probe_command: Vec<String>,
    /// Bound on one exec probe, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Bound on the protocol handshake, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Bound on one tool call or tool listing, in milliseconds.
    pub call_timeout_ms: u64,
    /// Bound on one liveness ping, in milliseconds.
    pub ping_timeout_ms: u64,
    /// Grace period for an in-flight call during teardown, in milliseconds.
    pub close_timeout_ms: u64,
    /// Seconds the engine waits before killing a stopping container.
    pub stop_grace_secs: u32,
    /// Container log lines captured for readiness diagnostics.
    pub log_tail_lines: usize,
    /// Liveness interval for servers that declare no policy, in milliseconds.
    pub default_health_interval_ms: u64,
    /// Tolerated consecutive ping failures for servers that declare no policy.
    pub default_health_max_retries: u32,
    /// Buffered health-change events per subscriber.
    pub health_event_capacity: usize,
    /// Largest accepted protocol frame, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            label_namespace: DEFAULT_NAMESPACE.to_owned(),
            readiness_attempts: 30,
            readiness_backoff_ms: 1_000,
            probe_command: vec!["true".to_owned()],
            probe_timeout_ms: 5_000,
            handshake_timeout_ms: 30_000,
            call_timeout_ms: 30_000,
            ping_timeout_ms: 5_000,
            close_timeout_ms: 2_000,
            stop_grace_secs: 5,
            log_tail_lines: 50,
            default_health_interval_ms: 30_000,
            default_health_max_retries: 3,
            health_event_capacity: 64,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ManagerSettings {
    /// Loads settings from a JSON file; omitted fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] when the file cannot be read or parsed, or
    /// a setting fails validation.
    pub fn from_json_file(path: &Utf8Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_string(),
            source,
        })?;
        let settings: Self =
            serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
                path: path.to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Sets the label namespace.
    #[must_use]
    pub fn with_label_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.label_namespace = namespace.into();
        self
    }

    /// Sets the readiness budget.
    #[must_use]
    pub fn with_readiness(mut self, attempts: u32, backoff: Duration) -> Self {
        self.readiness_attempts = attempts;
        self.readiness_backoff_ms = millis(backoff);
        self
    }

    /// Sets the exec probe command.
    #[must_use]
    pub fn with_probe_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.probe_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the bound on one exec probe.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = millis(timeout);
        self
    }

    /// Sets the tool call timeout.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = millis(timeout);
        self
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = millis(timeout);
        self
    }

    /// Sets the liveness ping timeout.
    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = millis(timeout);
        self
    }

    /// Sets the liveness policy for servers that declare none.
    #[must_use]
    pub fn with_default_health_check(mut self, policy: HealthCheckPolicy) -> Self {
        self.default_health_interval_ms = millis(policy.interval());
        self.default_health_max_retries = policy.max_retries();
        self
    }

    /// Builds the management label set.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError::InvalidLabelNamespace`] when the
    /// namespace is not label-safe.
    pub fn labels(&self) -> Result<ManagementLabels, ToolServerDomainError> {
        ManagementLabels::new(self.label_namespace.as_str())
    }

    /// Returns the readiness backoff.
    #[must_use]
    pub const fn readiness_backoff(&self) -> Duration {
        Duration::from_millis(self.readiness_backoff_ms)
    }

    /// Returns the exec probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Returns the handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Returns the tool call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Returns the liveness ping timeout.
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Returns the client close grace period.
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Returns the liveness policy for servers that declare none.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError::ZeroHealthCheckInterval`] when the
    /// default interval is zero.
    pub fn default_health_check(&self) -> Result<HealthCheckPolicy, ToolServerDomainError> {
        HealthCheckPolicy::new(
            Duration::from_millis(self.default_health_interval_ms),
            self.default_health_max_retries,
        )
    }

    /// Validates the settings that are checked lazily elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError`] for an invalid namespace or a zero
    /// default health interval.
    pub fn validate(&self) -> Result<(), ToolServerDomainError> {
        self.labels()?;
        self.default_health_check()?;
        Ok(())
    }

    /// Returns the transport limits.
    #[must_use]
    pub const fn transport_limits(&self) -> TransportLimits {
        TransportLimits {
            max_frame_bytes: self.max_frame_bytes,
            diagnostic_lines: DEFAULT_DIAGNOSTIC_LINES,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_budgets() {
        let settings = ManagerSettings::default();
        assert_eq!(settings.readiness_attempts, 30);
        assert_eq!(settings.readiness_backoff(), Duration::from_secs(1));
        assert_eq!(settings.call_timeout(), Duration::from_secs(30));
        assert_eq!(settings.probe_command, vec!["true".to_owned()]);
        let policy = settings
            .default_health_check()
            .expect("default policy should validate");
        assert_eq!(policy.interval(), Duration::from_secs(30));
        assert_eq!(policy.max_retries(), 3);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should be created");
        file.write_all(br#"{"label_namespace": "ci", "readiness_attempts": 3}"#)
            .expect("settings should be written");
        let path = Utf8PathBuf::from_path_buf(file.path().to_path_buf()).expect("utf-8 temp path");

        let settings = ManagerSettings::from_json_file(&path).expect("settings should load");

        assert_eq!(settings.label_namespace, "ci");
        assert_eq!(settings.readiness_attempts, 3);
        assert_eq!(settings.log_tail_lines, 50);
    }

    #[rstest]
    #[case(r#"{"label_namespace": "has space"}"#)]
    #[case(r#"{"readiness_attempts": "many"}"#)]
    #[case(r#"{"default_health_interval_ms": 0}"#)]
    fn invalid_files_are_rejected(#[case] contents: &str) {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should be created");
        file.write_all(contents.as_bytes())
            .expect("settings should be written");
        let path = Utf8PathBuf::from_path_buf(file.path().to_path_buf()).expect("utf-8 temp path");

        assert!(ManagerSettings::from_json_file(&path).is_err());
    }
}
