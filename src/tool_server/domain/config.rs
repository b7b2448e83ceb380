//! Tool-server configuration value objects.

use super::{ParseVolumeModeError, ServerId, ToolServerDomainError};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Access mode of a volume binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeMode {
    /// The container may only read the bound path.
    #[serde(rename = "ro")]
    ReadOnly,
    /// The container may read and write the bound path.
    #[serde(rename = "rw")]
    ReadWrite,
}

impl VolumeMode {
    /// Returns the engine bind-mode suffix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<&str> for VolumeMode {
    type Error = ParseVolumeModeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ro" => Ok(Self::ReadOnly),
            "rw" => Ok(Self::ReadWrite),
            _ => Err(ParseVolumeModeError(value.to_owned())),
        }
    }
}

/// Host directory bound into a tool-server container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    source: Utf8PathBuf,
    target: Utf8PathBuf,
    mode: VolumeMode,
}

impl VolumeBinding {
    /// Creates a volume binding.
    ///
    /// Whether the source exists is left to the engine; a bad path surfaces as
    /// a create failure.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError`] when a path is empty or the target is
    /// not absolute.
    pub fn new(
        source: impl Into<Utf8PathBuf>,
        target: impl Into<Utf8PathBuf>,
        mode: VolumeMode,
    ) -> Result<Self, ToolServerDomainError> {
        let source_path = source.into();
        let target_path = target.into();
        if source_path.as_str().trim().is_empty() || target_path.as_str().trim().is_empty() {
            return Err(ToolServerDomainError::EmptyVolumePath);
        }
        if !target_path.as_str().starts_with('/') {
            return Err(ToolServerDomainError::RelativeVolumeTarget(
                target_path.into_string(),
            ));
        }
        Ok(Self {
            source: source_path,
            target: target_path,
            mode,
        })
    }

    /// Returns the host source path.
    #[must_use]
    pub const fn source(&self) -> &Utf8PathBuf {
        &self.source
    }

    /// Returns the in-container target path.
    #[must_use]
    pub const fn target(&self) -> &Utf8PathBuf {
        &self.target
    }

    /// Returns the access mode.
    #[must_use]
    pub const fn mode(&self) -> VolumeMode {
        self.mode
    }

    /// Renders the binding in engine bind syntax (`source:target:mode`).
    #[must_use]
    pub fn to_bind_spec(&self) -> String {
        format!("{}:{}:{}", self.source, self.target, self.mode)
    }
}

/// Liveness policy for a tool server.
///
/// When present on a [`ServerConfig`], the engine's own health subsystem must
/// report healthy before the instance is considered ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    interval_ms: u64,
    max_retries: u32,
}

impl HealthCheckPolicy {
    /// Creates a health-check policy.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError::ZeroHealthCheckInterval`] when the
    /// interval is zero.
    pub fn new(interval: Duration, max_retries: u32) -> Result<Self, ToolServerDomainError> {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if interval_ms == 0 {
            return Err(ToolServerDomainError::ZeroHealthCheckInterval);
        }
        Ok(Self {
            interval_ms,
            max_retries,
        })
    }

    /// Returns the interval between liveness pings.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Returns the number of consecutive failed pings tolerated before the
    /// server is reported unhealthy.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Immutable description of a containerized tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    id: ServerId,
    display_name: String,
    image: String,
    #[serde(default)]
    command: Vec<String>,
    entrypoint: Vec<String>,
    #[serde(default)]
    volumes: Vec<VolumeBinding>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    health_check: Option<HealthCheckPolicy>,
}

impl ServerConfig {
    /// Creates a server configuration with required fields.
    ///
    /// `entrypoint` is the tool-process command executed inside the running
    /// container; it speaks the tool-invocation protocol on its stdio.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError`] when the image reference or the
    /// entrypoint is empty.
    pub fn new(
        id: ServerId,
        display_name: impl Into<String>,
        image: impl Into<String>,
        entrypoint: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, ToolServerDomainError> {
        let image_reference = image.into().trim().to_owned();
        if image_reference.is_empty() {
            return Err(ToolServerDomainError::EmptyImageReference);
        }

        let entrypoint_args: Vec<String> = entrypoint.into_iter().map(Into::into).collect();
        if entrypoint_args
            .first()
            .is_none_or(|program| program.trim().is_empty())
        {
            return Err(ToolServerDomainError::EmptyEntrypoint);
        }

        let name = display_name.into().trim().to_owned();
        let resolved_name = if name.is_empty() {
            id.as_str().to_owned()
        } else {
            name
        };

        Ok(Self {
            id,
            display_name: resolved_name,
            image: image_reference,
            command: Vec::new(),
            entrypoint: entrypoint_args,
            volumes: Vec::new(),
            env: BTreeMap::new(),
            health_check: None,
        })
    }

    /// Sets the container's startup command.
    #[must_use]
    pub fn with_command(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = values.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a volume binding.
    #[must_use]
    pub fn with_volume(mut self, binding: VolumeBinding) -> Self {
        self.volumes.push(binding);
        self
    }

    /// Replaces the container environment.
    #[must_use]
    pub fn with_env(mut self, values: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env = values.into_iter().collect();
        self
    }

    /// Declares a health-check policy.
    #[must_use]
    pub const fn with_health_check(mut self, policy: HealthCheckPolicy) -> Self {
        self.health_check = Some(policy);
        self
    }

    /// Returns the server identifier.
    #[must_use]
    pub const fn id(&self) -> &ServerId {
        &self.id
    }

    /// Returns the human-readable display name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the image reference.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Returns the container startup command (empty means image default).
    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Returns the in-container tool-process entrypoint.
    #[must_use]
    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }

    /// Returns volume bindings.
    #[must_use]
    pub fn volumes(&self) -> &[VolumeBinding] {
        &self.volumes
    }

    /// Returns environment variables.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Returns the optional health-check policy.
    #[must_use]
    pub const fn health_check(&self) -> Option<&HealthCheckPolicy> {
        self.health_check.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn server_id() -> ServerId {
        ServerId::new("filesystem").expect("valid server id")
    }

    #[test]
    fn config_defaults_display_name_to_id() {
        let config = ServerConfig::new(server_id(), "  ", "mcp/filesystem", ["node", "index.js"])
            .expect("valid config");
        assert_eq!(config.display_name(), "filesystem");
        assert!(config.command().is_empty());
        assert!(config.health_check().is_none());
    }

    #[rstest]
    #[case("", vec!["node"], ToolServerDomainError::EmptyImageReference)]
    #[case("mcp/filesystem", vec![], ToolServerDomainError::EmptyEntrypoint)]
    #[case("mcp/filesystem", vec![" "], ToolServerDomainError::EmptyEntrypoint)]
    fn config_rejects_missing_fields(
        #[case] image: &str,
        #[case] entrypoint: Vec<&str>,
        #[case] expected: ToolServerDomainError,
    ) {
        let result = ServerConfig::new(server_id(), "Files", image, entrypoint);
        assert_eq!(result, Err(expected));
    }

    #[test]
    fn volume_binding_renders_bind_spec() {
        let binding = VolumeBinding::new("/srv/data", "/projects", VolumeMode::ReadOnly)
            .expect("valid binding");
        assert_eq!(binding.to_bind_spec(), "/srv/data:/projects:ro");
    }

    #[test]
    fn volume_binding_requires_absolute_target() {
        let result = VolumeBinding::new("/srv/data", "projects", VolumeMode::ReadWrite);
        assert_eq!(
            result,
            Err(ToolServerDomainError::RelativeVolumeTarget(
                "projects".to_owned()
            ))
        );
    }

    #[rstest]
    #[case("ro", VolumeMode::ReadOnly)]
    #[case(" RW ", VolumeMode::ReadWrite)]
    fn volume_mode_parses_engine_suffixes(#[case] input: &str, #[case] expected: VolumeMode) {
        assert_eq!(VolumeMode::try_from(input), Ok(expected));
    }

    #[test]
    fn health_check_rejects_zero_interval() {
        assert_eq!(
            HealthCheckPolicy::new(Duration::ZERO, 3),
            Err(ToolServerDomainError::ZeroHealthCheckInterval)
        );
    }

    #[test]
    fn config_deserializes_from_tool_configuration_json() {
        let config: ServerConfig = serde_json::from_value(json!({
            "id": "filesystem",
            "display_name": "Filesystem",
            "image": "mcp/filesystem:latest",
            "entrypoint": ["node", "/app/dist/index.js", "/projects"],
            "volumes": [{"source": "/srv/data", "target": "/projects", "mode": "ro"}],
            "env": {"LOG_LEVEL": "debug"},
            "health_check": {"interval_ms": 15000, "max_retries": 2}
        }))
        .expect("config should deserialize");

        assert_eq!(config.id().as_str(), "filesystem");
        assert_eq!(config.volumes().len(), 1);
        assert_eq!(
            config.health_check().map(HealthCheckPolicy::interval),
            Some(Duration::from_secs(15))
        );
        assert_eq!(config.env().get("LOG_LEVEL").map(String::as_str), Some("debug"));
    }
}
