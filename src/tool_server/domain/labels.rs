//! Management labels stamped onto every container this crate creates.
//!
//! The label set is the only state that survives a process restart: orphan
//! reconciliation rediscovers managed containers purely by label filter.

use super::{ServerId, ToolServerDomainError};
use std::collections::BTreeMap;

/// Label key marking a container as managed by this crate.
pub const MANAGED_LABEL: &str = "dev.quay.managed";

/// Label key scoping managed containers to one manager namespace.
pub const NAMESPACE_LABEL: &str = "dev.quay.namespace";

/// Label key carrying the logical server identifier.
pub const SERVER_LABEL: &str = "dev.quay.server";

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "default";

const MANAGED_LABEL_VALUE: &str = "true";

/// Label set owned by a single manager instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagementLabels {
    namespace: String,
}

impl ManagementLabels {
    /// Creates a label set scoped to `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError::InvalidLabelNamespace`] when the
    /// namespace is empty or contains characters outside `[a-z0-9_-]`.
    pub fn new(namespace: impl Into<String>) -> Result<Self, ToolServerDomainError> {
        let normalized = namespace.into().trim().to_ascii_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized.chars().all(|character| {
                character.is_ascii_lowercase()
                    || character.is_ascii_digit()
                    || character == '_'
                    || character == '-'
            });
        if !is_valid {
            return Err(ToolServerDomainError::InvalidLabelNamespace(normalized));
        }
        Ok(Self {
            namespace: normalized,
        })
    }

    /// Returns the namespace component.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the filter matching every container of this namespace.
    #[must_use]
    pub fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_LABEL.to_owned(), MANAGED_LABEL_VALUE.to_owned()),
            (NAMESPACE_LABEL.to_owned(), self.namespace.clone()),
        ])
    }

    /// Returns the full label set for a server's container.
    #[must_use]
    pub fn for_server(&self, server_id: &ServerId) -> BTreeMap<String, String> {
        let mut labels = self.selector();
        labels.insert(SERVER_LABEL.to_owned(), server_id.as_str().to_owned());
        labels
    }

    /// Derives the engine container name for a server.
    #[must_use]
    pub fn container_name(&self, server_id: &ServerId) -> String {
        format!("quay-{}-{}", self.namespace, server_id)
    }

    /// Extracts the server identifier from a container's labels.
    #[must_use]
    pub fn server_of(labels: &BTreeMap<String, String>) -> Option<ServerId> {
        labels
            .get(SERVER_LABEL)
            .and_then(|value| ServerId::new(value.as_str()).ok())
    }
}

impl Default for ManagementLabels {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_owned(),
        }
    }
}
