//! Lifecycle states of a containerized tool-server instance.

use super::{ParseInstanceStateError, ToolServerDomainError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// No container has been requested yet.
    Uninitialized,
    /// The container exists but has not been started.
    Created,
    /// The engine has been asked to start the container.
    Starting,
    /// Waiting for the container and its exec channel to become usable.
    ReadinessProbing,
    /// The tool process can accept calls.
    Ready,
    /// Teardown is in progress.
    Stopping,
    /// The container has been stopped and removed.
    Terminated,
    /// A lifecycle step failed; teardown is still required.
    Failed,
}

impl InstanceState {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Created => "created",
            Self::Starting => "starting",
            Self::ReadinessProbing => "readiness_probing",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    /// Returns whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Returns whether transition to `target` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Uninitialized, Self::Created | Self::Terminated)
                | (Self::Created, Self::Starting)
                | (Self::Starting, Self::ReadinessProbing)
                | (Self::ReadinessProbing, Self::Ready)
                | (
                    Self::Created
                        | Self::Starting
                        | Self::ReadinessProbing
                        | Self::Ready
                        | Self::Failed,
                    Self::Stopping
                )
                | (Self::Stopping, Self::Terminated)
                | (
                    Self::Uninitialized
                        | Self::Created
                        | Self::Starting
                        | Self::ReadinessProbing
                        | Self::Ready
                        | Self::Stopping,
                    Self::Failed
                )
        )
    }

    /// Validates a transition to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolServerDomainError::InvalidLifecycleTransition`] when the
    /// transition is not allowed.
    pub fn transition_to(self, target: Self) -> Result<Self, ToolServerDomainError> {
        if self.can_transition_to(target) {
            return Ok(target);
        }
        Err(ToolServerDomainError::InvalidLifecycleTransition {
            from: self.as_str().to_owned(),
            to: target.as_str().to_owned(),
        })
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<&str> for InstanceState {
    type Error = ParseInstanceStateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "uninitialized" => Ok(Self::Uninitialized),
            "created" => Ok(Self::Created),
            "starting" => Ok(Self::Starting),
            "readiness_probing" => Ok(Self::ReadinessProbing),
            "ready" => Ok(Self::Ready),
            "stopping" => Ok(Self::Stopping),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseInstanceStateError(value.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ALL_STATES: [InstanceState; 8] = [
        InstanceState::Uninitialized,
        InstanceState::Created,
        InstanceState::Starting,
        InstanceState::ReadinessProbing,
        InstanceState::Ready,
        InstanceState::Stopping,
        InstanceState::Terminated,
        InstanceState::Failed,
    ];

    #[rstest]
    #[case(InstanceState::Uninitialized, InstanceState::Created, true)]
    #[case(InstanceState::Uninitialized, InstanceState::Terminated, true)]
    #[case(InstanceState::Uninitialized, InstanceState::Ready, false)]
    #[case(InstanceState::Created, InstanceState::Starting, true)]
    #[case(InstanceState::Created, InstanceState::Ready, false)]
    #[case(InstanceState::Starting, InstanceState::ReadinessProbing, true)]
    #[case(InstanceState::ReadinessProbing, InstanceState::Ready, true)]
    #[case(InstanceState::ReadinessProbing, InstanceState::Starting, false)]
    #[case(InstanceState::Ready, InstanceState::Stopping, true)]
    #[case(InstanceState::Ready, InstanceState::Terminated, false)]
    #[case(InstanceState::Stopping, InstanceState::Terminated, true)]
    #[case(InstanceState::Stopping, InstanceState::Ready, false)]
    #[case(InstanceState::Failed, InstanceState::Stopping, true)]
    #[case(InstanceState::Failed, InstanceState::Ready, false)]
    #[case(InstanceState::Terminated, InstanceState::Stopping, false)]
    fn lifecycle_transition_matrix(
        #[case] current: InstanceState,
        #[case] target: InstanceState,
        #[case] expected: bool,
    ) {
        assert_eq!(current.can_transition_to(target), expected);
    }

    #[test]
    fn failed_is_reachable_from_every_non_terminal_state() {
        for state in ALL_STATES {
            let expected = !state.is_terminal() && state != InstanceState::Failed;
            assert_eq!(
                state.can_transition_to(InstanceState::Failed),
                expected,
                "{state} -> failed"
            );
        }
    }

    #[test]
    fn terminated_has_no_outgoing_transitions() {
        for target in ALL_STATES {
            assert!(!InstanceState::Terminated.can_transition_to(target));
        }
    }

    #[test]
    fn transition_to_reports_both_states() {
        let result = InstanceState::Created.transition_to(InstanceState::Ready);
        assert_eq!(
            result,
            Err(ToolServerDomainError::InvalidLifecycleTransition {
                from: "created".to_owned(),
                to: "ready".to_owned(),
            })
        );
    }

    #[test]
    fn states_round_trip_through_their_string_form() {
        for state in ALL_STATES {
            assert_eq!(InstanceState::try_from(state.as_str()), Ok(state));
        }
        assert!(InstanceState::try_from("paused").is_err());
    }
}
