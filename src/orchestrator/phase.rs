//! Deployment lifecycle phases.

use serde::Serialize;

use crate::error::{DeployError, Result};

/// Lifecycle of one deployment.
///
/// `Planned -> Confirmed -> Executing -> {Succeeded, PartiallyFailed}`, then
/// `Succeeded -> Committed` or `PartiallyFailed -> RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    /// A plan has been computed.
    Planned,
    /// The plan was accepted.
    Confirmed,
    /// Provider operations are running.
    Executing,
    /// Every operation succeeded.
    Succeeded,
    /// At least one operation failed or the deadline expired.
    PartiallyFailed,
    /// Final state persisted after success.
    Committed,
    /// Applied changes were reversed.
    RolledBack,
}

impl DeploymentPhase {
    /// Returns true if `self -> to` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Planned, Self::Confirmed)
                | (Self::Confirmed, Self::Executing)
                | (Self::Executing, Self::Succeeded | Self::PartiallyFailed)
                | (Self::Succeeded, Self::Committed)
                | (Self::PartiallyFailed, Self::RolledBack)
        )
    }

    /// Moves to the next phase.
    ///
    /// # Errors
    ///
    /// Returns an internal error for an illegal move.
    pub fn transition(self, to: Self) -> Result<Self> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(DeployError::internal(format!(
                "illegal deployment phase transition {self} -> {to}"
            )))
        }
    }

    /// Returns true for `Committed` and `RolledBack`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Confirmed => "confirmed",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially failed",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_path() {
        let phase = DeploymentPhase::Planned
            .transition(DeploymentPhase::Confirmed)
            .and_then(|p| p.transition(DeploymentPhase::Executing))
            .and_then(|p| p.transition(DeploymentPhase::Succeeded))
            .and_then(|p| p.transition(DeploymentPhase::Committed))
            .expect("valid path");

        assert!(phase.is_terminal());
    }

    #[test]
    fn test_illegal_moves() {
        assert!(DeploymentPhase::Planned
            .transition(DeploymentPhase::Executing)
            .is_err());
        assert!(!DeploymentPhase::Succeeded.can_transition_to(DeploymentPhase::RolledBack));
        assert!(!DeploymentPhase::PartiallyFailed.can_transition_to(DeploymentPhase::Committed));
        assert!(!DeploymentPhase::Committed.can_transition_to(DeploymentPhase::Executing));
    }
}
