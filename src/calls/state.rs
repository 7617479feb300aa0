//! Local call session state machine.

use callcore::types::call::EndReason;
use chrono::{DateTime, Utc};

use super::error::CallError;

/// One participant's view of a call attempt.
#[derive(Debug, Clone, Default)]
pub enum LocalState {
    /// Session created, capture not yet acquired.
    #[default]
    Initializing,
    /// Capture acquired, waiting for remote media.
    Connecting { since: DateTime<Utc> },
    /// Remote media attached and transport up.
    Connected { connected_at: DateTime<Utc> },
    /// Setup or transport failure. `retry` or `end` leave this state.
    Failed { error: CallError, at: DateTime<Utc> },
    /// Terminal.
    Ended {
        reason: EndReason,
        at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl LocalState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn error(&self) -> Option<&CallError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Failed { .. } => "failed",
            Self::Ended { .. } => "ended",
        }
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: SessionTransition,
    ) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        let next = match (&*self, transition) {
            (Self::Initializing, SessionTransition::CaptureAcquired) => {
                Self::Connecting { since: now }
            }
            (Self::Connecting { .. }, SessionTransition::RemoteMediaAttached) => Self::Connected {
                connected_at: now,
            },
            (
                Self::Initializing | Self::Connecting { .. } | Self::Connected { .. },
                SessionTransition::Fail { error },
            ) => Self::Failed { error, at: now },
            (Self::Failed { .. }, SessionTransition::Retry) => Self::Initializing,
            (Self::Connected { connected_at }, SessionTransition::End { reason }) => {
                let duration = now.signed_duration_since(*connected_at).num_seconds();
                Self::Ended {
                    reason,
                    at: now,
                    duration_secs: Some(duration),
                }
            }
            (
                Self::Initializing | Self::Connecting { .. } | Self::Failed { .. },
                SessionTransition::End { reason },
            ) => Self::Ended {
                reason,
                at: now,
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        *self = next;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum SessionTransition {
    CaptureAcquired,
    RemoteMediaAttached,
    Fail { error: CallError },
    Retry,
    End { reason: EndReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: &'static str,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
