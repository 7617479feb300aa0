//! Call-related error types.

use callcore::analysis::AnalyzerError;
use callcore::media::{AcquisitionError, TrackKind, TransportError};
use callcore::store::StoreError;
use callcore::types::call::CallId;
use thiserror::Error;

use super::retry::RetryError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("media acquisition failed ({kind}): {0}", kind = .0.kind())]
    MediaAcquisition(#[from] AcquisitionError),

    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("call already ended: {0}")]
    AlreadyEnded(CallId),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("signaling store unavailable: {0}")]
    SignalingTransient(String),

    #[error("analysis error: {0}")]
    Analysis(#[from] AnalyzerError),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("session already started")]
    AlreadyStarted,

    #[error("session already ended")]
    SessionEnded,

    #[error("nothing to retry in state {0}")]
    NothingToRetry(&'static str),

    #[error("no local {0} track")]
    TrackUnavailable(TrackKind),

    #[error("call already handled: {0}")]
    AlreadyHandled(CallId),
}

impl CallError {
    /// Whether the call itself is gone, as opposed to a local problem the
    /// user can retry from.
    pub fn is_call_gone(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::AlreadyEnded(_))
    }

    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::MediaAcquisition(kind) => Some(kind.remediation()),
            _ => None,
        }
    }
}

impl From<StoreError> for CallError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Transient(msg) => Self::SignalingTransient(msg),
        }
    }
}

impl From<RetryError<StoreError>> for CallError {
    fn from(e: RetryError<StoreError>) -> Self {
        match e {
            RetryError::Fatal(e) => e.into(),
            RetryError::Exhausted { attempts, last } => Self::TransportFailed(format!(
                "signaling unavailable after {attempts} attempts: {last}"
            )),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NoTrack(kind) => Self::TrackUnavailable(kind),
            other => Self::TransportFailed(other.to_string()),
        }
    }
}
