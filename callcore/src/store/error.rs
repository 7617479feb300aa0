use crate::types::call::CallId;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("call record not found: {0}")]
    NotFound(CallId),

    #[error("transient store failure: {0}")]
    Transient(String),
}

impl StoreError {
    /// Transient failures may succeed when retried; not-found never will.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
