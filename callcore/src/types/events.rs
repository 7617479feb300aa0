use super::call::{CallId, CallRecord};

/// Change notification pushed by a signaling store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    /// The record was created or mutated; carries the full current value.
    Changed(CallRecord),
    /// The record no longer exists.
    Deleted(CallId),
}

impl RecordEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Changed(record) => &record.id,
            Self::Deleted(id) => id,
        }
    }
}
