pub mod call;
pub mod events;

pub use call::{
    CallId, CallInit, CallRecord, CallRole, CallStatus, CallType, EndReason, Participant,
    ParticipantStatus, ParticipantUpdate, RecordPatch, UserId, UserRef,
};
pub use events::RecordEvent;
