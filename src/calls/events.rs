//! Events delivered to the presentation layer.

use callcore::analysis::Verdict;
use callcore::quality::QualityPreset;
use callcore::types::call::{CallId, CallRecord, EndReason};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::state::LocalState;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct StateChanged {
    pub call_id: CallId,
    pub state: LocalState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationTick {
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CallTick {
    pub call_id: CallId,
    pub tick: DurationTick,
}

/// Local media toggles as last confirmed by read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFlags {
    pub muted: bool,
    pub video_off: bool,
    pub speaker_on: bool,
    pub quality: QualityPreset,
}

#[derive(Debug, Clone)]
pub struct MediaFlagsChanged {
    pub call_id: CallId,
    pub flags: MediaFlags,
}

/// A ringing call that should be shown to the local user.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub record: CallRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissReason {
    Accepted,
    Declined,
    TimedOut,
    /// The caller hung up or the record moved past ringing.
    Withdrawn,
    /// Accepting failed because the call no longer exists.
    CallGone,
}

#[derive(Debug, Clone)]
pub struct PromptDismissed {
    pub call_id: CallId,
    pub reason: DismissReason,
}

#[derive(Debug, Clone)]
pub struct VerdictReceived {
    pub call_id: CallId,
    pub verdict: Verdict,
}

/// Emitted exactly once per session when it ends.
#[derive(Debug, Clone)]
pub struct CallTerminated {
    pub call_id: CallId,
    pub reason: EndReason,
    pub duration_secs: Option<i64>,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event kind.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Session events
    (state_changed, Arc<StateChanged>),
    (ticks, Arc<CallTick>),
    (media_flags, Arc<MediaFlagsChanged>),
    (terminated, Arc<CallTerminated>),

    // Ring events
    (incoming_calls, Arc<IncomingCall>),
    (prompt_dismissed, Arc<PromptDismissed>),

    // Analysis
    (verdicts, Arc<VerdictReceived>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
