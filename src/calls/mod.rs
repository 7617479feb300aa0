//! Call orchestration for one local user.
//!
//! # Architecture
//!
//! - [`CallSession`]: one participant's side of a call, from capture to `end`
//! - [`SignalingChannel`]: session intents to store writes, store changes to session events
//! - [`RingNotifier`]: inbound prompts, ring timeout, accept and decline
//! - [`MediaController`]: local tracks, remote attach, toggles and release
//! - [`DurationGuard`]: connected-time counters and the hard cap
//! - [`AnalysisBridge`]: sampled frames to the authenticity analyzer
//! - [`CallManager`]: owns the shared context and the sessions
//!
//! Participants never talk to each other directly. Everything they share goes
//! through the call record in the signaling store, whose status only moves
//! forward and stops at `ended`.

mod analysis;
mod duration;
mod error;
mod events;
mod manager;
mod media_controller;
mod notifier;
mod retry;
mod session;
mod signaling;
mod state;

pub use analysis::AnalysisBridge;
pub use duration::{DurationGuard, TickOutcome};
pub use error::CallError;
pub use events::{
    CallTerminated, CallTick, DismissReason, DurationTick, EventBus, IncomingCall, MediaFlags,
    MediaFlagsChanged, PromptDismissed, StateChanged, VerdictReceived,
};
pub use manager::{CallContext, CallManager, SessionRegistry};
pub use media_controller::MediaController;
pub use notifier::{HandledCallSet, RingNotifier, Screened, screen};
pub use retry::{RetryError, RetryPolicy};
pub use session::{CallSession, StartCall};
pub use signaling::{ChannelEvent, SignalingChannel, StatusTracker, WatchHandle};
pub use state::{InvalidTransition, LocalState, SessionTransition};
