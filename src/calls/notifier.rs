//! Inbound call prompts for the local user.

use callcore::types::call::{CallId, CallRecord, CallStatus, EndReason, UserId};
use callcore::types::events::RecordEvent;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use log::{debug, info, warn};
use scopeguard::ScopeGuard;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::CallError;
use super::events::{DismissReason, IncomingCall, PromptDismissed};
use super::manager::{CallContext, SessionRegistry};
use super::session::CallSession;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Call ids the local user already answered, declined or let time out.
#[derive(Debug, Default)]
pub struct HandledCallSet {
    ids: DashSet<CallId>,
}

impl HandledCallSet {
    /// Returns `true` if `id` was not handled before.
    pub fn mark(&self, id: &CallId) -> bool {
        self.ids.insert(id.clone())
    }

    pub fn unmark(&self, id: &CallId) {
        self.ids.remove(id);
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.ids.contains(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screened {
    NotForMe,
    NotRinging,
    Handled,
    Stale,
    AlreadyShown,
}

/// Decide whether `record` should produce a prompt. `None` means show it.
pub fn screen(
    record: &CallRecord,
    me: &UserId,
    now: DateTime<Utc>,
    stale_after: Duration,
    handled: &HandledCallSet,
    shown: bool,
) -> Option<Screened> {
    if !record.is_addressed_to(me) {
        return Some(Screened::NotForMe);
    }
    if record.status != CallStatus::Ringing {
        return Some(Screened::NotRinging);
    }
    if handled.contains(&record.id) {
        return Some(Screened::Handled);
    }
    let age = record.age(now).to_std().unwrap_or_default();
    if age > stale_after {
        return Some(Screened::Stale);
    }
    if shown {
        return Some(Screened::AlreadyShown);
    }
    None
}

struct Prompt {
    record: CallRecord,
    /// Fixed when the prompt is first shown; re-presenting keeps it.
    deadline: Instant,
    ring_timer: JoinHandle<()>,
}

pub struct RingNotifier {
    ctx: Arc<CallContext>,
    registry: Arc<SessionRegistry>,
    handled: HandledCallSet,
    prompts: DashMap<CallId, Prompt>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RingNotifier {
    pub fn new(ctx: Arc<CallContext>, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            registry,
            handled: HandledCallSet::default(),
            prompts: DashMap::new(),
            listener: Mutex::new(None),
        })
    }

    pub fn handled(&self) -> &HandledCallSet {
        &self.handled
    }

    /// Records with a prompt currently shown.
    pub fn pending(&self) -> Vec<CallRecord> {
        self.prompts.iter().map(|p| p.record.clone()).collect()
    }

    pub fn is_prompting(&self, id: &CallId) -> bool {
        self.prompts.contains_key(id)
    }

    /// Subscribe to calls addressed to the local user. Calling it again while
    /// the listener runs does nothing.
    pub async fn listen(self: &Arc<Self>) -> Result<(), CallError> {
        if lock(&self.listener)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
        {
            return Ok(());
        }
        let mut subscription = self.ctx.signaling.incoming_for(&self.ctx.me.id).await?;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(notifier) = weak.upgrade() else {
                    break;
                };
                notifier.on_inbound(event);
            }
            debug!(target: "Call/Ring", "Incoming call listener finished");
        });
        if let Some(previous) = lock(&self.listener).replace(handle) {
            previous.abort();
        }
        info!(target: "Call/Ring", "Listening for calls to {}", self.ctx.me.id);
        Ok(())
    }

    pub fn on_inbound(self: &Arc<Self>, event: RecordEvent) {
        match event {
            RecordEvent::Deleted(id) => self.withdraw(&id),
            RecordEvent::Changed(record) => {
                if record.status != CallStatus::Ringing && self.prompts.contains_key(&record.id) {
                    self.withdraw(&record.id);
                    return;
                }
                let shown = self.prompts.contains_key(&record.id);
                match screen(
                    &record,
                    &self.ctx.me.id,
                    Utc::now(),
                    self.ctx.config.stale_after(),
                    &self.handled,
                    shown,
                ) {
                    None => self.present(record),
                    Some(Screened::AlreadyShown | Screened::NotRinging | Screened::NotForMe) => {}
                    Some(reason) => {
                        debug!(target: "Call/Ring", "Dropping inbound {} ({reason:?})", record.id);
                    }
                }
            }
        }
    }

    fn present(self: &Arc<Self>, record: CallRecord) {
        let deadline = Instant::now() + self.ctx.config.ring_timeout();
        self.show(record, deadline);
    }

    fn show(self: &Arc<Self>, record: CallRecord, deadline: Instant) {
        let id = record.id.clone();
        match self.prompts.entry(id.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let weak = Arc::downgrade(self);
                let timer_id = id.clone();
                let ring_timer = tokio::spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(notifier) = weak.upgrade() {
                        notifier.on_ring_timeout(&timer_id);
                    }
                });
                slot.insert(Prompt {
                    record: record.clone(),
                    deadline,
                    ring_timer,
                });
            }
        }
        info!(
            target: "Call/Ring",
            "Incoming {} call {id} from {}",
            record.call_type, record.caller_name
        );
        let _ = self
            .ctx
            .events
            .incoming_calls
            .send(Arc::new(IncomingCall { record }));
    }

    fn take_prompt(&self, id: &CallId) -> Option<Prompt> {
        let (_, prompt) = self.prompts.remove(id)?;
        prompt.ring_timer.abort();
        Some(prompt)
    }

    fn dismiss(&self, id: &CallId, reason: DismissReason) {
        let _ = self.ctx.events.prompt_dismissed.send(Arc::new(PromptDismissed {
            call_id: id.clone(),
            reason,
        }));
    }

    /// The caller hung up, or someone else moved the record on.
    fn withdraw(&self, id: &CallId) {
        if self.take_prompt(id).is_some() {
            info!(target: "Call/Ring", "Call {id} withdrawn");
            self.dismiss(id, DismissReason::Withdrawn);
        }
    }

    fn on_ring_timeout(&self, id: &CallId) {
        let Some((_, _prompt)) = self.prompts.remove(id) else {
            return;
        };
        self.handled.mark(id);
        info!(target: "Call/Ring", "Call {id} unanswered, declining");
        self.dismiss(id, DismissReason::TimedOut);
        self.end_record(id, EndReason::RingTimeout);
    }

    fn end_record(&self, id: &CallId, reason: EndReason) {
        let signaling = self.ctx.signaling.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = signaling.end_call(&id, reason).await {
                warn!(target: "Call/Ring", "Could not end {id} ({reason}): {e}");
            }
        });
    }

    /// Answer a call. The id is marked handled before anything else, so a
    /// second accept or decline for it fails with `AlreadyHandled`.
    ///
    /// If joining fails the mark is reverted and no session is kept.
    pub async fn accept(self: &Arc<Self>, id: &CallId) -> Result<Arc<CallSession>, CallError> {
        if !self.handled.mark(id) {
            return Err(CallError::AlreadyHandled(id.clone()));
        }
        let handled = &self.handled;
        let guard = scopeguard::guard(id.clone(), |id| {
            handled.unmark(&id);
            debug!(target: "Call/Ring", "Accept of {id} reverted");
        });

        let prompt = self.take_prompt(id);
        match CallSession::join_new(self.ctx.clone(), id.clone()).await {
            Ok(session) => {
                ScopeGuard::into_inner(guard);
                self.registry.insert(session.clone()).await;
                self.dismiss(id, DismissReason::Accepted);
                Ok(session)
            }
            Err(e) => {
                drop(guard);
                warn!(target: "Call/Ring", "Accepting {id} failed: {e}");
                if e.is_call_gone() {
                    self.dismiss(id, DismissReason::CallGone);
                } else if let Some(prompt) = prompt {
                    self.show(prompt.record, prompt.deadline);
                }
                Err(e)
            }
        }
    }

    /// Decline a call. Returns once the prompt is dismissed; the record is
    /// ended in the background.
    pub fn decline(&self, id: &CallId) -> Result<(), CallError> {
        if !self.handled.mark(id) {
            return Err(CallError::AlreadyHandled(id.clone()));
        }
        self.take_prompt(id);
        info!(target: "Call/Ring", "Declined {id}");
        self.dismiss(id, DismissReason::Declined);
        self.end_record(id, EndReason::Declined);
        Ok(())
    }

    /// Stop listening and drop every prompt without answering it.
    pub fn stop(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        let ids: Vec<CallId> = self.prompts.iter().map(|p| p.key().clone()).collect();
        for id in ids {
            self.take_prompt(&id);
        }
    }
}
