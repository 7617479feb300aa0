//! Maps session intents to signaling store operations and store changes back
//! to session events.

use callcore::store::{RecordSubscription, SignalingStore, StoreError};
use callcore::types::call::{
    CallId, CallInit, CallRecord, CallStatus, EndReason, RecordPatch, UserId, UserRef,
};
use callcore::types::events::RecordEvent;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::error::CallError;
use super::retry::RetryPolicy;

/// What a session learns about its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The record changed without ending.
    Updated(CallRecord),
    /// The record ended or was deleted. Delivered at most once per watch.
    Terminated {
        call_id: CallId,
        reason: EndReason,
        deleted: bool,
    },
}

/// Folds raw record events into channel events.
///
/// Drops status regressions and duplicates, and reports termination once no
/// matter whether it is seen as `ended`, as a deletion, or both.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<CallStatus>,
    terminated: bool,
}

impl StatusTracker {
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn observe(&mut self, event: RecordEvent) -> Option<ChannelEvent> {
        if self.terminated {
            return None;
        }
        match event {
            RecordEvent::Deleted(call_id) => {
                self.terminated = true;
                Some(ChannelEvent::Terminated {
                    call_id,
                    reason: EndReason::RemoteEnded,
                    deleted: true,
                })
            }
            RecordEvent::Changed(record) if record.status.is_ended() => {
                self.terminated = true;
                self.last = Some(CallStatus::Ended);
                Some(ChannelEvent::Terminated {
                    call_id: record.id,
                    reason: record.end_reason.unwrap_or(EndReason::RemoteEnded),
                    deleted: false,
                })
            }
            RecordEvent::Changed(record) => {
                if let Some(last) = self.last
                    && record.status.rank() < last.rank()
                {
                    debug!(
                        target: "Call/Signaling",
                        "Ignoring stale {} for {} (already {})",
                        record.status, record.id, last
                    );
                    return None;
                }
                self.last = Some(record.status);
                Some(ChannelEvent::Updated(record))
            }
        }
    }
}

/// Logical handle for a record watch. Subscribing again for the same call
/// returns an equal handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHandle {
    pub call_id: CallId,
    id: u64,
}

struct ActiveWatch {
    handle: WatchHandle,
    pump: JoinHandle<()>,
}

pub struct SignalingChannel {
    store: Arc<dyn SignalingStore>,
    retry: RetryPolicy,
    retention: Duration,
    watches: Mutex<HashMap<CallId, ActiveWatch>>,
    next_watch: AtomicU64,
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("retry", &self.retry)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn SignalingStore>, retry: RetryPolicy, retention: Duration) -> Self {
        Self {
            store,
            retry,
            retention,
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn SignalingStore> {
        &self.store
    }

    /// Create a fresh `ringing` record.
    pub async fn create_record(&self, init: CallInit) -> Result<CallRecord, CallError> {
        let record = CallRecord::new(CallId::generate(&init.caller.id), init, Utc::now());
        self.retry
            .run("create call record", StoreError::is_retryable, || {
                self.store.create(record.clone())
            })
            .await?;
        info!(
            target: "Call/Signaling",
            "Created {} call {} in room {}",
            record.call_type, record.id, record.room_id
        );
        Ok(record)
    }

    pub async fn fetch(&self, id: &CallId) -> Result<CallRecord, CallError> {
        Ok(self
            .retry
            .run("fetch call record", StoreError::is_retryable, || {
                self.store.get(id)
            })
            .await?)
    }

    /// Advance the record status. Returns whether the record now carries
    /// `status`; a rejected regression is `Ok(false)`.
    pub async fn update_status(&self, id: &CallId, status: CallStatus) -> Result<bool, CallError> {
        let merged = self.patch(id, RecordPatch::status(status)).await?;
        if merged.status != status {
            debug!(
                target: "Call/Signaling",
                "Status {} for {} not applied, record is {}",
                status, id, merged.status
            );
        }
        Ok(merged.status == status)
    }

    /// Mark `user` as connected on the record and move it to `connecting`.
    pub async fn mark_joined(&self, id: &CallId, user: &UserRef) -> Result<CallRecord, CallError> {
        let merged = self.patch(id, RecordPatch::joined(user)).await?;
        if merged.status.is_ended() {
            return Err(CallError::AlreadyEnded(id.clone()));
        }
        Ok(merged)
    }

    /// Mark `user` disconnected while the call goes on for everyone else.
    pub async fn leave(&self, id: &CallId, user: &UserRef) -> Result<(), CallError> {
        match self.patch(id, RecordPatch::left(user)).await {
            Ok(_) => {
                info!(target: "Call/Signaling", "{} left call {id}", user.id);
                Ok(())
            }
            Err(CallError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Mark the record ended and schedule its deletion after the retention
    /// delay. A record that is already gone counts as ended.
    pub async fn end_call(&self, id: &CallId, reason: EndReason) -> Result<(), CallError> {
        let now = Utc::now();
        match self.patch(id, RecordPatch::ended(reason, now)).await {
            Ok(_) => {}
            Err(CallError::NotFound(_)) => {
                debug!(target: "Call/Signaling", "Call {id} already gone while ending");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        info!(target: "Call/Signaling", "Marked call {id} ended ({reason})");
        self.schedule_delete(id.clone());
        Ok(())
    }

    fn schedule_delete(&self, id: CallId) {
        let store = self.store.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            match store.delete(&id).await {
                Ok(()) => debug!(target: "Call/Signaling", "Deleted ended call {id}"),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(target: "Call/Signaling", "Failed to delete ended call {id}: {e}"),
            }
        });
    }

    async fn patch(&self, id: &CallId, patch: RecordPatch) -> Result<CallRecord, CallError> {
        Ok(self
            .retry
            .run("update call record", StoreError::is_retryable, || {
                self.store.update(id, patch.clone())
            })
            .await?)
    }

    /// Watch a record and forward folded events to `sink`.
    ///
    /// One watch per call id: a second subscribe returns the existing handle
    /// and leaves the original sink in place.
    pub async fn subscribe(
        &self,
        id: &CallId,
        sink: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<WatchHandle, CallError> {
        let mut watches = self.watches.lock().await;
        if let Some(active) = watches.get(id)
            && !active.pump.is_finished()
        {
            debug!(target: "Call/Signaling", "Already watching {id}");
            return Ok(active.handle.clone());
        }

        let subscription = self
            .retry
            .run("subscribe to call record", StoreError::is_retryable, || {
                self.store.subscribe(id)
            })
            .await?;

        let handle = WatchHandle {
            call_id: id.clone(),
            id: self.next_watch.fetch_add(1, Ordering::Relaxed),
        };
        let pump = tokio::spawn(pump_record_events(id.clone(), subscription, sink));
        watches.insert(
            id.clone(),
            ActiveWatch {
                handle: handle.clone(),
                pump,
            },
        );
        Ok(handle)
    }

    pub async fn unsubscribe(&self, id: &CallId) {
        if let Some(active) = self.watches.lock().await.remove(id) {
            active.pump.abort();
            debug!(target: "Call/Signaling", "Stopped watching {id}");
        }
    }

    pub async fn is_watching(&self, id: &CallId) -> bool {
        self.watches
            .lock()
            .await
            .get(id)
            .is_some_and(|w| !w.pump.is_finished())
    }

    /// Watch every record addressed to `user`.
    pub async fn incoming_for(&self, user: &UserId) -> Result<RecordSubscription, CallError> {
        Ok(self
            .retry
            .run("query incoming calls", StoreError::is_retryable, || {
                self.store.query_incoming_for(user)
            })
            .await?)
    }
}

async fn pump_record_events(
    call_id: CallId,
    mut subscription: RecordSubscription,
    sink: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut tracker = StatusTracker::default();
    while let Some(event) = subscription.recv().await {
        let Some(out) = tracker.observe(event) else {
            continue;
        };
        if sink.send(out).is_err() || tracker.is_terminated() {
            break;
        }
    }
    debug!(target: "Call/Signaling", "Record pump for {call_id} finished");
}
