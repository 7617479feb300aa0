//! In-process signaling store.
//!
//! Backs the demo and the integration tests. Two participants in the same
//! process share one instance and see each other's writes as push events.

use async_trait::async_trait;
use callcore::store::{RecordSubscription, Result, SignalingStore, StoreError};
use callcore::types::call::{CallId, CallRecord, RecordPatch, UserId};
use callcore::types::events::RecordEvent;
use chrono::Utc;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

enum WatchTarget {
    Record(CallId),
    Incoming(UserId),
}

struct Watcher {
    target: WatchTarget,
    tx: mpsc::UnboundedSender<RecordEvent>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<CallId, CallRecord>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
    failures_pending: u32,
}

impl Inner {
    fn take_failure(&mut self, op: &str) -> Result<()> {
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            debug!(target: "Store/Memory", "Injected transient failure for {op}");
            return Err(StoreError::Transient(format!("injected failure during {op}")));
        }
        Ok(())
    }

    /// Push `event` to every watcher interested in `record`.
    fn notify(&mut self, record: &CallRecord, event: RecordEvent) {
        self.watchers.retain(|_, watcher| {
            let interested = match &watcher.target {
                WatchTarget::Record(id) => id == &record.id,
                WatchTarget::Incoming(user) => record.is_addressed_to(user),
            };
            !interested || watcher.tx.send(event.clone()).is_ok()
        });
    }

    fn add_watcher(&mut self, target: WatchTarget) -> (u64, mpsc::UnboundedReceiver<RecordEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher;
        self.next_watcher += 1;
        self.watchers.insert(id, Watcher { target, tx });
        (id, rx)
    }
}

#[derive(Clone, Default)]
pub struct InMemorySignalingStore {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for InMemorySignalingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("InMemorySignalingStore")
            .field("records", &inner.records.len())
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}

impl InMemorySignalingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.lock().failures_pending = n;
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    fn subscription(&self, id: u64, rx: mpsc::UnboundedReceiver<RecordEvent>) -> RecordSubscription {
        let inner: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        RecordSubscription::new(rx, move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .watchers
                    .remove(&id);
                trace!(target: "Store/Memory", "Watcher {id} removed");
            }
        })
    }
}

#[async_trait]
impl SignalingStore for InMemorySignalingStore {
    async fn create(&self, record: CallRecord) -> Result<CallId> {
        let mut inner = self.lock();
        inner.take_failure("create")?;
        if inner.records.contains_key(&record.id) {
            return Err(StoreError::Transient(format!(
                "call record {} already exists",
                record.id
            )));
        }
        let id = record.id.clone();
        inner.records.insert(id.clone(), record.clone());
        inner.notify(&record, RecordEvent::Changed(record.clone()));
        debug!(target: "Store/Memory", "Created {id}");
        Ok(id)
    }

    async fn get(&self, id: &CallId) -> Result<CallRecord> {
        let mut inner = self.lock();
        inner.take_failure("get")?;
        inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update(&self, id: &CallId, patch: RecordPatch) -> Result<CallRecord> {
        let mut inner = self.lock();
        inner.take_failure("update")?;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let changed = record.apply(&patch, Utc::now());
        let merged = record.clone();
        if changed {
            trace!(target: "Store/Memory", "Updated {id} to {}", merged.status);
            inner.notify(&merged, RecordEvent::Changed(merged.clone()));
        }
        Ok(merged)
    }

    async fn delete(&self, id: &CallId) -> Result<()> {
        let mut inner = self.lock();
        inner.take_failure("delete")?;
        let record = inner
            .records
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        inner.notify(&record, RecordEvent::Deleted(id.clone()));
        debug!(target: "Store/Memory", "Deleted {id}");
        Ok(())
    }

    async fn subscribe(&self, id: &CallId) -> Result<RecordSubscription> {
        let (watcher, rx) = {
            let mut inner = self.lock();
            inner.take_failure("subscribe")?;
            let current = inner
                .records
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            let (watcher, rx) = inner.add_watcher(WatchTarget::Record(id.clone()));
            if let Some(w) = inner.watchers.get(&watcher) {
                let _ = w.tx.send(RecordEvent::Changed(current));
            }
            (watcher, rx)
        };
        Ok(self.subscription(watcher, rx))
    }

    async fn query_incoming_for(&self, user: &UserId) -> Result<RecordSubscription> {
        let (watcher, rx) = {
            let mut inner = self.lock();
            inner.take_failure("query_incoming_for")?;
            let existing: Vec<CallRecord> = inner
                .records
                .values()
                .filter(|r| r.is_addressed_to(user))
                .cloned()
                .collect();
            let (watcher, rx) = inner.add_watcher(WatchTarget::Incoming(user.clone()));
            if let Some(w) = inner.watchers.get(&watcher) {
                for record in existing {
                    let _ = w.tx.send(RecordEvent::Changed(record));
                }
            }
            (watcher, rx)
        };
        Ok(self.subscription(watcher, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::types::call::{CallInit, CallStatus, CallType, EndReason, UserRef};

    fn new_record() -> CallRecord {
        let caller = UserRef::new("alice", "Alice");
        CallRecord::new(
            CallId::generate(&caller.id),
            CallInit {
                room_id: "room-1".into(),
                call_type: CallType::Video,
                caller,
                invitees: vec![UserRef::new("bob", "Bob")],
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_subscribe_delivers_snapshot_then_changes() {
        let store = InMemorySignalingStore::new();
        let record = new_record();
        let id = store.create(record.clone()).await.unwrap();

        let mut sub = store.subscribe(&id).await.unwrap();
        assert_eq!(sub.recv().await, Some(RecordEvent::Changed(record)));

        store
            .update(&id, RecordPatch::status(CallStatus::Connecting))
            .await
            .unwrap();
        match sub.recv().await {
            Some(RecordEvent::Changed(r)) => assert_eq!(r.status, CallStatus::Connecting),
            other => panic!("unexpected event: {other:?}"),
        }

        store.delete(&id).await.unwrap();
        assert_eq!(sub.recv().await, Some(RecordEvent::Deleted(id)));
    }

    #[tokio::test]
    async fn test_update_is_monotonic() {
        let store = InMemorySignalingStore::new();
        let id = store.create(new_record()).await.unwrap();
        store
            .update(&id, RecordPatch::ended(EndReason::Hangup, Utc::now()))
            .await
            .unwrap();
        let merged = store
            .update(&id, RecordPatch::status(CallStatus::Connected))
            .await
            .unwrap();
        assert_eq!(merged.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_incoming_query_filters_by_participant() {
        let store = InMemorySignalingStore::new();
        let mut bob = store.query_incoming_for(&UserId::new("bob")).await.unwrap();
        let mut alice = store
            .query_incoming_for(&UserId::new("alice"))
            .await
            .unwrap();

        let id = store.create(new_record()).await.unwrap();
        assert_eq!(bob.recv().await.map(|e| e.call_id().clone()), Some(id));

        // the caller is not notified about their own call
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(20), alice.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_dropping_subscription_removes_watcher() {
        let store = InMemorySignalingStore::new();
        let id = store.create(new_record()).await.unwrap();
        let sub = store.subscribe(&id).await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        drop(sub);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = InMemorySignalingStore::new();
        store.fail_next(1);
        let err = store.create(new_record()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.create(new_record()).await.is_ok());
        assert_eq!(
            store.get(&CallId::new("nope")).await,
            Err(StoreError::NotFound(CallId::new("nope")))
        );
    }
}
