use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::Result;
use crate::types::call::{CallId, CallRecord, RecordPatch, UserId};
use crate::types::events::RecordEvent;

/// Live stream of record changes. Dropping it unsubscribes.
pub struct RecordSubscription {
    rx: mpsc::UnboundedReceiver<RecordEvent>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl RecordSubscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<RecordEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next change, or `None` once the store side has gone away.
    pub async fn recv(&mut self) -> Option<RecordEvent> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.rx.close();
    }
}

impl Drop for RecordSubscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for RecordSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Persisted, shared store of call records with push change notification.
///
/// Any backend with change notification (a document database, a key-value
/// store with watches, an in-process map) can implement it.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn create(&self, record: CallRecord) -> Result<CallId>;

    async fn get(&self, id: &CallId) -> Result<CallRecord>;

    /// Merge `patch` into the stored record and return the merged value.
    /// Implementations must keep the status order monotonic
    /// (see [`CallRecord::apply`]).
    async fn update(&self, id: &CallId, patch: RecordPatch) -> Result<CallRecord>;

    async fn delete(&self, id: &CallId) -> Result<()>;

    /// Watch a single record. The current value, if any, is delivered first.
    async fn subscribe(&self, id: &CallId) -> Result<RecordSubscription>;

    /// Watch every record addressed to `user` (participant, not caller).
    /// Existing records are delivered first, then changes and deletions.
    async fn query_incoming_for(&self, user: &UserId) -> Result<RecordSubscription>;
}
