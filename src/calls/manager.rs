use callcore::analysis::FrameAnalyzer;
use callcore::media::MediaTransportFactory;
use callcore::store::SignalingStore;
use callcore::types::call::{CallId, CallRole, EndReason, UserRef};
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::CallError;
use super::events::EventBus;
use super::notifier::RingNotifier;
use super::session::{CallSession, StartCall};
use super::signaling::SignalingChannel;
use crate::config::CallConfig;

/// Everything a session needs from its surroundings.
pub struct CallContext {
    pub me: UserRef,
    pub config: CallConfig,
    pub signaling: Arc<SignalingChannel>,
    pub media: Arc<dyn MediaTransportFactory>,
    pub events: Arc<EventBus>,
    pub analyzer: Option<Arc<dyn FrameAnalyzer>>,
}

impl CallContext {
    pub fn new(
        me: UserRef,
        config: CallConfig,
        store: Arc<dyn SignalingStore>,
        media: Arc<dyn MediaTransportFactory>,
    ) -> Self {
        let signaling = Arc::new(SignalingChannel::new(
            store,
            config.signaling_retry,
            config.ended_retention(),
        ));
        Self {
            me,
            config,
            signaling,
            media,
            events: Arc::new(EventBus::new()),
            analyzer: None,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn FrameAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("me", &self.me)
            .field("config", &self.config)
            .field("analyzer", &self.analyzer.is_some())
            .finish_non_exhaustive()
    }
}

/// Sessions owned by one local user.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<Vec<Arc<CallSession>>>,
}

impl SessionRegistry {
    pub async fn insert(&self, session: Arc<CallSession>) {
        let mut sessions = self.sessions.write().await;
        if !sessions.iter().any(|s| Arc::ptr_eq(s, &session)) {
            sessions.push(session);
        }
    }

    /// The session currently bound to `call_id`.
    pub async fn get(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|s| s.call_id().as_ref() == Some(call_id))
            .cloned()
    }

    pub async fn all(&self) -> Vec<Arc<CallSession>> {
        self.sessions.read().await.clone()
    }

    /// Drop ended sessions. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|s| !s.is_ended());
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Entry point for one local user: places calls, answers them and keeps the
/// sessions it created.
pub struct CallManager {
    ctx: Arc<CallContext>,
    registry: Arc<SessionRegistry>,
    notifier: Arc<RingNotifier>,
}

impl CallManager {
    pub fn new(ctx: CallContext) -> Self {
        let ctx = Arc::new(ctx);
        let registry = Arc::new(SessionRegistry::default());
        let notifier = RingNotifier::new(ctx.clone(), registry.clone());
        Self {
            ctx,
            registry,
            notifier,
        }
    }

    pub fn context(&self) -> &Arc<CallContext> {
        &self.ctx
    }

    pub fn me(&self) -> &UserRef {
        &self.ctx.me
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.ctx.events
    }

    pub fn notifier(&self) -> &Arc<RingNotifier> {
        &self.notifier
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start watching for calls addressed to the local user.
    pub async fn listen(&self) -> Result<(), CallError> {
        self.notifier.listen().await
    }

    /// Create and register an idle session.
    pub async fn new_session(&self, role: CallRole) -> Result<Arc<CallSession>, CallError> {
        let session = CallSession::new(self.ctx.clone(), role).await?;
        self.registry.insert(session.clone()).await;
        Ok(session)
    }

    /// Place a call.
    ///
    /// A session that fails to start stays registered in `failed`, so it can
    /// be found through [`SessionRegistry::all`] and retried.
    pub async fn start_call(&self, request: StartCall) -> Result<Arc<CallSession>, CallError> {
        let session = self.new_session(CallRole::Initiator).await?;
        let call_id = session.start(request).await?;
        info!(target: "Call/Session", "{} started {call_id}", self.ctx.me.id);
        Ok(session)
    }

    /// Join a known call directly, as if its prompt had been accepted.
    pub async fn join_call(&self, call_id: &CallId) -> Result<Arc<CallSession>, CallError> {
        self.notifier.accept(call_id).await
    }

    pub async fn session(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.registry.get(call_id).await
    }

    pub async fn end_call(&self, call_id: &CallId, reason: EndReason) -> Result<(), CallError> {
        let session = self
            .registry
            .get(call_id)
            .await
            .ok_or_else(|| CallError::NotFound(call_id.clone()))?;
        session.end(reason).await;
        self.registry.prune().await;
        Ok(())
    }

    pub async fn cleanup_ended(&self) -> usize {
        let removed = self.registry.prune().await;
        if removed > 0 {
            debug!(target: "Call/Session", "Removed {removed} ended session(s)");
        }
        removed
    }

    /// End every session and stop ringing.
    pub async fn shutdown(&self) {
        self.notifier.stop();
        for session in self.registry.all().await {
            session.end(EndReason::Hangup).await;
        }
        self.registry.prune().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::{FakeMediaFactory, LoopbackHub};
    use crate::store::memory::InMemorySignalingStore;
    use callcore::types::call::CallType;

    fn manager(store: &InMemorySignalingStore) -> CallManager {
        CallManager::new(CallContext::new(
            UserRef::new("alice", "Alice"),
            CallConfig::default(),
            Arc::new(store.clone()),
            Arc::new(FakeMediaFactory::new("alice", LoopbackHub::new())),
        ))
    }

    #[tokio::test]
    async fn test_start_and_end_call() {
        let store = InMemorySignalingStore::new();
        let manager = manager(&store);
        let session = manager
            .start_call(StartCall {
                room_id: "room".into(),
                call_type: CallType::Video,
                invitees: vec![UserRef::new("bob", "Bob")],
            })
            .await
            .unwrap();
        let id = session.call_id().unwrap();
        assert!(manager.session(&id).await.is_some());

        manager.end_call(&id, EndReason::Hangup).await.unwrap();
        assert!(session.is_ended());
        assert!(manager.session(&id).await.is_none());
        assert_eq!(
            manager.end_call(&id, EndReason::Hangup).await,
            Err(CallError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn test_registry_prunes_ended_sessions() {
        let store = InMemorySignalingStore::new();
        let manager = manager(&store);
        let a = manager.new_session(CallRole::Initiator).await.unwrap();
        let _b = manager.new_session(CallRole::Initiator).await.unwrap();
        assert_eq!(manager.registry().len().await, 2);

        a.end(EndReason::Hangup).await;
        assert_eq!(manager.cleanup_ended().await, 1);
        assert_eq!(manager.registry().len().await, 1);
    }
}
