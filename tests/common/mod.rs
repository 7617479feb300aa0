#![allow(dead_code)]

use callsync::calls::{CallContext, CallManager, CallSession, LocalState, StartCall};
use callsync::config::CallConfig;
use callsync::media::{FakeMediaFactory, LoopbackHub};
use callsync::store::InMemorySignalingStore;
use callsync::types::call::{CallId, CallType, UserRef};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(60);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Alice and Bob sharing one store and one loopback hub.
pub struct Pair {
    pub store: InMemorySignalingStore,
    pub alice: CallManager,
    pub bob: CallManager,
    pub alice_media: Arc<FakeMediaFactory>,
    pub bob_media: Arc<FakeMediaFactory>,
    pub hub: LoopbackHub,
}

pub fn alice() -> UserRef {
    UserRef::new("alice", "Alice")
}

pub fn bob() -> UserRef {
    UserRef::new("bob", "Bob")
}

pub fn carol() -> UserRef {
    UserRef::new("carol", "Carol")
}

pub fn pair() -> Pair {
    pair_with(CallConfig::default())
}

pub fn pair_with(config: CallConfig) -> Pair {
    init_logger();
    let store = InMemorySignalingStore::new();
    let hub = LoopbackHub::new();
    let alice_media = Arc::new(FakeMediaFactory::new("alice", hub.clone()));
    let bob_media = Arc::new(FakeMediaFactory::new("bob", hub.clone()));
    Pair {
        alice: CallManager::new(CallContext::new(
            alice(),
            config.clone(),
            Arc::new(store.clone()),
            alice_media.clone(),
        )),
        bob: CallManager::new(CallContext::new(
            bob(),
            config,
            Arc::new(store.clone()),
            bob_media.clone(),
        )),
        store,
        alice_media,
        bob_media,
        hub,
    }
}

/// Another participant on the same store and loopback hub as `pair`.
pub fn third_party(pair: &Pair, user: UserRef) -> CallManager {
    let media = Arc::new(FakeMediaFactory::new(user.id.as_str(), pair.hub.clone()));
    CallManager::new(CallContext::new(
        user,
        CallConfig::default(),
        Arc::new(pair.store.clone()),
        media,
    ))
}

pub fn request(call_type: CallType) -> StartCall {
    StartCall {
        room_id: "room-1".into(),
        call_type,
        invitees: vec![bob()],
    }
}

pub async fn wait_state(session: &CallSession, pred: impl FnMut(&LocalState) -> bool) {
    let mut rx = session.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for session state")
        .expect("state channel closed");
}

/// Ring Bob, let him accept and wait until both sides are connected.
pub async fn connected_call(
    pair: &Pair,
    call_type: CallType,
) -> (Arc<CallSession>, Arc<CallSession>, CallId) {
    let mut incoming = pair.bob.events().incoming_calls.subscribe();
    pair.bob.listen().await.unwrap();

    let caller = pair.alice.start_call(request(call_type)).await.unwrap();
    let call_id = caller.call_id().unwrap();

    let ring = tokio::time::timeout(WAIT, incoming.recv())
        .await
        .expect("bob was never rung")
        .unwrap();
    assert_eq!(ring.record.id, call_id);

    let callee = pair.bob.join_call(&call_id).await.unwrap();
    wait_state(&caller, |s| s.is_connected()).await;
    wait_state(&callee, |s| s.is_connected()).await;
    (caller, callee, call_id)
}

/// Poll `check` until it holds, sleeping between attempts.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never became true");
}
