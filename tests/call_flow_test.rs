mod common;

use callsync::calls::{CallError, LocalState, StartCall};
use callsync::config::CallConfig;
use callsync::types::call::{
    CallStatus, CallType, EndReason, ParticipantStatus, RecordPatch, UserId,
};
use callcore::media::{
    AcquisitionError, MediaEvent, MediaTransport, SinkState, TrackKind, TransportState,
};
use callcore::quality::QualityPreset;
use callcore::store::SignalingStore;
use common::*;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_two_sided_video_call_connects_and_hangs_up() {
    let pair = pair();
    let mut bob_terminated = pair.bob.events().terminated.subscribe();
    let (caller, callee, call_id) = connected_call(&pair, CallType::Video).await;

    assert!(!caller.flags().video_off);
    assert!(!callee.flags().video_off);

    let store = pair.store.clone();
    let id = call_id.clone();
    eventually(|| {
        let store = store.clone();
        let id = id.clone();
        async move { store.get(&id).await.unwrap().status == CallStatus::Connected }
    })
    .await;
    let record = pair.store.get(&call_id).await.unwrap();
    assert!(record.connected_at.is_some());
    assert_eq!(
        record.participant(&UserId::new("bob")).unwrap().status,
        ParticipantStatus::Connected
    );

    caller.end(EndReason::Hangup).await;
    let event = tokio::time::timeout(WAIT, bob_terminated.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.call_id, call_id);
    assert_eq!(event.reason, EndReason::Hangup);
    wait_state(&callee, |s| s.is_ended()).await;

    // both sides released their devices exactly once
    for factory in [&pair.alice_media, &pair.bob_media] {
        let transport = factory.last_transport().unwrap();
        assert!(transport.live_tracks().is_empty());
        assert!(transport.release_counts().values().all(|n| *n == 1));
    }

    // the record is deleted once the retention delay has passed
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(pair.store.record_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_join_on_deleted_record_fails_without_session() {
    let pair = pair();
    let caller = pair.alice.start_call(request(CallType::Voice)).await.unwrap();
    let call_id = caller.call_id().unwrap();
    pair.store.delete(&call_id).await.unwrap();

    let err = pair.bob.join_call(&call_id).await.unwrap_err();
    assert_eq!(err, CallError::NotFound(call_id.clone()));
    assert!(pair.bob.registry().is_empty().await);
    assert!(!pair.bob.notifier().handled().contains(&call_id));

    // the caller noticed the deletion and ended too
    wait_state(&caller, |s| s.is_ended()).await;
}

#[tokio::test(start_paused = true)]
async fn test_join_on_ended_record_fails() {
    let pair = pair();
    let caller = pair.alice.start_call(request(CallType::Voice)).await.unwrap();
    let call_id = caller.call_id().unwrap();
    caller.end(EndReason::Hangup).await;

    let err = pair.bob.join_call(&call_id).await.unwrap_err();
    assert_eq!(err, CallError::AlreadyEnded(call_id.clone()));
    assert!(err.is_call_gone());
    assert!(pair.bob.registry().is_empty().await);
    assert!(pair.bob_media.last_transport().unwrap().release_counts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_inside_grace_keeps_call() {
    let pair = pair();
    let (caller, _callee, _id) = connected_call(&pair, CallType::Voice).await;
    let transport = pair.alice_media.last_transport().unwrap();

    transport
        .emit(MediaEvent::ConnectionState(TransportState::Disconnected))
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    transport
        .emit(MediaEvent::ConnectionState(TransportState::Connected))
        .await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(caller.state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_past_grace_fails_session() {
    let pair = pair();
    let (caller, _callee, _id) = connected_call(&pair, CallType::Voice).await;
    let transport = pair.alice_media.last_transport().unwrap();

    transport
        .emit(MediaEvent::ConnectionState(TransportState::Disconnected))
        .await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(caller.state().is_connected());

    wait_state(&caller, |s| s.is_failed()).await;
    assert!(matches!(
        caller.state().error(),
        Some(CallError::TransportFailed(_))
    ));
    // the duration guard stopped with the failure
    let elapsed = caller.duration().map(|t| t.elapsed_secs);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(caller.duration().map(|t| t.elapsed_secs), elapsed);

    caller.end(EndReason::Hangup).await;
    assert!(caller.state().is_ended());
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_then_retry() {
    let pair = pair();
    pair.alice_media
        .fail_next_acquire(AcquisitionError::PermissionDenied);

    let err = pair
        .alice
        .start_call(request(CallType::Video))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::MediaAcquisition(AcquisitionError::PermissionDenied)
    );
    assert!(err.remediation().is_some());

    let sessions = pair.alice.registry().all().await;
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(
        session.state().error(),
        Some(&CallError::MediaAcquisition(AcquisitionError::PermissionDenied))
    );
    let first = session.call_id().unwrap();
    assert_eq!(
        pair.store.get(&first).await.unwrap().end_reason,
        Some(EndReason::MediaUnavailable)
    );

    session.retry().await.unwrap();
    assert_eq!(pair.alice_media.acquire_calls(), 2);
    assert!(matches!(session.state(), LocalState::Connecting { .. }));
    let second = session.call_id().unwrap();
    assert_ne!(first, second);
    assert_eq!(
        pair.store.get(&second).await.unwrap().status,
        CallStatus::Ringing
    );
}

#[tokio::test(start_paused = true)]
async fn test_end_is_idempotent_across_paths() {
    let pair = pair();
    let mut terminated = pair.alice.events().terminated.subscribe();
    let (caller, _callee, call_id) = connected_call(&pair, CallType::Video).await;

    tokio::join!(
        caller.end(EndReason::Hangup),
        caller.end(EndReason::DurationCap),
        caller.end(EndReason::RemoteEnded),
    );
    caller.end(EndReason::Hangup).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let event = terminated.recv().await.unwrap();
    assert_eq!(event.call_id, call_id);
    assert!(event.duration_secs.is_some());
    assert!(terminated.try_recv().is_err());

    let counts = pair.alice_media.last_transport().unwrap().release_counts();
    assert_eq!(counts.len(), 2);
    assert!(counts.values().all(|n| *n == 1));
    match caller.state() {
        LocalState::Ended { reason, .. } => assert_eq!(reason, EndReason::Hangup),
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_duration_cap_ends_both_sides() {
    let config = CallConfig {
        max_duration_secs: 3,
        ..CallConfig::default()
    };
    let pair = pair_with(config);
    let mut terminated = pair.alice.events().terminated.subscribe();
    let mut ticks = pair.alice.events().ticks.subscribe();
    let (caller, callee, call_id) = connected_call(&pair, CallType::Voice).await;

    let event = tokio::time::timeout(WAIT, terminated.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.reason, EndReason::DurationCap);

    let mut last = None;
    while let Ok(tick) = ticks.try_recv() {
        last = Some(tick.tick.remaining_secs);
    }
    assert_eq!(last, Some(0));
    assert_eq!(caller.duration().unwrap().remaining_secs, 0);

    wait_state(&callee, |s| s.is_ended()).await;
    let record = pair.store.get(&call_id).await.unwrap();
    assert_eq!(record.end_reason, Some(EndReason::DurationCap));

    // no timer keeps running after the end
    let before = caller.duration().unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(caller.duration().unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn test_no_resurrection_after_end() {
    let pair = pair();
    let (caller, callee, call_id) = connected_call(&pair, CallType::Voice).await;
    callee.end(EndReason::Hangup).await;
    wait_state(&caller, |s| s.is_ended()).await;

    let record = pair
        .store
        .update(&call_id, RecordPatch::status(CallStatus::Connected))
        .await
        .unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert_eq!(record.end_reason, Some(EndReason::Hangup));

    caller.end(EndReason::Hangup).await;
    assert!(caller.state().is_ended());
    assert_eq!(caller.toggle_mute(), Err(CallError::SessionEnded));
}

#[tokio::test(start_paused = true)]
async fn test_mute_toggled_twice_restores_track() {
    let pair = pair();
    let mut flags = pair.alice.events().media_flags.subscribe();
    let (caller, _callee, _id) = connected_call(&pair, CallType::Video).await;
    let transport = pair.alice_media.last_transport().unwrap();
    while flags.try_recv().is_ok() {}

    assert!(caller.toggle_mute().unwrap());
    assert_eq!(transport.track_enabled(TrackKind::Audio), Some(false));
    assert!(!caller.toggle_mute().unwrap());
    assert_eq!(transport.track_enabled(TrackKind::Audio), Some(true));

    assert!(flags.recv().await.unwrap().flags.muted);
    assert!(!flags.recv().await.unwrap().flags.muted);

    assert!(caller.toggle_video().unwrap());
    assert!(caller.flags().video_off);
}

#[tokio::test(start_paused = true)]
async fn test_remote_stream_redelivery_is_ignored() {
    let pair = pair();
    let (caller, _callee, _id) = connected_call(&pair, CallType::Voice).await;
    let transport = pair.alice_media.last_transport().unwrap();
    let stream = transport.attached_streams()[0].clone();

    transport.emit(MediaEvent::RemoteStream(stream)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(transport.attached_streams().len(), 1);
    assert!(caller.state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_fails_without_grace() {
    let pair = pair();
    let (caller, _callee, id) = connected_call(&pair, CallType::Voice).await;

    caller.on_transport_state(TransportState::Failed);
    assert!(caller.state().is_failed());
    assert!(matches!(
        caller.state().error(),
        Some(CallError::TransportFailed(_))
    ));
    // the record stays up so the session can retry or hang up
    assert!(!pair.store.get(&id).await.unwrap().status.is_ended());

    caller.end(EndReason::Hangup).await;
    assert_eq!(pair.store.get(&id).await.unwrap().status, CallStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_speaker_and_quality_changes_are_published() {
    let pair = pair();
    let mut flags = pair.alice.events().media_flags.subscribe();
    let (caller, _callee, _id) = connected_call(&pair, CallType::Video).await;
    while flags.try_recv().is_ok() {}

    caller.set_speaker(false).await.unwrap();
    let changed = flags.recv().await.unwrap();
    assert!(!changed.flags.speaker_on);

    caller.set_quality(QualityPreset::Hd720p).await.unwrap();
    let changed = flags.recv().await.unwrap();
    assert_eq!(changed.flags.quality, QualityPreset::Hd720p);
    assert_eq!(caller.flags().quality, QualityPreset::Hd720p);

    let transport = pair.alice_media.last_transport().unwrap();
    assert_eq!(transport.selected_output(), Some(false));
    assert_eq!(transport.sink(), SinkState::speaker_off());
    assert_eq!(transport.applied_qualities(), vec![QualityPreset::Hd720p]);

    caller.end(EndReason::Hangup).await;
    assert_eq!(caller.set_speaker(true).await, Err(CallError::SessionEnded));
    assert_eq!(
        caller.set_quality(QualityPreset::Sd480p).await,
        Err(CallError::SessionEnded)
    );
}

#[tokio::test(start_paused = true)]
async fn test_hangup_in_group_call_only_leaves() {
    let pair = pair();
    let carol_side = third_party(&pair, carol());
    let mut bob_rings = pair.bob.events().incoming_calls.subscribe();
    let mut carol_rings = carol_side.events().incoming_calls.subscribe();
    pair.bob.listen().await.unwrap();
    carol_side.listen().await.unwrap();

    let caller = pair
        .alice
        .start_call(StartCall {
            room_id: "room-1".into(),
            call_type: CallType::Voice,
            invitees: vec![bob(), carol()],
        })
        .await
        .unwrap();
    let id = caller.call_id().unwrap();
    tokio::time::timeout(WAIT, bob_rings.recv()).await.unwrap().unwrap();
    tokio::time::timeout(WAIT, carol_rings.recv()).await.unwrap().unwrap();

    let bob_session = pair.bob.join_call(&id).await.unwrap();
    let carol_session = carol_side.join_call(&id).await.unwrap();
    for session in [&caller, &bob_session, &carol_session] {
        wait_state(session, |s| s.is_connected()).await;
    }

    bob_session.end(EndReason::Hangup).await;
    let record = pair.store.get(&id).await.unwrap();
    assert!(!record.status.is_ended());
    let bob_entry = record.participant(&bob().id).unwrap();
    assert_eq!(bob_entry.status, ParticipantStatus::Disconnected);
    assert!(bob_entry.left_at.is_some());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(caller.state().is_connected());
    assert!(carol_session.state().is_connected());

    // only Carol is left with Alice, so Alice hanging up ends the call
    caller.end(EndReason::Hangup).await;
    let record = pair.store.get(&id).await.unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert_eq!(record.end_reason, Some(EndReason::Hangup));
    wait_state(&carol_session, |s| s.is_ended()).await;
}

#[tokio::test(start_paused = true)]
async fn test_joiner_failing_after_join_leaves_the_call() {
    let pair = pair();
    let mut incoming = pair.bob.events().incoming_calls.subscribe();
    pair.bob.listen().await.unwrap();

    let caller = pair.alice.start_call(request(CallType::Voice)).await.unwrap();
    let id = caller.call_id().unwrap();
    tokio::time::timeout(WAIT, incoming.recv()).await.unwrap().unwrap();

    pair.bob_media.fail_next_connects(1);
    let err = pair.bob.join_call(&id).await.unwrap_err();
    assert!(matches!(err, CallError::TransportFailed(_)));
    assert!(pair.bob.registry().is_empty().await);

    let record = pair.store.get(&id).await.unwrap();
    assert!(!record.status.is_ended());
    let bob_entry = record.participant(&bob().id).unwrap();
    assert_eq!(bob_entry.status, ParticipantStatus::Disconnected);
    assert!(bob_entry.left_at.is_some());
    assert!(!caller.state().is_ended());
}
