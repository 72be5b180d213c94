mod common;

use common::{eventually, Party};
use duocall::call_engine::{
    status, CallEngineError, CallOutcome, CallRole, CallSessionHandle, DeviceError, EndReason,
    FacingMode, OrchestratorEvent, SessionEvent, SessionState, TrackKind,
};
use duocall::signaling::{pair_id, Candidate, MediaKind, MemoryStore, SignalingStore};
use std::sync::Arc;
use std::time::Duration;

async fn connected_call(
    store: &Arc<MemoryStore>,
    alice: &Party,
    bob: &Party,
    media_kind: MediaKind,
) -> (CallSessionHandle, CallSessionHandle) {
    bob.orchestrator.watch_contact("alice").await.unwrap();
    let caller = alice.orchestrator.start_call("bob", media_kind).unwrap();
    eventually("incoming call surfaced", || {
        bob.orchestrator.incoming_calls().len() == 1
    })
    .await;
    assert!(store.record(&pair_id("alice", "bob")).is_some());

    let callee = bob.orchestrator.accept("alice").unwrap();
    eventually("both sides connected", || {
        caller.state() == SessionState::Connected && callee.state() == SessionState::Connected
    })
    .await;
    (caller, callee)
}

#[tokio::test]
async fn test_call_connects_both_sides() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    let (caller, callee) = connected_call(&store, &alice, &bob, MediaKind::Audio).await;

    assert_eq!(caller.role(), CallRole::Caller);
    assert_eq!(callee.role(), CallRole::Callee);
    assert_eq!(caller.snapshot().status, status::CONNECTED);
    assert_eq!(callee.snapshot().status, status::CONNECTED);
    assert_eq!(bob.peer().answers(), 1);
    assert_eq!(alice.peer().offers(), 1);

    // Candidates reach the callee in the order the caller produced them,
    // no matter whether they arrived before or after the offer
    let pair = pair_id("alice", "bob");
    let published: Vec<String> = store
        .candidates(&pair, "alice")
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(published.len(), 2);
    assert_eq!(bob.peer().applied_candidates(), published);

    // Each side sees the other's audio
    eventually("remote audio on both sides", || {
        caller.snapshot().media.remote.is_some_and(|r| r.has_audio())
            && callee.snapshot().media.remote.is_some_and(|r| r.has_audio())
    })
    .await;
    assert!(!callee.snapshot().media.is_video);
}

#[tokio::test]
async fn test_second_call_while_busy_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    let _ = connected_call(&store, &alice, &bob, MediaKind::Audio).await;

    assert_eq!(
        alice
            .orchestrator
            .start_call("carol", MediaKind::Audio)
            .unwrap_err(),
        CallEngineError::AlreadyInCall
    );
    assert_eq!(
        bob.orchestrator.accept("carol").unwrap_err(),
        CallEngineError::AlreadyInCall
    );
}

#[tokio::test]
async fn test_accept_without_incoming_call() {
    let store = Arc::new(MemoryStore::new());
    let bob = Party::new(&store, "bob");

    assert_eq!(
        bob.orchestrator.accept("alice").unwrap_err(),
        CallEngineError::NoIncomingCall("alice".to_string())
    );
    assert_eq!(
        bob.orchestrator.hangup().await.unwrap_err(),
        CallEngineError::NoActiveCall
    );
    assert_eq!(bob.peers.count(), 0);
}

#[tokio::test]
async fn test_repeated_offer_is_not_answered_twice() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");
    let pair = pair_id("alice", "bob");

    let (caller, callee) = connected_call(&store, &alice, &bob, MediaKind::Audio).await;

    // Re-deliver the same offer, plus a candidate the connection rejects
    let record = store.record(&pair).unwrap();
    store
        .attach_signal(&pair, record.offer.as_ref().unwrap())
        .await
        .unwrap();
    store
        .append_candidate(&pair, "alice", &Candidate::new("malformed"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(bob.peer().answers(), 1);
    assert_eq!(alice.peer().offers(), 1);
    assert_eq!(caller.state(), SessionState::Connected);
    assert_eq!(callee.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_simultaneous_calls_settle_on_one_caller() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    let a = alice.orchestrator.start_call("bob", MediaKind::Audio).unwrap();
    let b = bob.orchestrator.start_call("alice", MediaKind::Audio).unwrap();

    eventually("both sides connected", || {
        a.state() == SessionState::Connected && b.state() == SessionState::Connected
    })
    .await;

    let callers = [a.role(), b.role()]
        .iter()
        .filter(|role| **role == CallRole::Caller)
        .count();
    assert_eq!(callers, 1);

    let record = store.record(&pair_id("alice", "bob")).unwrap();
    let winner = if a.role() == CallRole::Caller { "alice" } else { "bob" };
    assert_eq!(record.caller_id, winner);
}

#[tokio::test]
async fn test_hangup_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");
    let pair = pair_id("alice", "bob");

    let (caller, callee) = connected_call(&store, &alice, &bob, MediaKind::Audio).await;

    let first = caller.hangup().await.unwrap();
    let second = caller.hangup().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.reason, EndReason::LocalHangup);
    assert!(first.connected);
    assert_eq!(caller.state(), SessionState::Ended);
    assert_eq!(caller.snapshot().status, status::ENDED);

    assert!(store.record(&pair).is_none());
    assert_eq!(store.delete_count(&pair), 1);
    assert_eq!(alice.devices.outstanding(), 0);
    assert!(alice.peer().is_closed());

    let remote = callee.finished().await.unwrap();
    assert_eq!(remote.reason, EndReason::RemoteHangup);
    assert_eq!(bob.devices.outstanding(), 0);
    assert!(bob.peer().is_closed());
    assert_eq!(store.delete_count(&pair), 1);

    eventually("both outcomes logged", || {
        alice.log.reports().len() == 1 && bob.log.reports().len() == 1
    })
    .await;
    assert!(matches!(
        alice.log.reports()[0].outcome,
        CallOutcome::Completed { .. }
    ));
    assert!(matches!(
        bob.log.reports()[0].outcome,
        CallOutcome::Completed { .. }
    ));
    assert!(alice.orchestrator.active().is_none());
}

#[tokio::test]
async fn test_unanswered_call_is_missed_on_both_sides() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");
    let mut bob_events = bob.orchestrator.subscribe();

    bob.orchestrator.watch_contact("alice").await.unwrap();
    let caller = alice.orchestrator.start_call("bob", MediaKind::Video).unwrap();
    eventually("incoming call surfaced", || {
        bob.orchestrator.incoming_calls().len() == 1
    })
    .await;

    let summary = alice.orchestrator.hangup().await.unwrap();
    assert!(!summary.connected);
    assert_eq!(summary.duration, Duration::ZERO);
    assert_eq!(caller.state(), SessionState::Ended);

    eventually("both missed calls logged", || {
        alice.log.reports().len() == 1 && bob.log.reports().len() == 1
    })
    .await;
    assert_eq!(alice.log.reports()[0].outcome, CallOutcome::Missed);
    let missed = &bob.log.reports()[0];
    assert_eq!(missed.outcome, CallOutcome::Missed);
    assert_eq!(missed.remote_id, "alice");
    assert!(missed.is_video);
    assert!(bob.orchestrator.incoming_calls().is_empty());
    assert_eq!(bob.peers.count(), 0);

    let mut withdrawn = false;
    while let Ok(event) = bob_events.try_recv() {
        if let OrchestratorEvent::IncomingWithdrawn { caller_id, .. } = event {
            assert_eq!(caller_id, "alice");
            withdrawn = true;
        }
    }
    assert!(withdrawn);
}

#[tokio::test]
async fn test_rejected_call() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    bob.orchestrator.watch_contact("alice").await.unwrap();
    let caller = alice.orchestrator.start_call("bob", MediaKind::Audio).unwrap();
    eventually("incoming call surfaced", || {
        bob.orchestrator.incoming_calls().len() == 1
    })
    .await;

    bob.orchestrator.reject("alice").await.unwrap();
    assert!(store.record(&pair_id("alice", "bob")).is_none());

    let summary = caller.finished().await.unwrap();
    assert_eq!(summary.reason, EndReason::RemoteHangup);
    assert_eq!(alice.devices.outstanding(), 0);

    eventually("both rejections logged", || {
        alice.log.reports().len() == 1 && bob.log.reports().len() == 1
    })
    .await;
    assert_eq!(alice.log.reports()[0].outcome, CallOutcome::Rejected);
    assert_eq!(bob.log.reports()[0].outcome, CallOutcome::Rejected);
    assert_eq!(bob.peers.count(), 0);
    assert_eq!(bob.devices.acquired(), 0);
}

#[tokio::test]
async fn test_adding_video_mid_call_upgrades_the_callee() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    let (caller, callee) = connected_call(&store, &alice, &bob, MediaKind::Audio).await;
    assert!(!callee.snapshot().media.is_video);

    caller.toggle_camera().await.unwrap();
    assert!(caller.snapshot().media.local.video.is_some());
    assert_eq!(alice.peer().offers(), 2);

    eventually("callee sees remote video", || {
        let media = callee.snapshot().media;
        media.is_video && media.remote.is_some_and(|r| r.has_video() && r.has_audio())
    })
    .await;
    assert!(!callee.snapshot().media.local.camera_off);
    assert_eq!(bob.peer().answers(), 2);
    assert_eq!(callee.state(), SessionState::Connected);

    // Second toggle only flips the existing track
    caller.toggle_camera().await.unwrap();
    assert!(caller.snapshot().media.local.camera_off);
    assert_eq!(alice.peer().offers(), 2);
}

#[tokio::test]
async fn test_camera_switch_does_not_renegotiate() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    let (caller, _callee) = connected_call(&store, &alice, &bob, MediaKind::Video).await;
    assert_eq!(caller.snapshot().media.local.facing, FacingMode::User);
    let old_video = caller.snapshot().media.local.video.unwrap();

    caller.switch_camera().await.unwrap();

    let local = caller.snapshot().media.local;
    assert_eq!(local.facing, FacingMode::Environment);
    assert_ne!(local.video.unwrap().id(), old_video.id());
    assert_eq!(alice.peer().replaced(), 1);
    assert_eq!(alice.peer().offers(), 1);
    assert_eq!(
        alice.peer().sent_kinds(),
        vec![TrackKind::Audio, TrackKind::Video]
    );
    assert_eq!(bob.peer().answers(), 1);
    assert_eq!(alice.devices.outstanding(), 2);
    assert_eq!(alice.devices.released(), 1);
}

#[tokio::test]
async fn test_failed_camera_switch_keeps_current_camera() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    let (caller, _callee) = connected_call(&store, &alice, &bob, MediaKind::Video).await;
    let before = caller.snapshot().media.local.video.unwrap();

    alice.peer().set_fail_replace(true);
    assert!(caller.switch_camera().await.is_err());

    let local = caller.snapshot().media.local;
    assert_eq!(local.facing, FacingMode::User);
    assert_eq!(local.video.unwrap().id(), before.id());
    assert_eq!(alice.devices.outstanding(), 2);
    assert_eq!(caller.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_device_failure_ends_the_attempt() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    alice.devices.fail_with(DeviceError::PermissionDenied("camera".into()));

    let caller = alice.orchestrator.start_call("bob", MediaKind::Video).unwrap();
    let summary = caller.finished().await.unwrap();

    assert_eq!(
        summary.reason,
        EndReason::Failed(CallEngineError::Device(DeviceError::PermissionDenied(
            "camera".into()
        )))
    );
    assert_eq!(caller.snapshot().status, status::DEVICE_ERROR);
    assert!(store.record(&pair_id("alice", "bob")).is_none());
    assert_eq!(alice.peers.count(), 0);

    eventually("outcome logged", || alice.log.reports().len() == 1).await;
    assert_eq!(alice.log.reports()[0].outcome, CallOutcome::Missed);
}

#[tokio::test]
async fn test_lost_connectivity_restarts_ice_and_keeps_the_clock() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    let (caller, callee) = connected_call(&store, &alice, &bob, MediaKind::Audio).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let before = caller.snapshot().duration;
    assert!(before > Duration::ZERO);

    let mut events = caller.subscribe();
    alice.peer().drop_connectivity();

    eventually("restart answered", || bob.peer().answers() == 2).await;
    eventually("caller reconnected", || {
        caller.state() == SessionState::Connected
    })
    .await;

    let mut saw_reconnecting = false;
    let mut saw_status = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::StateChanged(SessionState::Reconnecting) => saw_reconnecting = true,
            SessionEvent::Status(text) if text == status::RECONNECTING => saw_status = true,
            _ => {}
        }
    }
    assert!(saw_reconnecting);
    assert!(saw_status);

    assert_eq!(alice.peer().offers(), 2);
    assert!(alice.peer().local_sdp().unwrap().contains("a=ice-restart"));
    assert_eq!(alice.peers.count(), 1);
    assert!(caller.snapshot().duration >= before);
    assert_eq!(callee.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_repeated_failures_drop_the_call() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    let (caller, callee) = connected_call(&store, &alice, &bob, MediaKind::Audio).await;

    let peer = alice.peer();
    peer.fail();
    peer.fail();
    peer.fail();

    let summary = caller.finished().await.unwrap();
    assert_eq!(summary.reason, EndReason::Dropped);
    assert!(summary.connected);
    assert_eq!(caller.snapshot().status, status::CONNECTION_LOST);

    let remote = callee.finished().await.unwrap();
    assert_eq!(remote.reason, EndReason::RemoteHangup);
    assert_eq!(bob.devices.outstanding(), 0);
}

#[tokio::test]
async fn test_failed_reject_keeps_the_call_ringing() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");
    let pair = pair_id("alice", "bob");

    bob.orchestrator.watch_contact("alice").await.unwrap();
    let caller = alice.orchestrator.start_call("bob", MediaKind::Audio).unwrap();
    eventually("offer and candidates published", || {
        store.record(&pair).is_some_and(|r| r.offer.is_some())
            && store.candidates(&pair, "alice").len() == 2
            && bob.orchestrator.incoming_calls().len() == 1
    })
    .await;

    store.set_offline(true);
    let err = bob.orchestrator.reject("alice").await.unwrap_err();
    assert!(matches!(err, CallEngineError::Transport(_)));
    store.set_offline(false);

    assert_eq!(bob.orchestrator.incoming_calls().len(), 1);
    assert!(store.record(&pair).is_some());
    assert!(bob.log.reports().is_empty());
    assert!(!caller.is_ended());

    bob.orchestrator.reject("alice").await.unwrap();
    let summary = caller.finished().await.unwrap();
    assert_eq!(summary.reason, EndReason::RemoteHangup);

    eventually("rejection logged", || bob.log.reports().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reports = bob.log.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, CallOutcome::Rejected);
    assert!(bob.orchestrator.incoming_calls().is_empty());
}

#[tokio::test]
async fn test_hanging_up_after_losing_the_race_is_missed() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");
    alice.peers.block_connectivity();
    bob.peers.block_connectivity();

    let a = alice.orchestrator.start_call("bob", MediaKind::Audio).unwrap();
    let b = bob.orchestrator.start_call("alice", MediaKind::Audio).unwrap();
    eventually("one side fell back to answering", || {
        a.role() == CallRole::Callee || b.role() == CallRole::Callee
    })
    .await;
    let (loser, loser_party, winner) = if a.role() == CallRole::Callee {
        (a, &alice, b)
    } else {
        (b, &bob, a)
    };

    let summary = loser.hangup().await.unwrap();
    assert_eq!(summary.role, CallRole::Callee);
    assert!(summary.dialed);
    assert!(!summary.connected);
    assert_eq!(summary.reason, EndReason::LocalHangup);
    assert_eq!(
        winner.finished().await.unwrap().reason,
        EndReason::RemoteHangup
    );

    eventually("loser's outcome logged", || {
        loser_party.log.reports().len() == 1
    })
    .await;
    assert_eq!(loser_party.log.reports()[0].outcome, CallOutcome::Missed);
}

#[tokio::test]
async fn test_closed_watch_is_reopened() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    bob.orchestrator.watch_contact("alice").await.unwrap();
    store.close_subscriptions();
    tokio::time::sleep(Duration::from_millis(50)).await;

    bob.orchestrator.watch_contact("alice").await.unwrap();
    let _caller = alice.orchestrator.start_call("bob", MediaKind::Audio).unwrap();
    eventually("incoming call surfaced on the new watch", || {
        bob.orchestrator.incoming_calls().len() == 1
    })
    .await;
}

#[tokio::test]
async fn test_publish_failure_ends_the_attempt() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    store.set_offline(true);

    let caller = alice.orchestrator.start_call("bob", MediaKind::Audio).unwrap();
    let summary = caller.finished().await.unwrap();
    store.set_offline(false);

    assert!(matches!(
        summary.reason,
        EndReason::Failed(CallEngineError::Transport(_))
    ));
    assert!(!summary.connected);
    assert_eq!(alice.devices.acquired(), 1);
    assert_eq!(alice.devices.outstanding(), 0);
    assert_eq!(alice.peers.count(), 0);
    assert!(store.record(&pair_id("alice", "bob")).is_none());
    assert!(alice.orchestrator.active().is_none());
}

#[tokio::test]
async fn test_hangup_while_offering_cleans_up() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let pair = pair_id("alice", "bob");

    let caller = alice.orchestrator.start_call("bob", MediaKind::Video).unwrap();
    eventually("offering", || caller.state() == SessionState::Offering).await;

    let summary = caller.hangup().await.unwrap();
    assert_eq!(summary.reason, EndReason::LocalHangup);
    assert_eq!(store.delete_count(&pair), 1);
    assert!(store.record(&pair).is_none());
    assert_eq!(alice.devices.acquired(), 2);
    assert_eq!(alice.devices.outstanding(), 0);
    assert!(alice.peers.latest().map_or(true, |peer| peer.is_closed()));
}

#[tokio::test]
async fn test_hangup_while_initializing_cleans_up() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let pair = pair_id("alice", "bob");
    alice.devices.set_acquire_delay(Duration::from_millis(200));

    let caller = alice.orchestrator.start_call("bob", MediaKind::Audio).unwrap();
    eventually("initializing", || {
        caller.state() == SessionState::Initializing
    })
    .await;

    let summary = caller.hangup().await.unwrap();
    assert_eq!(summary.reason, EndReason::LocalHangup);
    assert_eq!(store.delete_count(&pair), 1);

    // Past the point where the capture request would have completed
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.devices.outstanding(), 0);
    assert_eq!(alice.peers.count(), 0);
    assert!(store.record(&pair).is_none());
    assert_eq!(store.delete_count(&pair), 1);
}

#[tokio::test]
async fn test_callee_adding_video_renegotiates_from_the_callee() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");

    let (caller, callee) = connected_call(&store, &alice, &bob, MediaKind::Audio).await;

    callee.toggle_camera().await.unwrap();
    assert!(callee.snapshot().media.local.video.is_some());
    assert_eq!(bob.peer().offers(), 1);

    eventually("caller sees remote video", || {
        let media = caller.snapshot().media;
        media.is_video && media.remote.is_some_and(|r| r.has_video() && r.has_audio())
    })
    .await;
    eventually("callee applied the answer", || {
        callee.snapshot().media.remote.is_some_and(|r| r.has_audio())
            && alice.peer().answers() == 1
    })
    .await;
    assert_eq!(alice.peer().offers(), 1);
    assert_eq!(caller.state(), SessionState::Connected);
    assert_eq!(callee.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_new_call_waits_for_previous_teardown() {
    let store = Arc::new(MemoryStore::new());
    let alice = Party::new(&store, "alice");
    let bob = Party::new(&store, "bob");
    let pair = pair_id("alice", "bob");

    let (caller, callee) = connected_call(&store, &alice, &bob, MediaKind::Audio).await;
    alice.peer().set_close_delay(Duration::from_millis(200));

    let hanging_up = tokio::spawn({
        let caller = caller.clone();
        async move { caller.hangup().await }
    });
    eventually("hangup started", || caller.is_ended()).await;

    // Record delete still pending behind the slow close
    assert!(caller.summary().is_none());
    assert_eq!(
        alice
            .orchestrator
            .start_call("bob", MediaKind::Audio)
            .unwrap_err(),
        CallEngineError::AlreadyInCall
    );

    hanging_up.await.unwrap().unwrap();
    callee.finished().await.unwrap();
    assert_eq!(store.delete_count(&pair), 1);

    let next = alice.orchestrator.start_call("bob", MediaKind::Audio).unwrap();
    eventually("new record published", || {
        next.state() == SessionState::Offering && store.record(&pair).is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.record(&pair).is_some());
    assert_eq!(store.delete_count(&pair), 1);
}
