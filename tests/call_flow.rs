//! End-to-end call flow tests against mock collaborators.

use std::sync::Arc;
use std::time::Duration;

use roomcall::test_utils::{TestHarness, candidate};
use roomcall::{
    AnswerContent, CallDirection, CallError, CallId, CallState, ChannelId, ConnectivityState,
    HangupContent, HangupParty, HangupReason, InviteContent, MediaConstraints, MediaEvent,
    MediaStream, SessionDescription, Signal, SignalType,
};

fn harness() -> TestHarness {
    let _ = env_logger::builder().is_test(true).try_init();
    TestHarness::new()
}

fn room() -> ChannelId {
    ChannelId::new("!abcdefgh:example.org")
}

fn invite(call_id: &str, lifetime_ms: u64) -> Signal {
    Signal::Invite(InviteContent {
        call_id: CallId::new(call_id),
        offer: SessionDescription::offer("v=0\r\no=- 9 9 IN IP4 192.0.2.7"),
        lifetime: lifetime_ms,
    })
}

fn answer_for(call_id: &CallId) -> Signal {
    Signal::Answer(AnswerContent {
        call_id: call_id.clone(),
        answer: SessionDescription::answer("v=0\r\no=- 4 4 IN IP4 192.0.2.9"),
    })
}

fn hangup_for(call_id: &str) -> Signal {
    Signal::Hangup(HangupContent {
        call_id: CallId::new(call_id),
    })
}

/// Let spawned tasks and sub-debounce timers run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_outbound_call_full_lifecycle() {
    let harness = harness();
    let manager = harness.manager();

    let call = manager
        .place_call(room(), MediaConstraints::audio_video())
        .await
        .unwrap();
    settle().await;

    assert_eq!(call.state().await, CallState::InviteSent);
    assert_eq!(call.direction(), CallDirection::Outbound);

    let invites = harness.transport.delivered_of_type(SignalType::Invite).await;
    assert_eq!(invites.len(), 1);
    let wire = invites[0].signal.to_wire();
    assert_eq!(wire["version"], 0);
    assert_eq!(wire["call_id"], call.id().as_str());
    assert_eq!(wire["lifetime"], 60_000);

    let session = harness.media_factory.last_session().unwrap();
    assert_eq!(session.local_descriptions().await.len(), 1);
    assert_eq!(session.added_stream_ids(), vec!["local-1"]);

    manager
        .handle_signal(&room(), Duration::ZERO, answer_for(call.id()))
        .await;
    assert_eq!(call.state().await, CallState::Connecting);
    assert_eq!(session.remote_descriptions().await.len(), 1);

    manager
        .handle_media_event(
            call.id(),
            MediaEvent::ConnectivityChanged(ConnectivityState::Connected),
        )
        .await;
    assert_eq!(call.state().await, CallState::Connected);

    call.hangup().await;
    settle().await;

    assert_eq!(call.state().await, CallState::Ended);
    assert!(session.is_closed());
    assert!(harness.media_source.streams()[0].is_stopped());
    assert_eq!(
        harness
            .transport
            .delivered_of_type(SignalType::Hangup)
            .await
            .len(),
        1
    );

    let ended = harness.observer.ended().await;
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].hangup_party, Some(HangupParty::Local));
    assert_eq!(ended[0].hangup_reason, Some(HangupReason::UserHangup));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_call_full_lifecycle() {
    let harness = harness();
    let manager = harness.manager();

    manager
        .handle_signal(&room(), Duration::ZERO, invite("INBOUND1", 60_000))
        .await;

    let incoming = harness.observer.incoming().await;
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].state, CallState::Ringing);

    let call = manager.get_call(&CallId::new("INBOUND1")).await.unwrap();
    assert_eq!(call.direction(), CallDirection::Inbound);

    let session = harness.media_factory.last_session().unwrap();
    assert_eq!(session.remote_descriptions().await.len(), 1);

    call.answer().await.unwrap();
    settle().await;

    assert_eq!(call.state().await, CallState::Connecting);
    assert_eq!(
        harness
            .transport
            .delivered_of_type(SignalType::Answer)
            .await
            .len(),
        1
    );
    assert_eq!(session.added_stream_ids(), vec!["local-1"]);

    manager
        .handle_media_event(
            call.id(),
            MediaEvent::ConnectivityChanged(ConnectivityState::Completed),
        )
        .await;
    assert_eq!(call.state().await, CallState::Connected);

    manager
        .handle_signal(&room(), Duration::ZERO, hangup_for("INBOUND1"))
        .await;
    settle().await;

    assert_eq!(call.state().await, CallState::Ended);
    // Remote-caused endings emit no hangup of our own.
    assert!(
        harness
            .transport
            .delivered_of_type(SignalType::Hangup)
            .await
            .is_empty()
    );

    let ended = harness.observer.ended().await;
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].hangup_party, Some(HangupParty::Remote));
    assert_eq!(ended[0].hangup_reason, Some(HangupReason::RemoteHangup));
}

/// Candidates enqueued across send failures are all delivered exactly
/// once, in discovery order.
#[tokio::test(start_paused = true)]
async fn test_candidates_survive_failures_without_loss_or_duplication() {
    let harness = harness();
    let manager = harness.manager();

    let call = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;
    assert_eq!(call.state().await, CallState::InviteSent);

    harness.transport.fail_next(1).await;
    for n in 0..2 {
        manager
            .handle_media_event(call.id(), MediaEvent::LocalCandidate(candidate(n)))
            .await;
    }
    // Debounce elapses, the first batch attempt fails, a retry is
    // pending. New discoveries join the queue meanwhile.
    tokio::time::sleep(Duration::from_millis(110)).await;
    for n in 2..4 {
        manager
            .handle_media_event(call.id(), MediaEvent::LocalCandidate(candidate(n)))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // The retried batch carried the failed candidates plus the late
    // arrivals, in order.
    assert_eq!(
        harness.transport.candidates_delivered().await,
        vec![candidate(0), candidate(1), candidate(2), candidate(3)]
    );

    // A fresh burst goes out as its own batch; nothing is re-sent.
    manager
        .handle_media_event(call.id(), MediaEvent::LocalCandidate(candidate(4)))
        .await;
    tokio::time::sleep(Duration::from_millis(110)).await;

    let delivered = harness.transport.candidates_delivered().await;
    assert_eq!(
        delivered,
        vec![
            candidate(0),
            candidate(1),
            candidate(2),
            candidate(3),
            candidate(4)
        ]
    );
    let batches = harness
        .transport
        .delivered_of_type(SignalType::Candidates)
        .await;
    assert_eq!(batches.len(), 2);
}

/// A persistently failing invite is retried on the exact backoff
/// schedule, then abandoned without failing the call.
#[tokio::test(start_paused = true)]
async fn test_invite_retry_schedule_then_abandonment() {
    let harness = harness();
    let manager = harness.manager();
    harness.transport.fail_next(usize::MAX).await;

    let call = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(35)).await;

    let attempts = harness.transport.attempts_of_type(SignalType::Invite).await;
    assert_eq!(attempts.len(), 6);
    let gaps: Vec<u64> = attempts
        .windows(2)
        .map(|w| (w[1].at - w[0].at).as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 16000]);

    // Delivery exhaustion alone never ends the call.
    assert_eq!(call.state().await, CallState::InviteSent);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        harness
            .transport
            .attempts_of_type(SignalType::Invite)
            .await
            .len(),
        6,
        "no retry after the budget is exhausted"
    );
}

/// Local hangup from any non-terminal state: terminal state, exactly one
/// notification, all media released; a second hangup is a no-op.
#[tokio::test(start_paused = true)]
async fn test_hangup_is_idempotent() {
    let harness = harness();
    let manager = harness.manager();

    let call = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;

    call.hangup().await;
    call.hangup().await;
    settle().await;

    assert_eq!(call.state().await, CallState::Ended);
    assert_eq!(harness.observer.ended().await.len(), 1);
    assert_eq!(
        harness
            .transport
            .delivered_of_type(SignalType::Hangup)
            .await
            .len(),
        1
    );
    assert!(harness.media_source.streams()[0].is_stopped());
    assert!(harness.media_factory.last_session().unwrap().is_closed());
}

/// An unanswered inbound call expires autonomously, its window shortened
/// by the invite's observed age, with no hangup signaled either way.
#[tokio::test(start_paused = true)]
async fn test_ringing_expiry_adjusts_for_event_age() {
    let harness = harness();
    let manager = harness.manager();

    manager
        .handle_signal(&room(), Duration::from_secs(10), invite("AGED1", 30_000))
        .await;
    let call = manager.get_call(&CallId::new("AGED1")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(19_900)).await;
    assert_eq!(call.state().await, CallState::Ringing);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(call.state().await, CallState::Ended);

    let ended = harness.observer.ended().await;
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].hangup_party, Some(HangupParty::Remote));
    assert_eq!(ended[0].hangup_reason, Some(HangupReason::InviteTimeout));
    assert!(
        harness
            .transport
            .delivered_of_type(SignalType::Hangup)
            .await
            .is_empty(),
        "expiry takes no hangup action"
    );
}

/// A colliding inbound invite absorbs the in-flight outbound call: the
/// local stream moves over, the loser ends quietly with a successor
/// link, and the replacement is answered with the inherited media.
#[tokio::test(start_paused = true)]
async fn test_glare_transfers_media_to_replacement() {
    let harness = harness();
    let manager = harness.manager();

    let outbound = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;
    assert_eq!(outbound.state().await, CallState::InviteSent);
    assert!(outbound.local_media().await.is_some());

    manager
        .handle_signal(&room(), Duration::ZERO, invite("GLARE1", 60_000))
        .await;
    settle().await;

    let replacement = manager.get_call(&CallId::new("GLARE1")).await.unwrap();

    assert_eq!(outbound.state().await, CallState::Ended);
    assert!(outbound.local_media().await.is_none());
    let successor = outbound.successor().await.unwrap();
    assert!(Arc::ptr_eq(&successor, &replacement));

    // The handle moved, unreleased: exactly one capture ever happened.
    assert_eq!(harness.media_source.streams().len(), 1);
    assert!(!harness.media_source.streams()[0].is_stopped());
    assert_eq!(
        replacement.local_media().await.unwrap().id(),
        harness.media_source.streams()[0].id()
    );

    // The loser's teardown is silent for the owner but still signaled.
    assert!(harness.observer.ended().await.is_empty());
    assert_eq!(harness.observer.replaced().await.len(), 1);
    assert_eq!(
        harness
            .transport
            .delivered_of_type(SignalType::Hangup)
            .await
            .len(),
        1
    );

    // The replacement proceeded straight to answering.
    assert_eq!(replacement.state().await, CallState::Connecting);
    assert_eq!(
        harness
            .transport
            .delivered_of_type(SignalType::Answer)
            .await
            .len(),
        1
    );
}

/// Glare while capture is still in flight: the pending acquisition is
/// forwarded to the replacement when it completes.
#[tokio::test(start_paused = true)]
async fn test_glare_forwards_deferred_capture_to_replacement() {
    let harness = harness();
    let manager = harness.manager();
    harness.media_source.gate_acquire();

    let outbound = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;
    assert_eq!(outbound.state().await, CallState::WaitLocalMedia);

    manager
        .handle_signal(&room(), Duration::ZERO, invite("GLARE2", 60_000))
        .await;
    settle().await;

    let replacement = manager.get_call(&CallId::new("GLARE2")).await.unwrap();
    assert_eq!(outbound.state().await, CallState::Ended);
    assert_eq!(replacement.state().await, CallState::WaitLocalMedia);

    harness.media_source.release_acquire();
    settle().await;

    assert_eq!(replacement.state().await, CallState::Connecting);
    assert_eq!(
        replacement.local_media().await.unwrap().id(),
        harness.media_source.streams()[0].id()
    );
}

/// A remote-description completion landing after the call ended changes
/// nothing.
#[tokio::test(start_paused = true)]
async fn test_stale_description_completion_is_a_no_op() {
    let harness = harness();
    let manager = harness.manager();

    let call = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;

    let session = harness.media_factory.last_session().unwrap();
    session.gate_remote_description();

    let mgr = manager.clone();
    let id = call.id().clone();
    tokio::spawn(async move {
        mgr.handle_signal(&room(), Duration::ZERO, answer_for(&id))
            .await;
    });
    settle().await;
    assert_eq!(call.state().await, CallState::Connecting);

    call.hangup().await;
    settle().await;
    assert_eq!(call.state().await, CallState::Ended);
    let ended_count = harness.observer.ended().await.len();

    session.release_remote_description();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(call.state().await, CallState::Ended);
    assert_eq!(harness.observer.ended().await.len(), ended_count);
}

/// History replayed out of order: a hangup for an unseen call leaves a
/// terminal record, and the later invite replay cannot revive it.
#[tokio::test(start_paused = true)]
async fn test_out_of_order_hangup_creates_terminal_call() {
    let harness = harness();
    let manager = harness.manager();

    manager
        .handle_signal(&room(), Duration::from_secs(120), hangup_for("REPLAY1"))
        .await;

    let call = manager.get_call(&CallId::new("REPLAY1")).await.unwrap();
    assert_eq!(call.state().await, CallState::Ended);

    manager
        .handle_signal(&room(), Duration::from_secs(125), invite("REPLAY1", 60_000))
        .await;
    settle().await;

    assert_eq!(call.state().await, CallState::Ended);
    assert!(harness.observer.incoming().await.is_empty());
    assert!(harness.transport.attempts().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_capture_failure_ends_call_with_reason() {
    let harness = harness();
    let manager = harness.manager();
    harness.media_source.fail_capture();

    let call = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;

    assert_eq!(call.state().await, CallState::Ended);
    let ended = harness.observer.ended().await;
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].hangup_reason, Some(HangupReason::CaptureFailure));
    assert_eq!(ended[0].hangup_party, Some(HangupParty::Local));
    assert_eq!(
        harness
            .transport
            .delivered_of_type(SignalType::Hangup)
            .await
            .len(),
        1
    );
    // No invite ever went out.
    assert!(
        harness
            .transport
            .attempts_of_type(SignalType::Invite)
            .await
            .is_empty()
    );
}

#[tokio::test(start_paused = true)]
async fn test_outbound_invite_expires_unanswered() {
    let harness = harness().with_invite_lifetime(Duration::from_secs(30));
    let manager = harness.manager();

    let call = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;
    assert_eq!(call.state().await, CallState::InviteSent);

    let invites = harness.transport.delivered_of_type(SignalType::Invite).await;
    assert_eq!(invites[0].signal.to_wire()["lifetime"], 30_000);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(call.state().await, CallState::Ended);

    let ended = harness.observer.ended().await;
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].hangup_reason, Some(HangupReason::InviteTimeout));
    assert_eq!(ended[0].hangup_party, Some(HangupParty::Local));
    // Timing out locally still notifies the peer.
    assert_eq!(
        harness
            .transport
            .delivered_of_type(SignalType::Hangup)
            .await
            .len(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_stream_loss_ends_call() {
    let harness = harness();
    let manager = harness.manager();

    manager
        .handle_signal(&room(), Duration::ZERO, invite("STREAM1", 60_000))
        .await;
    let call = manager.get_call(&CallId::new("STREAM1")).await.unwrap();
    call.answer().await.unwrap();
    settle().await;

    manager
        .handle_media_event(
            call.id(),
            MediaEvent::ConnectivityChanged(ConnectivityState::Connected),
        )
        .await;
    let remote = roomcall::test_utils::MockMediaStream::new("remote-1");
    manager
        .handle_media_event(call.id(), MediaEvent::RemoteStreamAdded(remote.clone()))
        .await;
    assert!(call.remote_media().await.is_some());

    manager
        .handle_media_event(call.id(), MediaEvent::RemoteStreamEnded)
        .await;
    settle().await;

    assert_eq!(call.state().await, CallState::Ended);
    assert!(remote.is_stopped());
    let ended = harness.observer.ended().await;
    assert_eq!(ended[0].hangup_reason, Some(HangupReason::RemoteMediaLost));
    assert_eq!(ended[0].hangup_party, Some(HangupParty::Remote));
}

#[tokio::test(start_paused = true)]
async fn test_second_outbound_call_on_busy_channel_is_rejected() {
    let harness = harness();
    let manager = harness.manager();

    manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;

    let err = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::ChannelBusy(_)));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_answer_is_ignored() {
    let harness = harness();
    let manager = harness.manager();

    let call = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;

    manager
        .handle_signal(&room(), Duration::ZERO, answer_for(call.id()))
        .await;
    manager
        .handle_signal(&room(), Duration::ZERO, answer_for(call.id()))
        .await;

    assert_eq!(call.state().await, CallState::Connecting);
    let session = harness.media_factory.last_session().unwrap();
    assert_eq!(
        session.remote_descriptions().await.len(),
        1,
        "duplicate answer is not re-applied"
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_candidates_are_applied_in_order() {
    let harness = harness();
    let manager = harness.manager();

    manager
        .handle_signal(&room(), Duration::ZERO, invite("CANDS1", 60_000))
        .await;

    let cands = vec![candidate(1), candidate(2), candidate(3)];
    manager
        .handle_signal(
            &room(),
            Duration::ZERO,
            Signal::Candidates(roomcall::CandidatesContent {
                call_id: CallId::new("CANDS1"),
                candidates: cands.clone(),
            }),
        )
        .await;

    let session = harness.media_factory.last_session().unwrap();
    assert_eq!(session.remote_candidates().await, cands);
}

#[tokio::test(start_paused = true)]
async fn test_answer_in_wrong_state_is_an_error() {
    let harness = harness();
    let manager = harness.manager();

    let call = manager
        .place_call(room(), MediaConstraints::audio())
        .await
        .unwrap();
    settle().await;

    let err = call.answer().await.unwrap_err();
    assert!(matches!(err, CallError::NotAnswerable(_)));
}
