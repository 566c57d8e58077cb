//! Session lifecycle tests.
//!
//! Drives a `GroupCallActor` through initialize/enter/leave against mocked
//! capabilities. Time is paused; `get_state()` doubles as a barrier because the
//! mailbox is the lowest-priority input of the actor loop.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use call_test_utils::*;
use mesh_call::actors::{GroupCallEvent, GroupCallHandle, GroupCallState, SessionSnapshot};
use mesh_call::announcement::FeedPurpose;
use mesh_call::errors::CallError;
use mesh_call::media::DeviceKind;
use tokio::sync::broadcast;

async fn settle(session: &GroupCallHandle) -> SessionSnapshot {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    session.get_state().await.unwrap()
}

fn drain(events: &mut broadcast::Receiver<GroupCallEvent>) -> Vec<GroupCallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ============================================================================
// Enter
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_initialize_then_enter_publishes_announcement() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.initialize_local_media().await.unwrap();
    assert_eq!(session.state(), GroupCallState::Initialized);
    assert_eq!(test.media.held_feeds(), vec![FeedPurpose::Usermedia]);

    session.enter().await.unwrap();
    assert_eq!(session.state(), GroupCallState::Entered);

    let published = test.store.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].participant, alice());
    assert_eq!(published[0].session_id, *session.session_id());
    assert_eq!(published[0].feeds.len(), 1);
    assert!(test.store.is_announced(&alice(), &descriptor()));

    // Usermedia was not acquired a second time.
    assert_eq!(test.media.acquire_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_enter_acquires_media_when_uninitialized() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();

    assert_eq!(test.media.acquire_count(), 1);
    let snapshot = settle(&session).await;
    assert_eq!(snapshot.local_feeds, vec![FeedPurpose::Usermedia]);
    assert_eq!(snapshot.participants, vec![alice()]);
}

#[tokio::test(start_paused = true)]
async fn test_enter_twice_is_invalid_state() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();
    let result = session.enter().await;

    assert_eq!(
        result,
        Err(CallError::InvalidState {
            operation: "enter",
            state: GroupCallState::Entered,
        })
    );
    assert_eq!(test.store.publish_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_after_enter_is_invalid_state() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();
    let result = session.initialize_local_media().await;

    assert!(matches!(result, Err(CallError::InvalidState { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_enter_publish_failure_rolls_back() {
    let test = TestCall::new(alice());
    test.store.set_fail_publish(true);
    let (session, _task) = test.spawn();
    let mut events = session.subscribe();

    let result = session.enter().await;

    assert!(matches!(result, Err(CallError::Transport(_))));
    assert_eq!(session.state(), GroupCallState::Uninitialized);
    assert!(test.media.held_feeds().is_empty());
    assert_eq!(test.store.open_subscriptions(), 0);
    assert_eq!(test.store.retract_count(), 0);
    assert!(drain(&mut events).is_empty());

    // The session can try again.
    test.store.set_fail_publish(false);
    session.enter().await.unwrap();
    assert_eq!(session.state(), GroupCallState::Entered);
}

#[tokio::test(start_paused = true)]
async fn test_enter_media_failure_does_not_subscribe() {
    let test = TestCall::new(alice());
    test.media.set_fail_acquire(true);
    let (session, _task) = test.spawn();

    let result = session.enter().await;

    assert!(matches!(result, Err(CallError::Transport(_))));
    assert_eq!(session.state(), GroupCallState::Uninitialized);
    assert_eq!(test.store.subscribe_count(), 0);
    assert_eq!(test.store.publish_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_enter_failure_after_initialize_releases_media() {
    let test = TestCall::new(alice());
    test.store.set_fail_subscribe(true);
    let (session, _task) = test.spawn();

    session.initialize_local_media().await.unwrap();
    let result = session.enter().await;

    assert!(result.is_err());
    assert_eq!(session.state(), GroupCallState::Uninitialized);
    assert!(test.media.held_feeds().is_empty());
}

// ============================================================================
// Leave
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_leave_retracts_and_releases() {
    let test = TestCall::new(alice());
    let (session, task) = test.spawn();

    session.enter().await.unwrap();
    session.leave().await;

    assert_eq!(session.state(), GroupCallState::Ended);
    assert_eq!(test.store.retract_count(), 1);
    assert!(!test.store.is_announced(&alice(), &descriptor()));
    assert!(test.media.held_feeds().is_empty());

    // The actor stops once ended.
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("actor should stop")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_leave_is_idempotent() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();
    session.leave().await;
    session.leave().await;

    assert_eq!(session.state(), GroupCallState::Ended);
    assert_eq!(test.store.retract_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_leave_before_enter_does_not_retract() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.initialize_local_media().await.unwrap();
    session.leave().await;

    assert_eq!(session.state(), GroupCallState::Ended);
    assert_eq!(test.store.retract_count(), 0);
    assert!(test.media.held_feeds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_leave_swallows_retract_failure() {
    let test = TestCall::new(alice());
    test.store.set_fail_retract(true);
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();
    session.leave().await;

    assert_eq!(session.state(), GroupCallState::Ended);
    assert!(test.media.held_feeds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_enter_after_leave_is_invalid_state() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.leave().await;
    let result = session.enter().await;

    // The actor has stopped; the call cannot be entered again.
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_leaves_call() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();
    session.cancel();
    session.wait_until_ended().await;

    assert!(session.is_cancelled());
    assert_eq!(test.store.retract_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_state_events_are_broadcast() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();
    let mut events = session.subscribe();

    session.enter().await.unwrap();
    session.leave().await;

    assert_eq!(
        drain(&mut events),
        vec![
            GroupCallEvent::StateChanged(GroupCallState::Entered),
            GroupCallEvent::ParticipantsJoined(vec![alice()]),
            GroupCallEvent::StateChanged(GroupCallState::Ended),
        ]
    );
}

// ============================================================================
// Re-announcement
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_refresh_republishes_and_retries() {
    let test = TestCall::new(alice());
    let refresh = test.config.refresh_interval;
    let retry = test.config.refresh_retry_delay;
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();
    assert_eq!(test.store.publish_count(), 1);

    tokio::time::advance(refresh + Duration::from_millis(1)).await;
    settle(&session).await;
    assert_eq!(test.store.publish_count(), 2);

    // Failed refreshes are retried after the short delay.
    test.store.set_fail_publish(true);
    tokio::time::advance(refresh + Duration::from_millis(1)).await;
    settle(&session).await;
    tokio::time::advance(retry + Duration::from_millis(1)).await;
    settle(&session).await;
    assert_eq!(test.store.publish_count(), 2);

    test.store.set_fail_publish(false);
    tokio::time::advance(retry + Duration::from_millis(1)).await;
    settle(&session).await;
    assert_eq!(test.store.publish_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_no_refresh_after_leave() {
    let test = TestCall::new(alice());
    let refresh = test.config.refresh_interval;
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();
    session.leave().await;

    tokio::time::advance(refresh * 2).await;
    tokio::task::yield_now().await;
    assert_eq!(test.store.publish_count(), 1);
}

// ============================================================================
// Devices, screenshare, reactions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_set_device_muted_requires_local_media() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    let result = session.set_device_muted(DeviceKind::Microphone, true).await;
    assert!(matches!(result, Err(CallError::InvalidState { .. })));

    session.initialize_local_media().await.unwrap();
    session
        .set_device_muted(DeviceKind::Microphone, true)
        .await
        .unwrap();

    assert!(test.media.is_muted(DeviceKind::Microphone));
    let snapshot = settle(&session).await;
    assert!(snapshot.audio_muted);
    assert!(!snapshot.video_muted);
}

#[tokio::test(start_paused = true)]
async fn test_screensharing_requires_entered() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.initialize_local_media().await.unwrap();
    let result = session.set_screensharing_enabled(true).await;

    assert!(matches!(result, Err(CallError::InvalidState { .. })));
    assert_eq!(test.media.held_feeds(), vec![FeedPurpose::Usermedia]);
}

#[tokio::test(start_paused = true)]
async fn test_screensharing_republishes_feeds() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();
    session.set_screensharing_enabled(true).await.unwrap();

    assert_eq!(
        test.media.held_feeds(),
        vec![FeedPurpose::Usermedia, FeedPurpose::Screenshare]
    );
    let last = test.store.published().pop().unwrap();
    assert_eq!(last.feeds.len(), 2);

    // Enabling twice is a no-op.
    session.set_screensharing_enabled(true).await.unwrap();
    assert_eq!(test.store.publish_count(), 2);

    session.set_screensharing_enabled(false).await.unwrap();
    assert_eq!(test.media.held_feeds(), vec![FeedPurpose::Usermedia]);
    let last = test.store.published().pop().unwrap();
    assert_eq!(last.feeds.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reaction_requires_membership() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    let result = session.send_reaction("👍", false).await;
    assert_eq!(result, Err(CallError::MissingMembership));

    session.enter().await.unwrap();
    let event_id = session.send_reaction("👍", false).await.unwrap();
    assert!(event_id.starts_with("$reaction"));

    let reactions = test.sender.reactions();
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions[0].0, room());
    assert_eq!(reactions[0].1.sender, alice());
    assert_eq!(reactions[0].1.call_id, call());
}

#[tokio::test(start_paused = true)]
async fn test_ephemeral_reactions_throttle_and_decay() {
    let test = TestCall::new(alice());
    let budget = test.config.reaction_budget;
    let decay = test.config.reaction_decay_interval;
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();

    for _ in 0..budget {
        session.send_reaction("🎉", true).await.unwrap();
    }
    assert_eq!(
        session.send_reaction("🎉", true).await,
        Err(CallError::Throttled)
    );

    // Persistent reactions are not rate limited.
    session.send_reaction("👍", false).await.unwrap();

    tokio::time::advance(decay + Duration::from_millis(1)).await;
    settle(&session).await;
    session.send_reaction("🎉", true).await.unwrap();

    let snapshot = settle(&session).await;
    assert_eq!(snapshot.reactions_outstanding, budget);
    assert_eq!(
        test.sender.reactions().len(),
        usize::try_from(budget).unwrap() + 2
    );
}

#[tokio::test(start_paused = true)]
async fn test_reaction_after_leave_is_rejected() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();

    session.enter().await.unwrap();
    session.leave().await;

    assert!(session.send_reaction("👍", false).await.is_err());
}
