//! Membership reconciliation tests.
//!
//! Announcements are injected through `MockAnnouncementStore`; the session
//! turns them into `ParticipantsJoined`/`ParticipantsLeft` batches.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use call_test_utils::*;
use common::types::ParticipantId;
use mesh_call::actors::{GroupCallEvent, GroupCallHandle, GroupCallState, SessionSnapshot};
use mesh_call::announcement::AnnouncementChange;
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

fn membership_events(events: &mut broadcast::Receiver<GroupCallEvent>) -> Vec<GroupCallEvent> {
    drain(events)
        .into_iter()
        .filter(|e| !matches!(e, GroupCallEvent::StateChanged(_)))
        .collect()
}

/// Test call for alice with the given participants already announced.
fn with_announced(others: &[fn() -> ParticipantId]) -> TestCall {
    let mut store = MockAnnouncementStore::new();
    for participant in others {
        store = store.with_announcement(TestAnnouncement::new(participant()).build());
    }
    TestCall::new(alice()).with_store(store)
}

// ============================================================================
// Joins
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_existing_participants_reported_on_enter() {
    let test = with_announced(&[bob, carol]);
    let (session, _task) = test.spawn();
    let mut events = session.subscribe();

    session.enter().await.unwrap();
    let snapshot = settle(&session).await;

    assert_eq!(snapshot.participants, vec![alice(), bob(), carol()]);
    assert_eq!(
        membership_events(&mut events),
        vec![GroupCallEvent::ParticipantsJoined(vec![
            alice(),
            bob(),
            carol()
        ])]
    );
    // Alice orders first, so she offers to both.
    assert_eq!(test.sender.count_to(&bob(), "offer"), 1);
    assert_eq!(test.sender.count_to(&carol(), "offer"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_batched_joins_emit_one_event() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();
    settle(&session).await;
    let mut events = session.subscribe();

    test.store.announce_batch(
        &room(),
        vec![
            AnnouncementChange::Published(TestAnnouncement::new(carol()).build()),
            AnnouncementChange::Published(TestAnnouncement::new(bob()).build()),
        ],
    );
    let snapshot = settle(&session).await;

    assert_eq!(
        membership_events(&mut events),
        vec![GroupCallEvent::ParticipantsJoined(vec![bob(), carol()])]
    );
    assert_eq!(snapshot.participants, vec![alice(), bob(), carol()]);
    assert_eq!(snapshot.peers.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_announcement_is_not_a_new_join() {
    let test = with_announced(&[bob]);
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();
    settle(&session).await;
    let mut events = session.subscribe();

    // A refresh of the same announcement.
    test.store.announce(TestAnnouncement::new(bob()).build());
    settle(&session).await;

    assert!(membership_events(&mut events).is_empty());
    assert_eq!(test.media.connections_created_to(&bob()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_matching_announcements_are_ignored() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();

    test.store
        .announce(TestAnnouncement::new(bob()).expired().build());
    test.store
        .announce(TestAnnouncement::new(carol()).call("another-call").build());
    test.store.announce(
        TestAnnouncement::new(dave())
            .application("m.other")
            .build(),
    );
    let snapshot = settle(&session).await;

    assert_eq!(snapshot.participants, vec![alice()]);
    assert_eq!(test.media.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_local_identity_with_other_session_is_not_a_peer() {
    let test = TestCall::new(alice());
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();

    test.store
        .announce(TestAnnouncement::new(alice()).session("other-device-session").build());
    let snapshot = settle(&session).await;

    assert_eq!(snapshot.participants, vec![alice()]);
    assert!(snapshot.peers.is_empty());
    assert_eq!(test.media.open_connections(), 0);
}

// ============================================================================
// Departures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_departure_confirmed_after_settle_delay() {
    let test = with_announced(&[bob, carol]);
    let settle_delay = test.config.settle_delay;
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();
    settle(&session).await;
    let mut events = session.subscribe();

    test.store.withdraw(&bob(), &descriptor());
    let snapshot = settle(&session).await;

    // Still a participant until the settle delay has passed.
    assert_eq!(snapshot.pending_departures, vec![bob()]);
    assert_eq!(snapshot.participants, vec![alice(), bob(), carol()]);
    assert!(test.media.connection_to(&bob()).is_some());
    assert!(membership_events(&mut events).is_empty());

    tokio::time::advance(settle_delay + Duration::from_millis(1)).await;
    let snapshot = settle(&session).await;

    assert_eq!(
        membership_events(&mut events),
        vec![GroupCallEvent::ParticipantsLeft(vec![bob()])]
    );
    assert_eq!(snapshot.participants, vec![alice(), carol()]);
    assert!(snapshot.pending_departures.is_empty());
    assert!(test.media.connection_to(&bob()).is_none());
    assert_eq!(test.sender.count_to(&bob(), "hangup"), 1);
    assert_eq!(snapshot.state, GroupCallState::Entered);
}

#[tokio::test(start_paused = true)]
async fn test_flapping_departure_is_suppressed() {
    let test = with_announced(&[bob, carol]);
    let settle_delay = test.config.settle_delay;
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();
    settle(&session).await;
    let mut events = session.subscribe();

    test.store.withdraw(&bob(), &descriptor());
    settle(&session).await;
    tokio::time::advance(settle_delay / 2).await;
    test.store.announce(TestAnnouncement::new(bob()).build());
    let snapshot = settle(&session).await;
    assert!(snapshot.pending_departures.is_empty());

    tokio::time::advance(settle_delay).await;
    let snapshot = settle(&session).await;

    assert!(membership_events(&mut events).is_empty());
    assert_eq!(snapshot.participants, vec![alice(), bob(), carol()]);
    // The connection survived the flap.
    assert_eq!(test.media.connections_created_to(&bob()), 1);
    assert!(test.media.connection_to(&bob()).is_some());
    assert_eq!(test.sender.count_to(&bob(), "hangup"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_earlier_recheck_does_not_confirm_second_absence() {
    let test = with_announced(&[bob, carol]);
    let settle_delay = test.config.settle_delay;
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();
    settle(&session).await;
    let mut events = session.subscribe();

    // Gone, back, and gone again inside one settle window.
    test.store.withdraw(&bob(), &descriptor());
    settle(&session).await;
    tokio::time::advance(settle_delay / 2).await;
    test.store.announce(TestAnnouncement::new(bob()).build());
    settle(&session).await;
    tokio::time::advance(settle_delay / 4).await;
    test.store.withdraw(&bob(), &descriptor());
    settle(&session).await;

    // The first recheck fires while the second absence is still settling.
    tokio::time::advance(settle_delay / 4 + Duration::from_millis(100)).await;
    let snapshot = settle(&session).await;

    assert!(membership_events(&mut events).is_empty());
    assert_eq!(snapshot.pending_departures, vec![bob()]);
    assert_eq!(snapshot.participants, vec![alice(), bob(), carol()]);
    assert!(test.media.connection_to(&bob()).is_some());

    test.store.announce(TestAnnouncement::new(bob()).build());
    settle(&session).await;
    tokio::time::advance(settle_delay).await;
    let snapshot = settle(&session).await;

    assert!(membership_events(&mut events).is_empty());
    assert!(snapshot.pending_departures.is_empty());
    assert_eq!(test.media.connections_created_to(&bob()), 1);
    assert_eq!(test.sender.count_to(&bob(), "hangup"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_session_leaves_when_alone() {
    let test = with_announced(&[bob]);
    let settle_delay = test.config.settle_delay;
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();
    settle(&session).await;
    let mut events = session.subscribe();

    test.store.withdraw(&bob(), &descriptor());
    settle(&session).await;
    tokio::time::advance(settle_delay + Duration::from_millis(1)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    session.wait_until_ended().await;

    assert_eq!(
        drain(&mut events),
        vec![
            GroupCallEvent::ParticipantsLeft(vec![bob()]),
            GroupCallEvent::StateChanged(GroupCallState::Ended),
        ]
    );
    assert_eq!(test.store.retract_count(), 1);
    assert!(test.media.held_feeds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lone_participant_does_not_leave() {
    let test = TestCall::new(alice());
    let settle_delay = test.config.settle_delay;
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();

    tokio::time::advance(settle_delay * 5).await;
    let snapshot = settle(&session).await;

    assert_eq!(snapshot.state, GroupCallState::Entered);
    assert_eq!(snapshot.participants, vec![alice()]);
}

#[tokio::test(start_paused = true)]
async fn test_expired_announcement_becomes_departure() {
    let ttl = Duration::from_millis(200);
    let store = MockAnnouncementStore::new()
        .with_announcement(TestAnnouncement::new(bob()).expires_in(ttl).build());
    let test = TestCall::new(alice()).with_store(store);
    let settle_delay = test.config.settle_delay;
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();
    let snapshot = settle(&session).await;
    assert_eq!(snapshot.participants, vec![alice(), bob()]);
    let mut events = session.subscribe();

    // Expiry is judged on the wall clock; the timer runs on tokio time.
    std::thread::sleep(ttl + Duration::from_millis(50));
    tokio::time::advance(ttl + Duration::from_millis(50)).await;
    let snapshot = settle(&session).await;
    assert_eq!(snapshot.pending_departures, vec![bob()]);

    tokio::time::advance(settle_delay + Duration::from_millis(1)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    session.wait_until_ended().await;

    assert!(drain(&mut events).contains(&GroupCallEvent::ParticipantsLeft(vec![bob()])));
}

// ============================================================================
// Session changes and stream loss
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_far_future_expiry_is_accepted() {
    let century = Duration::from_secs(100 * 365 * 24 * 60 * 60);
    let store = MockAnnouncementStore::new()
        .with_announcement(TestAnnouncement::new(bob()).expires_in(century).build());
    let test = TestCall::new(alice()).with_store(store);
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    let snapshot = settle(&session).await;

    assert_eq!(snapshot.state, GroupCallState::Entered);
    assert_eq!(snapshot.participants, vec![alice(), bob()]);
}

#[tokio::test(start_paused = true)]
async fn test_new_session_reconnects_without_hangup() {
    let test = with_announced(&[bob]);
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();
    settle(&session).await;
    let mut events = session.subscribe();

    test.store
        .announce(TestAnnouncement::new(bob()).session("session-BOB-restarted").build());
    let snapshot = settle(&session).await;

    assert_eq!(test.media.connections_created_to(&bob()), 2);
    assert_eq!(test.media.open_connections(), 1);
    assert_eq!(test.sender.count_to(&bob(), "hangup"), 0);
    assert_eq!(test.sender.count_to(&bob(), "offer"), 2);

    let peer = snapshot.peer(&bob()).unwrap();
    assert_eq!(peer.remote_session.0, "session-BOB-restarted");
    assert!(membership_events(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_resyncs_missed_withdrawal() {
    let test = with_announced(&[bob, carol]);
    let resubscribe_delay = test.config.resubscribe_delay;
    let settle_delay = test.config.settle_delay;
    let (session, _task) = test.spawn();
    session.enter().await.unwrap();
    settle(&session).await;
    let mut events = session.subscribe();

    test.store.close_subscriptions();
    settle(&session).await;

    // Bob leaves while we are not listening.
    test.store.withdraw(&bob(), &descriptor());

    tokio::time::advance(resubscribe_delay + Duration::from_millis(1)).await;
    let snapshot = settle(&session).await;

    assert_eq!(test.store.subscribe_count(), 2);
    assert_eq!(snapshot.pending_departures, vec![bob()]);

    tokio::time::advance(settle_delay + Duration::from_millis(1)).await;
    let snapshot = settle(&session).await;

    assert_eq!(
        membership_events(&mut events),
        vec![GroupCallEvent::ParticipantsLeft(vec![bob()])]
    );
    assert_eq!(snapshot.participants, vec![alice(), carol()]);
}
