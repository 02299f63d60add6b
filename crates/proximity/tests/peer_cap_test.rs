// Single-peer cap: at most one connected or connecting peer at a time

mod common;

use common::{connect_and_range, spawn_device};
use proximity::{
    AppState, ConnectionState, InvitationResponder, MockAir, PeerIdentity, RadioCall, RangingState, SessionEvent,
};

#[tokio::test]
async fn test_invitations_declined_while_connected() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;

    connect_and_range(&alice, &bob).await;

    let carol = PeerIdentity::new("peer-c", "Carol");
    let (responder, answer) = InvitationResponder::new();
    assert!(alice.handle.events().post(SessionEvent::InvitationReceived {
        from: carol.clone(),
        responder,
    }));
    assert_eq!(answer.await, Ok(false));

    // A stray connection callback for another peer changes nothing.
    alice.handle.events().post(SessionEvent::ConnectionStateChanged {
        peer: carol.clone(),
        state: ConnectionState::Connecting,
    });
    alice.handle.events().post(SessionEvent::ConnectionStateChanged {
        peer: carol,
        state: ConnectionState::Connected,
    });

    // Commands are queued behind the callbacks, so once the invite below is
    // handled the callbacks have been too.
    alice.handle.invite("peer-c".into()).unwrap();
    alice.handle.app_state_changed(AppState::Background).unwrap();
    let snapshot = alice
        .wait_for("queue drained", |s| s.app_state == AppState::Background)
        .await;

    assert_eq!(snapshot.connected_peer, Some(bob.identity.clone()));
    assert_eq!(snapshot.ranging_state, Some(RangingState::Ranging));
    assert!(snapshot.pending_invitation.is_none());
    assert_eq!(snapshot.ranging_sessions, 1);

    let invites: Vec<_> = air
        .calls(&alice.id())
        .await
        .into_iter()
        .filter(|c| matches!(c, RadioCall::Invite { .. }))
        .collect();
    assert_eq!(invites.len(), 1);
}

#[tokio::test]
async fn test_discovery_is_suspended_while_engaged() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;
    let carol = spawn_device(&air, "peer-c", "Carol").await;
    carol.handle.start_discovery().unwrap();

    connect_and_range(&alice, &bob).await;

    for device in [&alice, &bob] {
        let snapshot = device.snapshot();
        assert!(!snapshot.discovery_active);
        assert!(snapshot.nearby_peers.is_empty());
    }

    // Carol can no longer see either of them.
    let (a, b) = (alice.id(), bob.id());
    carol
        .wait_for("engaged peers to disappear", |s| !s.is_nearby(&a) && !s.is_nearby(&b))
        .await;

    // Starting discovery again while engaged is a no-op.
    alice.handle.start_discovery().unwrap();
    alice.handle.app_state_changed(AppState::Background).unwrap();
    let snapshot = alice
        .wait_for("queue drained", |s| s.app_state == AppState::Background)
        .await;
    assert!(!snapshot.discovery_active);
    let advertised = air
        .calls(&alice.id())
        .await
        .iter()
        .filter(|c| matches!(c, RadioCall::StartAdvertising { .. }))
        .count();
    assert_eq!(advertised, 1);
}

#[tokio::test]
async fn test_newer_invitation_replaces_older() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;
    let carol = spawn_device(&air, "peer-c", "Carol").await;

    for device in [&alice, &bob, &carol] {
        device.handle.start_discovery().unwrap();
    }
    let b = bob.id();
    alice.wait_for("bob nearby", |s| s.is_nearby(&b)).await;
    carol.wait_for("bob nearby", |s| s.is_nearby(&b)).await;

    alice.handle.invite(bob.id()).unwrap();
    bob.wait_for("alice's invitation", |s| {
        s.pending_invitation.as_ref().map(|p| p.id.as_str()) == Some("peer-a")
    })
    .await;

    carol.handle.invite(bob.id()).unwrap();
    bob.wait_for("carol's invitation", |s| {
        s.pending_invitation.as_ref().map(|p| p.id.as_str()) == Some("peer-c")
    })
    .await;

    bob.handle.accept_invitation().unwrap();
    let c = carol.id();
    bob.wait_for("connected to carol", |s| {
        s.connected_peer.as_ref().map(|p| &p.id) == Some(&c)
    })
    .await;

    assert_eq!(air.linked_peer(&alice.id()).await, None);
    assert_eq!(alice.snapshot().connection_state, ConnectionState::NotConnected);
}

#[tokio::test]
async fn test_rejected_invitation_leaves_both_idle() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;

    alice.handle.start_discovery().unwrap();
    bob.handle.start_discovery().unwrap();
    let b = bob.id();
    alice.wait_for("bob nearby", |s| s.is_nearby(&b)).await;

    alice.handle.invite(bob.id()).unwrap();
    bob.wait_for("invitation", |s| s.pending_invitation.is_some()).await;
    bob.handle.reject_invitation().unwrap();
    bob.wait_for("invitation answered", |s| s.pending_invitation.is_none())
        .await;

    // Answering twice is reported, not fatal.
    bob.handle.reject_invitation().unwrap();
    bob.handle.suspend_discovery().unwrap();
    bob.wait_for("queue drained", |s| !s.discovery_active).await;

    assert_eq!(air.linked_peer(&alice.id()).await, None);
    assert_eq!(alice.snapshot().connection_state, ConnectionState::NotConnected);
    assert!(alice.snapshot().discovery_active);
}
