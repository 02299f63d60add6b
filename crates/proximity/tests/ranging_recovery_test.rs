// Ranging recovery: timeouts, peer restarts, suspension and early disconnects

mod common;

use common::{connect, connect_and_range, spawn_device, wait_for_reset};
use proximity::{ConnectionState, MockAir, NearbyObject, RangingState, RemovalReason};

#[tokio::test]
async fn test_ranging_timeout_reruns_without_new_tokens() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;

    connect_and_range(&alice, &bob).await;
    assert_eq!(air.runs(&alice.id()).await, 1);

    assert!(air.remove_peer(&alice.id(), RemovalReason::Timeout).await);

    let mut attempts = 0;
    while air.runs(&alice.id()).await < 2 {
        attempts += 1;
        assert!(attempts < 1000, "engine was not re-run");
        tokio::task::yield_now().await;
    }
    alice
        .wait_for("ranging again", |s| s.ranging_state == Some(RangingState::Ranging))
        .await;

    assert_eq!(air.sends(&alice.id()).await, 1);
    assert_eq!(alice.snapshot().connection_state, ConnectionState::Connected);
    assert_eq!(alice.snapshot().ranging_sessions, 1);

    // Samples still flow through the re-run configuration.
    assert_eq!(air.set_distance(&alice.id(), &bob.id(), 0.1).await, 2);
    alice.wait_for("encounter", |s| s.encounters_fired == 1).await;
}

#[tokio::test]
async fn test_peer_ended_triggers_fresh_exchange() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;

    connect_and_range(&alice, &bob).await;
    let old_token = air.local_token(&alice.id()).await.expect("alice token");

    assert!(air.remove_peer(&alice.id(), RemovalReason::PeerEnded).await);

    // Alice prepares a new token and sends it; Bob re-runs against it.
    let mut attempts = 0;
    while air.runs(&bob.id()).await < 2 {
        attempts += 1;
        assert!(attempts < 1000, "peer never re-ran");
        tokio::task::yield_now().await;
    }
    alice
        .wait_for("ranging again", |s| s.ranging_state == Some(RangingState::Ranging))
        .await;

    let new_token = air.local_token(&alice.id()).await.expect("alice token");
    assert_ne!(old_token, new_token);
    assert_eq!(air.sends(&alice.id()).await, 2);
    assert_eq!(air.sends(&bob.id()).await, 2);
    assert_eq!(alice.snapshot().ranging_sessions, 1);

    bob.wait_for("bob ranging", |s| s.ranging_state == Some(RangingState::Ranging))
        .await;
    assert_eq!(air.set_distance(&alice.id(), &bob.id(), 0.1).await, 2);
    alice.wait_for("encounter", |s| s.encounters_fired == 1).await;
}

#[tokio::test]
async fn test_suspension_holds_samples_until_resumed() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;

    connect_and_range(&alice, &bob).await;

    assert!(air.suspend_engine(&alice.id()).await);
    alice
        .wait_for("suspended", |s| s.ranging_state == Some(RangingState::Suspended))
        .await;

    // Samples during suspension are not used.
    let token = air.local_token(&bob.id()).await.expect("bob token");
    assert!(air.report_objects(&alice.id(), vec![NearbyObject::at_distance(token, 0.1)]).await);
    assert!(air.end_suspension(&alice.id()).await);
    alice
        .wait_for("resumed", |s| s.ranging_state == Some(RangingState::Ranging))
        .await;
    assert_eq!(alice.snapshot().encounters_fired, 0);
    assert_eq!(air.runs(&alice.id()).await, 2);
    assert_eq!(air.sends(&alice.id()).await, 1);
}

#[tokio::test]
async fn test_foreign_tokens_are_ignored() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;

    connect_and_range(&alice, &bob).await;

    let stranger = proximity::DiscoveryToken::from_bytes(vec![9; 16]);
    assert!(air.report_objects(&alice.id(), vec![NearbyObject::at_distance(stranger, 0.05)]).await);

    let token = air.local_token(&bob.id()).await.expect("bob token");
    assert!(air.report_objects(&alice.id(), vec![NearbyObject::at_distance(token, 0.8)]).await);

    let snapshot = alice.wait_for("bob's sample", |s| s.distance == Some(0.8)).await;
    assert_eq!(snapshot.encounters_fired, 0);
}

#[tokio::test]
async fn test_disconnect_before_exchange_completes() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;

    // Alice's token never reaches Bob.
    air.fail_next_send(&alice.id()).await;
    connect(&alice, &bob).await;
    alice
        .wait_for("alice ranging", |s| s.ranging_state == Some(RangingState::Ranging))
        .await;
    assert_eq!(
        bob.snapshot().ranging_state,
        Some(RangingState::AwaitingLocalToken)
    );

    air.drop_link(&bob.id()).await;

    wait_for_reset(&alice, &bob.id()).await;
    let snapshot = wait_for_reset(&bob, &alice.id()).await;
    assert_eq!(snapshot.ranging_state, Some(RangingState::Invalidated));
    assert_eq!(air.runs(&bob.id()).await, 0);
    assert_eq!(snapshot.encounters_fired, 0);
    assert!(snapshot.last_encounter.is_none());
    assert!(bob.recorder.encounters().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_token_exchange_timeout_tears_down_connection() {
    let air = MockAir::new();
    let alice = spawn_device(&air, "peer-a", "Alice").await;
    let bob = spawn_device(&air, "peer-b", "Bob").await;

    air.fail_next_send(&alice.id()).await;
    connect(&alice, &bob).await;
    alice
        .wait_for("alice ranging", |s| s.ranging_state == Some(RangingState::Ranging))
        .await;

    // Nothing else happens until Bob's exchange timer fires.
    let started = tokio::time::Instant::now();
    let snapshot = bob
        .wait_for("bob disconnected", |s| {
            s.connection_state == ConnectionState::NotConnected && s.ranging_state == Some(RangingState::Invalidated)
        })
        .await;
    assert!(started.elapsed() >= std::time::Duration::from_secs(9));
    assert_eq!(snapshot.encounters_fired, 0);

    wait_for_reset(&alice, &bob.id()).await;
    wait_for_reset(&bob, &alice.id()).await;
    assert_eq!(air.runs(&bob.id()).await, 0);
}
