// Shared harness: coordinators on a mock medium, driven through their handles

#![allow(dead_code)]

use proximity::{
    event_channel, Backends, CoordinatorHandle, InMemoryEncounterRecorder, LocationProvider, MockAir, PeerId,
    PeerIdentity, RangingState, SessionCoordinator, SessionSnapshot, StaticLocationProvider,
};
use shared::{Coordinates, EncounterConfig, PlaceDescription};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(30);

pub struct Device {
    pub identity: PeerIdentity,
    pub handle: CoordinatorHandle,
    pub recorder: Arc<InMemoryEncounterRecorder>,
    pub task: JoinHandle<proximity::Result<()>>,
}

impl Device {
    pub fn id(&self) -> PeerId {
        self.identity.id.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.handle.snapshot()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, what: &str, predicate: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.handle.subscribe();
        let snapshot = match timeout(WAIT, rx.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => snapshot.clone(),
            Ok(Err(_)) => panic!("{} stopped while waiting for {}", self.identity, what),
            Err(_) => panic!(
                "{} timed out waiting for {}: {:#?}",
                self.identity,
                what,
                self.handle.snapshot()
            ),
        };
        snapshot
    }
}

pub fn seoul() -> StaticLocationProvider {
    StaticLocationProvider::new(
        Coordinates::new(37.5665, 126.9780),
        Some(PlaceDescription {
            administrative_area: Some("Seoul".to_string()),
            locality: Some("Jung-gu".to_string()),
            sub_locality: Some("Myeong-dong".to_string()),
            thoroughfare: None,
        }),
    )
}

pub async fn spawn_device(air: &MockAir, id: &str, name: &str) -> Device {
    spawn_device_with(air, id, name, EncounterConfig::default(), Arc::new(seoul())).await
}

pub async fn spawn_device_with(
    air: &MockAir,
    id: &str,
    name: &str,
    config: EncounterConfig,
    location: Arc<dyn LocationProvider>,
) -> Device {
    let identity = PeerIdentity::new(id, name);
    let (tx, rx) = event_channel();
    let radio = air.attach(identity.clone(), tx.clone()).await;
    let recorder = Arc::new(InMemoryEncounterRecorder::new());

    let coordinator = SessionCoordinator::new(
        config,
        identity.clone(),
        Backends::from_radio(radio),
        recorder.clone(),
        location,
        (tx, rx),
    )
    .expect("coordinator over an encrypted radio");
    let handle = coordinator.handle();
    let task = tokio::spawn(coordinator.run());

    Device {
        identity,
        handle,
        recorder,
        task,
    }
}

/// Discover each other and connect `inviter` to `invitee`.
pub async fn connect(inviter: &Device, invitee: &Device) {
    inviter.handle.start_discovery().unwrap();
    invitee.handle.start_discovery().unwrap();

    let peer = invitee.id();
    inviter.wait_for("invitee to be nearby", |s| s.is_nearby(&peer)).await;
    inviter.handle.invite(invitee.id()).unwrap();

    invitee
        .wait_for("the invitation", |s| s.pending_invitation.is_some())
        .await;
    invitee.handle.accept_invitation().unwrap();

    let a = invitee.id();
    inviter
        .wait_for("the connection", |s| s.connected_peer.as_ref().map(|p| &p.id) == Some(&a))
        .await;
}

/// Connect and wait until both sides range against each other.
pub async fn connect_and_range(inviter: &Device, invitee: &Device) {
    connect(inviter, invitee).await;
    for device in [inviter, invitee] {
        device
            .wait_for("ranging", |s| s.ranging_state == Some(RangingState::Ranging))
            .await;
    }
}

/// Wait until the device is idle again and sees `peer` nearby.
pub async fn wait_for_reset(device: &Device, peer: &PeerId) -> SessionSnapshot {
    device
        .wait_for("discovery to resume", |s| {
            s.connected_peer.is_none() && s.discovery_active && s.is_nearby(peer)
        })
        .await
}
