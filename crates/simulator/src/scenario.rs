// Walk-up scenario: two simulated phones find each other, connect, close the
// distance and record an encounter each

use anyhow::{bail, Context, Result};
use proximity::{
    event_channel, Backends, CoordinatorHandle, InMemoryEncounterRecorder, MockAir, PeerId, PeerIdentity,
    RangingState, SessionCoordinator, SessionSnapshot, StaticLocationProvider,
};
use shared::{Coordinates, Encounter, EncounterConfig, PlaceDescription};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// Distances in metres reported while the two phones approach each other
pub const DEFAULT_PATH: [f32; 6] = [3.0, 1.8, 0.9, 0.45, 0.28, 0.12];

const WAIT: Duration = Duration::from_secs(15);

pub struct WalkReport {
    pub local: SessionSnapshot,
    pub peer: SessionSnapshot,
    pub encounters: Vec<Encounter>,
}

struct Phone {
    identity: PeerIdentity,
    handle: CoordinatorHandle,
    recorder: Arc<InMemoryEncounterRecorder>,
    task: JoinHandle<proximity::Result<()>>,
}

impl Phone {
    async fn boot(air: &MockAir, config: EncounterConfig, identity: PeerIdentity) -> Result<Self> {
        let (tx, rx) = event_channel();
        let radio = air.attach(identity.clone(), tx.clone()).await;
        let recorder = Arc::new(InMemoryEncounterRecorder::new());
        let location = Arc::new(StaticLocationProvider::new(
            Coordinates::new(37.5665, 126.9780),
            Some(PlaceDescription {
                administrative_area: Some("Seoul".to_string()),
                locality: Some("Jung-gu".to_string()),
                sub_locality: Some("Myeong-dong".to_string()),
                thoroughfare: None,
            }),
        ));

        let coordinator = SessionCoordinator::new(
            config,
            identity.clone(),
            Backends::from_radio(radio),
            recorder.clone(),
            location,
            (tx, rx),
        )?;
        let handle = coordinator.handle();
        let task = tokio::spawn(coordinator.run());

        Ok(Self {
            identity,
            handle,
            recorder,
            task,
        })
    }

    fn id(&self) -> PeerId {
        self.identity.id.clone()
    }

    async fn wait_for<F>(&self, what: &str, predicate: F) -> Result<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.handle.subscribe();
        let snapshot = timeout(WAIT, rx.wait_for(predicate))
            .await
            .with_context(|| format!("{} timed out waiting for {}", self.identity, what))?
            .with_context(|| format!("{} stopped while waiting for {}", self.identity, what))?;
        Ok(snapshot.clone())
    }

    async fn power_off(self) -> Result<SessionSnapshot> {
        let snapshot = self.handle.snapshot();
        self.handle.shutdown()?;
        self.task.await.context("coordinator task panicked")??;
        Ok(snapshot)
    }
}

/// Run one walk-up along `path`, reporting a sample every `step`.
pub async fn run(config: EncounterConfig, path: &[f32], step: Duration) -> Result<WalkReport> {
    let air = MockAir::new();
    let local = Phone::boot(
        &air,
        config.clone(),
        PeerIdentity::new("local", config.display_name.clone()),
    )
    .await?;
    let peer = Phone::boot(&air, config, PeerIdentity::new("peer-bob", "Bob")).await?;

    local.handle.start_discovery()?;
    peer.handle.start_discovery()?;

    let peer_id = peer.id();
    local.wait_for("Bob to appear", |s| s.is_nearby(&peer_id)).await?;
    info!("Found {}, inviting", peer.identity);
    local.handle.invite(peer.id())?;

    peer.wait_for("the invitation", |s| s.pending_invitation.is_some())
        .await?;
    peer.handle.accept_invitation()?;

    for phone in [&local, &peer] {
        phone
            .wait_for("ranging", |s| s.ranging_state == Some(RangingState::Ranging))
            .await?;
    }

    for &distance in path {
        let delivered = air.set_distance(&local.id(), &peer.id(), distance).await;
        info!("Distance {:.2}m reported to {} engines", distance, delivered);
        sleep(step).await;

        if local.handle.snapshot().encounters_fired > 0 {
            break;
        }
    }

    let encountered = local.handle.snapshot().encounters_fired > 0;
    if encountered {
        local
            .wait_for("the encounter to be saved", |s| s.last_encounter.is_some())
            .await?;
    } else {
        warn!("Walk ended without an encounter");
    }

    let encounters = local.recorder.encounters().await;
    if encountered && encounters.is_empty() {
        bail!("encounter fired but nothing was recorded");
    }

    Ok(WalkReport {
        local: local.power_off().await?,
        peer: peer.power_off().await?,
        encounters,
    })
}
