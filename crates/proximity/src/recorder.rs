// Encounter recording boundary - storage and location collaborators plus the
// one-shot recording step that runs once proximity is confirmed

use crate::permissions::PermissionStatus;
use crate::{PeerIdentity, ProximityError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    Coordinates, Encounter, EncounterDetails, EncounterId, NewEncounter, PeerRecord, PlaceDescription,
    StorageError, StorageResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait EncounterRecorder: Send + Sync {
    async fn record_encounter(&self, encounter: NewEncounter) -> StorageResult<EncounterId>;
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> Option<Coordinates>;

    async fn reverse_geocode(&self, coordinates: Coordinates) -> Option<PlaceDescription>;

    fn authorization(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncounterFailure {
    LocationDenied,
    LocationUnavailable,
    Storage(StorageError),
}

impl From<EncounterFailure> for ProximityError {
    fn from(failure: EncounterFailure) -> Self {
        match failure {
            EncounterFailure::LocationDenied => {
                ProximityError::PermissionDenied(crate::permissions::PermissionKind::Location)
            }
            EncounterFailure::LocationUnavailable => ProximityError::LocationUnavailable,
            EncounterFailure::Storage(err) => ProximityError::Storage(err),
        }
    }
}

/// Result of one recording attempt, reported back to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum EncounterOutcome {
    Recorded {
        encounter_id: EncounterId,
        peer: PeerIdentity,
    },
    Failed {
        peer: PeerIdentity,
        reason: EncounterFailure,
    },
}

impl EncounterOutcome {
    pub fn peer(&self) -> &PeerIdentity {
        match self {
            EncounterOutcome::Recorded { peer, .. } | EncounterOutcome::Failed { peer, .. } => peer,
        }
    }

    pub fn encounter_id(&self) -> Option<EncounterId> {
        match self {
            EncounterOutcome::Recorded { encounter_id, .. } => Some(*encounter_id),
            EncounterOutcome::Failed { .. } => None,
        }
    }
}

/// Gather location and place, then record the encounter once.
///
/// Waiting on location is bounded by `location_timeout`. Nothing is retried:
/// a failure is reported and the encounter counts as attempted.
pub async fn attempt_encounter(
    recorder: Arc<dyn EncounterRecorder>,
    location: Arc<dyn LocationProvider>,
    peer: PeerIdentity,
    occurred_at: DateTime<Utc>,
    location_timeout: Duration,
) -> EncounterOutcome {
    if location.authorization() == PermissionStatus::Denied {
        warn!("Location permission denied, encounter with {} not recorded", peer);
        return EncounterOutcome::Failed {
            peer,
            reason: EncounterFailure::LocationDenied,
        };
    }

    let lookup = async {
        let coordinates = location.current_location().await?;
        let place = location
            .reverse_geocode(coordinates)
            .await
            .map(|place| place.address())
            .filter(|address| !address.is_empty());
        Some((coordinates, place))
    };

    let (coordinates, place) = match tokio::time::timeout(location_timeout, lookup).await {
        Ok(Some(found)) => found,
        Ok(None) => {
            warn!("No location available, encounter with {} not recorded", peer);
            return EncounterOutcome::Failed {
                peer,
                reason: EncounterFailure::LocationUnavailable,
            };
        }
        Err(_) => {
            warn!("Location lookup timed out after {:?}", location_timeout);
            return EncounterOutcome::Failed {
                peer,
                reason: EncounterFailure::LocationUnavailable,
            };
        }
    };

    let encounter = NewEncounter {
        peer_id: peer.id.to_string(),
        display_name: peer.display_name.clone(),
        occurred_at,
        coordinates,
        place,
    };

    match recorder.record_encounter(encounter).await {
        Ok(encounter_id) => {
            info!("Recorded encounter {} with {}", encounter_id, peer);
            EncounterOutcome::Recorded { encounter_id, peer }
        }
        Err(err) => {
            error!("Failed to record encounter with {}: {}", peer, err);
            EncounterOutcome::Failed {
                peer,
                reason: EncounterFailure::Storage(err),
            }
        }
    }
}

/// In-memory encounter store. Peer records are shared between encounters
/// with the same peer.
#[derive(Default)]
pub struct InMemoryEncounterRecorder {
    peers: RwLock<HashMap<String, PeerRecord>>,
    encounters: RwLock<Vec<Encounter>>,
    fail_next: RwLock<Option<StorageError>>,
}

impl InMemoryEncounterRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `record_encounter` call fail with `error`.
    pub async fn fail_next(&self, error: StorageError) {
        *self.fail_next.write().await = Some(error);
    }

    pub async fn encounters(&self) -> Vec<Encounter> {
        self.encounters.read().await.clone()
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.first_met_at.cmp(&b.first_met_at));
        peers
    }

    pub async fn peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Annotate an encounter. Only allowed within the edit window.
    pub async fn update_details(
        &self,
        id: EncounterId,
        details: EncounterDetails,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut encounters = self.encounters.write().await;
        let encounter = encounters
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StorageError::EncounterNotFound(id))?;

        if !encounter.is_editable(now) {
            return Err(StorageError::NotEditable(id));
        }

        encounter.title = details.title;
        encounter.memo = details.memo;
        encounter.photo_data = details.photo_data;
        debug!("Updated details of encounter {}", id);
        Ok(())
    }
}

#[async_trait]
impl EncounterRecorder for InMemoryEncounterRecorder {
    async fn record_encounter(&self, encounter: NewEncounter) -> StorageResult<EncounterId> {
        if let Some(err) = self.fail_next.write().await.take() {
            return Err(err);
        }
        if encounter.peer_id.is_empty() {
            return Err(StorageError::Validation("peer id must not be empty".to_string()));
        }

        {
            let mut peers = self.peers.write().await;
            peers
                .entry(encounter.peer_id.clone())
                .or_insert_with(|| PeerRecord {
                    peer_id: encounter.peer_id.clone(),
                    display_name: encounter.display_name.clone(),
                    first_met_at: encounter.occurred_at,
                });
        }

        let id = EncounterId::new();
        self.encounters.write().await.push(Encounter {
            id,
            created_at: encounter.occurred_at,
            place: encounter.place,
            latitude: Some(encounter.coordinates.latitude),
            longitude: Some(encounter.coordinates.longitude),
            peer_id: encounter.peer_id,
            title: None,
            memo: None,
            photo_data: None,
        });
        Ok(id)
    }
}

/// Location provider with fixed answers
#[derive(Debug, Clone)]
pub struct StaticLocationProvider {
    coordinates: Option<Coordinates>,
    place: Option<PlaceDescription>,
    authorization: PermissionStatus,
    delay: Duration,
}

impl StaticLocationProvider {
    pub fn new(coordinates: Coordinates, place: Option<PlaceDescription>) -> Self {
        Self {
            coordinates: Some(coordinates),
            place,
            authorization: PermissionStatus::Granted,
            delay: Duration::ZERO,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            coordinates: None,
            place: None,
            authorization: PermissionStatus::Granted,
            delay: Duration::ZERO,
        }
    }

    pub fn with_authorization(mut self, authorization: PermissionStatus) -> Self {
        self.authorization = authorization;
        self
    }

    /// Delay every location fix, to simulate a slow GPS.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl LocationProvider for StaticLocationProvider {
    async fn current_location(&self) -> Option<Coordinates> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.coordinates
    }

    async fn reverse_geocode(&self, _coordinates: Coordinates) -> Option<PlaceDescription> {
        self.place.clone()
    }

    fn authorization(&self) -> PermissionStatus {
        self.authorization
    }
}
