use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Encounters can be annotated for this long after they are recorded.
pub const EDIT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncounterId(pub Uuid);

impl EncounterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EncounterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EncounterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Reverse-geocoded place, coarse to fine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceDescription {
    pub administrative_area: Option<String>,
    pub locality: Option<String>,
    pub sub_locality: Option<String>,
    pub thoroughfare: Option<String>,
}

impl PlaceDescription {
    /// Space-joined address from the parts that are present.
    pub fn address(&self) -> String {
        [
            &self.administrative_area,
            &self.locality,
            &self.sub_locality,
            &self.thoroughfare,
        ]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

// Peer models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub display_name: String,
    pub first_met_at: DateTime<Utc>,
}

// Encounter models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encounter {
    pub id: EncounterId,
    pub created_at: DateTime<Utc>,
    pub place: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub peer_id: String,
    pub title: Option<String>,
    pub memo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_data: Option<Vec<u8>>,
}

impl Encounter {
    pub fn is_editable(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) < Duration::hours(EDIT_WINDOW_HOURS)
    }
}

/// What the core hands to the recorder once proximity is confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEncounter {
    pub peer_id: String,
    pub display_name: String,
    pub occurred_at: DateTime<Utc>,
    pub coordinates: Coordinates,
    pub place: Option<String>,
}

/// User-editable fields of a recorded encounter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncounterDetails {
    pub title: Option<String>,
    pub memo: Option<String>,
    pub photo_data: Option<Vec<u8>>,
}
