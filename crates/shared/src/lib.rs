pub mod models;
pub mod error;
pub mod config;

pub use config::{Config, EncounterConfig, LogFormat, LoggingConfig};
pub use error::{StorageError, StorageResult};
pub use models::{
    Coordinates, Encounter, EncounterDetails, EncounterId, NewEncounter, PeerRecord,
    PlaceDescription,
};
