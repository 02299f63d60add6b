use thiserror::Error;

use crate::models::EncounterId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Encounter not found: {0}")]
    EncounterNotFound(EncounterId),

    #[error("Encounter {0} can no longer be edited")]
    NotEditable(EncounterId),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
