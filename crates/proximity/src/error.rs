use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::permissions::PermissionKind;
use crate::types::PeerId;

/// Failures of a single ranging session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangingError {
    #[error("Received discovery token could not be decoded")]
    TokenDecodeFailed,

    #[error("Peer invalidated its discovery token")]
    PeerTokenInvalidated,

    #[error("Ranging timed out")]
    RangingTimeout,

    #[error("User did not allow ranging")]
    UserPermissionDenied,

    #[error("Discovery token received from unexpected peer {0}")]
    UnexpectedPeer(PeerId),

    #[error("Token exchange did not complete in time")]
    TokenExchangeTimeout,

    #[error("Ranging engine failure: {0}")]
    EngineFailure(String),
}

impl RangingError {
    /// Recoverable errors are retried in place by the ranging session itself.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RangingError::PeerTokenInvalidated | RangingError::RangingTimeout)
    }

    /// Protocol errors invalidate the session and require a full reset.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            RangingError::TokenDecodeFailed | RangingError::UnexpectedPeer(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ProximityError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Already engaged with peer {0}; only one peer session is allowed")]
    PeerCapReached(PeerId),

    #[error("No pending invitation")]
    NoPendingInvitation,

    #[error("Transport refused: encryption is mandatory")]
    EncryptionRequired,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Invitation failed: {0}")]
    InvitationFailed(String),

    #[error("Ranging error: {0}")]
    Ranging(#[from] RangingError),

    #[error("Permission denied: {0}")]
    PermissionDenied(PermissionKind),

    #[error("Location unavailable")]
    LocationUnavailable,

    #[error("Storage error: {0}")]
    Storage(#[from] shared::StorageError),

    #[error("Coordinator is not running")]
    CoordinatorClosed,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<serde_json::Error> for ProximityError {
    fn from(err: serde_json::Error) -> Self {
        ProximityError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProximityError>;

/// Context for error logging
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub peer_id: Option<PeerId>,
    pub session_id: Option<Uuid>,
    pub additional_info: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }
}

impl ProximityError {
    /// Log error with structured context
    pub fn log_with_context(&self, context: &ErrorContext) {
        error!(
            error = %self,
            category = %self.category(),
            peer_id = ?context.peer_id,
            session_id = ?context.session_id,
            additional_info = ?context.additional_info,
            "Proximity session error occurred"
        );
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ProximityError::PeerNotFound(peer) => {
                format!("The peer '{}' could not be found. They may have moved out of range.", peer)
            }
            ProximityError::PeerCapReached(peer) => {
                format!("You are already connected to '{}'. Finish that encounter first.", peer)
            }
            ProximityError::NoPendingInvitation => {
                "There is no invitation waiting for an answer.".to_string()
            }
            ProximityError::EncryptionRequired => {
                "A secure connection could not be established.".to_string()
            }
            ProximityError::SendFailed(_) | ProximityError::InvitationFailed(_) => {
                "Could not reach the other device. Searching for peers again.".to_string()
            }
            ProximityError::DiscoveryFailed(_) => {
                "Searching for nearby devices failed. Please try again.".to_string()
            }
            ProximityError::Ranging(RangingError::UserPermissionDenied) => {
                PermissionKind::Ranging.settings_hint().to_string()
            }
            ProximityError::Ranging(_) => {
                "Lost track of the other device. Searching for peers again.".to_string()
            }
            ProximityError::PermissionDenied(kind) => kind.settings_hint().to_string(),
            ProximityError::LocationUnavailable => {
                "Your location is not available yet, so the encounter could not be saved.".to_string()
            }
            ProximityError::Storage(_) => {
                "The encounter could not be saved.".to_string()
            }
            ProximityError::CoordinatorClosed
            | ProximityError::SerializationError(_)
            | ProximityError::InternalError(_) => {
                "An internal error occurred. Please try again.".to_string()
            }
        }
    }

    /// Get error category for monitoring and recovery decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProximityError::Ranging(err) if err.is_recoverable() => ErrorCategory::Transient,
            ProximityError::Ranging(RangingError::UserPermissionDenied) => ErrorCategory::Permission,
            ProximityError::Ranging(err) if err.is_protocol_error() => ErrorCategory::Protocol,
            ProximityError::Ranging(_) => ErrorCategory::Transport,
            ProximityError::PermissionDenied(_) | ProximityError::LocationUnavailable => {
                ErrorCategory::Permission
            }
            ProximityError::Storage(_) => ErrorCategory::Storage,
            ProximityError::SendFailed(_)
            | ProximityError::DiscoveryFailed(_)
            | ProximityError::InvitationFailed(_)
            | ProximityError::EncryptionRequired => ErrorCategory::Transport,
            ProximityError::PeerNotFound(_)
            | ProximityError::PeerCapReached(_)
            | ProximityError::NoPendingInvitation => ErrorCategory::Validation,
            ProximityError::SerializationError(_) => ErrorCategory::Protocol,
            ProximityError::CoordinatorClosed | ProximityError::InternalError(_) => {
                ErrorCategory::Internal
            }
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Error categories, matching how each class of failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retried in place without user involvement
    Transient,
    /// Invalidates the ranging session and forces a full reset
    Protocol,
    /// Halts the current attempt until the user acts
    Permission,
    /// Reported, never retried automatically
    Storage,
    Transport,
    Validation,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Permission => write!(f, "permission"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}
