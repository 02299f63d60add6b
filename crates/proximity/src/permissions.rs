// Permission tracking for the encounter flow
// Records the OS-reported status of each capability the core depends on

use crate::{ProximityError, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Capabilities the encounter flow needs from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionKind {
    /// Advertise/browse and the peer transport
    LocalNetwork,
    /// Distance and direction measurement
    Ranging,
    /// Coordinates for the recorded encounter
    Location,
}

impl std::fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionKind::LocalNetwork => write!(f, "Local Network"),
            PermissionKind::Ranging => write!(f, "Nearby Interaction"),
            PermissionKind::Location => write!(f, "Location"),
        }
    }
}

impl PermissionKind {
    /// Message for the alert shown when the permission is missing.
    pub fn settings_hint(&self) -> &'static str {
        match self {
            PermissionKind::LocalNetwork => {
                "Local network access is required to find nearby devices. \
                 Please enable it in Settings."
            }
            PermissionKind::Ranging => {
                "Nearby Interaction access is required to measure distance to the other device. \
                 Please enable it in Settings."
            }
            PermissionKind::Location => {
                "Location access is required to remember where you met. \
                 Please enable it in Settings."
            }
        }
    }
}

/// Permission status for a specific capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Permission has been granted
    Granted,
    /// Permission has been denied by the user
    Denied,
    /// The user has not been asked yet
    NotDetermined,
}

/// Last known permission status per capability.
///
/// Owned by the coordinator; statuses change only through [`record`](Self::record),
/// which is fed from platform callbacks or an engine failure.
#[derive(Debug, Clone, Default)]
pub struct PermissionTracker {
    statuses: HashMap<PermissionKind, PermissionStatus>,
}

impl PermissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a status. Returns `true` when it differs from the previous one.
    pub fn record(&mut self, kind: PermissionKind, status: PermissionStatus) -> bool {
        let previous = self.statuses.insert(kind, status);
        let changed = previous != Some(status);

        if changed {
            match status {
                PermissionStatus::Denied => warn!("{} permission denied", kind),
                PermissionStatus::Granted => info!("{} permission granted", kind),
                PermissionStatus::NotDetermined => debug!("{} permission not determined", kind),
            }
        }
        changed
    }

    pub fn status(&self, kind: PermissionKind) -> PermissionStatus {
        self.statuses
            .get(&kind)
            .copied()
            .unwrap_or(PermissionStatus::NotDetermined)
    }

    pub fn is_denied(&self, kind: PermissionKind) -> bool {
        self.status(kind) == PermissionStatus::Denied
    }

    /// Fails only on an explicit denial; an undetermined permission is left
    /// for the platform to prompt on first use.
    pub fn verify(&self, kind: PermissionKind) -> Result<()> {
        match self.status(kind) {
            PermissionStatus::Denied => Err(ProximityError::PermissionDenied(kind)),
            PermissionStatus::Granted | PermissionStatus::NotDetermined => Ok(()),
        }
    }

    /// Get a link to device settings for permission management
    pub fn settings_link(&self) -> &'static str {
        #[cfg(target_os = "ios")]
        {
            "app-settings:"
        }

        #[cfg(target_os = "android")]
        {
            "android.settings.APPLICATION_DETAILS_SETTINGS"
        }

        #[cfg(not(any(target_os = "ios", target_os = "android")))]
        {
            "System settings"
        }
    }
}
