// Application lifecycle management for the encounter flow
// Handles background/foreground transitions and automatic discovery management

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Application state for lifecycle management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    /// Application is in the foreground and active
    Foreground,
    /// Application is in the background
    Background,
}

/// Discovery state before backgrounding
#[derive(Debug, Clone)]
struct SuspendedDiscovery {
    backgrounded_at: DateTime<Utc>,
}

/// What the coordinator should do with discovery after a lifecycle change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    SuspendDiscovery,
    RestoreDiscovery,
    None,
}

/// Tracks foreground/background transitions.
///
/// Discovery that was running when the app went to the background is
/// restored on foreground, unless the app stayed in the background longer
/// than the configured timeout.
#[derive(Debug)]
pub struct LifecycleManager {
    app_state: AppState,
    suspended: Option<SuspendedDiscovery>,
    background_timeout_minutes: i64,
}

impl LifecycleManager {
    /// Create a new LifecycleManager with default 5-minute background timeout
    pub fn new() -> Self {
        Self::with_timeout(5)
    }

    /// Create a new LifecycleManager with custom background timeout
    pub fn with_timeout(timeout_minutes: i64) -> Self {
        Self {
            app_state: AppState::Foreground,
            suspended: None,
            background_timeout_minutes: timeout_minutes,
        }
    }

    pub fn state(&self) -> AppState {
        self.app_state
    }

    pub fn is_background(&self) -> bool {
        self.app_state == AppState::Background
    }

    /// Apply a transition observed at `now`.
    ///
    /// `discovery_active` is whether advertising/browsing is running; it only
    /// matters when moving to the background.
    pub fn transition(&mut self, to: AppState, discovery_active: bool, now: DateTime<Utc>) -> LifecycleAction {
        if to == self.app_state {
            debug!("Application already in {:?}", to);
            return LifecycleAction::None;
        }
        self.app_state = to;

        match to {
            AppState::Background => self.on_background(discovery_active, now),
            AppState::Foreground => self.on_foreground(now),
        }
    }

    fn on_background(&mut self, discovery_active: bool, now: DateTime<Utc>) -> LifecycleAction {
        info!("Application moving to background");

        if discovery_active {
            self.suspended = Some(SuspendedDiscovery { backgrounded_at: now });
            debug!("Saved discovery state");
            LifecycleAction::SuspendDiscovery
        } else {
            self.suspended = None;
            LifecycleAction::None
        }
    }

    fn on_foreground(&mut self, now: DateTime<Utc>) -> LifecycleAction {
        info!("Application returning to foreground");

        let Some(state) = self.suspended.take() else {
            debug!("No discovery state to restore");
            return LifecycleAction::None;
        };

        let background_duration = now.signed_duration_since(state.backgrounded_at);
        if self.timeout().is_some_and(|timeout| background_duration > timeout) {
            warn!(
                "Background timeout exceeded ({} minutes), not restoring discovery",
                self.background_timeout_minutes
            );
            return LifecycleAction::None;
        }

        info!("Restoring discovery after {}s in background", background_duration.num_seconds());
        LifecycleAction::RestoreDiscovery
    }

    /// Get time remaining before background timeout
    pub fn time_until_timeout(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.app_state != AppState::Background {
            return None;
        }

        let state = self.suspended.as_ref()?;
        let elapsed = now.signed_duration_since(state.backgrounded_at);
        let timeout = self.timeout()?;

        (elapsed < timeout).then(|| timeout - elapsed)
    }

    /// Discovery should have started while in the background; restore it on
    /// the next foreground transition instead.
    pub fn defer_discovery(&mut self, now: DateTime<Utc>) {
        if self.app_state == AppState::Background && self.suspended.is_none() {
            debug!("Deferring discovery until foreground");
            self.suspended = Some(SuspendedDiscovery { backgrounded_at: now });
        }
    }

    /// Forget any discovery waiting to be restored.
    pub fn clear_state(&mut self) {
        if self.suspended.take().is_some() {
            debug!("Cleared discovery state");
        }
    }

    /// `None` when the configured minutes do not fit a duration; such a
    /// timeout never expires.
    fn timeout(&self) -> Option<Duration> {
        Duration::try_minutes(self.background_timeout_minutes)
    }

    pub fn timeout_minutes(&self) -> i64 {
        self.background_timeout_minutes
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_manager_creation() {
        let manager = LifecycleManager::new();

        assert_eq!(manager.state(), AppState::Foreground);
        assert_eq!(manager.timeout_minutes(), 5);
        assert_eq!(LifecycleManager::with_timeout(10).timeout_minutes(), 10);
    }

    #[test]
    fn test_background_with_active_discovery_suspends_and_restores() {
        let mut manager = LifecycleManager::new();
        let now = Utc::now();

        assert_eq!(
            manager.transition(AppState::Background, true, now),
            LifecycleAction::SuspendDiscovery
        );
        assert!(manager.is_background());

        assert_eq!(
            manager.transition(AppState::Foreground, false, now + Duration::minutes(1)),
            LifecycleAction::RestoreDiscovery
        );
        assert_eq!(manager.state(), AppState::Foreground);
    }

    #[test]
    fn test_background_timeout() {
        let mut manager = LifecycleManager::with_timeout(5);
        let now = Utc::now();

        manager.transition(AppState::Background, true, now);
        let action = manager.transition(AppState::Foreground, false, now + Duration::minutes(6));

        assert_eq!(action, LifecycleAction::None);
    }

    #[test]
    fn test_background_without_active_discovery() {
        let mut manager = LifecycleManager::new();
        let now = Utc::now();

        assert_eq!(manager.transition(AppState::Background, false, now), LifecycleAction::None);
        assert_eq!(manager.transition(AppState::Foreground, false, now), LifecycleAction::None);
    }

    #[test]
    fn test_repeated_state_is_ignored() {
        let mut manager = LifecycleManager::new();
        let now = Utc::now();

        assert_eq!(manager.transition(AppState::Foreground, true, now), LifecycleAction::None);
        manager.transition(AppState::Background, true, now);
        assert_eq!(manager.transition(AppState::Background, true, now), LifecycleAction::None);
    }

    #[test]
    fn test_time_until_timeout() {
        let mut manager = LifecycleManager::with_timeout(5);
        let now = Utc::now();

        assert!(manager.time_until_timeout(now).is_none());

        manager.transition(AppState::Background, true, now);
        let remaining = manager.time_until_timeout(now + Duration::minutes(2)).unwrap();
        assert_eq!(remaining.num_minutes(), 3);

        assert!(manager.time_until_timeout(now + Duration::minutes(6)).is_none());
    }

    #[test]
    fn test_clear_state() {
        let mut manager = LifecycleManager::new();
        let now = Utc::now();

        manager.transition(AppState::Background, true, now);
        manager.clear_state();

        assert_eq!(manager.transition(AppState::Foreground, false, now), LifecycleAction::None);
    }

    #[test]
    fn test_deferred_discovery_restores_on_foreground() {
        let mut manager = LifecycleManager::new();
        let now = Utc::now();

        manager.defer_discovery(now);
        assert_eq!(manager.transition(AppState::Foreground, false, now), LifecycleAction::None);

        manager.transition(AppState::Background, false, now);
        manager.defer_discovery(now + Duration::seconds(30));
        assert_eq!(
            manager.transition(AppState::Foreground, false, now + Duration::minutes(1)),
            LifecycleAction::RestoreDiscovery
        );
    }

    #[test]
    fn test_oversized_timeout_never_expires() {
        let mut manager = LifecycleManager::with_timeout(i64::MAX);
        let now = Utc::now();

        manager.transition(AppState::Background, true, now);
        assert!(manager.time_until_timeout(now + Duration::days(30)).is_none());
        assert_eq!(
            manager.transition(AppState::Foreground, false, now + Duration::days(30)),
            LifecycleAction::RestoreDiscovery
        );
    }
}
