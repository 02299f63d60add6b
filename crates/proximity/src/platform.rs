// Platform abstraction layer for the encounter flow
// Traits the local radio stack implements; callbacks come back as SessionEvents

use crate::events::RangingEventSink;
use crate::ranging::RangingConfiguration;
use crate::{EncryptionPreference, PeerId, PeerIdentity, Result, SendMode};
use async_trait::async_trait;
use std::time::Duration;

/// Advertise/browse half of the local wireless stack.
///
/// Found and lost peers, incoming invitations and failed invitations are
/// reported by posting to the [`EventSender`](crate::EventSender) the backend
/// was built with.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn start_advertising(&self, local: &PeerIdentity, service_type: &str) -> Result<()>;

    async fn stop_advertising(&self) -> Result<()>;

    async fn start_browsing(&self, service_type: &str) -> Result<()>;

    async fn stop_browsing(&self) -> Result<()>;

    /// Invite a discovered peer. Rejection and timeout are reported as
    /// events, never as an error here.
    async fn invite(&self, peer: &PeerId, timeout: Duration) -> Result<()>;
}

/// Encrypted point-to-point channel. Connection state changes and received
/// data are reported as events.
#[async_trait]
pub trait TransportBackend: Send + Sync {
    fn encryption(&self) -> EncryptionPreference;

    async fn send(&self, data: &[u8], peers: &[PeerId], mode: SendMode) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Distance/direction sensing session.
#[async_trait]
pub trait RangingEngine: Send + Sync {
    /// Create a fresh engine session reporting through `sink`. The new local
    /// token is delivered as `RangingEvent::LocalTokenReady`.
    async fn prepare(&self, sink: RangingEventSink) -> Result<()>;

    async fn run(&self, config: RangingConfiguration) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    /// Release the engine session. Safe to call repeatedly.
    async fn invalidate(&self) -> Result<()>;
}
