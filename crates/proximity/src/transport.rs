// Transport Session - tracks the single encrypted peer connection
//
// Connection state is only ever changed by transport callbacks fed through
// `apply_state_change`; the rest of the core observes it.

use crate::platform::TransportBackend;
use crate::{ConnectionState, EncryptionPreference, PeerId, PeerIdentity, ProximityError, Result, SendMode};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An accepted connection state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportTransition {
    Connecting(PeerIdentity),
    Connected(PeerIdentity),
    Disconnected(PeerIdentity),
}

pub struct TransportSession {
    backend: Arc<dyn TransportBackend>,
    state: ConnectionState,
    peer: Option<PeerIdentity>,
    connected_at: Option<DateTime<Utc>>,
    disconnect_requested: bool,
}

impl TransportSession {
    /// Refuses to build a session over a transport that does not require
    /// encryption.
    pub fn new(backend: Arc<dyn TransportBackend>) -> Result<Self> {
        let encryption = backend.encryption();
        if encryption != EncryptionPreference::Required {
            warn!("Refusing transport with encryption {:?}", encryption);
            return Err(ProximityError::EncryptionRequired);
        }

        Ok(Self {
            backend,
            state: ConnectionState::NotConnected,
            peer: None,
            connected_at: None,
            disconnect_requested: false,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Peer being connected to, or connected
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    pub fn connected_peer(&self) -> Option<&PeerIdentity> {
        match self.state {
            ConnectionState::Connected => self.peer.as_ref(),
            _ => None,
        }
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::NotConnected
    }

    /// Feed a transport callback. Returns the transition it caused, or
    /// `None` when the callback is a duplicate or is not allowed.
    pub fn apply_state_change(&mut self, peer: &PeerIdentity, state: ConnectionState) -> Option<TransportTransition> {
        let same_peer = self.peer.as_ref().map(|p| p.id == peer.id).unwrap_or(false);

        match (self.state, state) {
            (ConnectionState::NotConnected, ConnectionState::NotConnected) => {
                debug!("Ignoring notConnected for {} while idle", peer.id);
                None
            }
            (ConnectionState::NotConnected, ConnectionState::Connecting) => {
                info!("Connecting to {}", peer);
                self.state = ConnectionState::Connecting;
                self.peer = Some(peer.clone());
                Some(TransportTransition::Connecting(peer.clone()))
            }
            (ConnectionState::NotConnected, ConnectionState::Connected)
            | (ConnectionState::Connecting, ConnectionState::Connected)
                if self.state == ConnectionState::NotConnected || same_peer =>
            {
                info!("Connected to {}", peer);
                self.state = ConnectionState::Connected;
                self.peer = Some(peer.clone());
                self.connected_at = Some(Utc::now());
                Some(TransportTransition::Connected(peer.clone()))
            }
            (ConnectionState::Connecting | ConnectionState::Connected, ConnectionState::NotConnected)
                if same_peer =>
            {
                info!("Disconnected from {}", peer);
                self.state = ConnectionState::NotConnected;
                self.connected_at = None;
                self.disconnect_requested = false;
                self.peer.take().map(TransportTransition::Disconnected)
            }
            (ConnectionState::Connected, ConnectionState::Connecting) if same_peer => {
                warn!("Ignoring connected -> connecting for {}", peer.id);
                None
            }
            (current, new) if current == new && same_peer => {
                debug!("Duplicate {:?} for {}", new, peer.id);
                None
            }
            (current, new) => {
                warn!(
                    "Ignoring {:?} from {} while {:?} with {:?}",
                    new,
                    peer.id,
                    current,
                    self.peer.as_ref().map(|p| &p.id)
                );
                None
            }
        }
    }

    /// Send to specific peers. Failures are returned to the caller and leave
    /// the session untouched.
    pub async fn send(&self, data: &[u8], peers: &[PeerId], mode: SendMode) -> Result<()> {
        self.backend.send(data, peers, mode).await.map_err(|e| match e {
            ProximityError::SendFailed(_) => e,
            other => ProximityError::SendFailed(other.to_string()),
        })
    }

    pub async fn send_to_connected(&self, data: &[u8], mode: SendMode) -> Result<()> {
        let Some(peer) = self.connected_peer() else {
            return Err(ProximityError::SendFailed("no connected peer".to_string()));
        };
        self.send(data, std::slice::from_ref(&peer.id), mode).await
    }

    /// Ask the transport to drop the connection. The state itself changes
    /// when the transport reports notConnected. Repeated calls are no-ops.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.is_idle() {
            debug!("Transport already disconnected");
            return Ok(());
        }
        if self.disconnect_requested {
            debug!("Disconnect already requested");
            return Ok(());
        }

        info!("Disconnecting from {:?}", self.peer.as_ref().map(|p| &p.id));
        self.backend.disconnect().await?;
        self.disconnect_requested = true;
        Ok(())
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish()
    }
}
