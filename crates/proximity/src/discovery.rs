// Peer Discovery - advertise/browse, the nearby peer set and invitations

use crate::events::InvitationResponder;
use crate::platform::DiscoveryBackend;
use crate::transport::TransportSession;
use crate::{DiscoveredPeer, PeerId, PeerIdentity, ProximityError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The single invitation waiting for an answer
#[derive(Debug)]
pub struct PendingInvitation {
    pub from: PeerIdentity,
    pub received_at: DateTime<Utc>,
    responder: InvitationResponder,
}

pub struct PeerDiscovery {
    backend: Arc<dyn DiscoveryBackend>,
    local: PeerIdentity,
    service_type: String,
    invite_timeout: Duration,
    advertising: bool,
    browsing: bool,
    nearby: HashMap<PeerId, DiscoveredPeer>,
    pending: Option<PendingInvitation>,
}

impl PeerDiscovery {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        local: PeerIdentity,
        service_type: impl Into<String>,
        invite_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            local,
            service_type: service_type.into(),
            invite_timeout,
            advertising: false,
            browsing: false,
            nearby: HashMap::new(),
            pending: None,
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Check if advertising and browsing are both running
    pub fn is_active(&self) -> bool {
        self.advertising && self.browsing
    }

    /// Start advertising and browsing. Only the halves that are not already
    /// running are (re)started, so calling this repeatedly is safe.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_active() {
            debug!("Discovery already active");
            return Ok(());
        }

        info!("Starting discovery for service '{}' as {}", self.service_type, self.local);

        if !self.advertising {
            self.backend
                .start_advertising(&self.local, &self.service_type)
                .await
                .map_err(|e| ProximityError::DiscoveryFailed(format!("advertise: {}", e)))?;
            self.advertising = true;
        }
        if !self.browsing {
            self.backend
                .start_browsing(&self.service_type)
                .await
                .map_err(|e| ProximityError::DiscoveryFailed(format!("browse: {}", e)))?;
            self.browsing = true;
        }
        Ok(())
    }

    /// Stop advertising and browsing, keeping any transport session alive.
    /// Nearby peers are forgotten and found again on the next start.
    pub async fn suspend(&mut self) -> Result<()> {
        if !self.advertising && !self.browsing {
            debug!("No active discovery session to suspend");
            self.nearby.clear();
            return Ok(());
        }

        info!("Suspending discovery");
        if self.advertising {
            self.backend.stop_advertising().await?;
            self.advertising = false;
        }
        if self.browsing {
            self.backend.stop_browsing().await?;
            self.browsing = false;
        }
        self.nearby.clear();
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.suspend().await
    }

    /// Full teardown: discovery stops, a pending invitation is declined and
    /// the transport is asked to disconnect.
    pub async fn invalidate(&mut self, transport: &mut TransportSession) -> Result<()> {
        info!("Invalidating discovery");

        let suspended = self.suspend().await;
        self.decline_pending();
        let disconnected = transport.disconnect().await;

        suspended.and(disconnected)
    }

    /// Invite a nearby peer. Rejection and timeout surface later as events;
    /// nothing is retried.
    pub async fn invite(&self, peer: &PeerId) -> Result<()> {
        let Some(target) = self.nearby.get(peer) else {
            warn!("Cannot invite {}: not in the nearby set", peer);
            return Err(ProximityError::PeerNotFound(peer.clone()));
        };

        info!("Inviting {} (timeout {:?})", target.identity, self.invite_timeout);
        self.backend
            .invite(peer, self.invite_timeout)
            .await
            .map_err(|e| ProximityError::InvitationFailed(e.to_string()))
    }

    /// Returns `true` when the peer was not known yet.
    pub fn on_peer_found(&mut self, identity: PeerIdentity) -> bool {
        if identity.id == self.local.id {
            debug!("Ignoring our own advertisement");
            return false;
        }

        match self.nearby.get_mut(&identity.id) {
            Some(existing) => {
                existing.last_seen = Utc::now();
                existing.identity.display_name = identity.display_name;
                false
            }
            None => {
                info!("Found peer {}", identity);
                self.nearby.insert(identity.id.clone(), DiscoveredPeer::new(identity));
                true
            }
        }
    }

    /// Returns `true` when the peer was in the nearby set.
    pub fn on_peer_lost(&mut self, peer: &PeerId) -> bool {
        let removed = self.nearby.remove(peer).is_some();
        if removed {
            info!("Lost peer {}", peer);
        }
        removed
    }

    /// Track an incoming invitation. Only the most recent one is kept: an
    /// older unanswered invitation is declined when a newer one arrives.
    pub fn on_invitation_received(&mut self, from: PeerIdentity, responder: InvitationResponder) {
        if let Some(previous) = self.pending.take() {
            info!(
                "Invitation from {} replaces unanswered invitation from {}",
                from, previous.from
            );
            previous.responder.respond(false);
        } else {
            info!("Invitation received from {}", from);
        }

        self.pending = Some(PendingInvitation {
            from,
            received_at: Utc::now(),
            responder,
        });
    }

    /// Answer the pending invitation and clear the slot.
    pub fn respond_to_invitation(&mut self, accept: bool) -> Result<PeerIdentity> {
        let pending = self.pending.take().ok_or(ProximityError::NoPendingInvitation)?;

        info!(
            "{} invitation from {}",
            if accept { "Accepting" } else { "Declining" },
            pending.from
        );
        if !pending.responder.respond(accept) {
            warn!("Inviter {} stopped waiting for an answer", pending.from);
            return Err(ProximityError::InvitationFailed(format!(
                "invitation from {} expired",
                pending.from
            )));
        }
        Ok(pending.from)
    }

    pub fn decline_pending(&mut self) -> Option<PeerIdentity> {
        let pending = self.pending.take()?;
        debug!("Declining pending invitation from {}", pending.from);
        pending.responder.respond(false);
        Some(pending.from)
    }

    pub fn pending_invitation(&self) -> Option<&PeerIdentity> {
        self.pending.as_ref().map(|p| &p.from)
    }

    /// Nearby peers in the order they were found
    pub fn nearby_peers(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> = self.nearby.values().cloned().collect();
        peers.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.identity.id.cmp(&b.identity.id))
        });
        peers
    }

    pub fn is_nearby(&self, peer: &PeerId) -> bool {
        self.nearby.contains_key(peer)
    }
}
