// Ranging Session - token exchange and the ranging engine lifecycle for one peer
//
// The session never touches the engine or the transport itself. Every
// operation returns the actions the owner has to carry out, in order.

use crate::error::RangingError;
use crate::events::EngineFailure;
use crate::proximity_state::{ProximityObservation, ProximityStateMachine, ProximityThresholds};
use crate::{DiscoveryToken, NearbyObject, PeerIdentity, RemovalReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangingState {
    Idle,
    AwaitingLocalToken,
    TokenExchanged,
    Ranging,
    Suspended,
    Invalidated,
}

/// What the engine is run with: the peer's token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangingConfiguration {
    pub peer_token: DiscoveryToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangingAction {
    /// Create a fresh engine session; its local token arrives later.
    PrepareEngine,
    /// Send our token to the peer over the transport.
    SendLocalToken(DiscoveryToken),
    RunEngine(RangingConfiguration),
    /// Release the engine session.
    InvalidateEngine,
}

pub struct RangingSession {
    id: Uuid,
    peer: PeerIdentity,
    state: RangingState,
    local_token: Option<DiscoveryToken>,
    peer_token: Option<DiscoveryToken>,
    local_token_sent: bool,
    configuration: Option<RangingConfiguration>,
    /// Token from a peer restart seen while suspended, applied on resume.
    restarted_peer_token: Option<DiscoveryToken>,
    proximity: ProximityStateMachine,
    tokens_sent: u32,
    engine_runs: u32,
    started_at: DateTime<Utc>,
}

impl RangingSession {
    pub fn new(peer: PeerIdentity, thresholds: ProximityThresholds, confirmation_samples: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            state: RangingState::Idle,
            local_token: None,
            peer_token: None,
            local_token_sent: false,
            configuration: None,
            restarted_peer_token: None,
            proximity: ProximityStateMachine::new(thresholds, confirmation_samples),
            tokens_sent: 0,
            engine_runs: 0,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn state(&self) -> RangingState {
        self.state
    }

    pub fn is_invalidated(&self) -> bool {
        self.state == RangingState::Invalidated
    }

    /// True once the token pair is complete, until the session goes back to
    /// waiting for a fresh exchange.
    pub fn exchange_complete(&self) -> bool {
        matches!(
            self.state,
            RangingState::TokenExchanged | RangingState::Ranging | RangingState::Suspended
        )
    }

    pub fn local_token(&self) -> Option<&DiscoveryToken> {
        self.local_token.as_ref()
    }

    pub fn peer_token(&self) -> Option<&DiscoveryToken> {
        self.peer_token.as_ref()
    }

    pub fn configuration(&self) -> Option<&RangingConfiguration> {
        self.configuration.as_ref()
    }

    pub fn proximity(&self) -> &ProximityStateMachine {
        &self.proximity
    }

    pub fn encounter_fired(&self) -> bool {
        self.proximity.encounter_fired()
    }

    /// Token messages sent to the peer over the lifetime of this session
    pub fn tokens_sent(&self) -> u32 {
        self.tokens_sent
    }

    /// Times the engine was asked to run
    pub fn engine_runs(&self) -> u32 {
        self.engine_runs
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Begin ranging with a freshly connected peer.
    pub fn start(&mut self) -> Vec<RangingAction> {
        if self.state != RangingState::Idle {
            warn!("Ranging session {} already started ({:?})", self.id, self.state);
            return Vec::new();
        }

        info!("Starting ranging session {} with {}", self.id, self.peer);
        self.state = RangingState::AwaitingLocalToken;
        vec![RangingAction::PrepareEngine]
    }

    pub fn on_local_token(&mut self, token: DiscoveryToken) -> Vec<RangingAction> {
        if self.state != RangingState::AwaitingLocalToken {
            debug!("Ignoring local token in {:?}", self.state);
            return Vec::new();
        }
        if token.is_empty() {
            warn!("Engine produced an empty local token, ignoring");
            return Vec::new();
        }

        debug!("Local token ready: {:?}", token);
        self.local_token = Some(token.clone());

        let mut actions = Vec::new();
        if !self.local_token_sent {
            actions.push(self.send_local_token(token));
        }
        if self.peer_token.is_some() {
            actions.extend(self.complete_exchange());
        }
        actions
    }

    /// A token decoded from the peer's message.
    pub fn on_peer_token(&mut self, token: DiscoveryToken) -> Result<Vec<RangingAction>, RangingError> {
        if token.is_empty() {
            return Err(RangingError::TokenDecodeFailed);
        }

        match self.state {
            RangingState::Invalidated => {
                debug!("Ignoring peer token for invalidated session {}", self.id);
                Ok(Vec::new())
            }
            RangingState::Idle => {
                debug!("Buffering peer token before start: {:?}", token);
                self.peer_token = Some(token);
                Ok(Vec::new())
            }
            RangingState::AwaitingLocalToken => {
                debug!("Peer token received: {:?}", token);
                self.peer_token = Some(token);
                if self.local_token.is_some() {
                    Ok(self.complete_exchange())
                } else {
                    Ok(Vec::new())
                }
            }
            RangingState::Suspended => {
                if self.peer_token.as_ref() == Some(&token) || self.restarted_peer_token.as_ref() == Some(&token) {
                    debug!("Duplicate peer token, ignoring");
                    return Ok(Vec::new());
                }

                info!("Peer {} restarted its exchange while suspended, applying on resume", self.peer);
                self.restarted_peer_token = Some(token);

                let mut actions = Vec::new();
                if let Some(local) = self.local_token.clone() {
                    actions.push(self.send_local_token(local));
                }
                Ok(actions)
            }
            RangingState::TokenExchanged | RangingState::Ranging => {
                if self.peer_token.as_ref() == Some(&token) {
                    debug!("Duplicate peer token, ignoring");
                    return Ok(Vec::new());
                }

                // The peer restarted its engine; it needs our token again and
                // we have to range against its new one.
                info!("Peer {} restarted its exchange, re-running with {:?}", self.peer, token);
                self.peer_token = Some(token.clone());
                self.configuration = Some(RangingConfiguration { peer_token: token });

                let mut actions = Vec::new();
                if let Some(local) = self.local_token.clone() {
                    actions.push(self.send_local_token(local));
                }
                actions.push(self.run_engine());
                Ok(actions)
            }
        }
    }

    /// The engine accepted the configuration.
    pub fn on_engine_started(&mut self) {
        if self.state == RangingState::TokenExchanged {
            info!("Ranging with {} (session {})", self.peer, self.id);
            self.state = RangingState::Ranging;
        }
    }

    /// Feed engine measurements. Only objects carrying the accepted peer
    /// token are considered.
    pub fn on_objects_updated(&mut self, objects: &[NearbyObject]) -> Option<ProximityObservation> {
        if self.state != RangingState::Ranging {
            debug!("Ignoring {} ranging objects in {:?}", objects.len(), self.state);
            return None;
        }
        let peer_token = self.peer_token.as_ref()?;

        let mut result: Option<ProximityObservation> = None;
        for object in objects.iter().filter(|o| &o.token == peer_token) {
            let mut observation = self.proximity.observe(object.distance);
            if let Some(previous) = result {
                observation.encounter |= previous.encounter;
                observation.changed |= previous.changed;
            }
            result = Some(observation);
        }

        if result.is_none() && !objects.is_empty() {
            debug!("Dropped {} ranging objects for unknown tokens", objects.len());
        }
        result
    }

    pub fn on_objects_removed(&mut self, tokens: &[DiscoveryToken], reason: RemovalReason) -> Vec<RangingAction> {
        let Some(peer_token) = self.peer_token.as_ref() else {
            return Vec::new();
        };
        if !tokens.contains(peer_token) {
            debug!("Removal for unknown token ignored");
            return Vec::new();
        }

        match reason {
            RemovalReason::PeerEnded => self.fail(RangingError::PeerTokenInvalidated),
            RemovalReason::Timeout => self.fail(RangingError::RangingTimeout),
        }
    }

    pub fn on_suspended(&mut self) {
        if matches!(self.state, RangingState::Ranging | RangingState::TokenExchanged) {
            info!("Ranging session {} suspended", self.id);
            self.state = RangingState::Suspended;
        }
    }

    /// Re-applies the last configuration unchanged, unless the peer
    /// restarted its exchange meanwhile.
    pub fn on_suspension_ended(&mut self) -> Vec<RangingAction> {
        if self.state != RangingState::Suspended {
            return Vec::new();
        }

        info!("Ranging session {} resumed", self.id);
        if let Some(token) = self.restarted_peer_token.take() {
            debug!("Ranging against restarted peer token {:?}", token);
            self.peer_token = Some(token.clone());
            self.configuration = Some(RangingConfiguration { peer_token: token });
        }
        match self.configuration.clone() {
            Some(_) => {
                self.state = RangingState::TokenExchanged;
                vec![self.run_engine()]
            }
            None => {
                self.state = RangingState::AwaitingLocalToken;
                Vec::new()
            }
        }
    }

    /// Map an engine invalidation onto the error taxonomy and apply it.
    pub fn on_engine_invalidated(&mut self, failure: EngineFailure) -> (RangingError, Vec<RangingAction>) {
        let error = match failure {
            EngineFailure::UserDidNotAllow => RangingError::UserPermissionDenied,
            EngineFailure::Other(reason) => RangingError::EngineFailure(reason),
        };
        let actions = self.fail(error.clone());
        (error, actions)
    }

    /// Apply an error: recoverable ones are retried in place, anything else
    /// invalidates the session.
    pub fn fail(&mut self, error: RangingError) -> Vec<RangingAction> {
        if self.is_invalidated() {
            return Vec::new();
        }

        match error {
            RangingError::RangingTimeout => match self.state {
                RangingState::Ranging | RangingState::TokenExchanged if self.configuration.is_some() => {
                    warn!("Ranging timed out, re-running the same configuration");
                    self.state = RangingState::TokenExchanged;
                    vec![self.run_engine()]
                }
                _ => {
                    debug!("Ranging timeout in {:?}, nothing to re-run", self.state);
                    Vec::new()
                }
            },
            RangingError::PeerTokenInvalidated => {
                warn!("Peer {} ended its ranging session, exchanging fresh tokens", self.peer);
                self.local_token = None;
                self.peer_token = None;
                self.local_token_sent = false;
                self.configuration = None;
                self.restarted_peer_token = None;
                self.state = RangingState::AwaitingLocalToken;
                vec![RangingAction::InvalidateEngine, RangingAction::PrepareEngine]
            }
            other => {
                warn!("Ranging session {} failed: {}", self.id, other);
                self.invalidate()
            }
        }
    }

    /// Terminal. A new session has to be built to range again.
    pub fn invalidate(&mut self) -> Vec<RangingAction> {
        if self.is_invalidated() {
            return Vec::new();
        }

        info!(
            "Invalidating ranging session {} ({:?}, {} tokens sent, {} runs)",
            self.id, self.state, self.tokens_sent, self.engine_runs
        );
        self.state = RangingState::Invalidated;
        self.local_token = None;
        self.peer_token = None;
        self.configuration = None;
        self.restarted_peer_token = None;
        vec![RangingAction::InvalidateEngine]
    }

    fn send_local_token(&mut self, token: DiscoveryToken) -> RangingAction {
        self.local_token_sent = true;
        self.tokens_sent += 1;
        RangingAction::SendLocalToken(token)
    }

    fn complete_exchange(&mut self) -> Vec<RangingAction> {
        let Some(peer_token) = self.peer_token.clone() else {
            return Vec::new();
        };

        debug!("Token exchange complete for session {}", self.id);
        self.configuration = Some(RangingConfiguration { peer_token });
        self.state = RangingState::TokenExchanged;
        vec![self.run_engine()]
    }

    fn run_engine(&mut self) -> RangingAction {
        self.engine_runs += 1;
        match self.configuration.clone() {
            Some(config) => RangingAction::RunEngine(config),
            None => RangingAction::PrepareEngine,
        }
    }
}

impl std::fmt::Debug for RangingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangingSession")
            .field("id", &self.id)
            .field("peer", &self.peer.id)
            .field("state", &self.state)
            .field("tokens_sent", &self.tokens_sent)
            .field("engine_runs", &self.engine_runs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RangingSession {
        RangingSession::new(PeerIdentity::new("peer-b", "Bob"), ProximityThresholds::default(), 1)
    }

    fn token(byte: u8) -> DiscoveryToken {
        DiscoveryToken::from_bytes(vec![byte; 8])
    }

    fn ranging_session() -> RangingSession {
        let mut s = session();
        s.start();
        s.on_local_token(token(1));
        s.on_peer_token(token(2)).unwrap();
        s.on_engine_started();
        assert_eq!(s.state(), RangingState::Ranging);
        s
    }

    #[test]
    fn test_local_token_first() {
        let mut s = session();
        assert_eq!(s.start(), vec![RangingAction::PrepareEngine]);
        assert_eq!(s.state(), RangingState::AwaitingLocalToken);

        assert_eq!(s.on_local_token(token(1)), vec![RangingAction::SendLocalToken(token(1))]);
        assert_eq!(s.state(), RangingState::AwaitingLocalToken);

        let actions = s.on_peer_token(token(2)).unwrap();
        assert_eq!(
            actions,
            vec![RangingAction::RunEngine(RangingConfiguration { peer_token: token(2) })]
        );
        assert_eq!(s.state(), RangingState::TokenExchanged);

        s.on_engine_started();
        assert_eq!(s.state(), RangingState::Ranging);
    }

    #[test]
    fn test_peer_token_first_is_buffered() {
        let mut s = session();
        s.start();

        assert!(s.on_peer_token(token(2)).unwrap().is_empty());
        assert_eq!(s.state(), RangingState::AwaitingLocalToken);

        let actions = s.on_local_token(token(1));
        assert_eq!(
            actions,
            vec![
                RangingAction::SendLocalToken(token(1)),
                RangingAction::RunEngine(RangingConfiguration { peer_token: token(2) }),
            ]
        );
    }

    #[test]
    fn test_empty_peer_token_is_a_decode_failure() {
        let mut s = session();
        s.start();
        assert_eq!(
            s.on_peer_token(DiscoveryToken::from_bytes(Vec::new())),
            Err(RangingError::TokenDecodeFailed)
        );
    }

    #[test]
    fn test_samples_for_other_tokens_are_ignored() {
        let mut s = ranging_session();

        assert!(s.on_objects_updated(&[NearbyObject::at_distance(token(9), 0.1)]).is_none());
        assert!(!s.encounter_fired());

        let obs = s.on_objects_updated(&[NearbyObject::at_distance(token(2), 0.1)]).unwrap();
        assert!(obs.encounter);
    }

    #[test]
    fn test_samples_before_ranging_are_ignored() {
        let mut s = session();
        s.start();
        s.on_peer_token(token(2)).unwrap();
        assert!(s.on_objects_updated(&[NearbyObject::at_distance(token(2), 0.1)]).is_none());
    }

    #[test]
    fn test_timeout_reruns_without_new_exchange() {
        let mut s = ranging_session();

        let actions = s.on_objects_removed(&[token(2)], RemovalReason::Timeout);
        assert_eq!(
            actions,
            vec![RangingAction::RunEngine(RangingConfiguration { peer_token: token(2) })]
        );
        s.on_engine_started();

        assert_eq!(s.state(), RangingState::Ranging);
        assert_eq!(s.tokens_sent(), 1);
        assert_eq!(s.engine_runs(), 2);
    }

    #[test]
    fn test_peer_ended_requires_fresh_exchange() {
        let mut s = ranging_session();

        let actions = s.on_objects_removed(&[token(2)], RemovalReason::PeerEnded);
        assert_eq!(actions, vec![RangingAction::InvalidateEngine, RangingAction::PrepareEngine]);
        assert_eq!(s.state(), RangingState::AwaitingLocalToken);
        assert!(s.peer_token().is_none());

        assert_eq!(s.on_local_token(token(3)), vec![RangingAction::SendLocalToken(token(3))]);
        s.on_peer_token(token(4)).unwrap();
        s.on_engine_started();
        assert_eq!(s.state(), RangingState::Ranging);
        assert_eq!(s.tokens_sent(), 2);
    }

    #[test]
    fn test_removal_of_unknown_token_is_ignored() {
        let mut s = ranging_session();
        assert!(s.on_objects_removed(&[token(7)], RemovalReason::PeerEnded).is_empty());
        assert_eq!(s.state(), RangingState::Ranging);
    }

    #[test]
    fn test_restarted_peer_gets_our_token_again() {
        let mut s = ranging_session();

        let actions = s.on_peer_token(token(5)).unwrap();
        assert_eq!(
            actions,
            vec![
                RangingAction::SendLocalToken(token(1)),
                RangingAction::RunEngine(RangingConfiguration { peer_token: token(5) }),
            ]
        );
        assert_eq!(s.peer_token(), Some(&token(5)));

        assert!(s.on_peer_token(token(5)).unwrap().is_empty());
    }

    #[test]
    fn test_suspension_reapplies_configuration() {
        let mut s = ranging_session();

        s.on_suspended();
        assert_eq!(s.state(), RangingState::Suspended);
        assert!(s.on_objects_updated(&[NearbyObject::at_distance(token(2), 0.1)]).is_none());

        let actions = s.on_suspension_ended();
        assert_eq!(
            actions,
            vec![RangingAction::RunEngine(RangingConfiguration { peer_token: token(2) })]
        );
        s.on_engine_started();
        assert_eq!(s.state(), RangingState::Ranging);
    }

    #[test]
    fn test_restart_while_suspended_waits_for_resume() {
        let mut s = ranging_session();
        s.on_suspended();

        assert_eq!(s.on_peer_token(token(5)).unwrap(), vec![RangingAction::SendLocalToken(token(1))]);
        assert!(s.on_peer_token(token(5)).unwrap().is_empty());
        assert_eq!(s.configuration(), Some(&RangingConfiguration { peer_token: token(2) }));
        assert_eq!(s.peer_token(), Some(&token(2)));

        let actions = s.on_suspension_ended();
        assert_eq!(
            actions,
            vec![RangingAction::RunEngine(RangingConfiguration { peer_token: token(5) })]
        );
        assert_eq!(s.peer_token(), Some(&token(5)));
        s.on_engine_started();
        assert_eq!(s.state(), RangingState::Ranging);
    }

    #[test]
    fn test_permission_denial_is_terminal() {
        let mut s = ranging_session();

        let (error, actions) = s.on_engine_invalidated(EngineFailure::UserDidNotAllow);
        assert_eq!(error, RangingError::UserPermissionDenied);
        assert_eq!(actions, vec![RangingAction::InvalidateEngine]);
        assert!(s.is_invalidated());

        assert!(s.start().is_empty());
        assert!(s.on_peer_token(token(2)).unwrap().is_empty());
        assert!(s.invalidate().is_empty());
    }

    #[test]
    fn test_invalidate_clears_tokens() {
        let mut s = ranging_session();
        assert_eq!(s.invalidate(), vec![RangingAction::InvalidateEngine]);

        assert!(s.local_token().is_none());
        assert!(s.peer_token().is_none());
        assert!(s.configuration().is_none());
        assert!(!s.exchange_complete());
    }
}
