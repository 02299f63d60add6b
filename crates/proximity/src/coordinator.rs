// Session Coordinator - the single owner of discovery, transport and ranging
// state. Every callback arrives through one ordered queue and is handled here.

use crate::discovery::PeerDiscovery;
use crate::error::{ErrorContext, ProximityError, RangingError, Result};
use crate::events::{Command, EventReceiver, EventSender, RangingEvent, RangingEventSink, SessionEvent};
use crate::lifecycle::{AppState, LifecycleAction, LifecycleManager};
use crate::permissions::{PermissionKind, PermissionStatus, PermissionTracker};
use crate::platform::{DiscoveryBackend, RangingEngine, TransportBackend};
use crate::proximity_state::{ProximityObservation, ProximityState, ProximityThresholds};
use crate::ranging::{RangingAction, RangingSession, RangingState};
use crate::recorder::{attempt_encounter, EncounterFailure, EncounterOutcome, EncounterRecorder, LocationProvider};
use crate::transport::{TransportSession, TransportTransition};
use crate::{ConnectionState, PeerId, PeerIdentity, PeerMessage, SendMode};
use chrono::Utc;
use shared::EncounterConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Extra time a recording gets at shutdown beyond the location timeout.
const RECORDING_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Platform backends the coordinator drives
#[derive(Clone)]
pub struct Backends {
    pub discovery: Arc<dyn DiscoveryBackend>,
    pub transport: Arc<dyn TransportBackend>,
    pub ranging: Arc<dyn RangingEngine>,
}

impl Backends {
    /// Use one object for all three roles.
    pub fn from_radio<R>(radio: Arc<R>) -> Self
    where
        R: DiscoveryBackend + TransportBackend + RangingEngine + 'static,
    {
        Self {
            discovery: radio.clone(),
            transport: radio.clone(),
            ranging: radio,
        }
    }
}

/// Alert the UI shows until the user fixes the cause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAlert {
    pub permission: PermissionKind,
    pub message: String,
    pub settings_link: String,
}

/// Read-only copy of the coordinator state, published after every event.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub local: PeerIdentity,
    pub connection_state: ConnectionState,
    pub connected_peer: Option<PeerIdentity>,
    pub nearby_peers: Vec<PeerIdentity>,
    pub pending_invitation: Option<PeerIdentity>,
    pub discovery_active: bool,
    pub ranging_state: Option<RangingState>,
    pub proximity_state: ProximityState,
    pub distance: Option<f32>,
    pub direction: Option<[f32; 3]>,
    pub app_state: AppState,
    pub last_encounter: Option<EncounterOutcome>,
    pub alert: Option<UserAlert>,
    pub encounters_fired: u32,
    pub ranging_sessions: u32,
    pub invalidated: bool,
}

impl SessionSnapshot {
    fn initial(local: PeerIdentity) -> Self {
        Self {
            local,
            connection_state: ConnectionState::NotConnected,
            connected_peer: None,
            nearby_peers: Vec::new(),
            pending_invitation: None,
            discovery_active: false,
            ranging_state: None,
            proximity_state: ProximityState::Unknown,
            distance: None,
            direction: None,
            app_state: AppState::Foreground,
            last_encounter: None,
            alert: None,
            encounters_fired: 0,
            ranging_sessions: 0,
            invalidated: false,
        }
    }

    pub fn is_nearby(&self, peer: &PeerId) -> bool {
        self.nearby_peers.iter().any(|p| &p.id == peer)
    }
}

/// Cloneable front door for the UI and the application.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    events: EventSender,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl CoordinatorHandle {
    fn send(&self, command: Command) -> Result<()> {
        if self.events.command(command) {
            Ok(())
        } else {
            Err(ProximityError::CoordinatorClosed)
        }
    }

    pub fn start_discovery(&self) -> Result<()> {
        self.send(Command::StartDiscovery)
    }

    pub fn suspend_discovery(&self) -> Result<()> {
        self.send(Command::SuspendDiscovery)
    }

    pub fn invalidate(&self) -> Result<()> {
        self.send(Command::Invalidate)
    }

    pub fn invite(&self, peer: PeerId) -> Result<()> {
        self.send(Command::Invite(peer))
    }

    pub fn accept_invitation(&self) -> Result<()> {
        self.send(Command::RespondToInvitation { accept: true })
    }

    pub fn reject_invitation(&self) -> Result<()> {
        self.send(Command::RespondToInvitation { accept: false })
    }

    pub fn app_state_changed(&self, state: AppState) -> Result<()> {
        self.send(Command::AppStateChanged(state))
    }

    pub fn permission_changed(&self, kind: PermissionKind, status: PermissionStatus) -> Result<()> {
        self.send(Command::PermissionChanged { kind, status })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }
}

struct ActiveRanging {
    session: RangingSession,
    sink: RangingEventSink,
    exchange_timer: Option<CancellationToken>,
}

impl ActiveRanging {
    fn cancel_exchange_timer(&mut self) {
        if let Some(timer) = self.exchange_timer.take() {
            timer.cancel();
        }
    }
}

pub struct SessionCoordinator {
    config: EncounterConfig,
    discovery: PeerDiscovery,
    transport: TransportSession,
    engine: Arc<dyn RangingEngine>,
    recorder: Arc<dyn EncounterRecorder>,
    location: Arc<dyn LocationProvider>,
    ranging: Option<ActiveRanging>,
    ranging_state: Option<RangingState>,
    permissions: PermissionTracker,
    lifecycle: LifecycleManager,
    events: EventSender,
    receiver: EventReceiver,
    snapshot: watch::Sender<SessionSnapshot>,
    alert: Option<UserAlert>,
    last_encounter: Option<EncounterOutcome>,
    direction: Option<[f32; 3]>,
    encounters_fired: u32,
    ranging_sessions: u32,
    invalidated: bool,
    shutdown: CancellationToken,
    recordings: Vec<JoinHandle<()>>,
}

impl SessionCoordinator {
    /// `events` must be the channel the backends were built with.
    pub fn new(
        config: EncounterConfig,
        local: PeerIdentity,
        backends: Backends,
        recorder: Arc<dyn EncounterRecorder>,
        location: Arc<dyn LocationProvider>,
        events: (EventSender, EventReceiver),
    ) -> Result<Self> {
        let (sender, receiver) = events;
        let transport = TransportSession::new(backends.transport)?;
        let discovery = PeerDiscovery::new(
            backends.discovery,
            local.clone(),
            config.service_type.clone(),
            config.invite_timeout(),
        );
        let lifecycle = LifecycleManager::with_timeout(config.background_timeout_minutes);
        let (snapshot, _) = watch::channel(SessionSnapshot::initial(local));

        Ok(Self {
            config,
            discovery,
            transport,
            engine: backends.ranging,
            recorder,
            location,
            ranging: None,
            ranging_state: None,
            permissions: PermissionTracker::new(),
            lifecycle,
            events: sender,
            receiver,
            snapshot,
            alert: None,
            last_encounter: None,
            direction: None,
            encounters_fired: 0,
            ranging_sessions: 0,
            invalidated: false,
            shutdown: CancellationToken::new(),
            recordings: Vec::new(),
        })
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            events: self.events.clone(),
            snapshot: self.snapshot.subscribe(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Consume the queue until shutdown.
    pub async fn run(mut self) -> Result<()> {
        info!("Session coordinator running as {}", self.discovery.local());
        self.publish();

        while let Some(event) = self.receiver.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }

        self.teardown().await;
        info!("Session coordinator stopped");
        Ok(())
    }

    /// Handle everything already queued. Returns the number of events
    /// handled, stopping early on shutdown.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.receiver.try_recv() {
            handled += 1;
            if !self.handle_event(event).await {
                self.teardown().await;
                break;
            }
        }
        handled
    }

    /// Apply one event. Returns `false` once the coordinator should stop.
    pub async fn handle_event(&mut self, event: SessionEvent) -> bool {
        let keep_running = match event {
            SessionEvent::PeerFound(identity) => {
                self.discovery.on_peer_found(identity);
                true
            }
            SessionEvent::PeerLost(peer) => {
                self.discovery.on_peer_lost(&peer);
                true
            }
            SessionEvent::InvitationReceived { from, responder } => {
                if !self.transport.is_idle() || self.ranging.is_some() {
                    info!("Declining invitation from {}: already engaged", from);
                    responder.respond(false);
                } else {
                    self.discovery.on_invitation_received(from, responder);
                }
                true
            }
            SessionEvent::InviteFailed { peer, reason } => {
                warn!("Invitation to {} failed: {}", peer, reason);
                true
            }
            SessionEvent::ConnectionStateChanged { peer, state } => {
                self.on_connection_state(peer, state).await;
                true
            }
            SessionEvent::DataReceived { from, data } => {
                self.on_peer_data(from, data).await;
                true
            }
            SessionEvent::Ranging { session, event } => {
                self.on_ranging_event(session, event).await;
                true
            }
            SessionEvent::TokenExchangeTimedOut { session } => {
                self.on_exchange_timeout(session).await;
                true
            }
            SessionEvent::EncounterAttemptFinished(outcome) => {
                self.on_encounter_finished(outcome);
                true
            }
            SessionEvent::Command(command) => self.on_command(command).await,
        };

        self.publish();
        keep_running
    }

    async fn on_command(&mut self, command: Command) -> bool {
        debug!("Command: {:?}", command);
        match command {
            Command::StartDiscovery => {
                self.invalidated = false;
                if let Err(err) = self.permissions.verify(PermissionKind::LocalNetwork) {
                    self.report(&err, ErrorContext::new().with_info("start discovery"));
                    self.raise_alert(PermissionKind::LocalNetwork);
                } else if self.transport.is_idle() {
                    self.start_discovery().await;
                } else {
                    debug!("Engaged with a peer, discovery stays suspended");
                }
            }
            Command::SuspendDiscovery => self.suspend_discovery().await,
            Command::Invalidate => {
                info!("Invalidating the encounter flow");
                self.invalidated = true;
                self.lifecycle.clear_state();
                self.stop_ranging().await;
                if let Err(err) = self.discovery.invalidate(&mut self.transport).await {
                    self.report(&err, ErrorContext::new().with_info("invalidate"));
                }
            }
            Command::Invite(peer) => {
                if let Some(current) = self.transport.peer() {
                    let err = ProximityError::PeerCapReached(current.id.clone());
                    self.report(&err, ErrorContext::new().with_peer_id(peer));
                } else if let Err(err) = self.discovery.invite(&peer).await {
                    self.report(&err, ErrorContext::new().with_peer_id(peer));
                }
            }
            Command::RespondToInvitation { accept } => {
                let accept = accept && self.transport.is_idle();
                if let Err(err) = self.discovery.respond_to_invitation(accept) {
                    self.report(&err, ErrorContext::new().with_info("invitation response"));
                }
            }
            Command::AppStateChanged(state) => {
                if state == AppState::Background && self.ranging.is_some() {
                    // The engine reports the resulting suspension itself.
                    if let Err(err) = self.engine.pause().await {
                        self.report(&err, ErrorContext::new().with_info("pause ranging"));
                    }
                }
                let discovering = self.discovery.is_active() && self.transport.is_idle();
                match self.lifecycle.transition(state, discovering, Utc::now()) {
                    LifecycleAction::SuspendDiscovery => self.suspend_discovery().await,
                    LifecycleAction::RestoreDiscovery if self.transport.is_idle() && !self.invalidated => {
                        self.start_discovery().await
                    }
                    _ => {}
                }
            }
            Command::PermissionChanged { kind, status } => {
                self.on_permission_changed(kind, status).await;
            }
            Command::Shutdown => {
                info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    async fn on_connection_state(&mut self, peer: PeerIdentity, state: ConnectionState) {
        match self.transport.apply_state_change(&peer, state) {
            Some(TransportTransition::Connecting(peer)) => {
                debug!("Transport connecting to {}", peer);
            }
            Some(TransportTransition::Connected(peer)) => {
                // One peer at a time: stop being discoverable while engaged.
                self.suspend_discovery().await;
                self.discovery.decline_pending();
                self.start_ranging(peer).await;
            }
            Some(TransportTransition::Disconnected(peer)) => {
                info!("Peer {} disconnected", peer);
                self.stop_ranging().await;
                self.clear_session_fields();

                if self.invalidated {
                    debug!("Flow invalidated, not resuming discovery");
                } else if !self.config.resume_discovery_on_disconnect {
                    debug!("Discovery resume disabled");
                } else if self.lifecycle.is_background() {
                    debug!("In background, discovery resumes on foreground");
                    self.lifecycle.defer_discovery(Utc::now());
                } else {
                    self.start_discovery().await;
                }
            }
            None => {}
        }
    }

    async fn on_peer_data(&mut self, from: PeerId, data: Vec<u8>) {
        let Some(active) = self.ranging.as_ref() else {
            debug!("Dropping {} bytes from {}: no ranging session", data.len(), from);
            return;
        };

        if active.session.peer().id != from {
            self.ranging_failed(RangingError::UnexpectedPeer(from)).await;
            return;
        }

        let message = match PeerMessage::decode(&data) {
            Ok(message) => message,
            Err(err) => {
                debug!("Undecodable peer message: {}", err);
                self.ranging_failed(RangingError::TokenDecodeFailed).await;
                return;
            }
        };

        let PeerMessage::DiscoveryToken { token } = message;
        let result = match self.ranging.as_mut() {
            Some(active) => active.session.on_peer_token(token),
            None => return,
        };
        match result {
            Ok(actions) => self.apply_actions(actions).await,
            Err(err) => self.ranging_failed(err).await,
        }
    }

    async fn on_ranging_event(&mut self, session: Uuid, event: RangingEvent) {
        let Some(active) = self.ranging.as_mut() else {
            debug!("Dropping ranging event for {}: no ranging session", session);
            return;
        };
        if active.session.id() != session {
            debug!("Dropping stale ranging event for session {}", session);
            return;
        }

        match event {
            RangingEvent::LocalTokenReady(token) => {
                let actions = active.session.on_local_token(token);
                self.apply_actions(actions).await;
            }
            RangingEvent::ObjectsUpdated(objects) => {
                let direction = objects
                    .iter()
                    .find(|o| Some(&o.token) == active.session.peer_token())
                    .and_then(|o| o.direction);
                if let Some(observation) = active.session.on_objects_updated(&objects) {
                    self.direction = direction;
                    self.on_observation(observation).await;
                }
            }
            RangingEvent::ObjectsRemoved { tokens, reason } => {
                let actions = active.session.on_objects_removed(&tokens, reason);
                self.apply_actions(actions).await;
            }
            RangingEvent::Suspended => active.session.on_suspended(),
            RangingEvent::SuspensionEnded => {
                let actions = active.session.on_suspension_ended();
                self.apply_actions(actions).await;
            }
            RangingEvent::Invalidated(failure) => {
                let (error, actions) = active.session.on_engine_invalidated(failure);
                self.on_ranging_error(&error);
                self.apply_actions(actions).await;
            }
        }
    }

    async fn on_observation(&mut self, observation: ProximityObservation) {
        if observation.changed {
            debug!("Proximity now {:?}", observation.state);
        }
        if observation.encounter {
            self.on_encounter().await;
        }
    }

    /// Latch fired: record once, then reset so the next cycle starts clean.
    async fn on_encounter(&mut self) {
        let Some(peer) = self.ranging.as_ref().map(|a| a.session.peer().clone()) else {
            return;
        };
        self.encounters_fired += 1;
        info!("Encounter with {}", peer);

        let recorder = self.recorder.clone();
        let location = self.location.clone();
        let events = self.events.clone();
        let timeout = self.config.location_timeout();
        let occurred_at = Utc::now();
        self.recordings.retain(|task| !task.is_finished());
        self.recordings.push(tokio::spawn(async move {
            let outcome = attempt_encounter(recorder, location, peer, occurred_at, timeout).await;
            events.post(SessionEvent::EncounterAttemptFinished(outcome));
        }));

        self.stop_ranging().await;
        if let Err(err) = self.transport.disconnect().await {
            self.report(&err, ErrorContext::new().with_info("disconnect after encounter"));
        }
        self.clear_session_fields();
    }

    fn on_encounter_finished(&mut self, outcome: EncounterOutcome) {
        if let EncounterOutcome::Failed { reason, peer } = &outcome {
            if *reason == EncounterFailure::LocationDenied {
                self.permissions.record(PermissionKind::Location, PermissionStatus::Denied);
                self.raise_alert(PermissionKind::Location);
            }
            let err = ProximityError::from(reason.clone());
            self.report(&err, ErrorContext::new().with_peer_id(peer.id.clone()));
        }
        self.last_encounter = Some(outcome);
    }

    async fn on_exchange_timeout(&mut self, session: Uuid) {
        let Some(active) = self.ranging.as_ref() else {
            return;
        };
        if active.session.id() != session || active.session.exchange_complete() {
            debug!("Token exchange timer for {} no longer relevant", session);
            return;
        }

        warn!(
            "No token exchange with {} within {:?}",
            active.session.peer(),
            self.config.token_exchange_timeout()
        );
        self.ranging_failed(RangingError::TokenExchangeTimeout).await;
    }

    async fn on_permission_changed(&mut self, kind: PermissionKind, status: PermissionStatus) {
        if !self.permissions.record(kind, status) {
            return;
        }

        match status {
            PermissionStatus::Denied => {
                self.raise_alert(kind);
                match kind {
                    PermissionKind::LocalNetwork => self.suspend_discovery().await,
                    PermissionKind::Ranging if self.ranging.is_some() => {
                        self.ranging_failed(RangingError::UserPermissionDenied).await;
                    }
                    _ => {}
                }
            }
            PermissionStatus::Granted => {
                if self.alert.as_ref().map(|a| a.permission) == Some(kind) {
                    info!("{} permission granted, clearing alert", kind);
                    self.alert = None;
                }
            }
            PermissionStatus::NotDetermined => {}
        }
    }

    async fn start_ranging(&mut self, peer: PeerIdentity) {
        if self.permissions.is_denied(PermissionKind::Ranging) {
            warn!("Ranging permission denied, dropping connection with {}", peer);
            self.raise_alert(PermissionKind::Ranging);
            if let Err(err) = self.transport.disconnect().await {
                self.report(&err, ErrorContext::new().with_peer_id(peer.id));
            }
            return;
        }

        self.stop_ranging().await;

        let thresholds = ProximityThresholds {
            encounter_m: self.config.encounter_threshold_m,
            near_m: self.config.near_threshold_m,
        };
        let mut session = RangingSession::new(peer, thresholds, self.config.confirmation_samples);
        let sink = RangingEventSink::new(session.id(), self.events.clone());
        let actions = session.start();

        self.ranging_sessions += 1;
        self.ranging = Some(ActiveRanging {
            session,
            sink,
            exchange_timer: None,
        });
        self.apply_actions(actions).await;
    }

    /// Tear down the ranging session. The sink is detached before the engine
    /// is released so no engine callback can reach the old session.
    async fn stop_ranging(&mut self) {
        let Some(mut active) = self.ranging.take() else {
            return;
        };

        active.cancel_exchange_timer();
        active.sink.detach();
        active.session.invalidate();
        self.ranging_state = Some(RangingState::Invalidated);

        if let Err(err) = self.engine.invalidate().await {
            self.report(
                &err,
                ErrorContext::new()
                    .with_peer_id(active.session.peer().id.clone())
                    .with_session_id(active.session.id()),
            );
        }
    }

    async fn ranging_failed(&mut self, error: RangingError) {
        let Some(active) = self.ranging.as_mut() else {
            return;
        };
        let actions = active.session.fail(error.clone());
        self.on_ranging_error(&error);
        self.apply_actions(actions).await;
    }

    fn on_ranging_error(&mut self, error: &RangingError) {
        let Some(active) = self.ranging.as_ref() else {
            return;
        };
        let context = ErrorContext::new()
            .with_peer_id(active.session.peer().id.clone())
            .with_session_id(active.session.id());
        let err = ProximityError::from(error.clone());

        if err.is_recoverable() {
            warn!(category = %err.category(), "Recoverable ranging error: {}", err);
        } else {
            err.log_with_context(&context);
        }

        if *error == RangingError::UserPermissionDenied {
            self.permissions.record(PermissionKind::Ranging, PermissionStatus::Denied);
            self.raise_alert(PermissionKind::Ranging);
        }
    }

    /// Carry out ranging actions in order. Follow-up actions from failures
    /// along the way are queued behind the current ones.
    async fn apply_actions(&mut self, actions: Vec<RangingAction>) {
        let mut queue: VecDeque<RangingAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            let Some(active) = self.ranging.as_mut() else {
                return;
            };

            match action {
                RangingAction::PrepareEngine => {
                    let session_id = active.session.id();
                    let sink = active.sink.clone();
                    self.arm_exchange_timer(session_id);
                    if let Err(err) = self.engine.prepare(sink).await {
                        queue.extend(self.fail_inline(RangingError::EngineFailure(err.to_string())));
                    }
                }
                RangingAction::SendLocalToken(token) => {
                    let peer = active.session.peer().id.clone();
                    let payload = match (PeerMessage::DiscoveryToken { token }).encode() {
                        Ok(payload) => payload,
                        Err(err) => {
                            let err = ProximityError::from(err);
                            self.report(&err, ErrorContext::new().with_peer_id(peer));
                            continue;
                        }
                    };
                    // A lost token is caught by the exchange timeout.
                    if let Err(err) = self.transport.send_to_connected(&payload, SendMode::Reliable).await {
                        self.report(&err, ErrorContext::new().with_peer_id(peer).with_info("token send"));
                    }
                }
                RangingAction::RunEngine(config) => match self.engine.run(config).await {
                    Ok(()) => {
                        if let Some(active) = self.ranging.as_mut() {
                            active.session.on_engine_started();
                            if active.session.exchange_complete() {
                                active.cancel_exchange_timer();
                            }
                        }
                    }
                    Err(err) => {
                        queue.extend(self.fail_inline(RangingError::EngineFailure(err.to_string())));
                    }
                },
                RangingAction::InvalidateEngine => {
                    if active.session.is_invalidated() {
                        active.cancel_exchange_timer();
                        active.sink.detach();
                    }
                    if let Err(err) = self.engine.invalidate().await {
                        self.report(&err, ErrorContext::new().with_info("engine invalidate"));
                    }
                }
            }
        }

        self.settle_ranging().await;
    }

    fn fail_inline(&mut self, error: RangingError) -> Vec<RangingAction> {
        let actions = match self.ranging.as_mut() {
            Some(active) => active.session.fail(error.clone()),
            None => return Vec::new(),
        };
        self.on_ranging_error(&error);
        actions
    }

    /// Drop a session that invalidated itself and end the connection that
    /// carried it.
    async fn settle_ranging(&mut self) {
        let invalidated = self
            .ranging
            .as_ref()
            .map(|a| a.session.is_invalidated())
            .unwrap_or(false);
        if !invalidated {
            return;
        }

        if let Some(mut active) = self.ranging.take() {
            active.cancel_exchange_timer();
            active.sink.detach();
            info!("Ranging session {} ended, disconnecting", active.session.id());
        }
        self.ranging_state = Some(RangingState::Invalidated);
        self.clear_session_fields();

        if let Err(err) = self.transport.disconnect().await {
            self.report(&err, ErrorContext::new().with_info("disconnect after ranging failure"));
        }
    }

    fn arm_exchange_timer(&mut self, session: Uuid) {
        let Some(active) = self.ranging.as_mut() else {
            return;
        };
        active.cancel_exchange_timer();

        let timer = self.shutdown.child_token();
        let cancelled = timer.clone();
        let events = self.events.clone();
        let timeout = self.config.token_exchange_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    events.post(SessionEvent::TokenExchangeTimedOut { session });
                }
            }
        });
        active.exchange_timer = Some(timer);
    }

    async fn start_discovery(&mut self) {
        if let Err(err) = self.discovery.start().await {
            self.report(&err, ErrorContext::new().with_info("start discovery"));
        }
    }

    async fn suspend_discovery(&mut self) {
        if let Err(err) = self.discovery.suspend().await {
            self.report(&err, ErrorContext::new().with_info("suspend discovery"));
        }
    }

    fn raise_alert(&mut self, permission: PermissionKind) {
        self.alert = Some(UserAlert {
            permission,
            message: permission.settings_hint().to_string(),
            settings_link: self.permissions.settings_link().to_string(),
        });
    }

    fn report(&self, err: &ProximityError, context: ErrorContext) {
        if err.is_recoverable() {
            warn!("{}", err);
        } else {
            err.log_with_context(&context);
        }
    }

    fn clear_session_fields(&mut self) {
        self.direction = None;
    }

    async fn teardown(&mut self) {
        self.shutdown.cancel();
        self.stop_ranging().await;
        if let Err(err) = self.discovery.invalidate(&mut self.transport).await {
            self.report(&err, ErrorContext::new().with_info("shutdown"));
        }
        self.finish_recordings().await;
        self.publish();
    }

    /// Let in-flight encounter recordings land before stopping.
    async fn finish_recordings(&mut self) {
        let grace = self.config.location_timeout().saturating_add(RECORDING_GRACE);
        for task in std::mem::take(&mut self.recordings) {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Encounter recording task failed: {}", err),
                Err(_) => warn!("Encounter recording still running at shutdown, outcome lost"),
            }
        }

        while let Ok(event) = self.receiver.try_recv() {
            if let SessionEvent::EncounterAttemptFinished(outcome) = event {
                self.on_encounter_finished(outcome);
            }
        }
    }

    fn publish(&mut self) {
        if let Some(active) = self.ranging.as_ref() {
            self.ranging_state = Some(active.session.state());
        }

        let (proximity_state, distance) = match self.ranging.as_ref() {
            Some(active) => (active.session.proximity().state(), active.session.proximity().distance()),
            None => (ProximityState::Unknown, None),
        };

        let snapshot = SessionSnapshot {
            local: self.discovery.local().clone(),
            connection_state: self.transport.state(),
            connected_peer: self.transport.connected_peer().cloned(),
            nearby_peers: self
                .discovery
                .nearby_peers()
                .into_iter()
                .map(|p| p.identity)
                .collect(),
            pending_invitation: self.discovery.pending_invitation().cloned(),
            discovery_active: self.discovery.is_active(),
            ranging_state: self.ranging_state,
            proximity_state,
            distance,
            direction: if self.ranging.is_some() { self.direction } else { None },
            app_state: self.lifecycle.state(),
            last_encounter: self.last_encounter.clone(),
            alert: self.alert.clone(),
            encounters_fired: self.encounters_fired,
            ranging_sessions: self.ranging_sessions,
            invalidated: self.invalidated,
        };

        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
