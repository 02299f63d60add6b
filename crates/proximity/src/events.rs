// Session events - the single ordered queue every backend callback feeds

use crate::lifecycle::AppState;
use crate::permissions::{PermissionKind, PermissionStatus};
use crate::recorder::EncounterOutcome;
use crate::types::{ConnectionState, DiscoveryToken, NearbyObject, PeerId, PeerIdentity, RemovalReason};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    // Discovery callbacks
    PeerFound(PeerIdentity),
    PeerLost(PeerId),
    InvitationReceived {
        from: PeerIdentity,
        responder: InvitationResponder,
    },
    InviteFailed {
        peer: PeerId,
        reason: String,
    },

    // Transport callbacks
    ConnectionStateChanged {
        peer: PeerIdentity,
        state: ConnectionState,
    },
    DataReceived {
        from: PeerId,
        data: Vec<u8>,
    },

    /// Ranging callback, tagged with the ranging session that produced it
    Ranging {
        session: Uuid,
        event: RangingEvent,
    },

    TokenExchangeTimedOut {
        session: Uuid,
    },
    EncounterAttemptFinished(EncounterOutcome),
    Command(Command),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RangingEvent {
    /// The engine generated a fresh local token for this session.
    LocalTokenReady(DiscoveryToken),
    ObjectsUpdated(Vec<NearbyObject>),
    ObjectsRemoved {
        tokens: Vec<DiscoveryToken>,
        reason: RemovalReason,
    },
    Suspended,
    SuspensionEnded,
    Invalidated(EngineFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFailure {
    UserDidNotAllow,
    Other(String),
}

/// User and application requests
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartDiscovery,
    SuspendDiscovery,
    Invalidate,
    Invite(PeerId),
    RespondToInvitation { accept: bool },
    AppStateChanged(AppState),
    PermissionChanged {
        kind: PermissionKind,
        status: PermissionStatus,
    },
    Shutdown,
}

/// Answer channel for an incoming invitation. Consumed by the answer.
#[derive(Debug)]
pub struct InvitationResponder {
    reply: oneshot::Sender<bool>,
}

impl InvitationResponder {
    pub fn new() -> (Self, oneshot::Receiver<bool>) {
        let (reply, rx) = oneshot::channel();
        (Self { reply }, rx)
    }

    /// Returns `false` if the inviting side stopped waiting.
    pub fn respond(self, accept: bool) -> bool {
        self.reply.send(accept).is_ok()
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Cloneable producer side of the session queue. Posting never blocks.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    /// Returns `false` once the coordinator is gone.
    pub fn post(&self, event: SessionEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                debug!("Session queue closed, dropping {:?}", event);
                false
            }
        }
    }

    pub fn command(&self, command: Command) -> bool {
        self.post(SessionEvent::Command(command))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

/// Handed to the ranging engine for one ranging session.
///
/// Once detached, everything the engine posts through it is dropped, so a
/// torn down session can never be reached by late engine callbacks.
#[derive(Debug, Clone)]
pub struct RangingEventSink {
    session: Uuid,
    events: EventSender,
    attached: CancellationToken,
}

impl RangingEventSink {
    pub fn new(session: Uuid, events: EventSender) -> Self {
        Self {
            session,
            events,
            attached: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session
    }

    pub fn post(&self, event: RangingEvent) -> bool {
        if self.attached.is_cancelled() {
            debug!("Ranging session {} detached, dropping {:?}", self.session, event);
            return false;
        }
        self.events.post(SessionEvent::Ranging {
            session: self.session,
            event,
        })
    }

    pub fn detach(&self) {
        if !self.attached.is_cancelled() {
            debug!("Detaching ranging sink for session {}", self.session);
        }
        self.attached.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.attached.is_cancelled()
    }

    /// Resolves once the sink is detached.
    pub async fn detached(&self) {
        self.attached.cancelled().await
    }
}
