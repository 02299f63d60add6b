pub mod types;
pub mod error;
pub mod permissions;
pub mod lifecycle;
pub mod events;
pub mod platform;
pub mod proximity_state;
pub mod ranging;
pub mod transport;
pub mod discovery;
pub mod recorder;
pub mod coordinator;
pub mod mock;

pub use types::*;
pub use error::{ErrorCategory, ErrorContext, ProximityError, RangingError, Result};
pub use events::{
    event_channel, Command, EngineFailure, EventReceiver, EventSender, InvitationResponder, RangingEvent,
    RangingEventSink, SessionEvent,
};
pub use platform::{DiscoveryBackend, RangingEngine, TransportBackend};
pub use proximity_state::{ProximityObservation, ProximityState, ProximityStateMachine, ProximityThresholds};
pub use ranging::{RangingAction, RangingConfiguration, RangingSession, RangingState};
pub use transport::{TransportSession, TransportTransition};
pub use discovery::{PeerDiscovery, PendingInvitation};
pub use recorder::{
    attempt_encounter, EncounterFailure, EncounterOutcome, EncounterRecorder, InMemoryEncounterRecorder,
    LocationProvider, StaticLocationProvider,
};
pub use coordinator::{Backends, CoordinatorHandle, SessionCoordinator, SessionSnapshot, UserAlert};
pub use mock::{MockAir, MockRadio, RadioCall};
pub use permissions::{PermissionKind, PermissionStatus, PermissionTracker};
pub use lifecycle::{AppState, LifecycleAction, LifecycleManager};
