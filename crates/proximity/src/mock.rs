// Mock radios - an in-memory medium shared by simulated devices
//
// Each attached device gets a `MockRadio` implementing all three backend
// traits. The medium routes advertisements, invitations, data and ranging
// samples between devices by posting the same events a real radio stack
// would.

use crate::events::{EngineFailure, EventSender, InvitationResponder, RangingEvent, RangingEventSink, SessionEvent};
use crate::platform::{DiscoveryBackend, RangingEngine, TransportBackend};
use crate::ranging::RangingConfiguration;
use crate::{
    ConnectionState, DiscoveryToken, EncryptionPreference, NearbyObject, PeerId, PeerIdentity, ProximityError,
    RemovalReason, Result, SendMode,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Every backend call a device made, in order
#[derive(Debug, Clone, PartialEq)]
pub enum RadioCall {
    StartAdvertising { service_type: String },
    StopAdvertising,
    StartBrowsing { service_type: String },
    StopBrowsing,
    Invite { peer: PeerId, timeout: Duration },
    Send { peers: Vec<PeerId>, bytes: usize, mode: SendMode },
    Disconnect,
    Prepare,
    Run { peer_token: DiscoveryToken },
    Pause,
    Invalidate,
}

#[derive(Default)]
struct Engine {
    sink: Option<RangingEventSink>,
    local_token: Option<DiscoveryToken>,
    running_with: Option<DiscoveryToken>,
}

struct Device {
    identity: PeerIdentity,
    events: EventSender,
    advertising: Option<String>,
    browsing: Option<String>,
    link: Option<PeerId>,
    engine: Engine,
    fail_next_send: bool,
    calls: Vec<RadioCall>,
}

impl Device {
    fn post_state(&self, peer: &PeerIdentity, state: ConnectionState) {
        self.events.post(SessionEvent::ConnectionStateChanged {
            peer: peer.clone(),
            state,
        });
    }
}

type Devices = HashMap<PeerId, Device>;

/// Shared in-memory medium
#[derive(Clone, Default)]
pub struct MockAir {
    devices: Arc<Mutex<Devices>>,
}

impl MockAir {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, identity: PeerIdentity, events: EventSender) -> Arc<MockRadio> {
        self.attach_with_encryption(identity, events, EncryptionPreference::Required)
            .await
    }

    pub async fn attach_with_encryption(
        &self,
        identity: PeerIdentity,
        events: EventSender,
        encryption: EncryptionPreference,
    ) -> Arc<MockRadio> {
        let id = identity.id.clone();
        self.devices.lock().await.insert(
            id.clone(),
            Device {
                identity,
                events,
                advertising: None,
                browsing: None,
                link: None,
                engine: Engine::default(),
                fail_next_send: false,
                calls: Vec::new(),
            },
        );

        Arc::new(MockRadio {
            air: self.clone(),
            id,
            encryption,
        })
    }

    pub async fn calls(&self, device: &PeerId) -> Vec<RadioCall> {
        self.devices
            .lock()
            .await
            .get(device)
            .map(|d| d.calls.clone())
            .unwrap_or_default()
    }

    /// Number of messages the device put on the transport
    pub async fn sends(&self, device: &PeerId) -> usize {
        self.calls(device)
            .await
            .iter()
            .filter(|c| matches!(c, RadioCall::Send { .. }))
            .count()
    }

    /// Number of times the device's engine was run
    pub async fn runs(&self, device: &PeerId) -> usize {
        self.calls(device)
            .await
            .iter()
            .filter(|c| matches!(c, RadioCall::Run { .. }))
            .count()
    }

    pub async fn fail_next_send(&self, device: &PeerId) {
        if let Some(d) = self.devices.lock().await.get_mut(device) {
            d.fail_next_send = true;
        }
    }

    pub async fn local_token(&self, device: &PeerId) -> Option<DiscoveryToken> {
        self.devices
            .lock()
            .await
            .get(device)
            .and_then(|d| d.engine.local_token.clone())
    }

    pub async fn linked_peer(&self, device: &PeerId) -> Option<PeerId> {
        self.devices.lock().await.get(device).and_then(|d| d.link.clone())
    }

    /// Report a distance between two devices to every engine that ranges
    /// against the other one. Returns how many engines received it.
    pub async fn set_distance(&self, a: &PeerId, b: &PeerId, distance: f32) -> usize {
        let devices = self.devices.lock().await;
        let mut delivered = 0;

        for (observer, peer) in [(a, b), (b, a)] {
            let (Some(observer), Some(peer)) = (devices.get(observer), devices.get(peer)) else {
                continue;
            };
            let Some(peer_token) = peer.engine.local_token.clone() else {
                continue;
            };
            if observer.engine.running_with.as_ref() != Some(&peer_token) {
                continue;
            }
            if let Some(sink) = &observer.engine.sink {
                if sink.post(RangingEvent::ObjectsUpdated(vec![NearbyObject::at_distance(
                    peer_token, distance,
                )])) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Post raw objects through the device's current engine sink.
    pub async fn report_objects(&self, device: &PeerId, objects: Vec<NearbyObject>) -> bool {
        self.post_engine_event(device, RangingEvent::ObjectsUpdated(objects))
            .await
    }

    /// The observer's engine stops seeing the token it ranges against.
    pub async fn remove_peer(&self, observer: &PeerId, reason: RemovalReason) -> bool {
        let devices = self.devices.lock().await;
        let Some(device) = devices.get(observer) else {
            return false;
        };
        match (&device.engine.sink, &device.engine.running_with) {
            (Some(sink), Some(token)) => sink.post(RangingEvent::ObjectsRemoved {
                tokens: vec![token.clone()],
                reason,
            }),
            _ => false,
        }
    }

    pub async fn invalidate_engine(&self, device: &PeerId, failure: EngineFailure) -> bool {
        self.post_engine_event(device, RangingEvent::Invalidated(failure))
            .await
    }

    pub async fn suspend_engine(&self, device: &PeerId) -> bool {
        self.post_engine_event(device, RangingEvent::Suspended).await
    }

    pub async fn end_suspension(&self, device: &PeerId) -> bool {
        self.post_engine_event(device, RangingEvent::SuspensionEnded).await
    }

    /// The device walks away: its link drops without a local disconnect call.
    pub async fn drop_link(&self, device: &PeerId) {
        let mut devices = self.devices.lock().await;
        unlink(&mut devices, device);
    }

    async fn post_engine_event(&self, device: &PeerId, event: RangingEvent) -> bool {
        self.devices
            .lock()
            .await
            .get(device)
            .and_then(|d| d.engine.sink.as_ref().map(|sink| sink.post(event)))
            .unwrap_or(false)
    }

    async fn connect(&self, inviter: &PeerId, invitee: &PeerId) {
        let mut devices = self.devices.lock().await;

        let busy = [inviter, invitee]
            .iter()
            .any(|id| devices.get(*id).map(|d| d.link.is_some()).unwrap_or(true));
        if busy {
            if let Some(d) = devices.get(inviter) {
                d.events.post(SessionEvent::InviteFailed {
                    peer: invitee.clone(),
                    reason: "peer busy".to_string(),
                });
            }
            return;
        }

        let (Some(a), Some(b)) = (
            devices.get(inviter).map(|d| d.identity.clone()),
            devices.get(invitee).map(|d| d.identity.clone()),
        ) else {
            return;
        };

        if let Some(d) = devices.get_mut(inviter) {
            d.link = Some(b.id.clone());
        }
        if let Some(d) = devices.get_mut(invitee) {
            d.link = Some(a.id.clone());
        }

        for state in [ConnectionState::Connecting, ConnectionState::Connected] {
            if let Some(d) = devices.get(inviter) {
                d.post_state(&b, state);
            }
            if let Some(d) = devices.get(invitee) {
                d.post_state(&a, state);
            }
        }
        debug!("Mock link {} <-> {}", a.id, b.id);
    }
}

fn unlink(devices: &mut Devices, device: &PeerId) {
    let Some(other) = devices.get_mut(device).and_then(|d| d.link.take()) else {
        return;
    };
    if let Some(d) = devices.get_mut(&other) {
        d.link = None;
    }

    let identity = |id: &PeerId| devices.get(id).map(|d| d.identity.clone());
    let (Some(me), Some(them)) = (identity(device), identity(&other)) else {
        return;
    };
    if let Some(d) = devices.get(device) {
        d.post_state(&them, ConnectionState::NotConnected);
    }
    if let Some(d) = devices.get(&other) {
        d.post_state(&me, ConnectionState::NotConnected);
    }
    debug!("Mock link {} <-> {} dropped", me.id, them.id);
}

/// One simulated device's radio stack
pub struct MockRadio {
    air: MockAir,
    id: PeerId,
    encryption: EncryptionPreference,
}

impl MockRadio {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    async fn record(&self, call: RadioCall) {
        if let Some(d) = self.air.devices.lock().await.get_mut(&self.id) {
            d.calls.push(call);
        }
    }
}

#[async_trait]
impl DiscoveryBackend for MockRadio {
    async fn start_advertising(&self, local: &PeerIdentity, service_type: &str) -> Result<()> {
        self.record(RadioCall::StartAdvertising {
            service_type: service_type.to_string(),
        })
        .await;

        let mut devices = self.air.devices.lock().await;
        let device = devices
            .get_mut(&self.id)
            .ok_or_else(|| ProximityError::DiscoveryFailed("device detached".to_string()))?;
        device.identity = local.clone();
        device.advertising = Some(service_type.to_string());

        for (id, other) in devices.iter() {
            if id != &self.id && other.browsing.as_deref() == Some(service_type) {
                other.events.post(SessionEvent::PeerFound(local.clone()));
            }
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.record(RadioCall::StopAdvertising).await;

        let mut devices = self.air.devices.lock().await;
        let Some(service_type) = devices.get_mut(&self.id).and_then(|d| d.advertising.take()) else {
            return Ok(());
        };
        for (id, other) in devices.iter() {
            if id != &self.id && other.browsing.as_deref() == Some(service_type.as_str()) {
                other.events.post(SessionEvent::PeerLost(self.id.clone()));
            }
        }
        Ok(())
    }

    async fn start_browsing(&self, service_type: &str) -> Result<()> {
        self.record(RadioCall::StartBrowsing {
            service_type: service_type.to_string(),
        })
        .await;

        let mut devices = self.air.devices.lock().await;
        let device = devices
            .get_mut(&self.id)
            .ok_or_else(|| ProximityError::DiscoveryFailed("device detached".to_string()))?;
        device.browsing = Some(service_type.to_string());

        let Some(me) = devices.get(&self.id) else {
            return Ok(());
        };
        for (id, other) in devices.iter() {
            if id != &self.id && other.advertising.as_deref() == Some(service_type) {
                me.events.post(SessionEvent::PeerFound(other.identity.clone()));
            }
        }
        Ok(())
    }

    async fn stop_browsing(&self) -> Result<()> {
        self.record(RadioCall::StopBrowsing).await;

        if let Some(d) = self.air.devices.lock().await.get_mut(&self.id) {
            d.browsing = None;
        }
        Ok(())
    }

    async fn invite(&self, peer: &PeerId, timeout: Duration) -> Result<()> {
        self.record(RadioCall::Invite {
            peer: peer.clone(),
            timeout,
        })
        .await;

        let devices = self.air.devices.lock().await;
        let me = devices
            .get(&self.id)
            .ok_or_else(|| ProximityError::InvitationFailed("device detached".to_string()))?;
        let reachable = devices
            .get(peer)
            .filter(|target| target.advertising.is_some() && target.advertising == me.browsing);

        let Some(target) = reachable else {
            me.events.post(SessionEvent::InviteFailed {
                peer: peer.clone(),
                reason: "peer not reachable".to_string(),
            });
            return Ok(());
        };

        let (responder, answer) = InvitationResponder::new();
        target.events.post(SessionEvent::InvitationReceived {
            from: me.identity.clone(),
            responder,
        });

        let inviter_events = me.events.clone();
        let air = self.air.clone();
        let inviter = self.id.clone();
        let invitee = peer.clone();
        drop(devices);

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, answer).await {
                Ok(Ok(true)) => air.connect(&inviter, &invitee).await,
                Ok(Ok(false)) | Ok(Err(_)) => {
                    inviter_events.post(SessionEvent::InviteFailed {
                        peer: invitee,
                        reason: "declined".to_string(),
                    });
                }
                Err(_) => {
                    inviter_events.post(SessionEvent::InviteFailed {
                        peer: invitee,
                        reason: "timed out".to_string(),
                    });
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl TransportBackend for MockRadio {
    fn encryption(&self) -> EncryptionPreference {
        self.encryption
    }

    async fn send(&self, data: &[u8], peers: &[PeerId], mode: SendMode) -> Result<()> {
        self.record(RadioCall::Send {
            peers: peers.to_vec(),
            bytes: data.len(),
            mode,
        })
        .await;

        let mut devices = self.air.devices.lock().await;
        let me = devices
            .get_mut(&self.id)
            .ok_or_else(|| ProximityError::SendFailed("device detached".to_string()))?;
        if me.fail_next_send {
            me.fail_next_send = false;
            return Err(ProximityError::SendFailed("scripted failure".to_string()));
        }
        let link = me.link.clone();

        for peer in peers {
            if link.as_ref() != Some(peer) {
                return Err(ProximityError::SendFailed(format!("{} is not connected", peer)));
            }
            if let Some(target) = devices.get(peer) {
                target.events.post(SessionEvent::DataReceived {
                    from: self.id.clone(),
                    data: data.to_vec(),
                });
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(RadioCall::Disconnect).await;

        let mut devices = self.air.devices.lock().await;
        unlink(&mut devices, &self.id);
        Ok(())
    }
}

#[async_trait]
impl RangingEngine for MockRadio {
    async fn prepare(&self, sink: RangingEventSink) -> Result<()> {
        self.record(RadioCall::Prepare).await;

        let token = DiscoveryToken::from_bytes(Uuid::new_v4().as_bytes().to_vec());
        let mut devices = self.air.devices.lock().await;
        let device = devices
            .get_mut(&self.id)
            .ok_or_else(|| ProximityError::InternalError("device detached".to_string()))?;

        device.engine = Engine {
            sink: Some(sink.clone()),
            local_token: Some(token.clone()),
            running_with: None,
        };
        sink.post(RangingEvent::LocalTokenReady(token));
        Ok(())
    }

    async fn run(&self, config: RangingConfiguration) -> Result<()> {
        self.record(RadioCall::Run {
            peer_token: config.peer_token.clone(),
        })
        .await;

        let mut devices = self.air.devices.lock().await;
        let engine = devices
            .get_mut(&self.id)
            .map(|d| &mut d.engine)
            .ok_or_else(|| ProximityError::InternalError("device detached".to_string()))?;
        if engine.sink.is_none() {
            return Err(ProximityError::InternalError("engine not prepared".to_string()));
        }
        engine.running_with = Some(config.peer_token);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.record(RadioCall::Pause).await;
        Ok(())
    }

    async fn invalidate(&self) -> Result<()> {
        self.record(RadioCall::Invalidate).await;

        if let Some(d) = self.air.devices.lock().await.get_mut(&self.id) {
            d.engine = Engine::default();
        }
        Ok(())
    }
}
