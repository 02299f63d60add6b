use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a peer on the local transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A peer as seen by discovery: identifier plus the name it advertises.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub display_name: String,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: PeerId::new(id),
            display_name: display_name.into(),
        }
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Opaque ranging credential. Only ever compared and handed to the engine.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryToken(#[serde(with = "token_bytes")] Vec<u8>);

impl DiscoveryToken {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short hex prefix, enough to tell tokens apart in logs.
    pub fn fingerprint(&self) -> String {
        self.0.iter().take(4).map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Debug for DiscoveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DiscoveryToken({}.., {} bytes)", self.fingerprint(), self.0.len())
    }
}

mod token_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// Transport connection state, driven only by transport callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn display_string(&self) -> &'static str {
        match self {
            ConnectionState::NotConnected => "Not Connected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Reliable,
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPreference {
    Required,
    Optional,
    None,
}

/// Peer-to-peer message envelope carried over the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    DiscoveryToken { token: DiscoveryToken },
}

impl PeerMessage {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// One ranging measurement reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyObject {
    pub token: DiscoveryToken,
    /// Metres; `None` when the engine could not measure.
    pub distance: Option<f32>,
    /// Unit vector towards the peer, when the hardware supports it.
    pub direction: Option<[f32; 3]>,
}

impl NearbyObject {
    pub fn at_distance(token: DiscoveryToken, distance: f32) -> Self {
        Self {
            token,
            distance: Some(distance),
            direction: None,
        }
    }
}

/// Why the engine stopped reporting a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The peer invalidated its token; a fresh exchange is needed.
    PeerEnded,
    /// No measurement for a while; the same configuration can be re-run.
    Timeout,
}

/// A peer in the nearby, not-yet-connected set
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub identity: PeerIdentity,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredPeer {
    pub fn new(identity: PeerIdentity) -> Self {
        let now = Utc::now();
        Self {
            identity,
            discovered_at: now,
            last_seen: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_message_survives_the_wire() {
        let token = DiscoveryToken::from_bytes(vec![0xde, 0xad, 0xbe, 0xef, 0x01]);
        let bytes = PeerMessage::DiscoveryToken { token: token.clone() }.encode().unwrap();

        let PeerMessage::DiscoveryToken { token: decoded } = PeerMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(PeerMessage::decode(b"\x00\x01not json").is_err());
        assert!(PeerMessage::decode(br#"{"type":"Ping"}"#).is_err());
    }

    #[test]
    fn test_token_debug_hides_contents() {
        let token = DiscoveryToken::from_bytes(vec![0xab; 64]);
        let rendered = format!("{:?}", token);
        assert!(rendered.contains("abababab"));
        assert!(rendered.contains("64 bytes"));
        assert!(rendered.len() < 64);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::NotConnected.to_string(), "Not Connected");
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting...");
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
    }
}
