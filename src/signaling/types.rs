use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// Signaling hub errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid room id: {0}")]
    InvalidRoom(String),

    #[error("already joined room {0}")]
    AlreadyJoined(RoomId),

    #[error("not joined")]
    NotJoined,

    #[error("internal error: {0}")]
    Internal(String),
}

const PEER_ID_PREFIX: &str = "peer_";
const PEER_ID_HEX_LEN: usize = 32;

/// Peer ID: "peer_" + 128 random bits as lowercase hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u128);

impl PeerId {
    pub fn generate() -> Self {
        Self(rand::rng().random())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:032x}", PEER_ID_PREFIX, self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed peer id: {0:?}")]
pub struct InvalidPeerId(String);

impl FromStr for PeerId {
    type Err = InvalidPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix(PEER_ID_PREFIX)
            .filter(|h| h.len() == PEER_ID_HEX_LEN && h.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| InvalidPeerId(s.to_string()))?;
        u128::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| InvalidPeerId(s.to_string()))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Client-chosen room name. Rooms exist only while they have members.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(Arc<str>);

impl RoomId {
    /// Validate a client-supplied room name
    pub fn parse(raw: &str, max_len: usize) -> Result<Self, SignalingError> {
        if raw.is_empty() {
            return Err(SignalingError::InvalidRoom("room must not be empty".to_string()));
        }
        if raw.len() > max_len {
            return Err(SignalingError::InvalidRoom(format!(
                "room longer than {} bytes",
                max_len
            )));
        }
        Ok(Self(Arc::from(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RoomId::from(s.as_str()))
    }
}

/// A STUN/TURN entry handed to peers as-is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: IceUrls::One(url.into()),
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    /// Create a new outbound message from any string type
    pub fn new(s: impl Into<Utf8Bytes>) -> Self {
        Self(s.into())
    }

    /// Serialize a value as a JSON text frame
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_string(value).map(Self::from)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

#[derive(Debug)]
pub(crate) struct PeerState {
    pub broadcaster: bool,
    /// Channel drained by the connection's writer task.
    pub tx: mpsc::UnboundedSender<OutboundMessage>,
}

#[derive(Debug, Default)]
pub(crate) struct Room {
    pub peers: HashMap<PeerId, PeerState>,
}
