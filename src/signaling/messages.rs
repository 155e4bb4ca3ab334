use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::types::{IceServer, OutboundMessage, PeerId, RoomId};

/// Messages sent from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Enter a room, creating it if nobody is there yet
    Join {
        room: String,
        #[serde(default)]
        broadcaster: bool,
    },

    Offer { to: PeerId, offer: Value },

    Answer { to: PeerId, answer: Value },

    Candidate { to: PeerId, candidate: Value },
}

const KNOWN_TYPES: [&str; 4] = ["join", "offer", "answer", "candidate"];

/// Messages originated by the server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Acknowledges a join; `peers` are the members present before it
    #[serde(rename = "joined")]
    Joined {
        room: RoomId,
        peer_id: PeerId,
        peers: Vec<PeerId>,
        ice_servers: Vec<IceServer>,
    },

    /// A viewer entered the room and waits for an offer
    #[serde(rename = "viewer-ready")]
    ViewerReady { viewer_id: PeerId },

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },
}

/// Reasons an inbound frame is rejected
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("message must be a JSON object")]
    NotAnObject,

    #[error("missing or non-string \"type\" field")]
    MissingType,

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("invalid {kind} message: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayKind::Offer => "offer",
            RelayKind::Answer => "answer",
            RelayKind::Candidate => "candidate",
        })
    }
}

/// A negotiation message addressed to another peer.
///
/// Keeps the client's object intact so that forwarding only adds `from`.
#[derive(Debug)]
pub struct Relay {
    pub kind: RelayKind,
    pub to: PeerId,
    body: Map<String, Value>,
}

impl Relay {
    /// Produce the frame delivered to the recipient.
    ///
    /// Any client-supplied `from` is replaced with the real sender.
    pub fn stamp_sender(mut self, from: PeerId) -> Result<OutboundMessage, serde_json::Error> {
        self.body
            .insert("from".to_string(), Value::String(from.to_string()));
        OutboundMessage::json(&self.body)
    }
}

/// A validated inbound frame
#[derive(Debug)]
pub enum Inbound {
    Join { room: String, broadcaster: bool },
    Relay(Relay),
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text).map_err(MessageError::InvalidJson)?;
        if !value.is_object() {
            return Err(MessageError::NotAnObject);
        }

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(MessageError::UnknownType(kind.to_string()));
        }

        let message =
            ClientMessage::deserialize(&value).map_err(|source| MessageError::InvalidFields {
                kind: kind.to_string(),
                source,
            })?;

        let (kind, to) = match message {
            ClientMessage::Join { room, broadcaster } => {
                return Ok(Inbound::Join { room, broadcaster });
            }
            ClientMessage::Offer { to, .. } => (RelayKind::Offer, to),
            ClientMessage::Answer { to, .. } => (RelayKind::Answer, to),
            ClientMessage::Candidate { to, .. } => (RelayKind::Candidate, to),
        };

        match value {
            Value::Object(body) => Ok(Inbound::Relay(Relay { kind, to, body })),
            _ => Err(MessageError::NotAnObject),
        }
    }
}
