//! WebSocket signaling hub for WebRTC offer/answer/candidate exchange

mod actor;
mod messages;
mod server;
mod types;

pub use actor::{HubHandle, JoinOutcome};
pub use messages::{ClientMessage, Inbound, MessageError, Relay, RelayKind, ServerMessage};
pub use server::{DEFAULT_SIGNALING_PORT, SignalingServer};
pub use types::{
    IceServer, IceUrls, InvalidPeerId, OutboundMessage, PeerId, RoomId, SignalingError,
};
