use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::ServerMessage;
use super::types::{IceServer, OutboundMessage, PeerId, PeerState, Room, RoomId, SignalingError};

const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Commands sent to the hub actor
pub(crate) enum HubCommand {
    Join {
        room: RoomId,
        broadcaster: bool,
        peer_tx: mpsc::UnboundedSender<OutboundMessage>,
        reply: oneshot::Sender<JoinOutcome>,
    },
    Relay {
        from: PeerId,
        to: PeerId,
        message: OutboundMessage,
    },
    Leave {
        peer_id: PeerId,
    },
    RoomMembers {
        room: RoomId,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Result of registering a peer
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub peer_id: PeerId,
    /// Members that were in the room before this peer
    pub peers: Vec<PeerId>,
}

/// Room directory. Only the actor task touches it.
#[derive(Default)]
pub(crate) struct Directory {
    rooms: HashMap<RoomId, Room>,
    peer_rooms: HashMap<PeerId, RoomId>,
    ice_servers: Vec<IceServer>,
}

impl Directory {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers,
            ..Self::default()
        }
    }

    /// Registers the peer. Its `joined` ack is queued before it becomes
    /// reachable, so nothing else can precede it on that connection.
    pub fn join(
        &mut self,
        room_id: RoomId,
        broadcaster: bool,
        peer_tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> JoinOutcome {
        let mut peer_id = PeerId::generate();
        while self.peer_rooms.contains_key(&peer_id) {
            peer_id = PeerId::generate();
        }

        let room = self.rooms.entry(room_id.clone()).or_default();
        let peers: Vec<PeerId> = room.peers.keys().copied().collect();

        let ack = ServerMessage::Joined {
            room: room_id.clone(),
            peer_id,
            peers: peers.clone(),
            ice_servers: self.ice_servers.clone(),
        };
        match OutboundMessage::json(&ack) {
            Ok(msg) => {
                let _ = peer_tx.send(msg);
            }
            Err(e) => warn!("Failed to encode joined ack: {}", e),
        }

        if !broadcaster && !room.peers.is_empty() {
            match OutboundMessage::json(&ServerMessage::ViewerReady { viewer_id: peer_id }) {
                Ok(msg) => {
                    for peer in room.peers.values() {
                        let _ = peer.tx.send(msg.clone());
                    }
                }
                Err(e) => warn!("Failed to encode viewer-ready: {}", e),
            }
        }

        room.peers.insert(
            peer_id,
            PeerState {
                broadcaster,
                tx: peer_tx,
            },
        );
        self.peer_rooms.insert(peer_id, room_id.clone());

        info!(
            "Peer {} joined room {} as {}",
            peer_id,
            room_id,
            if broadcaster { "broadcaster" } else { "viewer" }
        );
        JoinOutcome { peer_id, peers }
    }

    /// Deliver to `to` if it shares a room with `from`. Returns whether it was handed off.
    pub fn relay(&self, from: PeerId, to: PeerId, message: OutboundMessage) -> bool {
        let Some(room) = self
            .peer_rooms
            .get(&from)
            .and_then(|room_id| self.rooms.get(room_id))
        else {
            debug!("Dropping relay from unregistered peer {}", from);
            return false;
        };

        match room.peers.get(&to) {
            Some(peer) => {
                if peer.tx.send(message).is_err() {
                    debug!("Recipient {} already gone, dropping relay from {}", to, from);
                    return false;
                }
                true
            }
            None => {
                debug!("Recipient {} not in room, dropping relay from {}", to, from);
                false
            }
        }
    }

    pub fn leave(&mut self, peer_id: PeerId) {
        let Some(room_id) = self.peer_rooms.remove(&peer_id) else {
            return;
        };

        if let Some(room) = self.rooms.get_mut(&room_id) {
            if let Some(peer) = room.peers.remove(&peer_id) {
                debug!(
                    "Removed {} {} from room {}",
                    if peer.broadcaster { "broadcaster" } else { "viewer" },
                    peer_id,
                    room_id
                );
            }

            if room.peers.is_empty() {
                self.rooms.remove(&room_id);
                info!("Room {} removed (empty)", room_id);
            }
        }
        info!("Peer {} left room {}", peer_id, room_id);
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<PeerId> {
        self.rooms
            .get(room_id)
            .map(|room| room.peers.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

pub(crate) async fn hub_actor(mut rx: mpsc::Receiver<HubCommand>, ice_servers: Vec<IceServer>) {
    let mut directory = Directory::new(ice_servers);

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Join {
                room,
                broadcaster,
                peer_tx,
                reply,
            } => {
                let outcome = directory.join(room, broadcaster, peer_tx);
                if reply.send(outcome.clone()).is_err() {
                    // Connection vanished while waiting for the reply.
                    directory.leave(outcome.peer_id);
                }
            }

            HubCommand::Relay { from, to, message } => {
                directory.relay(from, to, message);
            }

            HubCommand::Leave { peer_id } => directory.leave(peer_id),

            HubCommand::RoomMembers { room, reply } => {
                let _ = reply.send(directory.members(&room));
            }

            HubCommand::RoomCount { reply } => {
                let _ = reply.send(directory.room_count());
            }
        }
    }

    debug!("Hub actor stopped");
}

/// Handle to communicate with the hub actor
#[derive(Clone)]
pub struct HubHandle {
    pub(crate) tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Start the actor on the current runtime. `ice_servers` goes out in every `joined` ack.
    pub fn spawn(ice_servers: Vec<IceServer>) -> Self {
        let (tx, rx) = mpsc::channel::<HubCommand>(COMMAND_QUEUE_DEPTH);
        tokio::spawn(hub_actor(rx, ice_servers));
        Self { tx }
    }

    /// Register a new peer in `room`, creating the room if needed.
    /// The `joined` ack is already queued on `peer_tx` when this returns.
    pub async fn join(
        &self,
        room: RoomId,
        broadcaster: bool,
        peer_tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Result<JoinOutcome, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Join {
            room,
            broadcaster,
            peer_tx,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }

    /// Best-effort forward; an absent recipient is not an error
    pub async fn relay(&self, from: PeerId, to: PeerId, message: OutboundMessage) {
        let _ = self.tx.send(HubCommand::Relay { from, to, message }).await;
    }

    pub async fn leave(&self, peer_id: PeerId) {
        let _ = self.tx.send(HubCommand::Leave { peer_id }).await;
    }

    pub async fn room_members(&self, room: RoomId) -> Result<Vec<PeerId>, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::RoomMembers {
            room,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }

    pub async fn room_count(&self) -> Result<usize, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::RoomCount { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), SignalingError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }
}
