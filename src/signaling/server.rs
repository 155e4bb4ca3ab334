use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::actor::HubHandle;
use super::messages::{Inbound, Relay, ServerMessage};
use super::types::{OutboundMessage, PeerId, RoomId, SignalingError};
use crate::config::SignalingConfig;

pub const DEFAULT_SIGNALING_PORT: u16 = 9000;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-connection protocol state
#[derive(Debug)]
enum ConnectionState {
    Connected,
    Joined { peer_id: PeerId, room: RoomId },
}

pub struct SignalingServer {
    handle: HubHandle,
    config: Arc<SignalingConfig>,
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new(SignalingConfig::default())
    }
}

impl SignalingServer {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            handle: HubHandle::spawn(config.ice_servers.clone()),
            config: Arc::new(config),
        }
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("Signaling server listening on {}", listener.local_addr()?);
        info!(
            "Handing out {} ICE server(s) to joining peers",
            self.config.ice_servers.len()
        );

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            let handle = self.handle.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, handle, config).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Ping/pong liveness for one connection. A ping goes out every interval and
/// must be answered within the pong timeout.
struct Keepalive {
    ticker: Interval,
    pong_timeout: Duration,
    pong_deadline: Option<Instant>,
}

impl Keepalive {
    fn new(config: &SignalingConfig) -> Self {
        Self {
            ticker: tokio::time::interval(config.ping_interval),
            pong_timeout: config.pong_timeout,
            pong_deadline: None,
        }
    }

    fn awaiting_pong(&self) -> bool {
        self.pong_deadline.is_some()
    }

    fn ping_sent(&mut self) {
        self.pong_deadline = Some(Instant::now() + self.pong_timeout);
    }

    fn pong_received(&mut self) {
        self.pong_deadline = None;
    }
}

async fn pong_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drains the peer's queue into the socket; control frames bypass the queue.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let frame = tokio::select! {
            Some(msg) = rx.recv() => Message::Text(msg.into_inner()),
            Some(ctrl) = ctrl_rx.recv() => ctrl,
            else => break,
        };
        if ws_tx.send(frame).await.is_err() {
            break;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: HubHandle,
    config: Arc<SignalingConfig>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (ws_tx, mut ws_rx) = ws_stream.split();

    info!("WebSocket connection from {}", addr);

    let (tx, rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(write_loop(ws_tx, rx, ctrl_rx));

    let mut state = ConnectionState::Connected;
    let mut keepalive = Keepalive::new(&config);

    loop {
        tokio::select! {
            _ = keepalive.ticker.tick() => {
                if keepalive.awaiting_pong() {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                keepalive.ping_sent();
                debug!("Ping sent to {}", addr);
            }

            _ = pong_expired(keepalive.pong_deadline) => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = handle_text_message(&text, &tx, &handle, &config, &mut state).await {
                        warn!("Message handling error from {}: {}", addr, e);
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    keepalive.pong_received();
                    debug!("Pong received from {}", addr);
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Close received from {}", addr);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error from {}: {}", addr, e);
                    break;
                }
                None => break,
            },
        }
    }

    if let ConnectionState::Joined { peer_id, room } = state {
        debug!("Releasing {} from room {}", peer_id, room);
        handle.leave(peer_id).await;
    }

    send_task.abort();
    info!("WebSocket disconnected: {}", addr);

    Ok(())
}

fn reply(
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    msg: &ServerMessage,
) -> Result<(), serde_json::Error> {
    let _ = tx.send(OutboundMessage::json(msg)?);
    Ok(())
}

fn reply_error(
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    message: impl ToString,
) -> Result<(), serde_json::Error> {
    reply(
        tx,
        &ServerMessage::Error {
            message: message.to_string(),
        },
    )
}

async fn handle_text_message(
    text: &str,
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    handle: &HubHandle,
    config: &SignalingConfig,
    state: &mut ConnectionState,
) -> Result<(), BoxError> {
    let inbound = match Inbound::parse(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("Rejected message: {}", e);
            reply_error(tx, format!("Invalid message: {}", e))?;
            return Ok(());
        }
    };

    match inbound {
        Inbound::Join { room, broadcaster } => {
            handle_join(&room, broadcaster, tx, handle, config, state).await
        }
        Inbound::Relay(relay) => handle_relay(relay, tx, handle, state).await,
    }
}

async fn handle_join(
    room: &str,
    broadcaster: bool,
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    handle: &HubHandle,
    config: &SignalingConfig,
    state: &mut ConnectionState,
) -> Result<(), BoxError> {
    if let ConnectionState::Joined { room: current, .. } = state {
        reply_error(tx, SignalingError::AlreadyJoined(current.clone()))?;
        return Ok(());
    }

    let room = match RoomId::parse(room, config.max_room_id_len) {
        Ok(room) => room,
        Err(e) => {
            reply_error(tx, e)?;
            return Ok(());
        }
    };

    // The actor queues the `joined` ack itself.
    let outcome = handle.join(room.clone(), broadcaster, tx.clone()).await?;
    *state = ConnectionState::Joined {
        peer_id: outcome.peer_id,
        room,
    };
    Ok(())
}

async fn handle_relay(
    relay: Relay,
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    handle: &HubHandle,
    state: &ConnectionState,
) -> Result<(), BoxError> {
    let ConnectionState::Joined { peer_id, .. } = state else {
        reply_error(tx, SignalingError::NotJoined)?;
        return Ok(());
    };

    let (kind, to) = (relay.kind, relay.to);
    let message = relay.stamp_sender(*peer_id)?;
    debug!("Relaying {} from {} to {}", kind, peer_id, to);
    handle.relay(*peer_id, to, message).await;
    Ok(())
}
