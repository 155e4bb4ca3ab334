use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use medfly_signaling::config::SignalingConfig;
use medfly_signaling::signaling::{HubHandle, IceServer, PeerId, RoomId, SignalingServer};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(200);

async fn start() -> (SocketAddr, HubHandle) {
    let config = SignalingConfig {
        ice_servers: vec![
            IceServer::stun("stun:stun.l.google.com:19302"),
            IceServer {
                urls: medfly_signaling::signaling::IceUrls::One("turn:turn.example.org:3478".into()),
                username: Some("user".into()),
                credential: Some("pass".into()),
            },
        ],
        ..SignalingConfig::default()
    };
    let server = SignalingServer::new(config);
    let handle = server.handle();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.serve(listener).await });

    (addr, handle)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    ws
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {:?}", other),
        }
    }
}

async fn recv(ws: &mut Client) -> Value {
    timeout(RECV_TIMEOUT, next_json(ws))
        .await
        .expect("timed out waiting for message")
}

async fn assert_silent(ws: &mut Client) {
    if let Ok(msg) = timeout(SILENCE, next_json(ws)).await {
        panic!("unexpected message: {}", msg);
    }
}

async fn join(ws: &mut Client, room: &str, broadcaster: bool) -> String {
    send(ws, json!({"type": "join", "room": room, "broadcaster": broadcaster})).await;
    let ack = recv(ws).await;
    assert_eq!(ack["type"], "joined", "unexpected ack {}", ack);
    assert_eq!(ack["room"], room);
    ack["peer_id"].as_str().unwrap().to_string()
}

async fn wait_until_gone(handle: &HubHandle, room: &str, peer: &str) {
    let peer: PeerId = peer.parse().unwrap();
    timeout(RECV_TIMEOUT, async {
        while handle
            .room_members(RoomId::from(room))
            .await
            .unwrap()
            .contains(&peer)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer was never removed");
}

#[tokio::test]
async fn room42_broadcast_session() {
    let (addr, handle) = start().await;
    let mut b = connect(addr).await;
    let mut v1 = connect(addr).await;
    let mut v2 = connect(addr).await;

    let b_id = join(&mut b, "room42", true).await;
    assert_silent(&mut b).await;

    let v1_id = join(&mut v1, "room42", false).await;
    assert_eq!(
        recv(&mut b).await,
        json!({"type": "viewer-ready", "viewer_id": v1_id})
    );
    assert_silent(&mut v1).await;

    let v2_id = join(&mut v2, "room42", false).await;
    let ready = json!({"type": "viewer-ready", "viewer_id": v2_id});
    assert_eq!(recv(&mut b).await, ready);
    assert_eq!(recv(&mut v1).await, ready);
    assert_silent(&mut v2).await;

    send(&mut b, json!({"type": "offer", "to": v1_id, "offer": {"sdp": "..."}})).await;
    assert_eq!(
        recv(&mut v1).await,
        json!({"type": "offer", "to": v1_id, "offer": {"sdp": "..."}, "from": b_id})
    );
    assert_silent(&mut v2).await;

    send(&mut v1, json!({"type": "answer", "to": b_id, "answer": {"sdp": "ok"}})).await;
    assert_eq!(
        recv(&mut b).await,
        json!({"type": "answer", "to": b_id, "answer": {"sdp": "ok"}, "from": v1_id})
    );

    v1.close(None).await.unwrap();
    drop(v1);
    wait_until_gone(&handle, "room42", &v1_id).await;

    send(
        &mut b,
        json!({"type": "candidate", "to": v1_id, "candidate": {"candidate": "c"}}),
    )
    .await;
    assert_silent(&mut b).await;
    assert_silent(&mut v2).await;

    // sender's session survives the dropped relay
    send(
        &mut b,
        json!({"type": "candidate", "to": v2_id, "candidate": {"candidate": "c"}}),
    )
    .await;
    assert_eq!(recv(&mut v2).await["from"], b_id);
}

#[tokio::test]
async fn relay_never_crosses_rooms() {
    let (addr, _handle) = start().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    join(&mut a, "ward-1", true).await;
    let b_id = join(&mut b, "ward-2", true).await;

    send(&mut a, json!({"type": "offer", "to": b_id, "offer": {}})).await;
    assert_silent(&mut b).await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn joined_ack_lists_peers_and_ice_servers() {
    let (addr, _handle) = start().await;
    let mut b = connect(addr).await;
    let mut v = connect(addr).await;

    let b_id = join(&mut b, "theatre", true).await;

    send(&mut v, json!({"type": "join", "room": "theatre"})).await;
    let ack = recv(&mut v).await;
    assert_eq!(ack["type"], "joined");
    assert_eq!(ack["peers"], json!([b_id]));
    assert_eq!(
        ack["ice_servers"],
        json!([
            {"urls": "stun:stun.l.google.com:19302"},
            {"urls": "turn:turn.example.org:3478", "username": "user", "credential": "pass"}
        ])
    );
    assert_ne!(ack["peer_id"], json!(b_id));
}

#[tokio::test]
async fn second_join_is_rejected() {
    let (addr, handle) = start().await;
    let mut a = connect(addr).await;

    let a_id = join(&mut a, "first", true).await;
    send(&mut a, json!({"type": "join", "room": "second"})).await;

    let err = recv(&mut a).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["message"], "already joined room first");

    let a_id: PeerId = a_id.parse().unwrap();
    assert_eq!(
        handle.room_members(RoomId::from("first")).await.unwrap(),
        vec![a_id]
    );
    assert!(
        handle
            .room_members(RoomId::from("second"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn relay_before_join_is_an_error() {
    let (addr, _handle) = start().await;
    let mut a = connect(addr).await;

    send(
        &mut a,
        json!({"type": "offer", "to": PeerId::generate().to_string(), "offer": {}}),
    )
    .await;
    assert_eq!(
        recv(&mut a).await,
        json!({"type": "error", "message": "not joined"})
    );
}

#[tokio::test]
async fn malformed_messages_keep_connection_open() {
    let (addr, _handle) = start().await;
    let mut a = connect(addr).await;

    a.send(Message::text("not json")).await.unwrap();
    assert_eq!(recv(&mut a).await["type"], "error");

    send(&mut a, json!({"type": "shout", "room": "x"})).await;
    let err = recv(&mut a).await;
    assert_eq!(err["type"], "error");
    assert!(err["message"].as_str().unwrap().contains("shout"));

    send(&mut a, json!({"type": "join", "room": ""})).await;
    assert_eq!(recv(&mut a).await["type"], "error");

    join(&mut a, "still-alive", false).await;
}

#[tokio::test]
async fn spoofed_from_is_overwritten() {
    let (addr, _handle) = start().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    let a_id = join(&mut a, "r", true).await;
    let b_id = join(&mut b, "r", true).await;

    send(
        &mut a,
        json!({"type": "candidate", "to": b_id, "candidate": {}, "from": "peer_ffffffffffffffffffffffffffffffff"}),
    )
    .await;
    assert_eq!(recv(&mut b).await["from"], a_id);
}

#[tokio::test]
async fn last_disconnect_drops_room() {
    let (addr, handle) = start().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    let a_id = join(&mut a, "empty-soon", true).await;
    let b_id = join(&mut b, "empty-soon", false).await;
    assert_eq!(handle.room_count().await.unwrap(), 1);

    drop(a);
    wait_until_gone(&handle, "empty-soon", &a_id).await;
    assert_eq!(handle.room_count().await.unwrap(), 1);

    b.close(None).await.unwrap();
    drop(b);
    wait_until_gone(&handle, "empty-soon", &b_id).await;
    assert_eq!(handle.room_count().await.unwrap(), 0);
}

#[tokio::test]
async fn disconnect_before_join_is_harmless() {
    let (addr, handle) = start().await;
    let a = connect(addr).await;
    drop(a);

    let mut b = connect(addr).await;
    join(&mut b, "r", true).await;
    assert_eq!(handle.room_count().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joined_ack_is_first_frame_under_concurrent_joins() {
    let (addr, _handle) = start().await;

    for round in 0..25 {
        let room = format!("rush-{}", round);
        let viewers: Vec<_> = (0..8)
            .map(|_| {
                let room = room.clone();
                tokio::spawn(async move {
                    let mut ws = connect(addr).await;
                    send(&mut ws, json!({"type": "join", "room": room})).await;
                    let first = recv(&mut ws).await;
                    (first, ws)
                })
            })
            .collect();

        let mut clients = Vec::new();
        for viewer in viewers {
            let (first, ws) = viewer.await.unwrap();
            assert_eq!(first["type"], "joined", "first frame was {}", first);
            clients.push(ws);
        }
    }
}

#[tokio::test]
async fn relays_between_a_pair_keep_send_order() {
    let (addr, _handle) = start().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    let a_id = join(&mut a, "ordered", true).await;
    let b_id = join(&mut b, "ordered", true).await;

    for index in 0..100 {
        send(
            &mut a,
            json!({"type": "candidate", "to": b_id, "candidate": {"index": index}}),
        )
        .await;
    }

    for index in 0..100 {
        let msg = recv(&mut b).await;
        assert_eq!(msg["from"], a_id);
        assert_eq!(msg["candidate"]["index"], index);
    }
    assert_silent(&mut b).await;
}
