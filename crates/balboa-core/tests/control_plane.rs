use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use balboa_core::{ConnectionRegistry, ControlPlaneConfig, ControlPlaneServer};
use balboa_protocol::{Message, MessageBody, MessageKind};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsFrame;

type ControlSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server() -> (Arc<ConnectionRegistry>, SocketAddr) {
    let registry = Arc::new(ConnectionRegistry::new());
    let server = ControlPlaneServer::new(ControlPlaneConfig::default(), Arc::clone(&registry))
        .expect("server config");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind control listener");
    let addr = listener.local_addr().expect("control addr");
    tokio::spawn(async move {
        server.run_with_listener(listener).await.expect("serve");
    });
    (registry, addr)
}

async fn connect(addr: SocketAddr) -> ControlSocket {
    let (socket, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("connect control socket");
    socket
}

async fn next_message(socket: &mut ControlSocket) -> Option<Message> {
    loop {
        match socket.next().await? {
            Ok(WsFrame::Text(text)) => return Some(Message::decode(&text)),
            Ok(WsFrame::Ping(_) | WsFrame::Pong(_)) => continue,
            Ok(_) => return None,
            Err(_) => return None,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identify_is_acked_and_echoed_back() {
    let (registry, addr) = start_server().await;
    let mut socket = connect(addr).await;

    let identify = Message::identify("client-a");
    socket
        .send(WsFrame::Text(identify.encode()))
        .await
        .expect("send identify");

    let ack = next_message(&mut socket).await.expect("ack frame");
    assert_eq!(ack.kind(), MessageKind::Ack);
    assert_eq!(ack.message_id, identify.message_id);

    let echo = next_message(&mut socket).await.expect("echo frame");
    assert_eq!(echo, identify);

    assert!(registry.contains("client-a"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_handshakes_close_the_connection() {
    let (registry, addr) = start_server().await;
    let mut socket = connect(addr).await;

    socket
        .send(WsFrame::Text("definitely not a protocol frame".to_string()))
        .await
        .expect("send garbage");

    // Fail-fast: no ack, just a close.
    assert!(next_message(&mut socket).await.is_none());
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_sequence_first_messages_close_the_connection() {
    let (registry, addr) = start_server().await;
    let mut socket = connect(addr).await;

    let premature = Message::new(MessageBody::SseClose(balboa_protocol::SseClosePayload {
        request_id: "req-1".to_string(),
    }));
    socket
        .send(WsFrame::Text(premature.encode()))
        .await
        .expect("send premature message");

    assert!(next_message(&mut socket).await.is_none());
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_identify_is_left_unacknowledged() {
    let (_registry, addr) = start_server().await;
    let mut socket = connect(addr).await;

    let identify = Message::identify("client-b");
    socket
        .send(WsFrame::Text(identify.encode()))
        .await
        .expect("send identify");
    let _ack = next_message(&mut socket).await.expect("ack");
    let _echo = next_message(&mut socket).await.expect("echo");

    let second = Message::identify("client-b");
    socket
        .send(WsFrame::Text(second.encode()))
        .await
        .expect("send duplicate identify");

    // The violation is ignored, not answered; the sender can only observe a
    // timeout. The connection itself stays usable.
    let no_reply = tokio::time::timeout(Duration::from_millis(200), socket.next()).await;
    assert!(no_reply.is_err(), "duplicate IDENTIFY must not be acked");

    let probe = Message::new(MessageBody::SseClose(balboa_protocol::SseClosePayload {
        request_id: "req-2".to_string(),
    }));
    socket
        .send(WsFrame::Text(probe.encode()))
        .await
        .expect("send probe");
    let ack = next_message(&mut socket).await.expect("probe ack");
    assert_eq!(ack.kind(), MessageKind::Ack);
    assert_eq!(ack.message_id, probe.message_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_post_handshake_message_is_acked_before_any_listener_runs() {
    let (registry, addr) = start_server().await;
    let mut socket = connect(addr).await;

    let identify = Message::identify("client-c");
    socket
        .send(WsFrame::Text(identify.encode()))
        .await
        .expect("send identify");
    let _ack = next_message(&mut socket).await.expect("ack");
    let _echo = next_message(&mut socket).await.expect("echo");

    // No listener is subscribed to this correlation id; the liveness ack
    // must arrive regardless of semantic processing.
    let orphan = Message::new(MessageBody::SseEvent(balboa_protocol::SseEventPayload {
        request_id: "nobody-listens".to_string(),
        event: None,
        data: Some("lost".to_string()),
        id: None,
        retry: None,
    }));
    socket
        .send(WsFrame::Text(orphan.encode()))
        .await
        .expect("send orphan event");

    let ack = next_message(&mut socket).await.expect("orphan ack");
    assert_eq!(ack.kind(), MessageKind::Ack);
    assert_eq!(ack.message_id, orphan.message_id);

    // Closing the socket evicts the registry entry.
    socket.close(None).await.expect("close socket");
    let mut evicted = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !registry.contains("client-c") {
            evicted = true;
            break;
        }
    }
    assert!(evicted, "close path must remove the registry entry");
}
