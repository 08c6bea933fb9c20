use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use balboa_protocol::{Message, MessageBody, MessageKind};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::ControlPlaneConfig;
use crate::errors::ControlPlaneError;
use crate::registry::{ConnectionHandle, ConnectionRegistry};

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// WebSocket server the test-process clients connect to. Owns the
/// handshake and per-connection read loop; everything semantic happens in
/// the listeners registered on each connection's handle.
pub struct ControlPlaneServer {
    config: ControlPlaneConfig,
    registry: Arc<ConnectionRegistry>,
}

#[derive(Clone)]
struct ControlPlaneState {
    config: ControlPlaneConfig,
    registry: Arc<ConnectionRegistry>,
}

impl ControlPlaneServer {
    pub fn new(
        config: ControlPlaneConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, ControlPlaneError> {
        config.validate()?;
        Ok(Self { config, registry })
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.config.bind).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        let state = ControlPlaneState {
            config: self.config,
            registry: self.registry,
        };
        let router = Router::new()
            .route("/", get(control_socket_handler))
            .with_state(state);
        axum::serve(listener, router).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }
}

async fn control_socket_handler(
    State(state): State<ControlPlaneState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_control_connection(state, socket))
}

async fn handle_control_connection(state: ControlPlaneState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);

    // Single writer task per connection; send order is the channel order.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sink.send(WsFrame::Text(message.encode())).await.is_err() {
                break;
            }
        }
    });

    let handshake_timeout = Duration::from_millis(state.config.handshake_timeout_ms);
    let first = tokio::time::timeout(handshake_timeout, next_text_frame(&mut stream)).await;
    let identify = match first {
        Ok(Some(text)) => Message::decode(&text),
        Ok(None) => {
            tracing::debug!("control connection closed before handshake");
            writer.abort();
            return;
        }
        Err(_) => {
            tracing::warn!("control connection handshake timed out");
            writer.abort();
            return;
        }
    };

    // Fail-fast: the first frame must be a well-formed IDENTIFY.
    let MessageBody::Identify(payload) = &identify.body else {
        tracing::warn!(kind = ?identify.kind(), "malformed control handshake; closing connection");
        writer.abort();
        return;
    };
    let client_id = payload.client_id.clone();

    let handle = ConnectionHandle::new(outbound_tx.clone(), state.config.subscription_buffer);
    let connection_id = handle.connection_id();
    state.registry.insert(&client_id, handle.clone());

    // Ack the identify and echo it back to the client.
    let handshake_reply = async {
        outbound_tx.send(Message::ack(&identify.message_id)).await?;
        outbound_tx.send(identify.clone()).await
    };
    if handshake_reply.await.is_err() {
        state.registry.remove(&client_id, connection_id);
        writer.abort();
        return;
    }
    tracing::debug!(%client_id, connection_id, "control client identified");

    let close_reason = read_loop(&mut stream, &outbound_tx, &handle, &client_id).await;

    // Every close path must drop the registry entry, or future requests
    // would be routed to a dead connection.
    state.registry.remove(&client_id, connection_id);
    writer.abort();
    tracing::debug!(%client_id, connection_id, close_reason, "control connection closed");
}

async fn read_loop(
    stream: &mut (impl Stream<Item = Result<WsFrame, axum::Error>> + Unpin),
    outbound_tx: &mpsc::Sender<Message>,
    handle: &ConnectionHandle,
    client_id: &str,
) -> &'static str {
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(_)) => return "socket error",
            None => return "socket closed",
        };
        let text = match frame {
            WsFrame::Text(text) => text,
            WsFrame::Close(_) => return "close frame",
            WsFrame::Ping(_) | WsFrame::Pong(_) => continue,
            WsFrame::Binary(_) => {
                tracing::warn!(client_id, "ignoring binary frame on control connection");
                continue;
            }
        };

        let message = Message::decode(&text);
        match message.kind() {
            MessageKind::Unknown => {
                tracing::warn!(client_id, "ignoring unrecognized control message");
            }
            MessageKind::Ack => {
                handle.dispatch(message);
            }
            MessageKind::Identify => {
                // Left unacknowledged; the sender observes a timeout.
                tracing::warn!(client_id, "duplicate IDENTIFY on identified connection");
            }
            _ => {
                // Liveness ack before any listener runs.
                if outbound_tx.send(Message::ack(&message.message_id)).await.is_err() {
                    return "writer closed";
                }
                if !handle.dispatch(message) {
                    tracing::debug!(client_id, "no listener consumed control message");
                }
            }
        }
    }
}

async fn next_text_frame(
    stream: &mut (impl Stream<Item = Result<WsFrame, axum::Error>> + Unpin),
) -> Option<String> {
    loop {
        match stream.next().await? {
            Ok(WsFrame::Text(text)) => return Some(text),
            Ok(WsFrame::Ping(_) | WsFrame::Pong(_)) => continue,
            Ok(WsFrame::Binary(_) | WsFrame::Close(_)) | Err(_) => return None,
        }
    }
}
