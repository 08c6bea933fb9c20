use std::io;
use std::time::Duration;

use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientFrame, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use balboa_core::{ConnectionHandle, SubscriptionFilter};
use balboa_protocol::{
    Message, MessageBody, MessageKind, WebSocketConnectionReadyPayload, WebSocketOnMessagePayload,
    WebSocketShouldProxyRequestPayload,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamFrame;
use uuid::Uuid;

use crate::server::ProxyState;

#[derive(Debug, Deserialize)]
pub(crate) struct WsProxyParams {
    url: String,
    #[serde(rename = "x-mocky-balboa-client-id")]
    client_id: String,
}

/// WebSocket proxy endpoint. Outbound sockets on the server under test are
/// redirected here carrying the original URL and client identity; the owning
/// test client decides per URL whether the socket is virtual or relayed.
pub(crate) async fn ws_proxy(
    State(state): State<ProxyState>,
    Query(params): Query<WsProxyParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_ws_connection(state, params, socket))
}

async fn handle_ws_connection(state: ProxyState, params: WsProxyParams, socket: WebSocket) {
    let request_id = Uuid::new_v4().to_string();
    let should_proxy_timeout = Duration::from_millis(state.config.should_proxy_timeout_ms);

    let mock_owner = match state.registry.get(&params.client_id) {
        Some(handle) => {
            if should_proxy(&handle, &request_id, &params.url, should_proxy_timeout).await {
                Some(handle)
            } else {
                None
            }
        }
        None => None,
    };

    match mock_owner {
        Some(handle) => {
            tracing::debug!(request_id = %request_id, url = %params.url, "virtual websocket");
            run_virtual_socket(handle, request_id, socket).await;
        }
        None => {
            tracing::debug!(url = %params.url, "relaying websocket upstream");
            match relay_upstream(socket, &params.url).await {
                Ok(outcome) => tracing::debug!(
                    url = %params.url,
                    frames_from_client = outcome.frames_from_client,
                    frames_from_upstream = outcome.frames_from_upstream,
                    "websocket relay closed"
                ),
                Err(error) => tracing::warn!(url = %params.url, %error, "websocket relay failed"),
            }
        }
    }
}

/// `WEBSOCKET_SHOULD_PROXY_REQUEST` round trip. No live connection, a
/// negative answer, or a timeout all mean "relay verbatim".
async fn should_proxy(
    handle: &ConnectionHandle,
    request_id: &str,
    url: &str,
    timeout: Duration,
) -> bool {
    let reply = handle.replies().register(request_id);
    let question = Message::new(MessageBody::WebSocketShouldProxyRequest(
        WebSocketShouldProxyRequestPayload {
            request_id: request_id.to_string(),
            url: url.to_string(),
        },
    ));
    if handle.send(question).await.is_err() {
        return false;
    }

    match reply.wait(timeout).await {
        Ok(message) => {
            matches!(message.body, MessageBody::WebSocketShouldProxyResponse(payload) if payload.proxy)
        }
        Err(_) => false,
    }
}

/// Fully virtual socket: inbound frames forward to the test process as
/// `WEBSOCKET_ON_MESSAGE`; dispatches and closes come back correlated by the
/// request id.
async fn run_virtual_socket(handle: ConnectionHandle, request_id: String, socket: WebSocket) {
    let mut subscription = handle.subscribe(SubscriptionFilter {
        kinds: vec![
            MessageKind::WebSocketDispatchMessage,
            MessageKind::WebSocketClose,
        ],
        correlation_id: Some(request_id.clone()),
    });

    let ready = Message::new(MessageBody::WebSocketConnectionReady(
        WebSocketConnectionReadyPayload {
            request_id: request_id.clone(),
        },
    ));
    if handle.send(ready).await.is_err() {
        return;
    }

    let (mut client_sink, mut client_stream) = socket.split();
    loop {
        tokio::select! {
            frame = client_stream.next() => {
                let outbound = match frame {
                    Some(Ok(ClientFrame::Text(text))) => WebSocketOnMessagePayload {
                        request_id: request_id.clone(),
                        data: text,
                        binary: false,
                    },
                    Some(Ok(ClientFrame::Binary(bytes))) => WebSocketOnMessagePayload {
                        request_id: request_id.clone(),
                        data: BASE64.encode(bytes),
                        binary: true,
                    },
                    Some(Ok(ClientFrame::Ping(_) | ClientFrame::Pong(_))) => continue,
                    Some(Ok(ClientFrame::Close(_))) | Some(Err(_)) | None => break,
                };
                if handle
                    .send(Message::new(MessageBody::WebSocketOnMessage(outbound)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            message = subscription.recv() => {
                let Some(message) = message else { break };
                match message.body {
                    MessageBody::WebSocketDispatchMessage(payload) => {
                        let frame = if payload.binary {
                            match BASE64.decode(&payload.data) {
                                Ok(bytes) => ClientFrame::Binary(bytes),
                                Err(error) => {
                                    tracing::warn!(%error, "invalid base64 in websocket dispatch");
                                    continue;
                                }
                            }
                        } else {
                            ClientFrame::Text(payload.data)
                        };
                        if client_sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    MessageBody::WebSocketClose(payload) => {
                        let close = ClientFrame::Close(Some(ClientCloseFrame {
                            code: payload.code.unwrap_or(1000),
                            reason: payload.reason.unwrap_or_default().into(),
                        }));
                        let _ = client_sink.send(close).await;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct RelayOutcome {
    frames_from_client: u64,
    frames_from_upstream: u64,
}

/// Verbatim relay: open a genuine upstream socket to the original URL and
/// forward frames in both directions until either side closes.
async fn relay_upstream(socket: WebSocket, url: &str) -> io::Result<RelayOutcome> {
    let (upstream, _response) = connect_async(url).await.map_err(io::Error::other)?;
    let (mut upstream_sink, mut upstream_stream) = upstream.split();
    let (mut client_sink, mut client_stream) = socket.split();
    let mut outcome = RelayOutcome::default();

    loop {
        tokio::select! {
            frame = client_stream.next() => {
                let Some(Ok(frame)) = frame else { break };
                let closing = matches!(frame, ClientFrame::Close(_));
                if let Some(converted) = client_to_upstream(frame) {
                    if upstream_sink.send(converted).await.is_err() {
                        break;
                    }
                    outcome.frames_from_client += 1;
                }
                if closing {
                    break;
                }
            }
            frame = upstream_stream.next() => {
                let Some(Ok(frame)) = frame else { break };
                let closing = matches!(frame, UpstreamFrame::Close(_));
                if let Some(converted) = upstream_to_client(frame) {
                    if client_sink.send(converted).await.is_err() {
                        break;
                    }
                    outcome.frames_from_upstream += 1;
                }
                if closing {
                    break;
                }
            }
        }
    }

    Ok(outcome)
}

fn client_to_upstream(frame: ClientFrame) -> Option<UpstreamFrame> {
    match frame {
        ClientFrame::Text(text) => Some(UpstreamFrame::Text(text)),
        ClientFrame::Binary(bytes) => Some(UpstreamFrame::Binary(bytes)),
        ClientFrame::Ping(bytes) => Some(UpstreamFrame::Ping(bytes)),
        ClientFrame::Pong(bytes) => Some(UpstreamFrame::Pong(bytes)),
        ClientFrame::Close(frame) => Some(UpstreamFrame::Close(frame.map(|frame| {
            UpstreamCloseFrame {
                code: frame.code.into(),
                reason: frame.reason,
            }
        }))),
    }
}

fn upstream_to_client(frame: UpstreamFrame) -> Option<ClientFrame> {
    match frame {
        UpstreamFrame::Text(text) => Some(ClientFrame::Text(text)),
        UpstreamFrame::Binary(bytes) => Some(ClientFrame::Binary(bytes)),
        UpstreamFrame::Ping(bytes) => Some(ClientFrame::Ping(bytes)),
        UpstreamFrame::Pong(bytes) => Some(ClientFrame::Pong(bytes)),
        UpstreamFrame::Close(frame) => Some(ClientFrame::Close(frame.map(|frame| {
            ClientCloseFrame {
                code: frame.code.into(),
                reason: frame.reason,
            }
        }))),
        UpstreamFrame::Frame(_) => None,
    }
}
