use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use balboa_protocol::{
    Message, MessageBody, WebSocketClosePayload, WebSocketDispatchMessagePayload,
};
use balboa_routes::{MockRequest, RouteMatcher};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::ClientError;
use crate::sender::MessageSender;

pub(crate) type WsHandler = Arc<dyn Fn(WebSocketHandle) -> BoxFuture<'static, ()> + Send + Sync>;

/// A frame the server under test pushed into a virtual socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMockMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Handle to one virtual WebSocket: read inbound frames, push frames back,
/// or close it, all correlated by the socket's request id.
pub struct WebSocketHandle {
    request_id: String,
    url: String,
    sender: Arc<MessageSender>,
    messages: mpsc::Receiver<WsMockMessage>,
}

impl WebSocketHandle {
    pub(crate) fn new(
        request_id: String,
        url: String,
        sender: Arc<MessageSender>,
        messages: mpsc::Receiver<WsMockMessage>,
    ) -> Self {
        Self {
            request_id,
            url,
            sender,
            messages,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame forwarded from the socket, or `None` once it closed.
    pub async fn recv(&mut self) -> Option<WsMockMessage> {
        self.messages.recv().await
    }

    pub async fn send_text(&self, data: impl Into<String>) -> Result<(), ClientError> {
        self.dispatch(WebSocketDispatchMessagePayload {
            request_id: self.request_id.clone(),
            data: data.into(),
            binary: false,
        })
        .await
    }

    pub async fn send_binary(&self, bytes: &[u8]) -> Result<(), ClientError> {
        self.dispatch(WebSocketDispatchMessagePayload {
            request_id: self.request_id.clone(),
            data: BASE64.encode(bytes),
            binary: true,
        })
        .await
    }

    pub async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), ClientError> {
        self.sender
            .send_and_ack(Message::new(MessageBody::WebSocketClose(
                WebSocketClosePayload {
                    request_id: self.request_id.clone(),
                    code,
                    reason,
                },
            )))
            .await
    }

    async fn dispatch(&self, payload: WebSocketDispatchMessagePayload) -> Result<(), ClientError> {
        self.sender
            .send_and_ack(Message::new(MessageBody::WebSocketDispatchMessage(payload)))
            .await
    }
}

struct WsMockEntry {
    id: u64,
    matcher: RouteMatcher,
    handler: WsHandler,
}

pub(crate) struct PendingWsConnection {
    pub(crate) url: String,
    pub(crate) handler: WsHandler,
}

/// Registered WebSocket mocks plus the per-request-id state machine:
/// matched on should-proxy, bound on connection-ready, fed on every
/// forwarded frame.
#[derive(Default)]
pub(crate) struct WebSocketMockTable {
    entries: Mutex<Vec<Arc<WsMockEntry>>>,
    next_id: AtomicU64,
    pending: DashMap<String, PendingWsConnection>,
    connections: DashMap<String, mpsc::Sender<WsMockMessage>>,
}

impl WebSocketMockTable {
    pub(crate) fn register(&self, matcher: RouteMatcher, handler: WsHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.lock().push(Arc::new(WsMockEntry {
            id,
            matcher,
            handler,
        }));
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Should-proxy decision: true iff any registered matcher matches the
    /// socket's original URL. Remembers the match for the upcoming
    /// connection-ready notification.
    pub(crate) async fn claim(&self, request_id: &str, url: &str) -> bool {
        let probe = MockRequest::get(url);
        let snapshot: Vec<Arc<WsMockEntry>> = self.entries.lock().clone();
        for entry in snapshot {
            if entry.matcher.matches(&probe).await {
                self.pending.insert(
                    request_id.to_string(),
                    PendingWsConnection {
                        url: url.to_string(),
                        handler: Arc::clone(&entry.handler),
                    },
                );
                return true;
            }
        }
        false
    }

    pub(crate) fn take_pending(&self, request_id: &str) -> Option<PendingWsConnection> {
        self.pending.remove(request_id).map(|(_, pending)| pending)
    }

    pub(crate) fn bind_connection(&self, request_id: &str) -> mpsc::Receiver<WsMockMessage> {
        let (sender, receiver) = mpsc::channel(64);
        self.connections.insert(request_id.to_string(), sender);
        receiver
    }

    pub(crate) fn deliver(&self, request_id: &str, data: &str, binary: bool) {
        let message = if binary {
            match BASE64.decode(data) {
                Ok(bytes) => WsMockMessage::Binary(bytes),
                Err(error) => {
                    tracing::warn!(%error, "invalid base64 in forwarded websocket frame");
                    return;
                }
            }
        } else {
            WsMockMessage::Text(data.to_string())
        };

        let gone = match self.connections.get(request_id) {
            Some(sender) => sender.try_send(message).is_err(),
            None => false,
        };
        if gone {
            self.connections.remove(request_id);
        }
    }
}
