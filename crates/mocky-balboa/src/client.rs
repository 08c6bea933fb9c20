use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use balboa_core::PendingError;
use balboa_protocol::{
    Message, MessageBody, MessageKind, RequestPayload, ResponsePayload,
    SseConnectionReadyPayload, WebSocketShouldProxyRequestPayload,
    WebSocketShouldProxyResponsePayload,
};
use balboa_routes::{
    GraphqlMock, MockRequest, RequestOrigin, Route, RouteDecision, RouteError, RouteId,
    RouteMatcher, RouteOptions, RouteTable, WaitOptions,
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::sender::MessageSender;
use crate::sse::{SseHandle, SseRouteTable};
use crate::websocket::{WebSocketHandle, WebSocketMockTable};

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
const SSE_READY_CHANNEL_CAPACITY: usize = 64;

type ControlStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct ClientInner {
    client_id: String,
    sender: Arc<MessageSender>,
    routes: Arc<RouteTable>,
    sse_routes: SseRouteTable,
    ws_mocks: WebSocketMockTable,
    unmatched_sse: mpsc::Sender<SseHandle>,
}

/// Test-process client: one control connection to the mocking runtime
/// embedded in the server under test, plus the route tables answering its
/// intercepted requests.
pub struct MockClient {
    inner: Arc<ClientInner>,
    sse_ready: tokio::sync::Mutex<mpsc::Receiver<SseHandle>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl MockClient {
    /// Connects with a freshly generated client identity.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let client_id = Uuid::new_v4().to_string();
        Self::connect_with_identity(config, client_id).await
    }

    pub async fn connect_with_identity(
        config: ClientConfig,
        client_id: String,
    ) -> Result<Self, ClientError> {
        let (socket, _response) = connect_async(&config.control_url).await?;
        let (mut sink, stream) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(WsFrame::Text(message.encode())).await.is_err() {
                    break;
                }
            }
        });

        let sender = Arc::new(MessageSender::new(
            outbound_tx,
            Duration::from_millis(config.ack_timeout_ms),
        ));
        let (unmatched_sse, sse_ready_rx) = mpsc::channel(SSE_READY_CHANNEL_CAPACITY);
        let inner = Arc::new(ClientInner {
            client_id,
            sender,
            routes: Arc::new(RouteTable::default()),
            sse_routes: SseRouteTable::default(),
            ws_mocks: WebSocketMockTable::default(),
            unmatched_sse,
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&inner), stream));

        // IDENTIFY handshake: the server acks with the same message id and
        // echoes the identify frame back.
        let identify = Message::identify(inner.client_id.as_str());
        let ack_wait = inner.sender.acks().register(identify.message_id.as_str());
        inner.sender.send(identify).await?;
        let handshake_timeout = Duration::from_millis(config.handshake_timeout_ms);
        if let Err(error) = ack_wait.wait(handshake_timeout).await {
            writer.abort();
            reader.abort();
            return Err(match error {
                PendingError::TimedOut => ClientError::HandshakeTimeout,
                PendingError::ConnectionClosed => ClientError::ConnectionClosed,
            });
        }
        tracing::debug!(client_id = %inner.client_id, "control connection identified");

        Ok(Self {
            inner,
            sse_ready: tokio::sync::Mutex::new(sse_ready_rx),
            tasks: parking_lot::Mutex::new(vec![writer, reader]),
        })
    }

    /// The opaque identity carried by the reserved header on every request
    /// the test drives against the server under test.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn route<H, Fut>(&self, matcher: RouteMatcher, handler: H, options: RouteOptions) -> RouteId
    where
        H: Fn(Route) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RouteDecision, balboa_routes::BoxError>> + Send + 'static,
    {
        self.inner.routes.route(matcher, handler, options)
    }

    pub fn unroute(&self, id: RouteId) -> bool {
        self.inner.routes.unroute(id)
    }

    pub fn unroute_all(&self) {
        self.inner.routes.unroute_all();
        self.inner.sse_routes.clear();
    }

    pub async fn wait_for_request(
        &self,
        matcher: RouteMatcher,
        options: WaitOptions,
    ) -> Result<MockRequest, RouteError> {
        self.inner.routes.wait_for_request(matcher, options).await
    }

    /// GraphQL-aware routing attached to this client's route chain.
    pub fn graphql(&self, matcher: RouteMatcher, options: RouteOptions) -> GraphqlMock {
        GraphqlMock::attach(&self.inner.routes, matcher, options)
    }

    /// Registers an sse-transport route; the handler runs once a matching
    /// EventSource stream is ready to receive dispatches.
    pub fn route_sse<H, Fut>(&self, matcher: RouteMatcher, handler: H, times: Option<u64>) -> u64
    where
        H: Fn(SseHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.sse_routes.register(
            matcher,
            Arc::new(move |handle| Box::pin(handler(handle))),
            times,
        )
    }

    pub fn unroute_sse(&self, id: u64) -> bool {
        self.inner.sse_routes.remove(id)
    }

    /// Registers a WebSocket mock: matching outbound sockets are answered
    /// `proxy: true` and handed to the handler as virtual connections.
    pub fn mock_websocket<H, Fut>(&self, matcher: RouteMatcher, handler: H) -> u64
    where
        H: Fn(WebSocketHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .ws_mocks
            .register(matcher, Arc::new(move |handle| Box::pin(handler(handle))))
    }

    pub fn unmock_websocket(&self, id: u64) -> bool {
        self.inner.ws_mocks.remove(id)
    }

    /// Next ready SSE stream that no sse route claimed.
    pub async fn wait_for_sse_connection(&self, timeout: Duration) -> Result<SseHandle, ClientError> {
        let mut receiver = self.sse_ready.lock().await;
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Some(handle)) => Ok(handle),
            Ok(None) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::SseConnectionTimeout),
        }
    }

    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut stream: ControlStream) {
    while let Some(frame) = stream.next().await {
        let Ok(frame) = frame else { break };
        let text = match frame {
            WsFrame::Text(text) => text,
            WsFrame::Close(_) => break,
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => continue,
            WsFrame::Binary(_) => {
                tracing::warn!("ignoring binary frame on control connection");
                continue;
            }
        };

        let message = Message::decode(&text);
        match message.kind() {
            MessageKind::Ack => {
                let acked_id = message.message_id.clone();
                inner.sender.acks().complete(&acked_id, message);
            }
            MessageKind::Unknown => {
                tracing::warn!("ignoring unrecognized control message");
            }
            // The server echoes our IDENTIFY back after acking it.
            MessageKind::Identify => {}
            _ => {
                // Ack before any handler runs, mirroring the server side.
                if inner.sender.send(Message::ack(&message.message_id)).await.is_err() {
                    break;
                }
                dispatch(Arc::clone(&inner), message);
            }
        }
    }
    tracing::debug!("control connection read loop ended");
}

fn dispatch(inner: Arc<ClientInner>, message: Message) {
    match message.body {
        // Distinct intercepted requests resolve independently and may be in
        // flight concurrently; handlers for one request stay sequential.
        MessageBody::Request(payload) => {
            tokio::spawn(handle_request(inner, payload));
        }
        MessageBody::SseConnectionReady(payload) => {
            tokio::spawn(handle_sse_ready(inner, payload));
        }
        MessageBody::WebSocketShouldProxyRequest(payload) => {
            tokio::spawn(handle_should_proxy(inner, payload));
        }
        MessageBody::WebSocketConnectionReady(payload) => {
            match inner.ws_mocks.take_pending(&payload.request_id) {
                Some(pending) => {
                    let receiver = inner.ws_mocks.bind_connection(&payload.request_id);
                    let handle = WebSocketHandle::new(
                        payload.request_id.clone(),
                        pending.url,
                        Arc::clone(&inner.sender),
                        receiver,
                    );
                    tokio::spawn((pending.handler)(handle));
                }
                None => {
                    tracing::warn!(
                        request_id = %payload.request_id,
                        "websocket ready for a connection this client never claimed"
                    );
                }
            }
        }
        MessageBody::WebSocketOnMessage(payload) => {
            inner
                .ws_mocks
                .deliver(&payload.request_id, &payload.data, payload.binary);
        }
        MessageBody::Error(payload) => {
            tracing::warn!(
                request_id = ?payload.request_id,
                reason = %payload.reason,
                "mocking runtime reported an error"
            );
        }
        other => {
            tracing::debug!(kind = ?other, "unhandled control message");
        }
    }
}

async fn handle_request(inner: Arc<ClientInner>, payload: RequestPayload) {
    let request_id = payload.request_id.clone();
    let request = MockRequest::from_payload(&payload);

    let response = match inner.routes.resolve(&request, RequestOrigin::Server).await {
        Ok(RouteDecision::Fulfill(response)) => ResponsePayload {
            request_id: request_id.clone(),
            error: None,
            response: Some(response.into_payload()),
        },
        Ok(RouteDecision::Error) => ResponsePayload {
            request_id: request_id.clone(),
            error: Some(true),
            response: None,
        },
        // Passthrough, explicit or implicit: an empty response payload.
        Ok(RouteDecision::Passthrough | RouteDecision::Fallback) => ResponsePayload {
            request_id: request_id.clone(),
            error: None,
            response: None,
        },
        Err(error) => {
            // A failed handler terminates this request's mock resolution;
            // the application sees an ordinary network error.
            tracing::error!(%error, request_id = %request_id, "route resolution failed");
            ResponsePayload {
                request_id: request_id.clone(),
                error: Some(true),
                response: None,
            }
        }
    };

    if let Err(error) = inner
        .sender
        .send_and_ack(Message::new(MessageBody::Response(response)))
        .await
    {
        tracing::warn!(%error, request_id = %request_id, "failed to deliver mock response");
    }
}

async fn handle_sse_ready(inner: Arc<ClientInner>, payload: SseConnectionReadyPayload) {
    let handle = SseHandle::new(
        payload.request_id.clone(),
        payload.url.clone(),
        Arc::clone(&inner.sender),
    );
    match inner.sse_routes.match_url(&payload.url).await {
        Some(handler) => handler(handle).await,
        None => {
            if inner.unmatched_sse.try_send(handle).is_err() {
                tracing::debug!(
                    request_id = %payload.request_id,
                    "dropping unclaimed SSE connection handle"
                );
            }
        }
    }
}

async fn handle_should_proxy(inner: Arc<ClientInner>, payload: WebSocketShouldProxyRequestPayload) {
    let proxy = inner.ws_mocks.claim(&payload.request_id, &payload.url).await;
    let reply = Message::new(MessageBody::WebSocketShouldProxyResponse(
        WebSocketShouldProxyResponsePayload {
            request_id: payload.request_id.clone(),
            proxy,
        },
    ));
    if let Err(error) = inner.sender.send(reply).await {
        tracing::warn!(%error, request_id = %payload.request_id, "failed to answer should-proxy");
    }
}
